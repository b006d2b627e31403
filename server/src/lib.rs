//! Ethonode server library: fleet controller for ethoscope acquisition
//! devices — mDNS discovery, per-device polling, command relay, incremental
//! MySQL→SQLite backups, and frame-stream relaying.

pub mod backup;
pub mod client;
pub mod config;
pub mod db;
pub mod device;
pub mod poller;
pub mod scanner;
pub mod status;
pub mod stream;
