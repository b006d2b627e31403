//! The experiment database: the controller's own SQLite record of every
//! ethoscope it has ever seen, the experimental runs they performed, and the
//! users who ran them. Pollers persist discovery and run transitions here;
//! the UI reads it to show offline devices with their last-known state.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

/// The initial migration SQL, embedded at compile time.
const INIT_MIGRATION: &str = include_str!("migrations/001_init.sql");

/// Initialize the SQLite database pool and run migrations.
pub async fn init(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    info!("experiment database migrations applied");

    Ok(pool)
}

/// Apply migrations using a simple version-tracking approach.
async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (\
         version INTEGER PRIMARY KEY, \
         applied_at TEXT NOT NULL DEFAULT (datetime('now')))",
    )
    .execute(pool)
    .await?;

    let applied: bool = sqlx::query("SELECT 1 FROM _migrations WHERE version = 1")
        .fetch_optional(pool)
        .await?
        .is_some();

    if !applied {
        for statement in INIT_MIGRATION.split(';') {
            let stmt = statement.trim();
            if stmt.is_empty() || stmt.starts_with("--") {
                continue;
            }
            sqlx::query(stmt).execute(pool).await?;
        }

        sqlx::query("INSERT INTO _migrations (version) VALUES (1)")
            .execute(pool)
            .await?;

        info!("applied migration 001_init.sql");
    }

    Ok(())
}

/// One ethoscope as recorded in the experiment database.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EthoscopeRecord {
    pub ethoscope_id: String,
    pub ethoscope_name: String,
    pub last_ip: String,
    pub machine_info: String,
    pub status: String,
    pub active: bool,
    pub last_seen: Option<String>,
}

/// Partial update for an ethoscope record; unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct EthoscopeUpdate {
    pub name: Option<String>,
    pub last_ip: Option<String>,
    pub machine_info: Option<String>,
    pub status: Option<String>,
    pub active: Option<bool>,
}

/// A new experimental run to record.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: String,
    pub experiment_type: String,
    pub ethoscope_id: String,
    pub ethoscope_name: String,
    pub user_name: String,
    pub user_id: String,
    pub location: String,
    pub alert: bool,
    pub comments: String,
    pub experimental_data: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserRecord {
    pub name: String,
    pub fullname: String,
    pub email: String,
    pub is_admin: bool,
}

/// Handle to the experiment database.
#[derive(Debug, Clone)]
pub struct ExperimentDb {
    pool: SqlitePool,
}

impl ExperimentDb {
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = init(database_url).await?;
        Ok(ExperimentDb { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upsert an ethoscope record; only the provided fields change.
    pub async fn update_ethoscope(
        &self,
        ethoscope_id: &str,
        update: EthoscopeUpdate,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO ethoscopes \
             (ethoscope_id, ethoscope_name, last_ip, machine_info, status, active, last_seen) \
             VALUES (?, COALESCE(?, ''), COALESCE(?, ''), COALESCE(?, ''), COALESCE(?, 'offline'), COALESCE(?, 1), ?) \
             ON CONFLICT(ethoscope_id) DO UPDATE SET \
             ethoscope_name = COALESCE(?, ethoscope_name), \
             last_ip = COALESCE(?, last_ip), \
             machine_info = COALESCE(?, machine_info), \
             status = COALESCE(?, status), \
             active = COALESCE(?, active), \
             last_seen = ?",
        )
        .bind(ethoscope_id)
        .bind(&update.name)
        .bind(&update.last_ip)
        .bind(&update.machine_info)
        .bind(&update.status)
        .bind(update.active)
        .bind(&now)
        .bind(&update.name)
        .bind(&update.last_ip)
        .bind(&update.machine_info)
        .bind(&update.status)
        .bind(update.active)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_ethoscope(&self, ethoscope_id: &str) -> Option<EthoscopeRecord> {
        sqlx::query_as("SELECT * FROM ethoscopes WHERE ethoscope_id = ?")
            .bind(ethoscope_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
    }

    pub async fn get_all_ethoscopes(&self) -> Vec<EthoscopeRecord> {
        sqlx::query_as("SELECT * FROM ethoscopes ORDER BY ethoscope_name")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default()
    }

    /// Flip the `active` flag; a retired device drops out of the fleet view.
    pub async fn retire_ethoscope(
        &self,
        ethoscope_id: &str,
        active: bool,
    ) -> Result<Option<EthoscopeRecord>, sqlx::Error> {
        sqlx::query("UPDATE ethoscopes SET active = ? WHERE ethoscope_id = ?")
            .bind(active)
            .bind(ethoscope_id)
            .execute(&self.pool)
            .await?;
        Ok(self.get_ethoscope(ethoscope_id).await)
    }

    /// Record a freshly started experimental run.
    pub async fn add_run(&self, run: NewRun) -> Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR REPLACE INTO runs \
             (run_id, experiment_type, ethoscope_id, ethoscope_name, user_name, user_id, \
              location, alert, comments, experimental_data, status, started_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'running', ?)",
        )
        .bind(&run.run_id)
        .bind(&run.experiment_type)
        .bind(&run.ethoscope_id)
        .bind(&run.ethoscope_name)
        .bind(&run.user_name)
        .bind(&run.user_id)
        .bind(&run.location)
        .bind(run.alert)
        .bind(&run.comments)
        .bind(&run.experimental_data)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close a run that ended normally.
    pub async fn stop_run(&self, run_id: &str) -> Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE runs SET status = 'stopped', stopped_at = ? WHERE run_id = ?")
            .bind(&now)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append a problem note to a run (unreached, self-stopped, …).
    pub async fn flag_problem(&self, run_id: &str, message: &str) -> Result<(), sqlx::Error> {
        let stamped = format!("{} {message}\n", Utc::now().to_rfc3339());
        sqlx::query(
            "UPDATE runs SET status = 'problem', problems = problems || ? WHERE run_id = ?",
        )
        .bind(&stamped)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user_by_name(&self, name: &str) -> Option<UserRecord> {
        sqlx::query_as("SELECT name, fullname, email, is_admin FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
    }

    /// Escape hatch for the operator tooling: run one statement and return
    /// rows as JSON objects.
    pub async fn execute_sql(&self, sql: &str) -> Result<Vec<serde_json::Value>, sqlx::Error> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}

fn row_to_json(row: &SqliteRow) -> serde_json::Value {
    use sqlx::Column;

    let mut object = serde_json::Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(Into::into).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map(Into::into).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map(Into::into).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(i) {
            v.map(|bytes| serde_json::Value::String(format!("<{} bytes>", bytes.len())))
                .unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::Null
        };
        object.insert(column.name().to_string(), value);
    }
    serde_json::Value::Object(object)
}
