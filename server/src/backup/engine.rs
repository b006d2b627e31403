//! Incremental MySQL→SQLite replication engine.
//!
//! Each pass replicates one device's MySQL database into a local SQLite file,
//! preserving the remote schema (types mapped, PRIMARY KEY kept) and never
//! duplicating rows. Id-bearing tables advance by keyset chunks from the
//! local `max(id)`; the handful of keyless tables are synced row by row.
//! `CSV_DAM_ACTIVITY` additionally appends tab-separated rows to the sibling
//! DAM `.txt` file on every insert batch.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::TryStreamExt;
use serde_json::json;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, Row};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::marker::{self, BackupLock, LockError};

/// The charset the device-side tracker writes with.
pub const SQL_CHARSET: &str = "latin1";

/// Default credentials baked into the device image.
pub const DEVICE_DB_USER: &str = "ethoscope";
pub const DEVICE_DB_PASS: &str = "ethoscope";
pub const DEVICE_DB_NAME: &str = "ethoscope_db";

const MYSQL_CONNECT_TIMEOUT: Duration = Duration::from_secs(45);
const MYSQL_OP_TIMEOUT: Duration = Duration::from_secs(120);

/// Rows accumulated before a local insert batch is flushed.
const MAX_BATCH_SIZE: usize = 10_000;

/// Tables with no `id` column; synced by whole-row comparison.
pub const TABLES_WITHOUT_KEY: [&str; 3] = ["METADATA", "VAR_MAP", "ROI_MAP"];

/// Id-bearing auxiliary tables updated alongside the ROI tables.
const ID_TABLES: [&str; 4] = ["CSV_DAM_ACTIVITY", "START_EVENTS", "IMG_SNAPSHOTS", "SENSORS"];

pub fn is_table_without_key(table: &str) -> bool {
    TABLES_WITHOUT_KEY.contains(&table)
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup destination is locked: {0}")]
    Locked(PathBuf),

    #[error("remote database not ready (VAR_MAP is empty)")]
    NotReady,

    #[error("timed out connecting to the remote database")]
    ConnectTimeout,

    #[error("remote database error: {0}")]
    Remote(#[source] sqlx::Error),

    #[error("local database error: {0}")]
    Local(#[source] sqlx::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LockError> for BackupError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held(path) => BackupError::Locked(path),
            LockError::Io(err) => BackupError::Io(err),
        }
    }
}

/// What one engine pass did.
#[derive(Debug, Default)]
pub struct BackupOutcome {
    /// The pass was skipped because a fresh `.completed` marker exists.
    pub skipped_recent: bool,
    pub tables_synced: usize,
    pub rows_copied: u64,
    /// Tables skipped after a remote-side error, with the reason.
    pub failed_tables: Vec<(String, String)>,
}

impl BackupOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failed_tables.is_empty()
    }
}

/// One column of a replicated table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub sqlite_type: &'static str,
    pub nullable: bool,
    pub is_primary: bool,
    pub is_auto_increment: bool,
}

/// The remote schema of one table, already mapped to SQLite types.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn primary_key(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|col| col.is_primary)
            .map(|col| col.name.as_str())
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|col| col.name.as_str()).collect()
    }

    /// `CREATE TABLE` statement preserving PRIMARY KEY. Auto-increment needs
    /// no clause: SQLite implies it for INTEGER PRIMARY KEY.
    pub fn create_sql(&self, table: &str) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|col| {
                let mut def = format!("`{}` {}", col.name, col.sqlite_type);
                if col.is_primary {
                    def.push_str(" PRIMARY KEY");
                } else if !col.nullable {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();
        format!("CREATE TABLE `{}` ({})", table, columns.join(", "))
    }
}

/// Map a declared MySQL column type to its SQLite storage class.
pub fn mysql_to_sqlite_type(mysql_type: &str) -> &'static str {
    let ty = mysql_type.to_lowercase();
    if ty.contains("int") {
        "INTEGER"
    } else if ty.contains("varchar") || ty.contains("text") || ty.contains("char") {
        "TEXT"
    } else if ty.contains("float") || ty.contains("double") || ty.contains("decimal") {
        "REAL"
    } else if ty.contains("blob") {
        "BLOB"
    } else {
        "TEXT"
    }
}

/// A value in transit between the two databases.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => Ok(()),
            SqlValue::Int(v) => write!(f, "{v}"),
            SqlValue::Real(v) => write!(f, "{v}"),
            SqlValue::Text(v) => f.write_str(v),
            SqlValue::Blob(v) => {
                for byte in v {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_sqlite<'q>(query: SqliteQuery<'q>, value: &SqlValue) -> SqliteQuery<'q> {
    match value {
        SqlValue::Null => query.bind(Option::<i64>::None),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Real(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Blob(v) => query.bind(v.clone()),
    }
}

/// Decode one remote row according to the mapped schema.
fn decode_mysql_row(row: &MySqlRow, columns: &[ColumnSpec]) -> Result<Vec<SqlValue>, sqlx::Error> {
    let mut values = Vec::with_capacity(columns.len());
    for (i, col) in columns.iter().enumerate() {
        let value = match col.sqlite_type {
            "INTEGER" => match row.try_get::<Option<i64>, _>(i) {
                Ok(v) => v.map(SqlValue::Int).unwrap_or(SqlValue::Null),
                // Unsigned columns refuse the signed decode.
                Err(_) => row
                    .try_get::<Option<u64>, _>(i)?
                    .map(|v| SqlValue::Int(v as i64))
                    .unwrap_or(SqlValue::Null),
            },
            "REAL" => match row.try_get::<Option<f64>, _>(i) {
                Ok(v) => v.map(SqlValue::Real).unwrap_or(SqlValue::Null),
                Err(_) => row
                    .try_get::<Option<f32>, _>(i)?
                    .map(|v| SqlValue::Real(v as f64))
                    .unwrap_or(SqlValue::Null),
            },
            "BLOB" => row
                .try_get::<Option<Vec<u8>>, _>(i)?
                .map(SqlValue::Blob)
                .unwrap_or(SqlValue::Null),
            _ => match row.try_get::<Option<String>, _>(i) {
                Ok(v) => v.map(SqlValue::Text).unwrap_or(SqlValue::Null),
                // latin1 bytes that are not valid text for the driver.
                Err(_) => row
                    .try_get::<Option<Vec<u8>>, _>(i)?
                    .map(|b| SqlValue::Text(String::from_utf8_lossy(&b).into_owned()))
                    .unwrap_or(SqlValue::Null),
            },
        };
        values.push(value);
    }
    Ok(values)
}

/// Whether the incremental loop should fetch another chunk.
///
/// A chunk at or above the stop threshold may mean more rows are waiting; a
/// smaller one means we are caught up and the extra round trip is not worth
/// it. The threshold is deliberately lower than the chunk size.
pub fn chunk_has_more(batch_len: usize, stop_threshold: u32) -> bool {
    batch_len >= stop_threshold as usize
}

/// Append rows to the DAM file as tab-separated values.
fn append_dam_rows(dam_path: &Path, rows: &[Vec<SqlValue>]) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dam_path)?;
    for row in rows {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(file, "{}", line.join("\t"))?;
    }
    Ok(())
}

/// Replicates one remote MySQL database into one local SQLite file.
pub struct MySqlToSqlite {
    dst_path: PathBuf,
    dam_file: PathBuf,
    remote_host: String,
    remote_user: String,
    remote_pass: String,
    remote_db: String,
    overwrite: bool,
    chunk_size: u32,
    chunk_stop_threshold: u32,
}

impl MySqlToSqlite {
    pub fn new(dst_path: &Path, remote_host: &str, remote_db: &str) -> Self {
        MySqlToSqlite {
            dst_path: dst_path.to_path_buf(),
            dam_file: marker::dam_path(dst_path),
            remote_host: remote_host.to_string(),
            remote_user: DEVICE_DB_USER.to_string(),
            remote_pass: DEVICE_DB_PASS.to_string(),
            remote_db: remote_db.to_string(),
            overwrite: false,
            chunk_size: 200,
            chunk_stop_threshold: 100,
        }
    }

    pub fn with_credentials(mut self, user: &str, pass: &str) -> Self {
        self.remote_user = user.to_string();
        self.remote_pass = pass.to_string();
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_chunking(mut self, chunk_size: u32, stop_threshold: u32) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_stop_threshold = stop_threshold;
        self
    }

    pub fn destination(&self) -> &Path {
        &self.dst_path
    }

    /// One full backup pass: lock, freshness gate, initial copy or
    /// incremental update, completion marker. The lock is released on every
    /// exit path by the guard's `Drop`.
    pub async fn run(&self, freshness: Duration) -> Result<BackupOutcome, BackupError> {
        let _lock = BackupLock::acquire(&self.dst_path)?;

        if marker::is_recent(&self.dst_path, freshness) {
            debug!(dst = %self.dst_path.display(), "completion marker is fresh, skipping pass");
            return Ok(BackupOutcome {
                skipped_recent: true,
                ..BackupOutcome::default()
            });
        }

        if self.overwrite {
            for path in [&self.dst_path, &self.dam_file] {
                match std::fs::remove_file(path) {
                    Ok(()) => info!(path = %path.display(), "removed existing file for overwrite"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        // The DAM file accumulates across passes; make sure it exists.
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.dam_file)?;

        let fresh_replica = !self.dst_path.exists();

        let mut remote = self.connect_remote().await?;
        let mut local = self.open_local().await?;

        let outcome = if fresh_replica {
            self.initial_copy(&mut remote, &mut local).await?
        } else {
            self.incremental_update(&mut remote, &mut local).await?
        };

        let stats = json!({
            "tables": outcome.tables_synced,
            "rows": outcome.rows_copied,
            "failed_tables": outcome
                .failed_tables
                .iter()
                .map(|(t, e)| json!({"table": t, "error": e}))
                .collect::<Vec<_>>(),
        });
        marker::mark_completed(&self.dst_path, stats);

        Ok(outcome)
    }

    async fn connect_remote(&self) -> Result<MySqlConnection, BackupError> {
        let options = MySqlConnectOptions::new()
            .host(&self.remote_host)
            .username(&self.remote_user)
            .password(&self.remote_pass)
            .database(&self.remote_db)
            .charset(SQL_CHARSET);
        match tokio::time::timeout(MYSQL_CONNECT_TIMEOUT, MySqlConnection::connect_with(&options))
            .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => Err(BackupError::Remote(err)),
            Err(_) => Err(BackupError::ConnectTimeout),
        }
    }

    async fn open_local(&self) -> Result<SqliteConnection, BackupError> {
        let options = SqliteConnectOptions::new()
            .filename(&self.dst_path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));
        SqliteConnection::connect_with(&options)
            .await
            .map_err(BackupError::Local)
    }

    /// First pass: replicate the full schema and every row.
    async fn initial_copy(
        &self,
        remote: &mut MySqlConnection,
        local: &mut SqliteConnection,
    ) -> Result<BackupOutcome, BackupError> {
        ensure_remote_ready(remote).await?;

        let tables = list_remote_tables(remote).await?;
        info!(
            db = %self.remote_db,
            host = %self.remote_host,
            tables = tables.len(),
            "starting initial copy"
        );

        let mut outcome = BackupOutcome::default();
        for table in &tables {
            match self.copy_table(remote, local, table).await {
                Ok(rows) => {
                    outcome.tables_synced += 1;
                    outcome.rows_copied += rows;
                }
                Err(BackupError::Remote(err)) => {
                    warn!(table = %table, error = %err, "remote error copying table, continuing with the rest");
                    outcome.failed_tables.push((table.clone(), err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }

    /// Subsequent passes: bring every table group up to date.
    async fn incremental_update(
        &self,
        remote: &mut MySqlConnection,
        local: &mut SqliteConnection,
    ) -> Result<BackupOutcome, BackupError> {
        let mut outcome = BackupOutcome::default();

        // ROI tables are named from the local map of regions of interest. A
        // replica missing ROI_MAP (aborted first pass) syncs it further down.
        let roi_indices: Vec<i64> = match sqlx::query_scalar("SELECT DISTINCT roi_idx FROM ROI_MAP")
            .fetch_all(&mut *local)
            .await
        {
            Ok(indices) => indices,
            Err(err) => {
                warn!(error = %err, "no usable local ROI_MAP, skipping ROI tables this pass");
                Vec::new()
            }
        };

        let mut id_tables: Vec<String> =
            roi_indices.iter().map(|idx| format!("ROI_{idx}")).collect();
        id_tables.extend(ID_TABLES.iter().map(|t| t.to_string()));

        for table in &id_tables {
            match self.update_table_with_id(remote, local, table).await {
                Ok(rows) => {
                    outcome.tables_synced += 1;
                    outcome.rows_copied += rows;
                }
                Err(BackupError::Remote(err)) => {
                    warn!(table = %table, error = %err, "could not update table");
                    outcome.failed_tables.push((table.clone(), err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }

        for table in TABLES_WITHOUT_KEY {
            match self.update_table_without_id(remote, local, table).await {
                Ok(rows) => {
                    outcome.tables_synced += 1;
                    outcome.rows_copied += rows;
                }
                Err(BackupError::Remote(err)) => {
                    warn!(table = %table, error = %err, "could not update table");
                    outcome
                        .failed_tables
                        .push((table.to_string(), err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }

        Ok(outcome)
    }

    /// Full copy of one table, schema first.
    async fn copy_table(
        &self,
        remote: &mut MySqlConnection,
        local: &mut SqliteConnection,
        table: &str,
    ) -> Result<u64, BackupError> {
        let schema = self.ensure_table(remote, local, table).await?;

        if table == "IMG_SNAPSHOTS" {
            return self.copy_image_table(remote, local, table).await;
        }

        // Keyless tables are cleared first so re-runs cannot accumulate
        // duplicates; everything else dedupes through the PRIMARY KEY.
        let (insert_verb, clear_first) = if is_table_without_key(table) {
            ("INSERT", true)
        } else {
            ("INSERT OR IGNORE", false)
        };
        if clear_first {
            info!(table = %table, "clearing keyless table before full copy");
            sqlx::query(&format!("DELETE FROM `{table}`"))
                .execute(&mut *local)
                .await
                .map_err(BackupError::Local)?;
        }

        let placeholders = vec!["?"; schema.columns.len()].join(",");
        let insert_sql = format!("{insert_verb} INTO `{table}` VALUES ({placeholders})");
        let dump_dam = table == "CSV_DAM_ACTIVITY";

        let mut total: u64 = 0;
        let mut batch: Vec<Vec<SqlValue>> = Vec::new();

        let select_sql = format!("SELECT * FROM `{table}`");
        let mut stream = sqlx::query(&select_sql).fetch(&mut *remote);
        loop {
            let row = tokio::time::timeout(MYSQL_OP_TIMEOUT, stream.try_next())
                .await
                .map_err(|_| BackupError::Remote(sqlx::Error::PoolTimedOut))?
                .map_err(BackupError::Remote)?;
            let Some(row) = row else { break };

            batch.push(decode_mysql_row(&row, &schema.columns).map_err(BackupError::Remote)?);
            if batch.len() >= MAX_BATCH_SIZE {
                total += flush_batch(local, &insert_sql, &batch).await?;
                if dump_dam {
                    append_dam_rows(&self.dam_file, &batch)?;
                }
                batch.clear();
            }
        }
        drop(stream);

        if !batch.is_empty() {
            total += flush_batch(local, &insert_sql, &batch).await?;
            if dump_dam {
                append_dam_rows(&self.dam_file, &batch)?;
            }
        }

        info!(table = %table, rows = total, "table copied");
        Ok(total)
    }

    /// BLOB-bearing snapshots use an explicit three-column template.
    async fn copy_image_table(
        &self,
        remote: &mut MySqlConnection,
        local: &mut SqliteConnection,
        table: &str,
    ) -> Result<u64, BackupError> {
        let columns = vec![
            ColumnSpec {
                name: "id".into(),
                sqlite_type: "INTEGER",
                nullable: false,
                is_primary: true,
                is_auto_increment: true,
            },
            ColumnSpec {
                name: "t".into(),
                sqlite_type: "INTEGER",
                nullable: false,
                is_primary: false,
                is_auto_increment: false,
            },
            ColumnSpec {
                name: "img".into(),
                sqlite_type: "BLOB",
                nullable: true,
                is_primary: false,
                is_auto_increment: false,
            },
        ];
        let insert_sql = format!("INSERT OR IGNORE INTO `{table}` (id, t, img) VALUES (?, ?, ?)");
        let select_sql = format!("SELECT id, t, img FROM `{table}`");

        let mut total: u64 = 0;
        let mut batch: Vec<Vec<SqlValue>> = Vec::new();
        let mut stream = sqlx::query(&select_sql).fetch(&mut *remote);
        loop {
            let row = tokio::time::timeout(MYSQL_OP_TIMEOUT, stream.try_next())
                .await
                .map_err(|_| BackupError::Remote(sqlx::Error::PoolTimedOut))?
                .map_err(BackupError::Remote)?;
            let Some(row) = row else { break };

            batch.push(decode_mysql_row(&row, &columns).map_err(BackupError::Remote)?);
            if batch.len() >= MAX_BATCH_SIZE {
                total += flush_batch(local, &insert_sql, &batch).await?;
                batch.clear();
            }
        }
        drop(stream);

        if !batch.is_empty() {
            total += flush_batch(local, &insert_sql, &batch).await?;
        }
        Ok(total)
    }

    /// Chunked incremental update for an id-bearing table.
    ///
    /// Fetch `chunk_size` rows past the local `max(id)`, insert them with
    /// `INSERT OR IGNORE`, advance the cursor, and stop once a chunk comes
    /// back below the stop threshold.
    async fn update_table_with_id(
        &self,
        remote: &mut MySqlConnection,
        local: &mut SqliteConnection,
        table: &str,
    ) -> Result<u64, BackupError> {
        let schema = self.ensure_table(remote, local, table).await?;

        let max_id_sql = format!("SELECT COALESCE(MAX(id), 0) FROM `{table}`");
        let mut current_max_id: i64 = match sqlx::query_scalar(&max_id_sql)
            .fetch_one(&mut *local)
            .await
        {
            Ok(id) => id,
            Err(_) => {
                // Local table unusable; rebuild it from scratch.
                warn!(table = %table, "local table missing or unreadable, falling back to full copy");
                return self.copy_table(remote, local, table).await;
            }
        };

        debug!(table = %table, from_id = current_max_id, "incremental update");

        let placeholders = vec!["?"; schema.columns.len()].join(",");
        let insert_sql = format!("INSERT OR IGNORE INTO `{table}` VALUES ({placeholders})");
        let select_sql = format!("SELECT * FROM `{table}` WHERE id > ? ORDER BY id LIMIT ?");
        let dump_dam = table == "CSV_DAM_ACTIVITY";

        let mut total_inserted: u64 = 0;
        loop {
            let rows: Vec<MySqlRow> = tokio::time::timeout(
                MYSQL_OP_TIMEOUT,
                sqlx::query(&select_sql)
                    .bind(current_max_id)
                    .bind(self.chunk_size as i64)
                    .fetch_all(&mut *remote),
            )
            .await
            .map_err(|_| BackupError::Remote(sqlx::Error::PoolTimedOut))?
            .map_err(BackupError::Remote)?;

            let fetched = rows.len();
            if fetched > 0 {
                let mut batch = Vec::with_capacity(fetched);
                for row in &rows {
                    batch.push(decode_mysql_row(row, &schema.columns).map_err(BackupError::Remote)?);
                }

                let inserted = flush_batch(local, &insert_sql, &batch).await?;
                if (inserted as usize) < fetched {
                    // A resent id means the remote writer recycled keys.
                    warn!(
                        table = %table,
                        skipped = fetched - inserted as usize,
                        "duplicate ids skipped during incremental update"
                    );
                }
                total_inserted += inserted;

                if let Some(SqlValue::Int(last_id)) = batch.last().and_then(|row| row.first()) {
                    current_max_id = *last_id;
                }

                if dump_dam {
                    append_dam_rows(&self.dam_file, &batch)?;
                }
            }

            if !chunk_has_more(fetched, self.chunk_stop_threshold) {
                break;
            }
        }

        if total_inserted > 0 {
            info!(table = %table, rows = total_inserted, "incremental update done");
        }
        Ok(total_inserted)
    }

    /// Row-by-row sync for the keyless tables. O(rows), but these tables are
    /// tiny and nearly static.
    async fn update_table_without_id(
        &self,
        remote: &mut MySqlConnection,
        local: &mut SqliteConnection,
        table: &str,
    ) -> Result<u64, BackupError> {
        let schema = self.ensure_table(remote, local, table).await?;
        let columns = schema.column_names();

        let select_sql = format!("SELECT * FROM `{table}`");
        let rows: Vec<MySqlRow> =
            tokio::time::timeout(MYSQL_OP_TIMEOUT, sqlx::query(&select_sql).fetch_all(&mut *remote))
                .await
                .map_err(|_| BackupError::Remote(sqlx::Error::PoolTimedOut))?
                .map_err(BackupError::Remote)?;

        if rows.is_empty() {
            return Ok(0);
        }

        let column_list = columns
            .iter()
            .map(|c| format!("`{c}`"))
            .collect::<Vec<_>>()
            .join(", ");
        // `IS` instead of `=` so NULL cells still match their counterpart.
        let where_clause = columns
            .iter()
            .map(|c| format!("`{c}` IS ?"))
            .collect::<Vec<_>>()
            .join(" AND ");
        let exists_sql = format!("SELECT 1 FROM `{table}` WHERE {where_clause} LIMIT 1");
        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert_sql = format!("INSERT INTO `{table}` ({column_list}) VALUES ({placeholders})");

        let mut inserted: u64 = 0;
        for row in &rows {
            let values = decode_mysql_row(row, &schema.columns).map_err(BackupError::Remote)?;

            let mut exists = sqlx::query(&exists_sql);
            for value in &values {
                exists = bind_sqlite(exists, value);
            }
            let present = exists
                .fetch_optional(&mut *local)
                .await
                .map_err(BackupError::Local)?
                .is_some();

            if !present {
                let mut insert = sqlx::query(&insert_sql);
                for value in &values {
                    insert = bind_sqlite(insert, value);
                }
                insert.execute(&mut *local).await.map_err(BackupError::Local)?;
                inserted += 1;
            }
        }

        if inserted > 0 {
            info!(table = %table, rows = inserted, "keyless table synced");
        }
        Ok(inserted)
    }

    /// Make sure the local table exists with the remote's (mapped) schema,
    /// migrating it when the expected PRIMARY KEY is missing.
    async fn ensure_table(
        &self,
        remote: &mut MySqlConnection,
        local: &mut SqliteConnection,
        table: &str,
    ) -> Result<TableSchema, BackupError> {
        let schema = fetch_remote_schema(remote, table).await?;

        let exists: Option<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(&mut *local)
                .await
                .map_err(BackupError::Local)?;

        if exists.is_none() {
            debug!(table = %table, "creating local table");
            sqlx::query(&schema.create_sql(table))
                .execute(&mut *local)
                .await
                .map_err(BackupError::Local)?;
        } else if !has_expected_primary_key(local, table, &schema).await? {
            info!(table = %table, "local table lacks the expected PRIMARY KEY, migrating");
            migrate_table(local, table, &schema).await?;
        }

        Ok(schema)
    }

    /// Percentage of remote data present locally, or -1 on any error.
    ///
    /// Fast mode trusts `INFORMATION_SCHEMA.TABLE_ROWS` (approximate under
    /// InnoDB); slow mode issues per-table `MAX(id)` / `COUNT(*)` on both
    /// sides. More than 100% means the local side holds rows the remote has
    /// since forgotten; that is logged and the value capped.
    pub async fn compare_databases(&self, fast: bool) -> f64 {
        match self.compare_databases_inner(fast).await {
            Ok(percentage) => {
                if percentage > 100.0 {
                    warn!(
                        dst = %self.dst_path.display(),
                        percentage,
                        "local replica has more rows than the remote (possible duplicates)"
                    );
                    100.0
                } else {
                    percentage
                }
            }
            Err(err) => {
                debug!(dst = %self.dst_path.display(), error = %err, "database comparison failed");
                -1.0
            }
        }
    }

    async fn compare_databases_inner(&self, fast: bool) -> Result<f64, BackupError> {
        let mut remote = self.connect_remote().await?;

        let remote_counts: Vec<(String, i64)> = if fast {
            let rows: Vec<MySqlRow> = sqlx::query(
                "SELECT table_name, table_rows FROM INFORMATION_SCHEMA.TABLES \
                 WHERE table_schema = ?",
            )
            .bind(&self.remote_db)
            .fetch_all(&mut remote)
            .await
            .map_err(BackupError::Remote)?;
            rows.iter()
                .map(|row| {
                    let name: String = row.try_get(0)?;
                    // TABLE_ROWS is unsigned; fall back when the signed
                    // decode is refused.
                    let count: i64 = match row.try_get::<Option<i64>, _>(1) {
                        Ok(v) => v.unwrap_or(0),
                        Err(_) => row.try_get::<Option<u64>, _>(1)?.unwrap_or(0) as i64,
                    };
                    Ok((name, count))
                })
                .collect::<Result<_, sqlx::Error>>()
                .map_err(BackupError::Remote)?
        } else {
            let tables = list_remote_tables(&mut remote).await?;
            let mut counts = Vec::with_capacity(tables.len());
            for table in tables {
                let sql = if is_table_without_key(&table) {
                    format!("SELECT COUNT(*) FROM `{table}`")
                } else {
                    format!("SELECT COALESCE(MAX(id), 0) FROM `{table}`")
                };
                let count: i64 = sqlx::query_scalar(&sql)
                    .fetch_one(&mut remote)
                    .await
                    .unwrap_or(0);
                counts.push((table, count));
            }
            counts
        };

        let mut local = self.open_local_readonly().await?;
        let local_tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&mut local)
        .await
        .map_err(BackupError::Local)?;

        let mut local_total: i64 = 0;
        for table in &local_tables {
            let sql = if is_table_without_key(table) {
                format!("SELECT COUNT(*) FROM `{table}`")
            } else {
                format!("SELECT COALESCE(MAX(id), 0) FROM `{table}`")
            };
            let count: i64 = sqlx::query_scalar(&sql)
                .fetch_one(&mut local)
                .await
                .unwrap_or(0);
            local_total += count;
        }

        let remote_total: i64 = remote_counts.iter().map(|(_, count)| count).sum();
        if remote_total == 0 {
            return Ok(-1.0);
        }
        Ok(local_total as f64 / remote_total as f64 * 100.0)
    }

    async fn open_local_readonly(&self) -> Result<SqliteConnection, BackupError> {
        if !self.dst_path.exists() {
            return Err(BackupError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no replica at {}", self.dst_path.display()),
            )));
        }
        let options = SqliteConnectOptions::new()
            .filename(&self.dst_path)
            .read_only(true)
            .busy_timeout(Duration::from_secs(10));
        SqliteConnection::connect_with(&options)
            .await
            .map_err(BackupError::Local)
    }
}

/// `SELECT COUNT(*) FROM VAR_MAP` must be positive before a copy makes sense.
async fn ensure_remote_ready(remote: &mut MySqlConnection) -> Result<(), BackupError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM VAR_MAP")
        .fetch_one(remote)
        .await
        .map_err(BackupError::Remote)?;
    if count == 0 {
        return Err(BackupError::NotReady);
    }
    Ok(())
}

async fn list_remote_tables(remote: &mut MySqlConnection) -> Result<Vec<String>, BackupError> {
    let rows: Vec<MySqlRow> = sqlx::query("SHOW TABLES")
        .fetch_all(remote)
        .await
        .map_err(BackupError::Remote)?;
    rows.iter()
        .map(|row| row.try_get::<String, _>(0))
        .collect::<Result<_, _>>()
        .map_err(BackupError::Remote)
}

/// `SHOW COLUMNS` → mapped [`TableSchema`].
async fn fetch_remote_schema(
    remote: &mut MySqlConnection,
    table: &str,
) -> Result<TableSchema, BackupError> {
    let rows: Vec<MySqlRow> = sqlx::query(&format!("SHOW COLUMNS FROM `{table}`"))
        .fetch_all(remote)
        .await
        .map_err(BackupError::Remote)?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in &rows {
        let name: String = row.try_get("Field").map_err(BackupError::Remote)?;
        let mysql_type: String = row.try_get("Type").map_err(BackupError::Remote)?;
        let nullable: String = row.try_get("Null").map_err(BackupError::Remote)?;
        let key: String = row.try_get("Key").map_err(BackupError::Remote)?;
        let extra: String = row.try_get("Extra").map_err(BackupError::Remote)?;

        columns.push(ColumnSpec {
            name,
            sqlite_type: mysql_to_sqlite_type(&mysql_type),
            nullable: nullable.eq_ignore_ascii_case("yes"),
            is_primary: key == "PRI",
            is_auto_increment: extra.to_lowercase().contains("auto_increment"),
        });
    }
    Ok(TableSchema { columns })
}

/// Does the local table carry the PRIMARY KEY the remote schema expects?
async fn has_expected_primary_key(
    local: &mut SqliteConnection,
    table: &str,
    schema: &TableSchema,
) -> Result<bool, BackupError> {
    let Some(expected_pk) = schema.primary_key() else {
        // Keyless remotely means anything local is acceptable.
        return Ok(true);
    };

    let rows = sqlx::query(&format!("PRAGMA table_info(`{table}`)"))
        .fetch_all(&mut *local)
        .await
        .map_err(BackupError::Local)?;

    for row in &rows {
        let name: String = row.try_get("name").map_err(BackupError::Local)?;
        let pk: i64 = row.try_get("pk").map_err(BackupError::Local)?;
        if name == expected_pk && pk == 1 {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Rebuild a table whose local schema lacks the expected constraints.
///
/// The old table is renamed to `<t>_backup_<epoch>`, the new one created from
/// the remote schema, and rows copied back with `INSERT OR IGNORE` ordered by
/// the key — duplicates from the pre-constraint era collapse to the first
/// writer. If recreation fails, the rename is reverted.
pub async fn migrate_table(
    local: &mut SqliteConnection,
    table: &str,
    schema: &TableSchema,
) -> Result<(), BackupError> {
    let epoch = chrono::Utc::now().timestamp();
    let backup_table = format!("{table}_backup_{epoch}");

    sqlx::query(&format!("ALTER TABLE `{table}` RENAME TO `{backup_table}`"))
        .execute(&mut *local)
        .await
        .map_err(BackupError::Local)?;

    if let Err(err) = sqlx::query(&schema.create_sql(table)).execute(&mut *local).await {
        warn!(table = %table, error = %err, "could not recreate table, restoring the original");
        sqlx::query(&format!("ALTER TABLE `{backup_table}` RENAME TO `{table}`"))
            .execute(&mut *local)
            .await
            .map_err(BackupError::Local)?;
        return Err(BackupError::Local(err));
    }

    let order_clause = schema
        .primary_key()
        .map(|pk| format!(" ORDER BY `{pk}`"))
        .unwrap_or_default();
    sqlx::query(&format!(
        "INSERT OR IGNORE INTO `{table}` SELECT * FROM `{backup_table}`{order_clause}"
    ))
    .execute(&mut *local)
    .await
    .map_err(BackupError::Local)?;

    let original: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM `{backup_table}`"))
        .fetch_one(&mut *local)
        .await
        .map_err(BackupError::Local)?;
    let migrated: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM `{table}`"))
        .fetch_one(&mut *local)
        .await
        .map_err(BackupError::Local)?;
    if migrated < original {
        warn!(
            table = %table,
            removed = original - migrated,
            "duplicate rows removed during migration"
        );
    }

    sqlx::query(&format!("DROP TABLE `{backup_table}`"))
        .execute(&mut *local)
        .await
        .map_err(BackupError::Local)?;

    info!(table = %table, rows = migrated, "table migrated");
    Ok(())
}

/// Insert a batch inside one transaction; returns rows actually inserted.
async fn flush_batch(
    local: &mut SqliteConnection,
    insert_sql: &str,
    batch: &[Vec<SqlValue>],
) -> Result<u64, BackupError> {
    let mut tx = local.begin().await.map_err(BackupError::Local)?;
    let mut inserted: u64 = 0;
    for row in batch {
        let mut query = sqlx::query(insert_sql);
        for value in row {
            query = bind_sqlite(query, value);
        }
        let result = query.execute(&mut *tx).await.map_err(BackupError::Local)?;
        inserted += result.rows_affected();
    }
    tx.commit().await.map_err(BackupError::Local)?;
    Ok(inserted)
}

/// Informational completeness probe used by the poller: percentage of the
/// remote database present at `dst_path`, or -1 on error.
pub async fn db_diff(remote_host: &str, remote_db: &str, dst_path: &Path) -> f64 {
    MySqlToSqlite::new(dst_path, remote_host, remote_db)
        .compare_databases(true)
        .await
}

/// Recover the backup filename for a device running pre-2022 firmware by
/// reading the experiment start time from its `METADATA` table.
pub async fn remote_backup_filename(
    remote_host: &str,
    remote_db: &str,
    device_id: &str,
) -> Result<String, BackupError> {
    let options = MySqlConnectOptions::new()
        .host(remote_host)
        .username(DEVICE_DB_USER)
        .password(DEVICE_DB_PASS)
        .database(remote_db)
        .charset(SQL_CHARSET);
    let mut conn =
        match tokio::time::timeout(Duration::from_secs(30), MySqlConnection::connect_with(&options))
            .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => return Err(BackupError::Remote(err)),
            Err(_) => return Err(BackupError::ConnectTimeout),
        };

    let value: String =
        sqlx::query_scalar("SELECT value FROM METADATA WHERE field = 'date_time'")
            .fetch_one(&mut conn)
            .await
            .map_err(BackupError::Remote)?;
    let timestamp = value
        .parse::<f64>()
        .map_err(|_| BackupError::Remote(sqlx::Error::Decode(
            format!("METADATA date_time is not a timestamp: {value}").into(),
        )))?;

    Ok(crate::device::backup_filename_for(timestamp as i64, device_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_sqlite() -> SqliteConnection {
        SqliteConnection::connect_with(&SqliteConnectOptions::new())
            .await
            .expect("in-memory sqlite")
    }

    fn roi_schema() -> TableSchema {
        TableSchema {
            columns: vec![
                ColumnSpec {
                    name: "id".into(),
                    sqlite_type: "INTEGER",
                    nullable: false,
                    is_primary: true,
                    is_auto_increment: true,
                },
                ColumnSpec {
                    name: "t".into(),
                    sqlite_type: "INTEGER",
                    nullable: false,
                    is_primary: false,
                    is_auto_increment: false,
                },
                ColumnSpec {
                    name: "x".into(),
                    sqlite_type: "REAL",
                    nullable: true,
                    is_primary: false,
                    is_auto_increment: false,
                },
            ],
        }
    }

    #[test]
    fn test_mysql_type_mapping() {
        assert_eq!(mysql_to_sqlite_type("int(11)"), "INTEGER");
        assert_eq!(mysql_to_sqlite_type("smallint(6)"), "INTEGER");
        assert_eq!(mysql_to_sqlite_type("BIGINT"), "INTEGER");
        assert_eq!(mysql_to_sqlite_type("varchar(100)"), "TEXT");
        assert_eq!(mysql_to_sqlite_type("text"), "TEXT");
        assert_eq!(mysql_to_sqlite_type("char(32)"), "TEXT");
        assert_eq!(mysql_to_sqlite_type("float"), "REAL");
        assert_eq!(mysql_to_sqlite_type("double"), "REAL");
        assert_eq!(mysql_to_sqlite_type("decimal(10,2)"), "REAL");
        assert_eq!(mysql_to_sqlite_type("longblob"), "BLOB");
        assert_eq!(mysql_to_sqlite_type("datetime"), "TEXT", "fallback is TEXT");
    }

    #[test]
    fn test_create_sql_preserves_primary_key() {
        let sql = roi_schema().create_sql("ROI_1");
        assert_eq!(
            sql,
            "CREATE TABLE `ROI_1` (`id` INTEGER PRIMARY KEY, `t` INTEGER NOT NULL, `x` REAL)"
        );
    }

    #[test]
    fn test_chunk_stop_threshold_boundary() {
        // Exactly at the threshold → fetch another chunk.
        assert!(chunk_has_more(100, 100));
        assert!(chunk_has_more(200, 100));
        // One below → caught up, stop.
        assert!(!chunk_has_more(99, 100));
        assert!(!chunk_has_more(0, 100));
    }

    #[test]
    fn test_keyless_table_set() {
        assert!(is_table_without_key("METADATA"));
        assert!(is_table_without_key("VAR_MAP"));
        assert!(is_table_without_key("ROI_MAP"));
        assert!(!is_table_without_key("ROI_1"));
        assert!(!is_table_without_key("CSV_DAM_ACTIVITY"));
    }

    #[test]
    fn test_sql_value_display() {
        assert_eq!(SqlValue::Int(42).to_string(), "42");
        assert_eq!(SqlValue::Real(1.5).to_string(), "1.5");
        assert_eq!(SqlValue::Text("fly".into()).to_string(), "fly");
        assert_eq!(SqlValue::Null.to_string(), "");
        assert_eq!(SqlValue::Blob(vec![0xde, 0xad]).to_string(), "dead");
    }

    #[test]
    fn test_dam_rows_are_tab_separated() {
        let dir = tempfile::tempdir().unwrap();
        let dam = dir.path().join("device.txt");

        append_dam_rows(
            &dam,
            &[
                vec![SqlValue::Int(1), SqlValue::Int(100), SqlValue::Int(3)],
                vec![SqlValue::Int(2), SqlValue::Int(160), SqlValue::Int(0)],
            ],
        )
        .unwrap();
        // Appends accumulate across calls.
        append_dam_rows(&dam, &[vec![SqlValue::Int(3), SqlValue::Int(220), SqlValue::Int(7)]])
            .unwrap();

        let contents = std::fs::read_to_string(&dam).unwrap();
        assert_eq!(contents, "1\t100\t3\n2\t160\t0\n3\t220\t7\n");
    }

    #[tokio::test]
    async fn test_has_expected_primary_key() {
        let mut conn = memory_sqlite().await;
        let schema = roi_schema();

        sqlx::query("CREATE TABLE `ROI_1` (`id` INTEGER PRIMARY KEY, `t` INTEGER NOT NULL, `x` REAL)")
            .execute(&mut conn)
            .await
            .unwrap();
        assert!(has_expected_primary_key(&mut conn, "ROI_1", &schema)
            .await
            .unwrap());

        sqlx::query("CREATE TABLE `ROI_2` (`id` INTEGER, `t` INTEGER, `x` REAL)")
            .execute(&mut conn)
            .await
            .unwrap();
        assert!(!has_expected_primary_key(&mut conn, "ROI_2", &schema)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_keyless_schema_always_acceptable() {
        let mut conn = memory_sqlite().await;
        let schema = TableSchema {
            columns: vec![
                ColumnSpec {
                    name: "field".into(),
                    sqlite_type: "TEXT",
                    nullable: false,
                    is_primary: false,
                    is_auto_increment: false,
                },
                ColumnSpec {
                    name: "value".into(),
                    sqlite_type: "TEXT",
                    nullable: true,
                    is_primary: false,
                    is_auto_increment: false,
                },
            ],
        };
        sqlx::query("CREATE TABLE `METADATA` (`field` TEXT, `value` TEXT)")
            .execute(&mut conn)
            .await
            .unwrap();
        assert!(has_expected_primary_key(&mut conn, "METADATA", &schema)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_migration_deduplicates_and_adds_key() {
        let mut conn = memory_sqlite().await;
        let schema = roi_schema();

        // Pre-constraint table with a duplicated id from the old bug.
        sqlx::query("CREATE TABLE `ROI_2` (`id` INTEGER, `t` INTEGER, `x` REAL)")
            .execute(&mut conn)
            .await
            .unwrap();
        for (id, t, x) in [(1i64, 10i64, 0.5f64), (2, 20, 0.6), (2, 21, 0.7), (3, 30, 0.8)] {
            sqlx::query("INSERT INTO `ROI_2` VALUES (?, ?, ?)")
                .bind(id)
                .bind(t)
                .bind(x)
                .execute(&mut conn)
                .await
                .unwrap();
        }

        migrate_table(&mut conn, "ROI_2", &schema).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM `ROI_2`")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(count, 3, "duplicate id collapsed to the first writer");

        // First writer kept: id 2 retains t = 20.
        let t: i64 = sqlx::query_scalar("SELECT t FROM `ROI_2` WHERE id = 2")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(t, 20);

        assert!(has_expected_primary_key(&mut conn, "ROI_2", &schema)
            .await
            .unwrap());

        // The scratch table is gone.
        let leftovers: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE name LIKE 'ROI_2_backup_%'",
        )
        .fetch_all(&mut conn)
        .await
        .unwrap();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_migration_is_noop_safe_on_correct_table() {
        let mut conn = memory_sqlite().await;
        let schema = roi_schema();

        sqlx::query(&schema.create_sql("ROI_1"))
            .execute(&mut conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO `ROI_1` VALUES (1, 10, 0.5)")
            .execute(&mut conn)
            .await
            .unwrap();

        // A correct table never reaches migrate_table through ensure_table,
        // but running it anyway must not lose rows.
        migrate_table(&mut conn, "ROI_1", &schema).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM `ROI_1`")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_flush_batch_reports_ignored_rows() {
        let mut conn = memory_sqlite().await;
        sqlx::query("CREATE TABLE `ROI_1` (`id` INTEGER PRIMARY KEY, `t` INTEGER NOT NULL, `x` REAL)")
            .execute(&mut conn)
            .await
            .unwrap();

        let insert = "INSERT OR IGNORE INTO `ROI_1` VALUES (?,?,?)";
        let batch = vec![
            vec![SqlValue::Int(1), SqlValue::Int(10), SqlValue::Real(0.1)],
            vec![SqlValue::Int(2), SqlValue::Int(20), SqlValue::Real(0.2)],
        ];
        assert_eq!(flush_batch(&mut conn, insert, &batch).await.unwrap(), 2);

        // Re-sending the same ids inserts nothing.
        assert_eq!(flush_batch(&mut conn, insert, &batch).await.unwrap(), 0);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM `ROI_1`")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
