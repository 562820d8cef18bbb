//! SQLite-backed migration record store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    AppendProgress, MigrationFilter, MigrationRecord, MigrationStore, ProgressEntry, StoreError,
};

const RECORD_COLUMNS: &str = "instance_id, source_server_id, target_server_id, target_instance_id, phase, state, automatic, override_instance_id, override_alias, job_id, created_at, updated_at";

/// SQLite-backed migration record store.
pub struct SqliteMigrationStore {
    conn: Mutex<Connection>,
}

impl SqliteMigrationStore {
    /// Create a new store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS migrations (
                instance_id TEXT PRIMARY KEY,
                source_server_id TEXT NOT NULL,
                target_server_id TEXT,
                target_instance_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                state TEXT NOT NULL,
                automatic INTEGER NOT NULL DEFAULT 0,
                override_instance_id TEXT,
                override_alias TEXT,
                job_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_migrations_state ON migrations(state);

            CREATE TABLE IF NOT EXISTS migration_progress (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL REFERENCES migrations(instance_id),
                phase TEXT NOT NULL,
                state TEXT NOT NULL,
                current_progress INTEGER NOT NULL,
                total_progress INTEGER NOT NULL,
                transfer_bytes_per_second INTEGER,
                eta_ms INTEGER,
                message TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_progress_instance ON migration_progress(instance_id, id);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection lock poisoned".to_string()))
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<MigrationRecord> {
        let phase: String = row.get(4)?;
        let state: String = row.get(5)?;
        let created_at: String = row.get(10)?;
        let updated_at: String = row.get(11)?;

        Ok(MigrationRecord {
            instance_id: row.get(0)?,
            source_server_id: row.get(1)?,
            target_server_id: row.get(2)?,
            target_instance_id: row.get(3)?,
            phase: phase.parse().map_err(|e| conversion_err(4, e))?,
            state: state.parse().map_err(|e| conversion_err(5, e))?,
            automatic: row.get(6)?,
            override_instance_id: row.get(7)?,
            override_alias: row.get(8)?,
            job_id: row.get(9)?,
            progress_history: Vec::new(),
            created_at: parse_timestamp(10, &created_at)?,
            updated_at: parse_timestamp(11, &updated_at)?,
        })
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<ProgressEntry> {
        let phase: String = row.get(0)?;
        let state: String = row.get(1)?;
        let timestamp: String = row.get(7)?;

        Ok(ProgressEntry {
            phase: phase.parse().map_err(|e| conversion_err(0, e))?,
            state: state.parse().map_err(|e| conversion_err(1, e))?,
            current_progress: row.get(2)?,
            total_progress: row.get(3)?,
            transfer_bytes_per_second: row.get(4)?,
            eta_ms: row.get(5)?,
            message: row.get(6)?,
            timestamp: parse_timestamp(7, &timestamp)?,
        })
    }

    fn load_history(
        conn: &Connection,
        instance_id: &str,
    ) -> Result<Vec<ProgressEntry>, StoreError> {
        let mut stmt = conn
            .prepare(
                "SELECT phase, state, current_progress, total_progress, transfer_bytes_per_second, eta_ms, message, timestamp FROM migration_progress WHERE instance_id = ? ORDER BY id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![instance_id], Self::row_to_entry)
            .map_err(db_err)?;

        let mut history = Vec::new();
        for row in rows {
            history.push(row.map_err(db_err)?);
        }
        Ok(history)
    }

    fn load_record(
        conn: &Connection,
        instance_id: &str,
    ) -> Result<Option<MigrationRecord>, StoreError> {
        let sql = format!("SELECT {} FROM migrations WHERE instance_id = ?", RECORD_COLUMNS);
        let record = conn
            .query_row(&sql, params![instance_id], Self::row_to_record)
            .optional()
            .map_err(db_err)?;

        match record {
            Some(mut record) => {
                record.progress_history = Self::load_history(conn, instance_id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

impl MigrationStore for SqliteMigrationStore {
    fn get(&self, instance_id: &str) -> Result<Option<MigrationRecord>, StoreError> {
        let conn = self.lock()?;
        Self::load_record(&conn, instance_id)
    }

    fn list(&self, filter: &MigrationFilter) -> Result<Vec<MigrationRecord>, StoreError> {
        let mut conn = self.lock()?;
        // Header and history reads share one snapshot.
        let tx = conn.transaction().map_err(db_err)?;

        let mut conditions = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref instance_id) = filter.instance_id {
            conditions.push("instance_id = ?");
            values.push(Box::new(instance_id.clone()));
        }
        if let Some(state) = filter.state {
            conditions.push("state = ?");
            values.push(Box::new(state.as_str()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT {} FROM migrations {} ORDER BY created_at ASC, instance_id ASC LIMIT ? OFFSET ?",
            RECORD_COLUMNS, where_clause
        );
        values.push(Box::new(filter.limit));
        values.push(Box::new(filter.offset));
        let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|p| p.as_ref()).collect();

        let mut records = {
            let mut stmt = tx.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(param_refs.as_slice(), Self::row_to_record)
                .map_err(db_err)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(db_err)?);
            }
            records
        };

        for record in &mut records {
            record.progress_history = Self::load_history(&tx, &record.instance_id)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(records)
    }

    fn put(&self, record: &MigrationRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO migrations (instance_id, source_server_id, target_server_id, target_instance_id, phase, state, automatic, override_instance_id, override_alias, job_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(instance_id) DO UPDATE SET
                source_server_id = excluded.source_server_id,
                target_server_id = excluded.target_server_id,
                target_instance_id = excluded.target_instance_id,
                phase = excluded.phase,
                state = excluded.state,
                automatic = excluded.automatic,
                override_instance_id = excluded.override_instance_id,
                override_alias = excluded.override_alias,
                job_id = excluded.job_id,
                updated_at = excluded.updated_at",
            params![
                record.instance_id,
                record.source_server_id,
                record.target_server_id,
                record.target_instance_id,
                record.phase.as_str(),
                record.state.as_str(),
                record.automatic,
                record.override_instance_id,
                record.override_alias,
                record.job_id,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn append_progress(
        &self,
        instance_id: &str,
        update: AppendProgress,
    ) -> Result<MigrationRecord, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let now = Utc::now();
        let changed = tx
            .execute(
                "UPDATE migrations SET phase = ?, state = ?, updated_at = ? WHERE instance_id = ?",
                params![
                    update.phase.as_str(),
                    update.state.as_str(),
                    now.to_rfc3339(),
                    instance_id
                ],
            )
            .map_err(db_err)?;

        if changed == 0 {
            return Err(StoreError::NotFound(instance_id.to_string()));
        }

        let entry = &update.entry;
        tx.execute(
            "INSERT INTO migration_progress (instance_id, phase, state, current_progress, total_progress, transfer_bytes_per_second, eta_ms, message, timestamp) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                instance_id,
                entry.phase.as_str(),
                entry.state.as_str(),
                entry.current_progress,
                entry.total_progress,
                entry.transfer_bytes_per_second,
                entry.eta_ms,
                entry.message,
                entry.timestamp.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        let record = Self::load_record(&tx, instance_id)?
            .ok_or_else(|| StoreError::NotFound(instance_id.to_string()))?;

        tx.commit().map_err(db_err)?;
        Ok(record)
    }
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn conversion_err(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(column, format!("invalid timestamp {:?}: {}", value, e)))
}
