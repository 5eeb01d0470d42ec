//! SQLite database implementation for the shared stores
//!
//! Every watchdog process opens the same database file. WAL mode plus a busy
//! timeout lets them read and write concurrently.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, error, info};

use super::{ActivityRecord, ActivityStore, EventLog, ProtectionStore, StatusMirror};
use crate::core::{
    push_bounded, EventLogEntry, InstanceId, InstanceStatus, ProtectionSet, Settings, TargetId,
    DEFAULT_EVENT_LOG_CAPACITY,
};

/// Namespace of the protection configuration records
const PREFS_NAMESPACE: &str = "unkill_prefs";
const PROTECTED_APPS_KEY: &str = "protected_apps";
const PROTECTED_APPS_COUNT_KEY: &str = "protected_apps_count";

/// Namespace of the shared event log record
const DEBUG_NAMESPACE: &str = "unkill_global_debug";
const DEBUG_LOG_KEY: &str = "global_debug_log";

/// How long a writer waits for another process holding the lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
    event_capacity: usize,
}

impl Database {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)
            .context(format!("Failed to open database at {:?}", path))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        info!("Database opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            event_capacity: DEFAULT_EVENT_LOG_CAPACITY,
        })
    }

    /// Open the database in the settings' data directory
    pub fn for_settings(settings: &Settings) -> Result<Self> {
        let db = Self::open(settings.get_database_path())?
            .with_event_capacity(settings.event_log_capacity);
        db.initialize()?;
        Ok(db)
    }

    /// Number of entries the event log keeps
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Initialize database schema
    pub fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            -- Settings table
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Named records shared between processes
            CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            );

            -- Last sighting of each protected target
            CREATE TABLE IF NOT EXISTS activity (
                target_id TEXT PRIMARY KEY,
                last_seen TEXT NOT NULL,
                executable TEXT,
                arguments TEXT NOT NULL
            );

            -- Mirror of the coordinator's status table
            CREATE TABLE IF NOT EXISTS statuses (
                instance_id INTEGER PRIMARY KEY,
                data TEXT NOT NULL
            );
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    // === Settings ===

    /// Load settings from database
    pub fn load_settings(&self) -> Result<Option<Settings>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = 'app_settings'")?;
        let result: Option<String> = stmt.query_row([], |row| row.get(0)).optional()?;

        match result {
            Some(json) => {
                let mut settings: Settings =
                    serde_json::from_str(&json).context("Failed to deserialize settings")?;
                // Validate and fix any invalid values after deserialization
                settings.validate();
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Save settings to database
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.lock()?;
        let json = serde_json::to_string(settings)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('app_settings', ?1)",
            params![json],
        )?;
        debug!("Settings saved");
        Ok(())
    }

    // === Named records ===

    fn read_record(conn: &Connection, namespace: &str, key: &str) -> Result<Option<String>> {
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write_record(conn: &Connection, namespace: &str, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)",
            params![namespace, key, value],
        )?;
        Ok(())
    }
}

// === Protection set ===

impl ProtectionStore for Database {
    fn get(&self) -> Result<ProtectionSet> {
        let conn = self.lock()?;
        match Self::read_record(&conn, PREFS_NAMESPACE, PROTECTED_APPS_KEY)? {
            Some(json) => {
                serde_json::from_str(&json).context("Failed to deserialize protection set")
            }
            None => Ok(ProtectionSet::new()),
        }
    }

    fn replace_protection_set(&self, set: &ProtectionSet) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let json = serde_json::to_string(set)?;
        Self::write_record(&tx, PREFS_NAMESPACE, PROTECTED_APPS_KEY, &json)?;
        Self::write_record(
            &tx,
            PREFS_NAMESPACE,
            PROTECTED_APPS_COUNT_KEY,
            &set.len().to_string(),
        )?;
        tx.commit()?;

        debug!("Protection set saved with {} targets", set.len());
        Ok(())
    }
}

// === Event log ===

impl EventLog for Database {
    fn append(&self, source: InstanceId, message: &str) -> Result<()> {
        let mut conn = self.lock()?;

        // Read, append and trim under one write lock on the database so
        // writers in other processes cannot interleave.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = Self::read_record(&tx, DEBUG_NAMESPACE, DEBUG_LOG_KEY)?.unwrap_or_default();

        let mut lines: Vec<String> = existing
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        lines.push(EventLogEntry::new(Utc::now(), source, message).to_line());
        if lines.len() > self.event_capacity {
            let excess = lines.len() - self.event_capacity;
            lines.drain(..excess);
        }

        Self::write_record(&tx, DEBUG_NAMESPACE, DEBUG_LOG_KEY, &lines.join("\n"))?;
        tx.commit()?;
        Ok(())
    }

    fn read(&self) -> Result<Vec<EventLogEntry>> {
        let conn = self.lock()?;
        let log = Self::read_record(&conn, DEBUG_NAMESPACE, DEBUG_LOG_KEY)?.unwrap_or_default();

        let mut entries = Vec::new();
        for line in log.lines().filter(|line| !line.is_empty()) {
            match EventLogEntry::parse_line(line) {
                Some(entry) => push_bounded(&mut entries, entry, self.event_capacity),
                None => debug!("Skipping unparseable event log line: {}", line),
            }
        }
        Ok(entries)
    }
}

// === Activity ===

impl ActivityStore for Database {
    fn record_sighting(&self, target: &TargetId, record: &ActivityRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO activity (target_id, last_seen, executable, arguments)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                target.as_str(),
                record.last_seen.to_rfc3339(),
                record
                    .executable
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
                serde_json::to_string(&record.arguments)?,
            ],
        )?;
        Ok(())
    }

    fn last_sighting(&self, target: &TargetId) -> Result<Option<ActivityRecord>> {
        let conn = self.lock()?;
        let row: Option<(String, Option<String>, String)> = conn
            .query_row(
                "SELECT last_seen, executable, arguments FROM activity WHERE target_id = ?1",
                params![target.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((last_seen, executable, arguments)) = row else {
            return Ok(None);
        };

        let last_seen = chrono::DateTime::parse_from_rfc3339(&last_seen)
            .context("Invalid last_seen timestamp")?
            .with_timezone(&Utc);
        let arguments = serde_json::from_str(&arguments).unwrap_or_else(|e| {
            error!("Failed to deserialize arguments for {}: {}", target, e);
            Vec::new()
        });

        Ok(Some(ActivityRecord {
            last_seen,
            executable: executable.map(PathBuf::from),
            arguments,
        }))
    }
}

// === Status mirror ===

impl StatusMirror for Database {
    fn save_status(&self, status: &InstanceStatus) -> Result<()> {
        let conn = self.lock()?;
        let json = serde_json::to_string(status)?;
        conn.execute(
            "INSERT OR REPLACE INTO statuses (instance_id, data) VALUES (?1, ?2)",
            params![status.instance_id.get(), json],
        )?;
        Ok(())
    }

    fn load_statuses(&self) -> Result<Vec<InstanceStatus>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT data FROM statuses ORDER BY instance_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut result = Vec::new();
        for json in rows {
            let json = json?;
            match serde_json::from_str::<InstanceStatus>(&json) {
                Ok(status) => result.push(status),
                Err(e) => error!("Failed to deserialize instance status: {}", e),
            }
        }
        Ok(result)
    }
}
