use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use seatbase_core::{
    DefaultsSeeder, EntityDirectory, EntityId, EntityKind, SchemaVersion, StoreError, VersionStore,
    SETTING_DATABASE_VERSION,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

mod extension;
mod units;

pub use extension::ExtensionManifest;
pub use units::{core_unit_definitions, core_units, SchemaStep, SqlUnit, TARGET_SCHEMA_VERSION};

const CREATE_GLOBAL_STATE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS global_settings (
  name TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_upgrade_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  from_version INTEGER NOT NULL CHECK (from_version >= 0),
  to_version INTEGER NOT NULL CHECK (to_version > from_version),
  unit_count INTEGER NOT NULL CHECK (unit_count >= 0),
  applied_at TEXT NOT NULL
);
";

pub type DefaultSet = &'static [(&'static str, &'static str)];

/// Defaults written for an organization that has no settings yet.
pub const ORG_DEFAULT_SETTINGS: DefaultSet = &[
    ("allow_any_user", "1"),
    ("confluence_anonymous", "0"),
    ("daily_basis_booking", "0"),
    ("max_bookings_per_user", "10"),
    ("max_concurrent_bookings_per_user", "0"),
    ("max_days_in_advance", "14"),
    ("max_booking_duration_hours", "12"),
    ("max_hours_partially_booked", "8"),
    ("min_booking_duration_hours", "0"),
    ("show_names", "0"),
    ("default_timezone", "UTC"),
];

/// Defaults written for a user that has no preferences yet.
pub const USER_DEFAULT_PREFERENCES: DefaultSet = &[
    ("enter_time", "1"),
    ("workday_start", "9"),
    ("workday_end", "17"),
    ("workdays", "1,2,3,4,5"),
    ("booked_color", "#ff453a"),
    ("not_booked_color", "#30d158"),
    ("self_booked_color", "#b825de"),
    ("partially_booked_color", "#ff9100"),
    ("buddy_booked_color", "#2415c5"),
    ("location", ""),
];

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradeHistoryEntry {
    pub from_version: u32,
    pub to_version: u32,
    pub unit_count: u32,
    pub applied_at: String,
}

impl SqliteStore {
    /// Open a SQLite-backed store, configure runtime pragmas and create the global state tables.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        conn.execute_batch(CREATE_GLOBAL_STATE_SQL)
            .context("failed to create global settings tables")?;

        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// # Errors
    /// Returns an error when the settings table cannot be read.
    pub fn global_setting(&self, name: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM global_settings WHERE name = ?1", params![name], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read global setting {name}"))
    }

    /// Integer value of a global setting; empty or missing values read as `None`.
    ///
    /// # Errors
    /// Returns an error when the setting cannot be read or is not a decimal integer.
    pub fn global_int(&self, name: &str) -> Result<Option<i64>> {
        let Some(raw) = self.global_setting(name)? else {
            return Ok(None);
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse::<i64>()
            .map(Some)
            .with_context(|| format!("global setting {name} is not an integer: {raw:?}"))
    }

    /// # Errors
    /// Returns an error when the setting cannot be written.
    pub fn put_global_setting(&self, name: &str, value: &str) -> Result<()> {
        upsert_global_setting(&self.conn, name, value)
    }

    /// # Errors
    /// Returns an error when the history table cannot be read.
    pub fn upgrade_history(&self) -> Result<Vec<UpgradeHistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT from_version, to_version, unit_count, applied_at
             FROM schema_upgrade_history
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UpgradeHistoryEntry {
                from_version: row.get(0)?,
                to_version: row.get(1)?,
                unit_count: row.get(2)?,
                applied_at: row.get(3)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to decode upgrade history row")?);
        }
        Ok(entries)
    }

    /// Store the new schema version and its history entry in one transaction.
    fn commit_version_upgrade(
        &self,
        from: SchemaVersion,
        to: SchemaVersion,
        unit_count: usize,
    ) -> Result<()> {
        let unit_count = u32::try_from(unit_count).context("unit count does not fit in u32")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start schema version transaction")?;
        upsert_global_setting(&tx, SETTING_DATABASE_VERSION, &to.to_string())?;
        tx.execute(
            "INSERT INTO schema_upgrade_history(from_version, to_version, unit_count, applied_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![from.get(), to.get(), unit_count, now_rfc3339()?],
        )
        .context("failed to record schema upgrade")?;
        tx.commit().context("failed to commit schema version")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the organizations table is missing or the insert fails.
    pub fn create_organization(&self, name: &str) -> Result<EntityId> {
        if name.trim().is_empty() {
            return Err(anyhow!("organization name must not be empty"));
        }
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute("INSERT INTO organizations(id, name) VALUES (?1, ?2)", params![id, name])
            .context("failed to create organization")?;
        Ok(EntityId(id))
    }

    /// # Errors
    /// Returns an error when the organization does not exist, the email is taken,
    /// or the users table is missing.
    pub fn create_user(&self, organization_id: &EntityId, email: &str) -> Result<EntityId> {
        if !email.contains('@') {
            return Err(anyhow!("invalid email address: {email}"));
        }
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO users(id, organization_id, email) VALUES (?1, ?2, ?3)",
                params![id, organization_id.as_str(), email],
            )
            .with_context(|| format!("failed to create user {email}"))?;
        Ok(EntityId(id))
    }

    /// # Errors
    /// Returns an error when the entity table does not exist or cannot be read.
    pub fn entity_ids(&self, kind: EntityKind) -> Result<Vec<EntityId>> {
        let table = entity_table(kind);
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {table} ORDER BY id ASC"))
            .with_context(|| format!("failed to list {kind} ids"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(EntityId(row?));
        }
        Ok(ids)
    }

    /// # Errors
    /// Returns an error when the settings table cannot be read.
    pub fn entity_settings(&self, kind: EntityKind, id: &EntityId) -> Result<BTreeMap<String, String>> {
        let (table, column, _) = settings_target(kind);
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT name, value FROM {table} WHERE {column} = ?1 ORDER BY name ASC"))
            .with_context(|| format!("failed to read settings for {kind} {id}"))?;
        let rows = stmt.query_map(params![id.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut settings = BTreeMap::new();
        for row in rows {
            let (name, value) = row?;
            settings.insert(name, value);
        }
        Ok(settings)
    }

    /// # Errors
    /// Returns an error when the setting cannot be written.
    pub fn put_entity_setting(
        &self,
        kind: EntityKind,
        id: &EntityId,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let (table, column, _) = settings_target(kind);
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {table}({column}, name, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT({column}, name) DO UPDATE SET value = excluded.value"
                ),
                params![id.as_str(), name, value],
            )
            .with_context(|| format!("failed to write setting {name} for {kind} {id}"))?;
        Ok(())
    }

    /// Write the default set for an entity that has no settings yet.
    ///
    /// # Errors
    /// Returns an error when the settings table cannot be read or written.
    pub fn seed_entity_defaults(&self, kind: EntityKind, id: &EntityId) -> Result<bool> {
        let (table, column, defaults) = settings_target(kind);
        let tx = self.conn.unchecked_transaction().context("failed to start defaults transaction")?;

        let existing = tx
            .query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE {column} = ?1"),
                params![id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to count settings for {kind} {id}"))?;
        if existing > 0 {
            return Ok(false);
        }

        for (name, value) in defaults {
            tx.execute(
                &format!("INSERT INTO {table}({column}, name, value) VALUES (?1, ?2, ?3)"),
                params![id.as_str(), name, value],
            )
            .with_context(|| format!("failed to write default {name} for {kind} {id}"))?;
        }

        tx.commit().context("failed to commit default settings")?;
        debug!(kind = kind.as_str(), id = %id, settings = defaults.len(), "seeded defaults");
        Ok(true)
    }
}

impl VersionStore for SqliteStore {
    fn get_global_int(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.global_int(key).map_err(store_error)
    }

    fn get_global_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.global_setting(key).map_err(store_error)
    }

    fn set_global(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put_global_setting(key, value).map_err(store_error)
    }

    fn advance_version(
        &self,
        from: SchemaVersion,
        to: SchemaVersion,
        unit_count: usize,
    ) -> Result<(), StoreError> {
        self.commit_version_upgrade(from, to, unit_count).map_err(store_error)
    }
}

impl EntityDirectory for SqliteStore {
    fn list_entity_ids(&self, kind: EntityKind) -> Result<Vec<EntityId>, StoreError> {
        self.entity_ids(kind).map_err(store_error)
    }
}

impl DefaultsSeeder for SqliteStore {
    fn seed_defaults(&self, kind: EntityKind, id: &EntityId) -> Result<bool, StoreError> {
        self.seed_entity_defaults(kind, id).map_err(store_error)
    }
}

fn upsert_global_setting(conn: &Connection, name: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO global_settings(name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, value],
    )
    .with_context(|| format!("failed to write global setting {name}"))?;
    Ok(())
}

pub(crate) fn store_error(err: anyhow::Error) -> StoreError {
    StoreError::new(format!("{err:#}"))
}

fn entity_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Organization => "organizations",
        EntityKind::User => "users",
    }
}

fn settings_target(kind: EntityKind) -> (&'static str, &'static str, DefaultSet) {
    match kind {
        EntityKind::Organization => ("settings", "organization_id", ORG_DEFAULT_SETTINGS),
        EntityKind::User => ("users_preferences", "user_id", USER_DEFAULT_PREFERENCES),
    }
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

pub(crate) fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
