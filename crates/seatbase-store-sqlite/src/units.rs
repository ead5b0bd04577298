use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use seatbase_core::{MigratableUnit, SchemaVersion, StoreError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{store_error, table_has_column, SqliteStore};

/// Schema version the built-in units are written against.
pub const TARGET_SCHEMA_VERSION: u32 = 24;

const AUTH_PROVIDERS_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS auth_providers (
  id TEXT PRIMARY KEY,
  organization_id TEXT NOT NULL,
  name TEXT NOT NULL,
  provider_type INTEGER NOT NULL,
  auth_url TEXT NOT NULL,
  token_url TEXT NOT NULL,
  auth_style INTEGER NOT NULL,
  scopes TEXT NOT NULL,
  userinfo_url TEXT NOT NULL,
  userinfo_email_field TEXT NOT NULL,
  client_id TEXT NOT NULL,
  client_secret TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_auth_providers_organization_id ON auth_providers(organization_id);
";

const AUTH_STATES_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS auth_states (
  id TEXT PRIMARY KEY,
  auth_provider_id TEXT NOT NULL,
  expiry TEXT NOT NULL,
  auth_state_type INTEGER NOT NULL,
  payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_auth_states_expiry ON auth_states(expiry);
";

const AUTH_ATTEMPTS_V8_SQL: &str = r"
CREATE TABLE IF NOT EXISTS auth_attempts (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  successful INTEGER NOT NULL CHECK (successful IN (0, 1))
);
CREATE INDEX IF NOT EXISTS idx_auth_attempts_user_id ON auth_attempts(user_id);
";

const BOOKINGS_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS bookings (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  space_id TEXT NOT NULL,
  enter_time TEXT NOT NULL,
  leave_time TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bookings_user_id ON bookings(user_id);
CREATE INDEX IF NOT EXISTS idx_bookings_space_id ON bookings(space_id);
";

const BUDDIES_V9_SQL: &str = r"
CREATE TABLE IF NOT EXISTS buddies (
  id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  buddy_id TEXT NOT NULL,
  UNIQUE(owner_id, buddy_id)
);
";

const GROUPS_V16_SQL: &str = r"
CREATE TABLE IF NOT EXISTS groups (
  id TEXT PRIMARY KEY,
  organization_id TEXT NOT NULL,
  name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS groups_users (
  group_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  PRIMARY KEY (group_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_groups_organization_id ON groups(organization_id);
";

const LOCATIONS_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS locations (
  id TEXT PRIMARY KEY,
  organization_id TEXT NOT NULL,
  name TEXT NOT NULL,
  map_width INTEGER NOT NULL DEFAULT 0,
  map_height INTEGER NOT NULL DEFAULT 0,
  map_mimetype TEXT NOT NULL DEFAULT '',
  map_data BLOB
);
CREATE INDEX IF NOT EXISTS idx_locations_organization_id ON locations(organization_id);
";

const ORGANIZATIONS_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS organizations (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  contact_firstname TEXT NOT NULL DEFAULT '',
  contact_lastname TEXT NOT NULL DEFAULT '',
  contact_email TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS organizations_domains (
  organization_id TEXT NOT NULL,
  domain TEXT NOT NULL,
  active INTEGER NOT NULL DEFAULT 0,
  verify_token TEXT NOT NULL DEFAULT '',
  PRIMARY KEY (organization_id, domain)
);
";

const SPACES_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS spaces (
  id TEXT PRIMARY KEY,
  location_id TEXT NOT NULL,
  name TEXT NOT NULL,
  x INTEGER NOT NULL DEFAULT 0,
  y INTEGER NOT NULL DEFAULT 0,
  width INTEGER NOT NULL DEFAULT 0,
  height INTEGER NOT NULL DEFAULT 0,
  rotation INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_spaces_location_id ON spaces(location_id);
";

const USERS_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  organization_id TEXT NOT NULL REFERENCES organizations(id),
  email TEXT NOT NULL UNIQUE,
  password TEXT,
  role INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_users_organization_id ON users(organization_id);
";

const USERS_PREFERENCES_V4_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users_preferences (
  user_id TEXT NOT NULL,
  name TEXT NOT NULL,
  value TEXT NOT NULL,
  PRIMARY KEY (user_id, name)
);
";

const SETTINGS_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS settings (
  organization_id TEXT NOT NULL,
  name TEXT NOT NULL,
  value TEXT NOT NULL,
  PRIMARY KEY (organization_id, name)
);
";

const RECURRING_BOOKINGS_V18_SQL: &str = r"
CREATE TABLE IF NOT EXISTS recurring_bookings (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  space_id TEXT NOT NULL,
  subject TEXT NOT NULL DEFAULT '',
  enter_time TEXT NOT NULL,
  leave_time TEXT NOT NULL,
  end_date TEXT NOT NULL,
  cadence INTEGER NOT NULL,
  cycle INTEGER NOT NULL DEFAULT 1,
  details TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_recurring_bookings_user_id ON recurring_bookings(user_id);
";

const REFRESH_TOKENS_V12_SQL: &str = r"
CREATE TABLE IF NOT EXISTS refresh_tokens (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  expiry TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_refresh_tokens_expiry ON refresh_tokens(expiry);
";

const DEBUG_TIME_ISSUES_V20_SQL: &str = r"
CREATE TABLE IF NOT EXISTS debug_time_issues (
  id TEXT PRIMARY KEY,
  created TEXT NOT NULL,
  tz TEXT NOT NULL,
  booking_id TEXT NOT NULL,
  payload TEXT NOT NULL
);
";

const SPACE_ATTRIBUTES_V22_SQL: &str = r"
CREATE TABLE IF NOT EXISTS space_attributes (
  id TEXT PRIMARY KEY,
  organization_id TEXT NOT NULL,
  label TEXT NOT NULL,
  attribute_type INTEGER NOT NULL,
  spacemap INTEGER NOT NULL DEFAULT 0,
  location_applicable INTEGER NOT NULL DEFAULT 0,
  space_applicable INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_space_attributes_organization_id ON space_attributes(organization_id);
";

const SPACE_ATTRIBUTE_VALUES_V22_SQL: &str = r"
CREATE TABLE IF NOT EXISTS space_attribute_values (
  attribute_id TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  entity_type INTEGER NOT NULL,
  value TEXT NOT NULL,
  PRIMARY KEY (attribute_id, entity_id, entity_type)
);
";

const SPACE_ATTRIBUTE_VALUES_V24_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_space_attribute_values_entity ON space_attribute_values(entity_id, entity_type);
";

/// One change introduced at a given schema version.
///
/// Every step must be safe to replay: `sql` steps use `IF NOT EXISTS` forms and
/// `add_column` skips columns that are already present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaStep {
    Sql { version: u32, sql: String },
    AddColumn { version: u32, table: String, column: String, definition: String },
}

impl SchemaStep {
    #[must_use]
    pub fn sql(version: u32, sql: &str) -> Self {
        Self::Sql { version, sql: sql.to_string() }
    }

    #[must_use]
    pub fn add_column(version: u32, table: &str, column: &str, definition: &str) -> Self {
        Self::AddColumn {
            version,
            table: table.to_string(),
            column: column.to_string(),
            definition: definition.to_string(),
        }
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        match self {
            Self::Sql { version, .. } | Self::AddColumn { version, .. } => *version,
        }
    }

    /// # Errors
    /// Returns an error when the version is 0, identifiers are malformed or the statement is empty.
    pub fn validate(&self) -> Result<()> {
        // Version 0 is the fresh-install baseline, so a step tagged 0 could never be pending.
        if self.version() == 0 {
            return Err(anyhow!("schema steps must target version 1 or later"));
        }
        match self {
            Self::Sql { version, sql } => {
                if sql.trim().is_empty() {
                    return Err(anyhow!("sql step for v{version} is empty"));
                }
                Ok(())
            }
            Self::AddColumn { table, column, definition, .. } => {
                validate_identifier(table)?;
                validate_identifier(column)?;
                if definition.trim().is_empty() || definition.contains(';') {
                    return Err(anyhow!("invalid column definition for {table}.{column}: {definition}"));
                }
                Ok(())
            }
        }
    }

    fn apply(&self, conn: &Connection) -> Result<()> {
        self.validate()?;
        match self {
            Self::Sql { version, sql } => conn
                .execute_batch(sql)
                .with_context(|| format!("failed to apply v{version} sql step")),
            Self::AddColumn { version, table, column, definition } => {
                if table_has_column(conn, table, column)? {
                    return Ok(());
                }
                conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))
                    .with_context(|| format!("failed to add v{version} column {table}.{column}"))
            }
        }
    }
}

/// A persistence unit whose schema is described by versioned steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SqlUnit {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<SchemaStep>,
}

impl SqlUnit {
    #[must_use]
    pub fn new(name: &str, steps: Vec<SchemaStep>) -> Self {
        Self { name: name.to_string(), steps }
    }

    /// Steps with `current < version <= target`, in version order.
    #[must_use]
    pub fn pending_steps(&self, current: SchemaVersion, target: SchemaVersion) -> Vec<&SchemaStep> {
        let mut pending = self
            .steps
            .iter()
            .filter(|step| step.version() > current.get() && step.version() <= target.get())
            .collect::<Vec<_>>();
        pending.sort_by_key(|step| step.version());
        pending
    }

    /// # Errors
    /// Returns an error when the unit has no name or any step is malformed.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("unit name must not be empty"));
        }
        for step in &self.steps {
            step.validate().with_context(|| format!("invalid step in unit {}", self.name))?;
        }
        Ok(())
    }

    /// Apply pending steps in one transaction; returns how many ran.
    fn apply(&self, conn: &Connection, current: SchemaVersion, target: SchemaVersion) -> Result<usize> {
        let pending = self.pending_steps(current, target);
        if pending.is_empty() {
            return Ok(0);
        }

        let tx = conn
            .unchecked_transaction()
            .with_context(|| format!("failed to start upgrade transaction for {}", self.name))?;
        for step in &pending {
            step.apply(&tx)?;
        }
        tx.commit().with_context(|| format!("failed to commit upgrade of {}", self.name))?;
        Ok(pending.len())
    }
}

impl MigratableUnit<SqliteStore> for SqlUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn upgrade(
        &self,
        store: &SqliteStore,
        current: SchemaVersion,
        target: SchemaVersion,
    ) -> Result<(), StoreError> {
        let applied = self.apply(store.conn(), current, target).map_err(store_error)?;
        if applied > 0 {
            debug!(unit = %self.name, steps = applied, "applied schema steps");
        }
        Ok(())
    }
}

fn validate_identifier(value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(anyhow!("invalid sql identifier: {value:?}"))
    }
}

/// Built-in units in registration order. Users follow organizations because
/// `users.organization_id` references them.
#[must_use]
pub fn core_unit_definitions() -> Vec<SqlUnit> {
    vec![
        SqlUnit::new(
            "auth_providers",
            vec![
                SchemaStep::sql(1, AUTH_PROVIDERS_V1_SQL),
                SchemaStep::add_column(5, "auth_providers", "profile_page_url", "TEXT NOT NULL DEFAULT ''"),
                SchemaStep::add_column(17, "auth_providers", "logout_url", "TEXT NOT NULL DEFAULT ''"),
            ],
        ),
        SqlUnit::new("auth_states", vec![SchemaStep::sql(1, AUTH_STATES_V1_SQL)]),
        SqlUnit::new("auth_attempts", vec![SchemaStep::sql(8, AUTH_ATTEMPTS_V8_SQL)]),
        SqlUnit::new(
            "bookings",
            vec![
                SchemaStep::sql(1, BOOKINGS_V1_SQL),
                SchemaStep::add_column(11, "bookings", "subject", "TEXT NOT NULL DEFAULT ''"),
                SchemaStep::add_column(18, "bookings", "recurring_id", "TEXT"),
                SchemaStep::add_column(19, "bookings", "approved", "INTEGER NOT NULL DEFAULT 1"),
            ],
        ),
        SqlUnit::new("buddies", vec![SchemaStep::sql(9, BUDDIES_V9_SQL)]),
        SqlUnit::new("groups", vec![SchemaStep::sql(16, GROUPS_V16_SQL)]),
        SqlUnit::new(
            "locations",
            vec![
                SchemaStep::sql(1, LOCATIONS_V1_SQL),
                SchemaStep::add_column(6, "locations", "description", "TEXT NOT NULL DEFAULT ''"),
                SchemaStep::add_column(10, "locations", "tz", "TEXT NOT NULL DEFAULT ''"),
                SchemaStep::add_column(21, "locations", "enabled", "INTEGER NOT NULL DEFAULT 1"),
            ],
        ),
        SqlUnit::new(
            "organizations",
            vec![
                SchemaStep::sql(1, ORGANIZATIONS_V1_SQL),
                SchemaStep::add_column(14, "organizations", "language", "TEXT NOT NULL DEFAULT 'en'"),
                SchemaStep::add_column(
                    23,
                    "organizations_domains",
                    "accept_users",
                    "INTEGER NOT NULL DEFAULT 1",
                ),
            ],
        ),
        SqlUnit::new(
            "spaces",
            vec![
                SchemaStep::sql(1, SPACES_V1_SQL),
                SchemaStep::add_column(19, "spaces", "approval_required", "INTEGER NOT NULL DEFAULT 0"),
            ],
        ),
        SqlUnit::new(
            "users",
            vec![
                SchemaStep::sql(1, USERS_V1_SQL),
                SchemaStep::add_column(7, "users", "auth_provider_id", "TEXT"),
                SchemaStep::add_column(13, "users", "disabled", "INTEGER NOT NULL DEFAULT 0"),
                SchemaStep::add_column(15, "users", "firstname", "TEXT NOT NULL DEFAULT ''"),
                SchemaStep::add_column(15, "users", "lastname", "TEXT NOT NULL DEFAULT ''"),
            ],
        ),
        SqlUnit::new("users_preferences", vec![SchemaStep::sql(4, USERS_PREFERENCES_V4_SQL)]),
        SqlUnit::new("settings", vec![SchemaStep::sql(1, SETTINGS_V1_SQL)]),
        SqlUnit::new("recurring_bookings", vec![SchemaStep::sql(18, RECURRING_BOOKINGS_V18_SQL)]),
        SqlUnit::new("refresh_tokens", vec![SchemaStep::sql(12, REFRESH_TOKENS_V12_SQL)]),
        SqlUnit::new("debug_time_issues", vec![SchemaStep::sql(20, DEBUG_TIME_ISSUES_V20_SQL)]),
        SqlUnit::new("space_attributes", vec![SchemaStep::sql(22, SPACE_ATTRIBUTES_V22_SQL)]),
        SqlUnit::new(
            "space_attribute_values",
            vec![
                SchemaStep::sql(22, SPACE_ATTRIBUTE_VALUES_V22_SQL),
                SchemaStep::sql(24, SPACE_ATTRIBUTE_VALUES_V24_SQL),
            ],
        ),
    ]
}

#[must_use]
pub fn core_units() -> Vec<Box<dyn MigratableUnit<SqliteStore>>> {
    core_unit_definitions()
        .into_iter()
        .map(|unit| Box::new(unit) as Box<dyn MigratableUnit<SqliteStore>>)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::table_exists;

    #[test]
    fn core_units_cover_every_persistence_area_in_order() {
        let names = core_unit_definitions().into_iter().map(|unit| unit.name).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "auth_providers",
                "auth_states",
                "auth_attempts",
                "bookings",
                "buddies",
                "groups",
                "locations",
                "organizations",
                "spaces",
                "users",
                "users_preferences",
                "settings",
                "recurring_bookings",
                "refresh_tokens",
                "debug_time_issues",
                "space_attributes",
                "space_attribute_values",
            ]
        );
    }

    #[test]
    fn newest_core_step_matches_target_version() -> Result<()> {
        let definitions = core_unit_definitions();
        for unit in &definitions {
            unit.validate()?;
        }
        let newest = definitions
            .iter()
            .flat_map(|unit| unit.steps.iter().map(SchemaStep::version))
            .max()
            .unwrap_or_default();
        assert_eq!(newest, TARGET_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn pending_steps_are_bounded_by_current_and_target() {
        let unit = SqlUnit::new(
            "users",
            vec![
                SchemaStep::add_column(15, "users", "firstname", "TEXT"),
                SchemaStep::sql(1, USERS_V1_SQL),
                SchemaStep::add_column(7, "users", "auth_provider_id", "TEXT"),
                SchemaStep::add_column(13, "users", "disabled", "INTEGER NOT NULL DEFAULT 0"),
            ],
        );

        let versions = |current: u32, target: u32| {
            unit.pending_steps(SchemaVersion(current), SchemaVersion(target))
                .into_iter()
                .map(SchemaStep::version)
                .collect::<Vec<_>>()
        };

        assert_eq!(versions(0, 24), vec![1, 7, 13, 15]);
        assert_eq!(versions(7, 13), vec![13]);
        assert!(versions(15, 15).is_empty());
        assert!(versions(20, 15).is_empty());
    }

    #[test]
    fn add_column_rejects_unsafe_identifiers() {
        assert!(SchemaStep::add_column(2, "users; DROP TABLE users", "x", "TEXT").validate().is_err());
        assert!(SchemaStep::add_column(2, "users", "1st", "TEXT").validate().is_err());
        assert!(SchemaStep::add_column(2, "users", "nick", "TEXT; DELETE FROM users").validate().is_err());
        assert!(SchemaStep::add_column(2, "users", "nick_name", "TEXT").validate().is_ok());
    }

    #[test]
    fn steps_at_baseline_version_are_rejected() {
        assert!(SchemaStep::sql(0, "CREATE TABLE IF NOT EXISTS zero_table (id TEXT)").validate().is_err());
        assert!(SchemaStep::add_column(0, "users", "nick_name", "TEXT").validate().is_err());
        assert!(SchemaStep::sql(1, "CREATE TABLE IF NOT EXISTS zero_table (id TEXT)").validate().is_ok());
    }

    #[test]
    fn replaying_steps_after_interrupted_run_is_safe() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        let bookings = core_unit_definitions()
            .into_iter()
            .find(|unit| unit.name == "bookings")
            .ok_or_else(|| anyhow!("bookings unit missing"))?;

        bookings.apply(store.conn(), SchemaVersion(0), SchemaVersion(24))?;
        // The stored version never advanced, so the next start replays from 0.
        let replayed = bookings.apply(store.conn(), SchemaVersion(0), SchemaVersion(24))?;

        assert_eq!(replayed, 4);
        assert!(table_exists(store.conn(), "bookings")?);
        assert!(table_has_column(store.conn(), "bookings", "approved")?);
        Ok(())
    }

    #[test]
    fn failed_step_rolls_back_the_whole_unit() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        let unit = SqlUnit::new(
            "kiosk_devices",
            vec![
                SchemaStep::sql(23, "CREATE TABLE IF NOT EXISTS kiosk_devices (id TEXT PRIMARY KEY);"),
                SchemaStep::sql(24, "CREATE TABLE kiosk_broken ("),
            ],
        );

        let result = unit.apply(store.conn(), SchemaVersion(0), SchemaVersion(24));

        assert!(result.is_err());
        assert!(!table_exists(store.conn(), "kiosk_devices")?);
        Ok(())
    }
}
