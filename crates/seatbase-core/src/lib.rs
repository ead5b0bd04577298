//! Startup-time schema coordination for Seatbase stores.
//!
//! A store is brought from whatever schema version it holds up to one declared
//! target by invoking every registered [`MigratableUnit`] in registration order:
//! core units first, then the units of each [`ExtensionModule`] in load order.
//! The stored version only advances once every unit has succeeded.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Global setting holding the schema version as decimal text.
pub const SETTING_DATABASE_VERSION: &str = "DatabaseVersion";
/// Global setting holding the installation identifier.
pub const SETTING_INSTALL_ID: &str = "InstallID";

/// Failure reported by a storage collaborator (version store, unit, entity directory).
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{0}")]
pub struct StoreError(String);

impl StoreError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("schema upgrade of unit `{unit}` from v{current} to v{target} failed: {reason}")]
    UnitUpgrade { unit: String, current: SchemaVersion, target: SchemaVersion, reason: String },
    #[error("failed to enumerate {kind} ids: {reason}")]
    Enumeration { kind: EntityKind, reason: String },
    #[error("failed to initialize default settings for {kind} {id}: {reason}")]
    DefaultsInit { kind: EntityKind, id: EntityId, reason: String },
    #[error("stored schema version {value} is out of range")]
    InvalidStoredVersion { value: i64 },
    #[error("stored schema version v{stored} is newer than target v{target}; refusing to downgrade")]
    StoreAhead { stored: SchemaVersion, target: SchemaVersion },
    #[error("version store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct SchemaVersion(pub u32);

impl SchemaVersion {
    /// Version of a store that has never been migrated.
    pub const INITIAL: Self = Self(0);

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for SchemaVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl TryFrom<i64> for SchemaVersion {
    type Error = CoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u32::try_from(value).map(Self).map_err(|_| CoreError::InvalidStoredVersion { value })
    }
}

impl Display for SchemaVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct InstallId(pub Uuid);

impl InstallId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for InstallId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Organization,
    User,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::User => "user",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque organization or user identifier owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable global scalar settings.
///
/// A missing key is `Ok(None)`: callers treat it as a first-run signal, not a failure.
pub trait VersionStore {
    /// # Errors
    /// Returns an error when the value cannot be read or is not an integer.
    fn get_global_int(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// # Errors
    /// Returns an error when the value cannot be read.
    fn get_global_string(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// # Errors
    /// Returns an error when the value cannot be written durably.
    fn set_global(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Persist `to` as the schema version after a run that moved it from `from`.
    ///
    /// Stores that keep an upgrade history must write the history entry and the
    /// version atomically: either both land or neither does.
    ///
    /// # Errors
    /// Returns an error when the version or its history entry cannot be written.
    fn advance_version(
        &self,
        _from: SchemaVersion,
        to: SchemaVersion,
        _unit_count: usize,
    ) -> Result<(), StoreError> {
        self.set_global(SETTING_DATABASE_VERSION, &to.to_string())
    }
}

/// A persistence component that can upgrade its own schema.
///
/// `upgrade` must be a no-op when `current >= target` and must report failure
/// instead of silently skipping work.
pub trait MigratableUnit<S: ?Sized> {
    fn name(&self) -> &str;

    /// # Errors
    /// Returns an error when the unit cannot complete its transform.
    fn upgrade(
        &self,
        store: &S,
        current: SchemaVersion,
        target: SchemaVersion,
    ) -> Result<(), StoreError>;
}

/// A loaded extension contributing zero or more units.
pub trait ExtensionModule<S: ?Sized> {
    fn name(&self) -> &str;

    fn units(&self) -> Vec<Box<dyn MigratableUnit<S>>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", content = "module", rename_all = "snake_case")]
pub enum UnitOrigin {
    Core,
    Extension(String),
}

pub struct RegisteredUnit<S: ?Sized> {
    pub origin: UnitOrigin,
    pub unit: Box<dyn MigratableUnit<S>>,
}

/// Ordered set of migratable units.
///
/// Registration order is the only ordering: no deduplication and no dependency
/// analysis. A unit that reads rows created by another must be registered after it.
pub struct UnitRegistry<S: ?Sized> {
    entries: Vec<RegisteredUnit<S>>,
    modules: Vec<String>,
}

impl<S: ?Sized> UnitRegistry<S> {
    #[must_use]
    pub fn new(core_units: Vec<Box<dyn MigratableUnit<S>>>) -> Self {
        let entries = core_units
            .into_iter()
            .map(|unit| RegisteredUnit { origin: UnitOrigin::Core, unit })
            .collect();
        Self { entries, modules: Vec::new() }
    }

    /// Append the units of a loaded module. Modules must be registered in load order.
    pub fn register_module(&mut self, module: &dyn ExtensionModule<S>) {
        let units = module.units();
        debug!(module = module.name(), units = units.len(), "registering extension module");
        let origin = UnitOrigin::Extension(module.name().to_string());
        self.entries.extend(
            units.into_iter().map(|unit| RegisteredUnit { origin: origin.clone(), unit }),
        );
        self.modules.push(module.name().to_string());
    }

    pub fn units(&self) -> impl Iterator<Item = &RegisteredUnit<S>> {
        self.entries.iter()
    }

    #[must_use]
    pub fn unit_names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.unit.name().to_string()).collect()
    }

    #[must_use]
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlannedUpgrade {
    pub unit: String,
    pub origin: UnitOrigin,
    pub current: SchemaVersion,
    pub target: SchemaVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaUpgradeReport {
    pub from_version: SchemaVersion,
    pub to_version: SchemaVersion,
    pub upgraded_units: Vec<String>,
}

impl SchemaUpgradeReport {
    #[must_use]
    pub fn version_changed(&self) -> bool {
        self.from_version != self.to_version
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct InstallIdOutcome {
    pub install_id: String,
    pub generated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunReport {
    pub schema: SchemaUpgradeReport,
    pub install: InstallIdOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaStatus {
    pub current_version: SchemaVersion,
    pub target_version: SchemaVersion,
    pub up_to_date: bool,
    pub install_id: Option<String>,
    pub units: Vec<String>,
    pub modules: Vec<String>,
}

/// Drives every registered unit from the stored version to a target version.
pub struct MigrationCoordinator<'a, S: VersionStore + ?Sized> {
    store: &'a S,
    registry: &'a UnitRegistry<S>,
}

impl<'a, S: VersionStore + ?Sized> MigrationCoordinator<'a, S> {
    #[must_use]
    pub fn new(store: &'a S, registry: &'a UnitRegistry<S>) -> Self {
        Self { store, registry }
    }

    /// Stored schema version, or [`SchemaVersion::INITIAL`] for a fresh install.
    ///
    /// # Errors
    /// Returns an error when the version cannot be read or is out of range.
    pub fn current_version(&self) -> Result<SchemaVersion, CoreError> {
        match self.store.get_global_int(SETTING_DATABASE_VERSION)? {
            Some(value) => SchemaVersion::try_from(value),
            None => Ok(SchemaVersion::INITIAL),
        }
    }

    /// Upgrade invocations a run against `target` would perform, in order.
    ///
    /// # Errors
    /// Returns an error when the stored version is unreadable or ahead of `target`.
    pub fn plan(&self, target: SchemaVersion) -> Result<Vec<PlannedUpgrade>, CoreError> {
        let current = self.checked_current(target)?;
        Ok(self
            .registry
            .units()
            .map(|entry| PlannedUpgrade {
                unit: entry.unit.name().to_string(),
                origin: entry.origin.clone(),
                current,
                target,
            })
            .collect())
    }

    /// # Errors
    /// Returns an error when the stored version cannot be read.
    pub fn status(&self, target: SchemaVersion) -> Result<SchemaStatus, CoreError> {
        let current_version = self.current_version()?;
        let install_id =
            self.store.get_global_string(SETTING_INSTALL_ID)?.filter(|id| !id.is_empty());
        Ok(SchemaStatus {
            current_version,
            target_version: target,
            up_to_date: current_version == target,
            install_id,
            units: self.registry.unit_names(),
            modules: self.registry.modules().to_vec(),
        })
    }

    /// Upgrade all units, persist `target`, then make sure an install id exists.
    ///
    /// # Errors
    /// Returns the first unit failure (the stored version is left untouched) or any
    /// version store failure.
    pub fn run(&self, target: SchemaVersion) -> Result<RunReport, CoreError> {
        let schema = self.run_schema_upgrades(target)?;
        let install = ensure_install_id(self.store)?;
        Ok(RunReport { schema, install })
    }

    /// Invoke every unit with `(current, target)` and persist `target` once all succeed.
    ///
    /// # Errors
    /// Returns [`CoreError::UnitUpgrade`] for the first failing unit; remaining units
    /// are skipped and the stored version is not advanced.
    pub fn run_schema_upgrades(
        &self,
        target: SchemaVersion,
    ) -> Result<SchemaUpgradeReport, CoreError> {
        info!(target_version = target.get(), "initializing database with schema version {target}");
        let current = self.checked_current(target)?;

        let mut upgraded_units = Vec::with_capacity(self.registry.len());
        for entry in self.registry.units() {
            let name = entry.unit.name();
            debug!(unit = name, current = current.get(), target = target.get(), "upgrading unit");
            entry.unit.upgrade(self.store, current, target).map_err(|err| {
                warn!(unit = name, error = %err, "unit upgrade failed; schema version not advanced");
                CoreError::UnitUpgrade {
                    unit: name.to_string(),
                    current,
                    target,
                    reason: err.to_string(),
                }
            })?;
            upgraded_units.push(name.to_string());
        }

        if current == target {
            self.store.set_global(SETTING_DATABASE_VERSION, &target.to_string())?;
        } else {
            self.store.advance_version(current, target, upgraded_units.len())?;
            info!(from = current.get(), to = target.get(), "schema upgraded");
        }

        Ok(SchemaUpgradeReport { from_version: current, to_version: target, upgraded_units })
    }

    fn checked_current(&self, target: SchemaVersion) -> Result<SchemaVersion, CoreError> {
        let current = self.current_version()?;
        if current > target {
            return Err(CoreError::StoreAhead { stored: current, target });
        }
        Ok(current)
    }
}

/// Generate and persist an install id unless a non-empty one is already stored.
///
/// # Errors
/// Returns an error when the install id cannot be read or written.
pub fn ensure_install_id<S: VersionStore + ?Sized>(
    store: &S,
) -> Result<InstallIdOutcome, CoreError> {
    if let Some(existing) = store.get_global_string(SETTING_INSTALL_ID)? {
        if !existing.is_empty() {
            return Ok(InstallIdOutcome { install_id: existing, generated: false });
        }
    }

    let install_id = InstallId::generate().to_string();
    store.set_global(SETTING_INSTALL_ID, &install_id)?;
    info!(install_id = %install_id, "generated install id");
    Ok(InstallIdOutcome { install_id, generated: true })
}

/// Enumerates the ids of existing top-level entities.
pub trait EntityDirectory {
    /// # Errors
    /// Returns an error when the backing store is unreachable.
    fn list_entity_ids(&self, kind: EntityKind) -> Result<Vec<EntityId>, StoreError>;
}

/// Creates baseline settings for a single entity.
pub trait DefaultsSeeder {
    /// Create the default set for `id` if it has no settings yet.
    /// Returns `true` when defaults were created, `false` when the entity was
    /// already configured and left untouched.
    ///
    /// # Errors
    /// Returns an error when the defaults cannot be written.
    fn seed_defaults(&self, kind: EntityKind, id: &EntityId) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SeedReport {
    pub kind: EntityKind,
    pub total: usize,
    pub seeded: usize,
    pub already_configured: usize,
}

/// Makes sure every organization and user has baseline settings before traffic is served.
pub struct DefaultSettingsInitializer<'a, D: ?Sized, W: ?Sized> {
    directory: &'a D,
    seeder: &'a W,
}

impl<'a, D, W> DefaultSettingsInitializer<'a, D, W>
where
    D: EntityDirectory + ?Sized,
    W: DefaultsSeeder + ?Sized,
{
    #[must_use]
    pub fn new(directory: &'a D, seeder: &'a W) -> Self {
        Self { directory, seeder }
    }

    /// # Errors
    /// Returns [`CoreError::Enumeration`] or [`CoreError::DefaultsInit`]; both are fatal.
    pub fn ensure_org_defaults(&self) -> Result<SeedReport, CoreError> {
        info!("configuring default settings for organizations");
        self.ensure_defaults(EntityKind::Organization)
    }

    /// # Errors
    /// Returns [`CoreError::Enumeration`] or [`CoreError::DefaultsInit`]; both are fatal.
    pub fn ensure_user_defaults(&self) -> Result<SeedReport, CoreError> {
        info!("configuring default preferences for users");
        self.ensure_defaults(EntityKind::User)
    }

    fn ensure_defaults(&self, kind: EntityKind) -> Result<SeedReport, CoreError> {
        let ids = self
            .directory
            .list_entity_ids(kind)
            .map_err(|err| CoreError::Enumeration { kind, reason: err.to_string() })?;

        let mut seeded = 0;
        for id in &ids {
            let created = self.seeder.seed_defaults(kind, id).map_err(|err| {
                CoreError::DefaultsInit { kind, id: id.clone(), reason: err.to_string() }
            })?;
            if created {
                debug!(kind = kind.as_str(), id = %id, "created default settings");
                seeded += 1;
            }
        }

        Ok(SeedReport { kind, total: ids.len(), seeded, already_configured: ids.len() - seeded })
    }
}
