use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use seatbase_core::{ExtensionModule, MigratableUnit};
use serde::{Deserialize, Serialize};

use crate::units::SqlUnit;
use crate::SqliteStore;

/// An extension module described by a YAML manifest.
///
/// ```yaml
/// name: kiosk
/// units:
///   - name: kiosk_devices
///     steps:
///       - kind: sql
///         version: 21
///         sql: CREATE TABLE IF NOT EXISTS kiosk_devices (id TEXT PRIMARY KEY);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtensionManifest {
    pub name: String,
    #[serde(default)]
    pub units: Vec<SqlUnit>,
}

impl ExtensionManifest {
    /// # Errors
    /// Returns an error when the file cannot be read or is not a valid manifest.
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read extension manifest {}", path.display()))?;
        Self::parse(&body).with_context(|| format!("invalid extension manifest {}", path.display()))
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or the manifest fails validation.
    pub fn parse(body: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(body).context("failed to parse manifest yaml")?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("extension name must not be empty"));
        }
        let mut seen = BTreeSet::new();
        for unit in &self.units {
            unit.validate()?;
            if !seen.insert(unit.name.as_str()) {
                return Err(anyhow!("extension {} declares unit {} twice", self.name, unit.name));
            }
        }
        Ok(())
    }
}

impl ExtensionModule<SqliteStore> for ExtensionManifest {
    fn name(&self) -> &str {
        &self.name
    }

    fn units(&self) -> Vec<Box<dyn MigratableUnit<SqliteStore>>> {
        self.units
            .iter()
            .cloned()
            .map(|unit| Box::new(unit) as Box<dyn MigratableUnit<SqliteStore>>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::SchemaStep;

    #[test]
    fn manifest_units_keep_file_order() -> Result<()> {
        let manifest = ExtensionManifest::parse(
            r"
name: visitors
units:
  - name: visitor_passes
    steps:
      - kind: sql
        version: 20
        sql: CREATE TABLE IF NOT EXISTS visitor_passes (id TEXT PRIMARY KEY);
      - kind: add_column
        version: 22
        table: visitor_passes
        column: host_id
        definition: TEXT
  - name: visitor_badges
",
        )?;

        let names = manifest.units().iter().map(|unit| unit.name().to_string()).collect::<Vec<_>>();
        assert_eq!(names, vec!["visitor_passes".to_string(), "visitor_badges".to_string()]);
        assert_eq!(
            manifest.units[0].steps[1],
            SchemaStep::add_column(22, "visitor_passes", "host_id", "TEXT")
        );
        assert!(manifest.units[1].steps.is_empty());
        Ok(())
    }

    #[test]
    fn module_without_units_is_valid() -> Result<()> {
        let manifest = ExtensionManifest::parse("name: branding\n")?;
        assert!(manifest.units().is_empty());
        Ok(())
    }

    #[test]
    fn invalid_manifests_are_rejected() {
        assert!(ExtensionManifest::parse("name: ''\n").is_err());
        assert!(ExtensionManifest::parse(
            "name: dup\nunits:\n  - name: a\n    steps: []\n  - name: a\n    steps: []\n"
        )
        .is_err());
        assert!(ExtensionManifest::parse(
            "name: bad\nunits:\n  - name: a\n    steps:\n      - kind: add_column\n        version: 3\n        table: \"x y\"\n        column: c\n        definition: TEXT\n"
        )
        .is_err());
        assert!(ExtensionManifest::parse(
            "name: zero\nunits:\n  - name: zero_table\n    steps:\n      - kind: sql\n        version: 0\n        sql: CREATE TABLE IF NOT EXISTS zero_table (id TEXT PRIMARY KEY);\n"
        )
        .is_err());
        assert!(ExtensionManifest::load(Path::new("/nonexistent/seatbase/extension.yaml")).is_err());
    }
}
