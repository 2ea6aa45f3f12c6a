//! Command capabilities installed at runtime, kept under
//! `<state_dir>/installed/<name>.json` so later processes can reinstall them.

use std::fs;
use std::path::{Path, PathBuf};

use cadence_types::{InstalledCapability, is_valid_handler_name};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::record_store::{StoreError, write_atomic};

/// Subdirectory of the state directory holding installed capabilities.
pub const INSTALLED_DIR: &str = "installed";

#[derive(Debug)]
pub struct CapabilityStore {
    directory: PathBuf,
}

impl CapabilityStore {
    /// Open (creating if needed) a store rooted at `directory`.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, StoreError> {
        Self::open(config.state_dir.join(INSTALLED_DIR))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn capability_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_handler_name(name) {
            return Err(StoreError::InvalidCapabilityName { name: name.to_string() });
        }
        Ok(self.directory.join(format!("{name}.json")))
    }

    /// Write `capability`, replacing an earlier one with the same name.
    pub fn save(&self, capability: &InstalledCapability) -> Result<(), StoreError> {
        let path = self.capability_path(capability.name())?;
        let content = serde_json::to_vec_pretty(capability)?;
        write_atomic(&self.directory, &path, &content)?;
        debug!(capability = %capability.name(), path = %path.display(), "persisted installed capability");
        Ok(())
    }

    /// Delete the persisted capability `name`; `false` when none was stored.
    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.capability_path(name)?) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Every readable capability, sorted by name.
    ///
    /// Unreadable files are logged and skipped so one corrupt entry does not
    /// hide the rest.
    pub fn load_all(&self) -> Result<Vec<InstalledCapability>, StoreError> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut capabilities = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|extension| extension.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|bytes| serde_json::from_slice::<InstalledCapability>(&bytes).map_err(StoreError::from));
            match parsed {
                Ok(capability) => capabilities.push(capability),
                Err(error) => warn!(path = %path.display(), error = %error, "skipping unreadable installed capability"),
            }
        }
        capabilities.sort_by(|left, right| left.spec.name.cmp(&right.spec.name));
        Ok(capabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::{CapabilitySpec, CommandSpec, ContractField, FieldType};
    use chrono::Utc;
    use tempfile::tempdir;

    fn capability(name: &str) -> InstalledCapability {
        InstalledCapability {
            spec: CapabilitySpec {
                name: name.into(),
                description: "Count the words of a text".into(),
                parameters: vec![ContractField::required("text", FieldType::String)],
                returns: vec![ContractField::required("words", FieldType::Integer)],
                guidance: None,
            },
            command: CommandSpec {
                program: "wc".into(),
                args: vec!["-w".into()],
            },
            parameters: vec![ContractField::required("text", FieldType::String)],
            returns: vec![ContractField::required("words", FieldType::Integer)],
            concurrency_safe: false,
            installed_at: Utc::now(),
        }
    }

    #[test]
    fn saved_capabilities_load_back_sorted_by_name() {
        let dir = tempdir().expect("tempdir");
        let store = CapabilityStore::open(dir.path()).expect("open");
        store.save(&capability("word.count")).expect("save");
        store.save(&capability("char.count")).expect("save");

        let reopened = CapabilityStore::open(dir.path()).expect("reopen");
        let loaded = reopened.load_all().expect("load");
        let names: Vec<&str> = loaded.iter().map(InstalledCapability::name).collect();
        assert_eq!(names, vec!["char.count", "word.count"]);
        assert_eq!(loaded[1].command.args, vec!["-w"]);
    }

    #[test]
    fn corrupt_files_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let store = CapabilityStore::open(dir.path()).expect("open");
        store.save(&capability("word.count")).expect("save");
        fs::write(dir.path().join("broken.json"), "{ not json").expect("write");

        assert_eq!(store.load_all().expect("load").len(), 1);
    }

    #[test]
    fn remove_reports_whether_anything_was_stored() {
        let dir = tempdir().expect("tempdir");
        let store = CapabilityStore::open(dir.path()).expect("open");
        store.save(&capability("word.count")).expect("save");

        assert!(store.remove("word.count").expect("remove"));
        assert!(!store.remove("word.count").expect("remove again"));
        assert!(matches!(store.remove("../escape"), Err(StoreError::InvalidCapabilityName { .. })));
    }

    #[test]
    fn config_places_capabilities_under_the_state_dir() {
        let dir = tempdir().expect("tempdir");
        let config = EngineConfig {
            state_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let store = CapabilityStore::from_config(&config).expect("open");
        assert_eq!(store.directory(), dir.path().join(INSTALLED_DIR));
    }
}
