use crate::InstallerError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use stratus_store::StorageKind;

pub const DEFAULT_ENV_CREDENTIAL_ID: &str = "aws_env";

/// Installer settings, usually read from a TOML file.
///
/// ```toml
/// data_dir = "/var/lib/stratus"
/// storage = "file"
/// env_credential_id = "aws_env"
/// reconcile_on_start = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerConfig {
    pub data_dir: PathBuf,
    pub storage: StorageKind,
    /// Credential id that resolves from the process environment instead of
    /// storage.
    pub env_credential_id: String,
    pub reconcile_on_start: bool,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("stratus-data"),
            storage: StorageKind::File,
            env_credential_id: DEFAULT_ENV_CREDENTIAL_ID.to_owned(),
            reconcile_on_start: true,
        }
    }
}

impl InstallerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Keep everything in process memory. Nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            storage: StorageKind::Memory,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }

    pub fn parse(content: &str) -> Result<Self, InstallerError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| InstallerError::Config(format!("invalid installer config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, InstallerError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn save(&self, path: &Path) -> Result<(), InstallerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| InstallerError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), InstallerError> {
        if self.env_credential_id.trim().is_empty() {
            return Err(InstallerError::Config(
                "env_credential_id must not be empty".to_owned(),
            ));
        }
        if self.storage == StorageKind::File && self.data_dir.as_os_str().is_empty() {
            return Err(InstallerError::Config(
                "data_dir is required for file storage".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = InstallerConfig::default();
        assert_eq!(config.env_credential_id, "aws_env");
        assert_eq!(config.storage, StorageKind::File);
        assert!(config.reconcile_on_start);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config = InstallerConfig::parse(
            r#"
data_dir = "/srv/stratus"
storage = "memory"
"#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/stratus"));
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.env_credential_id, DEFAULT_ENV_CREDENTIAL_ID);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(matches!(
            InstallerConfig::parse("data_dirr = \"/x\""),
            Err(InstallerError::Config(_))
        ));
    }

    #[test]
    fn empty_env_id_rejected() {
        assert!(InstallerConfig::parse("env_credential_id = \"\"").is_err());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/stratus.toml");
        let config = InstallerConfig::new(dir.path().join("data"));
        config.save(&path).unwrap();
        assert_eq!(InstallerConfig::load(&path).unwrap(), config);
    }
}
