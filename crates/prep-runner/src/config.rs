use anyhow::{Context, Result};
use prep_core::ConfigurationError;
use prep_provenance::DEFAULT_PRIMARY_CANDIDATES;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "prep.yaml";
pub const RUNS_ROOT_ENV: &str = "PREP_RUNS_ROOT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrepConfig {
    pub runs_root: PathBuf,
    pub store_dir: PathBuf,
    /// Files starting with this prefix are run bookkeeping and never copied forward.
    pub reserved_prefix: String,
    pub metadata_filename: String,
    /// Ordered; the first present candidate is the run's primary input.
    pub primary_input_candidates: Vec<String>,
    pub derived_override_prefix: String,
}

impl Default for PrepConfig {
    fn default() -> Self {
        Self {
            runs_root: PathBuf::from("."),
            store_dir: PathBuf::from(".prep").join("records"),
            reserved_prefix: "simmate_".to_string(),
            metadata_filename: "simmate_metadata.yaml".to_string(),
            primary_input_candidates: DEFAULT_PRIMARY_CANDIDATES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            derived_override_prefix: "custom__".to_string(),
        }
    }
}

/// Loads `explicit`, else `prep.yaml` in the working directory when present,
/// else the defaults. `PREP_RUNS_ROOT` overrides `runs_root` in every case.
pub fn load_config(explicit: Option<&Path>) -> Result<PrepConfig> {
    load_config_with(explicit, std::env::var(RUNS_ROOT_ENV).ok())
}

pub fn load_config_with(explicit: Option<&Path>, runs_root: Option<String>) -> Result<PrepConfig> {
    let default_path = Path::new(DEFAULT_CONFIG_FILE);
    let path = match explicit {
        Some(path) => Some(path),
        None if default_path.is_file() => Some(default_path),
        None => None,
    };
    let mut config = match path {
        Some(path) => parse_config_file(path)?,
        None => PrepConfig::default(),
    };
    if let Some(root) = runs_root.filter(|r| !r.trim().is_empty()) {
        config.runs_root = PathBuf::from(root);
    }
    let loaded_from = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".to_string());
    debug!(
        loaded_from = %loaded_from,
        runs_root = %config.runs_root.display(),
        "configuration loaded"
    );
    Ok(config)
}

fn parse_config_file(path: &Path) -> Result<PrepConfig> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(PrepConfig::default());
    }
    let config: PrepConfig =
        serde_yaml::from_str(&raw).map_err(|e| ConfigurationError::InvalidConfig {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    config.validate().map_err(|reason| ConfigurationError::InvalidConfig {
        path: path.to_path_buf(),
        reason,
    })?;
    Ok(config)
}

impl PrepConfig {
    /// The metadata document must carry the reserved prefix so copy-forward
    /// never brings a previous run's document along.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.primary_input_candidates.is_empty() {
            return Err("primary_input_candidates must not be empty".to_string());
        }
        if self.reserved_prefix.is_empty() {
            return Err("reserved_prefix must not be empty".to_string());
        }
        if !self.metadata_filename.starts_with(&self.reserved_prefix) {
            return Err(format!(
                "metadata_filename '{}' must start with reserved_prefix '{}'",
                self.metadata_filename, self.reserved_prefix
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prep_core::ensure_dir;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "prep_config_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    #[test]
    fn file_values_override_defaults() {
        let root = temp_root("file");
        let path = root.join("prep.yaml");
        fs::write(
            &path,
            "runs_root: /scratch/runs\nprimary_input_candidates: [supercell_start, structure]\n",
        )
        .expect("write config");
        let config = load_config_with(Some(&path), None).expect("load");
        assert_eq!(config.runs_root, PathBuf::from("/scratch/runs"));
        assert_eq!(
            config.primary_input_candidates,
            vec!["supercell_start", "structure"]
        );
        assert_eq!(config.reserved_prefix, "simmate_");
        assert_eq!(config.metadata_filename, "simmate_metadata.yaml");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn env_runs_root_wins() {
        let root = temp_root("env");
        let path = root.join("prep.yaml");
        fs::write(&path, "runs_root: /from/file\n").expect("write config");
        let config =
            load_config_with(Some(&path), Some("/from/env".to_string())).expect("load");
        assert_eq!(config.runs_root, PathBuf::from("/from/env"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_keys_and_empty_candidates_are_rejected() {
        let root = temp_root("invalid");
        let path = root.join("prep.yaml");
        fs::write(&path, "run_root: typo\n").expect("write config");
        let err = load_config_with(Some(&path), None).expect_err("unknown key");
        assert!(err.to_string().contains("invalid configuration file"), "{}", err);

        fs::write(&path, "primary_input_candidates: []\n").expect("write config");
        assert!(load_config_with(Some(&path), None).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn metadata_filename_must_carry_the_reserved_prefix() {
        let root = temp_root("prefix");
        let path = root.join("prep.yaml");
        fs::write(&path, "metadata_filename: run_meta.yaml\n").expect("write config");
        let err = load_config_with(Some(&path), None).expect_err("unprefixed metadata name");
        assert!(err.to_string().contains("run_meta.yaml"), "{}", err);

        fs::write(&path, "reserved_prefix: \"\"\n").expect("write config");
        assert!(load_config_with(Some(&path), None).is_err());

        fs::write(
            &path,
            "reserved_prefix: run_\nmetadata_filename: run_meta.yaml\n",
        )
        .expect("write config");
        let config = load_config_with(Some(&path), None).expect("matching prefix");
        assert_eq!(config.metadata_filename, "run_meta.yaml");
        assert!(PrepConfig::default().validate().is_ok());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn defaults_name_the_builtin_candidates() {
        let config = PrepConfig::default();
        assert_eq!(
            config.primary_input_candidates,
            vec!["structure", "migration_hop", "supercell_start"]
        );
        assert_eq!(config.store_dir, PathBuf::from(".prep/records"));
    }
}
