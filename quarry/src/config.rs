//! Configuration surface: one plain struct constructed by the caller and
//! threaded through every component that needs a path or a policy number.
//! No component reads environment variables or global state directly.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory under which `<root>/<name>/recipe.{yaml,yml,json}` live.
    pub recipes_root: PathBuf,
    /// Root of the real filesystem installs are applied against (normally `/`).
    pub install_root: PathBuf,
    /// Per-build sandbox staging root.
    pub sandbox_root: PathBuf,
    /// Directory sandbox pre-install snapshots are written to.
    pub snapshot_dir: PathBuf,
    /// Directory freshly built artifacts land in before being cache-stored.
    pub build_output_dir: PathBuf,
    /// Content-addressed artifact cache directory.
    pub artifact_cache_root: PathBuf,
    /// Directory pre-overwrite backup tarballs are written to.
    pub backup_dir: PathBuf,
    /// Installed Database JSON document path.
    pub installed_db_path: PathBuf,
    /// Append-only history log path.
    pub history_log_path: PathBuf,
    /// Persisted recipe-index sqlite cache path.
    pub recipe_index_cache_path: PathBuf,
    /// Directory upgrade reports are written to.
    pub report_dir: PathBuf,
    /// Directory scanned for global, directory-discovered hook scripts.
    pub global_hooks_dir: PathBuf,
    /// Upgrade orchestrator worker pool size (default 4).
    pub worker_count: usize,
    /// Default build pipeline retry count (default 1).
    pub default_build_retries: u32,
    /// Default privileged executor per-attempt timeout (the `default` profile).
    #[serde(with = "duration_secs")]
    pub default_exec_timeout: Duration,
    pub allow_downgrade: bool,
    pub backup_on_install: bool,
}

impl Default for Config {
    fn default() -> Self {
        let state_root = PathBuf::from("/var/lib/quarry");
        Self {
            recipes_root: PathBuf::from("/var/lib/quarry/recipes"),
            install_root: PathBuf::from("/"),
            sandbox_root: state_root.join("sandboxes"),
            snapshot_dir: state_root.join("snapshots"),
            build_output_dir: state_root.join("artifacts/pending"),
            artifact_cache_root: state_root.join("artifacts/cache"),
            backup_dir: state_root.join("backups"),
            installed_db_path: state_root.join("installed.json"),
            history_log_path: state_root.join("history.jsonl"),
            recipe_index_cache_path: state_root.join("recipe-index.sqlite"),
            report_dir: state_root.join("reports"),
            global_hooks_dir: PathBuf::from("/etc/quarry/hooks"),
            worker_count: 4,
            default_build_retries: 1,
            default_exec_timeout: Duration::from_secs(300),
            allow_downgrade: false,
            backup_on_install: true,
        }
    }
}

impl Config {
    /// Parse a config document from YAML text, applying `Default` for any
    /// field the document omits.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.default_build_retries, 1);
    }

    #[test]
    fn from_yaml_overrides_selected_fields() {
        let yaml = "worker_count: 8\nrecipes_root: /srv/recipes\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.recipes_root, PathBuf::from("/srv/recipes"));
        assert_eq!(config.default_build_retries, 1);
    }
}
