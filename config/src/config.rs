use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the settings file inside the config directory.
pub const CONFIG_FILE_NAME: &str = "multiout.toml";

/// Upper bound for the post-create settling delay.
pub const MAX_SETTLE_DELAY_MS: u64 = 5_000;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub config_version: i32,
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub virtual_device: VirtualDevice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct General {
    /// Seconds between two directory refreshes.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// How long to wait after creating the virtual device before making it the default.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Fallback log filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Naming of the virtual multi-output device this application creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualDevice {
    pub name: String,
    pub uid: String,
    /// Every device whose UID starts with this prefix is ours and is never offered for selection.
    pub uid_prefix: String,
    /// Hide the device from other processes. A private device cannot become the system default.
    #[serde(default)]
    pub private: bool,
}

/// Reasons a configuration is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("general.refresh_interval_secs must be at least 1")]
    ZeroRefreshInterval,
    #[error("general.settle_delay_ms must not exceed 5000 (got {0})")]
    SettleDelayTooLong(u64),
    #[error("virtual_device.{0} must not be empty")]
    EmptyField(&'static str),
    #[error("virtual_device.uid {uid:?} does not start with uid_prefix {prefix:?}")]
    UidOutsidePrefix { uid: String, prefix: String },
}

fn default_refresh_interval_secs() -> u64 {
    3
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for General {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            log_level: default_log_level(),
        }
    }
}

impl Default for VirtualDevice {
    fn default() -> Self {
        Self {
            name: "Multi-Output (multiout)".to_string(),
            uid: "io.multiout.virtual-output".to_string(),
            uid_prefix: "io.multiout.".to_string(),
            private: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: 1,
            general: General::default(),
            virtual_device: VirtualDevice::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.general.refresh_interval_secs == 0 {
            return Err(ValidationError::ZeroRefreshInterval);
        }
        if self.general.settle_delay_ms > MAX_SETTLE_DELAY_MS {
            return Err(ValidationError::SettleDelayTooLong(
                self.general.settle_delay_ms,
            ));
        }
        let vd = &self.virtual_device;
        if vd.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("name"));
        }
        if vd.uid_prefix.is_empty() {
            return Err(ValidationError::EmptyField("uid_prefix"));
        }
        if !vd.uid.starts_with(&vd.uid_prefix) {
            return Err(ValidationError::UidOutsidePrefix {
                uid: vd.uid.clone(),
                prefix: vd.uid_prefix.clone(),
            });
        }
        Ok(())
    }
}

/// Manager providing thread-safe access and persistence.
pub struct ConfigManager {
    path: PathBuf,
    inner: Arc<RwLock<Config>>,
}

impl ConfigManager {
    /// Load config from the given directory, or from the executable's directory if None.
    /// A missing file is created with default values.
    pub fn load(basepath: Option<PathBuf>) -> Result<Self> {
        let config_dir = basepath.unwrap_or_else(default_config_dir);
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        let cfg = if config_path.exists() {
            let s = fs::read_to_string(&config_path)
                .with_context(|| format!("reading config file: {}", config_path.display()))?;
            let cfg: Config = toml::from_str(&s).context("parsing TOML config")?;
            cfg.validate()
                .with_context(|| format!("validating {}", config_path.display()))?;
            cfg
        } else {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("creating config dir: {}", config_dir.display()))?;
            let cfg = Config::default();
            write_atomically(&config_path, &cfg)?;
            cfg
        };

        Ok(Self {
            path: config_path,
            inner: Arc::new(RwLock::new(cfg)),
        })
    }

    /// Save current config to disk atomically.
    pub fn save(&self) -> Result<()> {
        let cfg = self.inner.read().clone();
        cfg.validate().context("refusing to save invalid config")?;
        write_atomically(&self.path, &cfg)
    }

    /// Returns a cloneable handle to the shared config.
    pub fn handle(&self) -> Arc<RwLock<Config>> {
        self.inner.clone()
    }

    /// Update the config through a closure and persist it. The in-memory value is
    /// rolled back when the result does not validate.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Config),
    {
        {
            let mut cfg = self.inner.write();
            let before = cfg.clone();
            f(&mut *cfg);
            if let Err(e) = cfg.validate() {
                *cfg = before;
                return Err(e).context("rejected config update");
            }
        }
        self.save()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_atomically(path: &Path, cfg: &Config) -> Result<()> {
    let tmp = path.with_extension("toml.tmp");
    let s = toml::to_string_pretty(cfg).context("serializing config")?;
    let mut f = fs::File::create(&tmp)
        .with_context(|| format!("creating tmp config file: {}", tmp.display()))?;
    f.write_all(s.as_bytes())?;
    f.sync_all()?;
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming tmp config {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

fn default_config_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe_path| exe_path.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| Path::new(".").to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let decoded: Config = toml::from_str("config_version = 1\n").expect("deserialize");
        assert_eq!(decoded, Config::default());

        let decoded: Config = toml::from_str(
            "config_version = 1\n[general]\nrefresh_interval_secs = 10\n",
        )
        .expect("deserialize");
        assert_eq!(decoded.general.refresh_interval_secs, 10);
        assert_eq!(decoded.general.settle_delay_ms, 500);
    }

    #[test]
    fn load_creates_default_file() {
        let td = tempdir().unwrap();
        let config_dir = td.path().to_path_buf();
        let expected_config_path = config_dir.join(CONFIG_FILE_NAME);
        assert!(!expected_config_path.exists());
        let mgr = ConfigManager::load(Some(config_dir)).expect("load");
        assert!(expected_config_path.exists());
        assert_eq!(mgr.path(), expected_config_path.as_path());
        let cfg = mgr.handle();
        let c = cfg.read();
        assert_eq!(c.config_version, 1);
        assert_eq!(c.general.refresh_interval_secs, 3);
    }

    #[test]
    fn update_persists_changes() {
        let td = tempdir().unwrap();
        let config_dir = td.path().to_path_buf();
        let mgr = ConfigManager::load(Some(config_dir.clone())).expect("load");
        mgr.update(|c| {
            c.general.settle_delay_ms = 750;
        })
        .expect("update");
        let s = fs::read_to_string(config_dir.join(CONFIG_FILE_NAME)).expect("read file");
        assert!(s.contains("settle_delay_ms = 750"));

        let reloaded = ConfigManager::load(Some(config_dir)).expect("reload");
        assert_eq!(reloaded.handle().read().general.settle_delay_ms, 750);
    }

    #[test]
    fn invalid_update_is_rolled_back() {
        let td = tempdir().unwrap();
        let mgr = ConfigManager::load(Some(td.path().to_path_buf())).expect("load");
        let res = mgr.update(|c| c.general.refresh_interval_secs = 0);
        assert!(res.is_err());
        assert_eq!(mgr.handle().read().general.refresh_interval_secs, 3);
    }

    #[test]
    fn validate_rejects_uid_outside_prefix() {
        let mut cfg = Config::default();
        cfg.virtual_device.uid = "com.other.device".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ValidationError::UidOutsidePrefix { .. })
        ));

        let mut cfg = Config::default();
        cfg.general.settle_delay_ms = MAX_SETTLE_DELAY_MS + 1;
        assert_eq!(
            cfg.validate(),
            Err(ValidationError::SettleDelayTooLong(MAX_SETTLE_DELAY_MS + 1))
        );
    }

    #[test]
    fn load_rejects_invalid_file() {
        let td = tempdir().unwrap();
        fs::write(
            td.path().join(CONFIG_FILE_NAME),
            "config_version = 1\n[virtual_device]\nname = \"\"\nuid = \"io.multiout.x\"\nuid_prefix = \"io.multiout.\"\n",
        )
        .unwrap();
        assert!(ConfigManager::load(Some(td.path().to_path_buf())).is_err());
    }
}
