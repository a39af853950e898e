use crate::error::Result;
use crate::output::CompletionDispatch;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_DIR_NAME: &str = "GmicBridge";
const CONFIG_FILE_NAME: &str = "bridge.json";
pub const EXECUTABLE_ENV: &str = "GMIC_BRIDGE_EXECUTABLE";

/// Pointer width of the external filter build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalArch {
    X86,
    #[default]
    X64,
}

impl ExternalArch {
    pub fn is_32bit(self) -> bool {
        self == Self::X86
    }
}

/// Host-side settings, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Explicit path of the external filter executable.
    pub gmic_executable: Option<PathBuf>,
    pub external_arch: ExternalArch,
    /// First command line argument, identifying the host to the filter UI.
    pub host_marker: String,
    pub completion_dispatch: CompletionDispatch,
    pub output_directory: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            gmic_executable: None,
            external_arch: ExternalArch::default(),
            host_marker: "paintdotnet".to_string(),
            completion_dispatch: CompletionDispatch::default(),
            output_directory: None,
        }
    }
}

/// `<config dir>/GmicBridge`, or the working directory when unavailable.
pub fn get_config_directory() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_config_path() -> PathBuf {
    get_config_directory().join(CONFIG_FILE_NAME)
}

impl BridgeConfig {
    /// Load the user config with environment overrides applied.
    pub fn load_or_default() -> Result<Self> {
        let mut config = Self::load_from(&default_config_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("[CONFIG] {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        info!("[CONFIG] Loaded {:?}", path);
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&default_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("[CONFIG] Saved {:?}", path);
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(exe) = std::env::var_os(EXECUTABLE_ENV).filter(|v| !v.is_empty()) {
            debug!("[CONFIG] {} overrides the executable path", EXECUTABLE_ENV);
            self.gmic_executable = Some(PathBuf::from(exe));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load_from(&dir.path().join("bridge.json")).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.host_marker, "paintdotnet");
        assert_eq!(config.external_arch, ExternalArch::X64);
    }

    #[test]
    fn save_creates_directory_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bridge.json");
        let config = BridgeConfig {
            gmic_executable: Some(PathBuf::from("/opt/gmic/gmic_qt")),
            external_arch: ExternalArch::X86,
            completion_dispatch: CompletionDispatch::Post,
            ..Default::default()
        };

        config.save_to(&path).unwrap();
        assert_eq!(BridgeConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        fs::write(&path, r#"{ "externalArch": "x86", "completionDispatch": "post" }"#).unwrap();

        let config = BridgeConfig::load_from(&path).unwrap();
        assert!(config.external_arch.is_32bit());
        assert_eq!(config.completion_dispatch, CompletionDispatch::Post);
        assert_eq!(config.host_marker, "paintdotnet");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            BridgeConfig::load_from(&path),
            Err(BridgeError::Config(_))
        ));
    }
}
