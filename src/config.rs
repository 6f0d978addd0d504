use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost/";
pub const DEFAULT_HOOK_NAME: &str = "__ENCLAVE_GLOBAL_HOOK__";
pub const DEFAULT_GLOBAL_VARS_NAME: &str = "__ENCLAVE_GLOBAL_VARS__";
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_AMBIENT_EVENTS: &[&str] = &["resize", "scroll", "focus", "blur"];
const DEFAULT_FRAME_STYLE: &str = "position: absolute; top: -20000px; width: 1px; height: 1px;";

/// Environment variable pointing at a YAML config file.
pub const CONFIG_ENV_VAR: &str = "ENCLAVE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read loader config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// URL the host page is considered to be served from.
    pub base_url: String,
    pub script_timeout_ms: u64,
    pub hook_name: String,
    pub global_vars_name: String,
    /// Event types that are bound to the host window instead of the frame.
    pub ambient_events: Vec<String>,
    pub frame_style: String,
    /// Hosts that always receive credentials, regardless of origin.
    pub credential_hosts: Vec<String>,
    pub fetch_cookie: Option<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            script_timeout_ms: DEFAULT_SCRIPT_TIMEOUT_MS,
            hook_name: DEFAULT_HOOK_NAME.to_string(),
            global_vars_name: DEFAULT_GLOBAL_VARS_NAME.to_string(),
            ambient_events: DEFAULT_AMBIENT_EVENTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            frame_style: DEFAULT_FRAME_STYLE.to_string(),
            credential_hosts: Vec::new(),
            fetch_cookie: None,
        }
    }
}

impl LoaderConfig {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                serde_yaml::from_str::<LoaderConfig>(&contents)?
            }
            _ => LoaderConfig::default(),
        };

        config.base_url()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from);
        Self::load(path)
    }

    pub fn base_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.base_url)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub fn is_ambient_event(&self, event_type: &str) -> bool {
        self.ambient_events.iter().any(|ambient| ambient == event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_default() {
        let config = LoaderConfig::load(None).unwrap();
        assert_eq!(config.script_timeout(), Duration::from_secs(120));
        assert_eq!(config.hook_name, DEFAULT_HOOK_NAME);
        assert!(config.is_ambient_event("resize"));
        assert!(config.is_ambient_event("focus"));
        assert!(!config.is_ambient_event("click"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = LoaderConfig::load(Some(PathBuf::from("/nonexistent/enclave.yaml"))).unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(
            file,
            "base_url: https://console.example/app/\nscript_timeout_ms: 500\nambient_events:\n  - resize\ncredential_hosts:\n  - cdn.example"
        )
        .unwrap();
        let config = LoaderConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.script_timeout(), Duration::from_millis(500));
        assert!(config.is_ambient_event("resize"));
        assert!(!config.is_ambient_event("scroll"));
        assert_eq!(config.credential_hosts, vec!["cdn.example".to_string()]);
        assert_eq!(config.hook_name, DEFAULT_HOOK_NAME);
    }

    #[test]
    fn rejects_invalid_base_url() {
        let mut file = NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(file, "base_url: not a url").unwrap();
        let err = LoaderConfig::load(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl(_)));
    }
}
