//! Configuration loading for card clients.
//!
//! Clients are configured from a TOML file with one `[[client]]` table per
//! card server:
//!
//! ```toml
//! [[client]]
//! name = "living-room"
//! hostname = "192.168.1.10"
//! port = 15000
//! username = "tv"
//! password = "secret"
//! emm = true
//! emmex = true
//! keepalive_interval = 30
//! ```
//!
//! A single client can also be configured from `CARDCLIENT_*` environment
//! variables.

use std::fs;
use std::path::Path;
use std::time::Duration;

use cardclient_protocol::Credentials;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default keepalive interval in seconds.
pub const DEFAULT_KEEPALIVE_INTERVAL: u64 = 30;

/// Default number of NOKs before a section is given up.
pub const DEFAULT_MAX_NOKS: u8 = 4;

/// Configuration of one card client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name used in logs and resolver notices.
    pub name: String,
    pub enabled: bool,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Forward EMMs to the server.
    pub emm: bool,
    /// Take EMMs from one mux only.
    pub emmex: bool,
    /// Seconds between keepalives.
    pub keepalive_interval: u64,
    /// Seconds to wait for connect and login.
    pub connect_timeout: u64,
    /// Seconds to wait before reconnecting after repeated failures.
    pub reconnect_delay: u64,
    /// Seconds EMM forwarding sticks to one mux in `emmex` mode.
    pub emm_mux_cooldown: u64,
    /// NOKs after which a section is given up.
    pub max_noks: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "cardclient".to_string(),
            enabled: true,
            hostname: "localhost".to_string(),
            port: 0,
            username: String::new(),
            password: String::new(),
            emm: true,
            emmex: true,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            connect_timeout: 10,
            reconnect_delay: 3,
            emm_mux_cooldown: 25,
            max_noks: DEFAULT_MAX_NOKS,
        }
    }
}

impl ClientConfig {
    /// `host:port`, used as the display name of the connection.
    pub fn display_name(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// A client without hostname cannot run.
    pub fn is_configured(&self) -> bool {
        !self.hostname.trim().is_empty()
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    pub fn emm_mux_cooldown(&self) -> Duration {
        Duration::from_secs(self.emm_mux_cooldown)
    }

    /// NOK cap, never below one.
    pub fn max_noks(&self) -> u8 {
        self.max_noks.max(1)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default, rename = "client")]
    clients: Vec<ClientConfig>,
}

/// Load every `[[client]]` table from a TOML file.
pub fn load_config(path: &Path) -> Result<Vec<ClientConfig>, ConfigError> {
    info!("Loading configuration from {:?}", path);
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Parse configuration text.
pub fn parse_config(content: &str) -> Result<Vec<ClientConfig>, ConfigError> {
    let file: ConfigFile = toml::from_str(content)?;
    for client in &file.clients {
        debug!(
            "Configuration loaded: client={}, server={}",
            client.name,
            client.display_name()
        );
    }
    Ok(file.clients)
}

/// Build one client configuration from `CARDCLIENT_*` environment
/// variables, falling back to defaults.
pub fn load_from_env() -> Result<ClientConfig, ConfigError> {
    load_from_vars(|key| std::env::var(key).ok())
}

fn load_from_vars(var: impl Fn(&str) -> Option<String>) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();

    if let Some(v) = var("CARDCLIENT_NAME") {
        config.name = v;
    }
    if let Some(v) = var("CARDCLIENT_HOST") {
        config.hostname = v;
    }
    if let Some(v) = var("CARDCLIENT_PORT") {
        config.port = parse_number("CARDCLIENT_PORT", &v)?;
    }
    if let Some(v) = var("CARDCLIENT_USER") {
        config.username = v;
    }
    if let Some(v) = var("CARDCLIENT_PASSWORD") {
        config.password = v;
    }
    if let Some(v) = var("CARDCLIENT_ENABLED") {
        config.enabled = parse_bool(&v);
    }
    if let Some(v) = var("CARDCLIENT_EMM") {
        config.emm = parse_bool(&v);
    }
    if let Some(v) = var("CARDCLIENT_EMMEX") {
        config.emmex = parse_bool(&v);
    }
    if let Some(v) = var("CARDCLIENT_KEEPALIVE") {
        config.keepalive_interval = parse_number("CARDCLIENT_KEEPALIVE", &v)?;
    }

    debug!("Using environment/default config: server={}", config.display_name());
    Ok(config)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(value: &str) -> bool {
    let lower = value.trim().to_lowercase();
    lower == "1" || lower == "true" || lower == "yes" || lower == "on"
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_config() {
        let content = r#"
[[client]]
name = "primary"
hostname = "192.168.1.10"
port = 15000
username = "tv"
password = "secret"
emmex = false

[[client]]
name = "backup"
hostname = "10.0.0.2"
port = 15001
keepalive_interval = 60
"#;
        let clients = parse_config(content).unwrap();
        assert_eq!(clients.len(), 2);

        let primary = &clients[0];
        assert_eq!(primary.display_name(), "192.168.1.10:15000");
        assert_eq!(primary.credentials().username, "tv");
        assert!(primary.emm);
        assert!(!primary.emmex);
        assert_eq!(primary.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(primary.max_noks(), 4);

        let backup = &clients[1];
        assert_eq!(backup.keepalive_interval(), Duration::from_secs(60));
        assert_eq!(backup.reconnect_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[client]]\nhostname = \"cards.local\"\nport = 12000").unwrap();

        let clients = load_config(file.path()).unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].hostname, "cards.local");
        assert!(clients[0].is_configured());
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("/nonexistent/cardclient.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_invalid_toml() {
        let result = parse_config("[[client]]\nport = \"not a number\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_empty_hostname_not_configured() {
        let config = ClientConfig {
            hostname: "  ".to_string(),
            ..Default::default()
        };
        assert!(!config.is_configured());
    }

    #[test]
    fn test_load_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("CARDCLIENT_HOST", "cards.local"),
            ("CARDCLIENT_PORT", "15000"),
            ("CARDCLIENT_EMM", "off"),
            ("CARDCLIENT_EMMEX", "Yes"),
        ]
        .into_iter()
        .collect();

        let config = load_from_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.display_name(), "cards.local:15000");
        assert!(!config.emm);
        assert!(config.emmex);
    }

    #[test]
    fn test_load_from_vars_bad_port() {
        let result = load_from_vars(|k| (k == "CARDCLIENT_PORT").then(|| "99999".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
