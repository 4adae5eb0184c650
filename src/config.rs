use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

/// Relay configuration, loaded once at startup and read-only afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Peer addresses allowed to connect, compared as exact strings.
    #[serde(default)]
    pub allow_ip: Vec<String>,

    #[serde(default = "default_port", deserialize_with = "deserialize_port")]
    pub port: u16,

    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Local address -> public address presented during delivery.
    #[serde(default)]
    pub map_ip: HashMap<String, String>,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub smtpd: SmtpdSettings,

    #[serde(default)]
    pub delivery: DeliverySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpdSettings {
    pub hostname: String,
    pub read_timeout_secs: u64,
    pub max_message_size: usize,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub auth_users: HashMap<String, String>,
}

impl Default for SmtpdSettings {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            read_timeout_secs: 300,
            max_message_size: 10 * 1024 * 1024,
            tls_cert: None,
            tls_key: None,
            auth_users: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub port: u16,
    pub timeout_secs: u64,
    pub helo_name: Option<String>,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            port: 25,
            timeout_secs: 300,
            helo_name: None,
        }
    }
}

fn default_port() -> u16 {
    25
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}

/// Accepts `port = 2525` as well as `port = "2525"`.
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct PortVisitor;

    impl<'de> Visitor<'de> for PortVisitor {
        type Value = u16;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a port number as integer or string")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<u16, E> {
            u16::try_from(v).map_err(|_| E::custom(format!("port out of range: {}", v)))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<u16, E> {
            u16::try_from(v).map_err(|_| E::custom(format!("port out of range: {}", v)))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<u16, E> {
            v.trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid port: {:?}", v)))
        }
    }

    deserializer.deserialize_any(PortVisitor)
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml_str(&raw).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        match self.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            _ => format!("{}:{}", self.address, self.port),
        }
    }

    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.smtpd.tls_cert, &self.smtpd.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_layout() {
        let config = Config::from_toml_str(
            r#"
            allow_ip = ["127.0.0.1", "10.0.0.20"]
            port = "2525"
            log_dir = "/var/log/smtp-proxy"
            debug = true

            [map_ip]
            "10.0.0.5" = "203.0.113.9"
            "#,
        )
        .unwrap();

        assert_eq!(config.allow_ip, vec!["127.0.0.1", "10.0.0.20"]);
        assert_eq!(config.port, 2525);
        assert_eq!(config.log_dir, PathBuf::from("/var/log/smtp-proxy"));
        assert_eq!(config.map_ip.get("10.0.0.5").map(String::as_str), Some("203.0.113.9"));
        assert!(config.debug);
        assert_eq!(config.listen_addr(), "0.0.0.0:2525");
    }

    #[test]
    fn defaults_fill_missing_keys() {
        let config = Config::from_toml_str("").unwrap();

        assert!(config.allow_ip.is_empty());
        assert_eq!(config.port, 25);
        assert_eq!(config.log_dir, PathBuf::from("log"));
        assert!(!config.debug);
        assert_eq!(config.smtpd.hostname, "localhost");
        assert_eq!(config.smtpd.read_timeout_secs, 300);
        assert_eq!(config.delivery.port, 25);
        assert!(config.tls_paths().is_none());
    }

    #[test]
    fn numeric_port_and_nested_tables() {
        let config = Config::from_toml_str(
            r#"
            port = 587

            [smtpd]
            hostname = "relay.example.net"
            tls_cert = "cert.pem"
            tls_key = "key.pem"

            [smtpd.auth_users]
            app = "secret"

            [delivery]
            helo_name = "mx-out.example.net"
            timeout_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 587);
        assert_eq!(config.smtpd.hostname, "relay.example.net");
        assert_eq!(config.smtpd.max_message_size, 10 * 1024 * 1024);
        assert_eq!(config.smtpd.auth_users.get("app").map(String::as_str), Some("secret"));
        assert!(config.tls_paths().is_some());
        assert_eq!(config.delivery.helo_name.as_deref(), Some("mx-out.example.net"));
        assert_eq!(config.delivery.timeout_secs, 30);
        assert_eq!(config.delivery.port, 25);
    }

    #[test]
    fn ipv6_listen_address_is_bracketed() {
        let config = Config::from_toml_str(
            r#"
            address = "::"
            port = 2525
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr(), "[::]:2525");
    }

    #[test]
    fn rejects_bad_port() {
        assert!(Config::from_toml_str(r#"port = "smtp""#).is_err());
        assert!(Config::from_toml_str("port = 70000").is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }
}
