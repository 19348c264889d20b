//! Section-keyed configuration loaded from rc files.
//!
//! Several rc files can be layered; later files override earlier ones
//! key by key. Values are plain strings with typed accessors on top, the
//! same layering discipline streamline applies to its config fragments.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{Error, Result};

pub const GENERAL_SECTION: &str = "general";

pub const SERVER_ADDRESS_VAR: &str = "${CAPTUREMOCK_SERVER}";
pub const SERVER_PORT_VAR: &str = "${CAPTUREMOCK_PORT}";

/// Hierarchical key/value store behind the `--rcfiles` option.
///
/// Sections are introduced by `[name]` headers; keys before any header land
/// in `[general]`. Lines starting with `#` are comments. New sections and
/// keys may be added at runtime.
#[derive(Debug, Clone, Default)]
pub struct RcConfig {
    sections: BTreeMap<String, BTreeMap<String, String>>,
    server_address: Option<SocketAddr>,
}

impl RcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and layer the given rc files, in override order.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut config = Self::new();
        for path in paths {
            config.add_file(path)?;
        }
        Ok(config)
    }

    pub fn add_file(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        self.add_str(&contents);
        Ok(())
    }

    pub fn add_str(&mut self, contents: &str) {
        let mut section = GENERAL_SECTION.to_string();
        for line in contents.lines() {
            let line = line.trim_end();
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(name) = trimmed.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
                section = name.trim().to_string();
            } else if let Some((key, value)) = trimmed.split_once('=') {
                self.set(&section, key.trim(), value.trim());
            } else {
                warn!("Ignoring malformed configuration line: {trimmed:?}");
            }
        }
    }

    /// Record the server's own bound address, consulted by
    /// [`get_with_address`](Self::get_with_address).
    pub fn set_server_address(&mut self, address: SocketAddr) {
        self.server_address = Some(address);
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.get(section, key).unwrap_or(default)
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            Some(value) => matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"),
            None => default,
        }
    }

    pub fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.parse_or(section, key, default)
    }

    pub fn get_float(&self, section: &str, key: &str, default: f64) -> f64 {
        self.parse_or(section, key, default)
    }

    fn parse_or<T: std::str::FromStr + Copy>(&self, section: &str, key: &str, default: T) -> T {
        match self.get(section, key) {
            Some(value) => value.parse().unwrap_or_else(|_| {
                warn!("Ignoring non-numeric value {value:?} for [{section}] {key}");
                default
            }),
            None => default,
        }
    }

    /// Comma-split list accessor. A missing key yields an empty list.
    pub fn get_list(&self, section: &str, key: &str) -> Vec<String> {
        self.get(section, key)
            .map(|value| {
                value
                    .split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The whole section as a map. Missing sections yield an empty map.
    pub fn get_section(&self, section: &str) -> BTreeMap<String, String> {
        self.sections.get(section).cloned().unwrap_or_default()
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Try `key` in each candidate section in order; first hit wins.
    pub fn get_composite(&self, key: &str, sections: &[&str]) -> Option<&str> {
        sections.iter().find_map(|section| self.get(section, key))
    }

    /// Composite lookup with `${CAPTUREMOCK_SERVER}` / `${CAPTUREMOCK_PORT}`
    /// substituted against the server's own bound address.
    pub fn get_with_address(&self, key: &str, sections: &[&str]) -> Option<String> {
        let raw = self.get_composite(key, sections)?;
        Some(self.substitute_address(raw))
    }

    pub fn substitute_address(&self, raw: &str) -> String {
        match self.server_address {
            Some(address) => {
                let mut server = String::new();
                let _ = write!(server, "{address}");
                raw.replace(SERVER_ADDRESS_VAR, &server)
                    .replace(SERVER_PORT_VAR, &address.port().to_string())
            }
            None => raw.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RcConfig {
        let mut config = RcConfig::new();
        config.add_str(
            "# comment\n\
             server_protocol = http\n\
             [general]\n\
             server_multithreaded = false\n\
             alterations = dates,hosts\n\
             [command line]\n\
             intercepts = echo, ls\n\
             [dates]\n\
             match_pattern = \\d{4}-\\d{2}-\\d{2}\n\
             replacement = <date>\n",
        );
        config
    }

    #[test]
    fn keys_before_a_header_land_in_general() {
        let config = sample();
        assert_eq!(config.get(GENERAL_SECTION, "server_protocol"), Some("http"));
    }

    #[test]
    fn typed_accessors_fall_back_to_defaults() {
        let config = sample();
        assert!(!config.get_bool(GENERAL_SECTION, "server_multithreaded", true));
        assert!(config.get_bool(GENERAL_SECTION, "missing", true));
        assert_eq!(config.get_int(GENERAL_SECTION, "missing", 7), 7);
        assert_eq!(config.get_float(GENERAL_SECTION, "missing", 0.5), 0.5);
    }

    #[test]
    fn lists_are_comma_split_and_trimmed() {
        let config = sample();
        assert_eq!(config.get_list("command line", "intercepts"), vec!["echo", "ls"]);
        assert!(config.get_list("command line", "missing").is_empty());
    }

    #[test]
    fn composite_lookup_takes_the_first_hit() {
        let config = sample();
        assert_eq!(
            config.get_composite("match_pattern", &["missing", "dates"]),
            Some("\\d{4}-\\d{2}-\\d{2}")
        );
        assert_eq!(config.get_composite("match_pattern", &["missing"]), None);
    }

    #[test]
    fn later_files_override_earlier_ones() {
        let mut config = sample();
        config.add_str("[general]\nserver_protocol = classic_tcp\n");
        assert_eq!(config.get(GENERAL_SECTION, "server_protocol"), Some("classic_tcp"));
    }

    #[test]
    fn address_variables_are_substituted() {
        let mut config = sample();
        config.add_str("[general]\nurl = amqp://${CAPTUREMOCK_SERVER}/vhost\nport = ${CAPTUREMOCK_PORT}\n");
        config.set_server_address("127.0.0.1:4372".parse().unwrap());
        assert_eq!(
            config.get_with_address("url", &[GENERAL_SECTION]).unwrap(),
            "amqp://127.0.0.1:4372/vhost"
        );
        assert_eq!(config.get_with_address("port", &[GENERAL_SECTION]).unwrap(), "4372");
    }

    #[test]
    fn runtime_insertion_creates_sections() {
        let mut config = RcConfig::new();
        config.set("ids", "client", "id_1");
        assert!(config.has_section("ids"));
        assert_eq!(config.get("ids", "client"), Some("id_1"));
    }
}
