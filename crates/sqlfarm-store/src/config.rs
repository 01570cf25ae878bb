use serde::{Deserialize, Serialize};
use sqlfarm_core::driver::DEFAULT_PORT;
use sqlfarm_core::{ConnectParams, Result, SqlFarmError};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

pub const WILDCARD_TABLE: &str = "*";
pub const DEFAULT_CONNECTION_EXPIRE_SECONDS: u64 = 3600;
pub const DEFAULT_CONFIG_DIR: &str = "/etc/sqlfarm";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub farms: BTreeMap<String, FarmConfig>,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statsd: Option<StatsdConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alerting: Option<AlertingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload: Option<ReloadConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FarmConfig {
    /// `host:db:user:pass` or `host:port:db:user:pass`.
    pub master: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_expire_seconds: Option<u64>,
    #[serde(default)]
    pub disable_query_cache: bool,
    #[serde(default)]
    pub delete_without_where: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionsConfig {
    #[serde(default)]
    pub logging: bool,
    #[serde(default)]
    pub show_warnings: bool,
    #[serde(default)]
    pub treat_warning_as_error: bool,
    #[serde(default)]
    pub treat_warning_as_error_sampling_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsdConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

impl Default for StatsdConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_sample_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertingConfig {
    pub dsn: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReloadConfig {
    #[serde(default)]
    pub config_node: Option<String>,
    #[serde(default)]
    pub blacklist_node: Option<String>,
}

impl StoreConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read(path)
            .map_err(|e| SqlFarmError::Config(format!("{}: {e}", path.display())))?;
        let is_json = path.extension().map(|ext| ext == "json").unwrap_or(false);
        if is_json {
            Self::from_json_slice(&contents)
        } else {
            Self::from_document(&contents)
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: StoreConfig =
            toml::from_str(contents).map_err(|e| SqlFarmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_slice(contents: &[u8]) -> Result<Self> {
        let config: StoreConfig =
            serde_json::from_slice(contents).map_err(|e| SqlFarmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// A pushed document: JSON when it opens with `{`, TOML otherwise.
    pub fn from_document(contents: &[u8]) -> Result<Self> {
        let first = contents.iter().find(|b| !b.is_ascii_whitespace());
        if first == Some(&b'{') {
            return Self::from_json_slice(contents);
        }
        let text = std::str::from_utf8(contents)
            .map_err(|e| SqlFarmError::Config(format!("config is not utf-8: {e}")))?;
        Self::from_toml_str(text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SqlFarmError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        for (name, farm) in &self.farms {
            parse_master(&farm.master)
                .map_err(|e| SqlFarmError::Config(format!("farm {name}: {e}")))?;
        }
        if !self.farms.is_empty()
            && !self
                .farms
                .values()
                .any(|farm| farm.tables.iter().any(|t| t == WILDCARD_TABLE))
        {
            return Err(SqlFarmError::Config("No default farm specified".into()));
        }
        let rate = self.options.treat_warning_as_error_sampling_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(SqlFarmError::Config(format!(
                "treat_warning_as_error_sampling_rate must be within 0..=1, got {rate}"
            )));
        }
        if let Some(statsd) = &self.statsd {
            if !(0.0..=1.0).contains(&statsd.sample_rate) {
                return Err(SqlFarmError::Config(format!(
                    "statsd sample_rate must be within 0..=1, got {}",
                    statsd.sample_rate
                )));
            }
        }
        Ok(())
    }
}

/// Parses a farm's `master` connection string.
pub fn parse_master(master: &str) -> Result<ConnectParams> {
    let parts: Vec<&str> = master.split(':').collect();
    match parts.as_slice() {
        [host, db, user, password] => Ok(ConnectParams::new(host, DEFAULT_PORT, db, user, password)),
        [host, port, db, user, password] => {
            let port = port
                .parse::<u16>()
                .map_err(|_| SqlFarmError::Config(format!("invalid port in {master:?}")))?;
            Ok(ConnectParams::new(host, port, db, user, password))
        }
        _ => Err(SqlFarmError::Config(format!(
            "invalid connection string {master:?}"
        ))),
    }
}

/// Options in effect after environment overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeOptions {
    pub logging: bool,
    pub show_warnings: bool,
    pub treat_warning_as_error: bool,
    pub treat_warning_as_error_sampling_rate: f64,
}

impl RuntimeOptions {
    pub fn from_config(options: &OptionsConfig) -> Self {
        Self {
            logging: options.logging || env_flag("SQLFARM_LOGGING"),
            show_warnings: options.show_warnings || env_flag("SQLFARM_SHOW_WARNINGS"),
            treat_warning_as_error: options.treat_warning_as_error
                || env_flag("SQLFARM_TREAT_WARNING_AS_ERROR"),
            treat_warning_as_error_sampling_rate: options.treat_warning_as_error_sampling_rate,
        }
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| !v.is_empty()).unwrap_or(false)
}

/// Where a store's config comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    Inline(StoreConfig),
    /// A config file name under the config directory.
    Named(String),
}

impl ConfigSource {
    pub fn load(&self) -> Result<StoreConfig> {
        match self {
            ConfigSource::Inline(config) => {
                config.validate()?;
                Ok(config.clone())
            }
            ConfigSource::Named(name) => StoreConfig::from_path(named_config_path(name)),
        }
    }

    /// Stable identity used to share stores between callers.
    pub fn cache_key(&self) -> Result<String> {
        match self {
            ConfigSource::Inline(config) => Ok(format!("inline:{}", config.to_json()?)),
            ConfigSource::Named(name) => Ok(format!("named:{}", resolve_config_name(name))),
        }
    }
}

/// `SQLFARM_CONFIG_OVERRIDE="shire-online=>shire-offline ark-online=>ark-offline"`
/// swaps config names without touching code.
pub fn override_map() -> HashMap<String, String> {
    std::env::var("SQLFARM_CONFIG_OVERRIDE")
        .map(|raw| parse_override(&raw))
        .unwrap_or_default()
}

pub fn parse_override(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for item in raw.split_whitespace() {
        match item.split_once("=>") {
            Some((from, to)) if !from.is_empty() && !to.is_empty() => {
                out.insert(from.to_string(), to.to_string());
            }
            // A malformed override disables all of them.
            _ => return HashMap::new(),
        }
    }
    out
}

pub fn resolve_config_name(name: &str) -> String {
    override_map()
        .remove(name)
        .unwrap_or_else(|| name.to_string())
}

pub fn config_dir() -> PathBuf {
    std::env::var("SQLFARM_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR))
}

fn named_config_path(name: &str) -> PathBuf {
    let name = resolve_config_name(name);
    let path = PathBuf::from(&name);
    if path.is_absolute() {
        return path;
    }
    let mut path = config_dir().join(&name);
    if path.extension().is_none() {
        path.set_extension("toml");
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[farms.farm1]
master = "127.0.0.1:3306:test_sqlfarm1:sqlfarm:sqlfarm"
tables = ["test_table1", "*"]

[farms.farm2]
master = "db2.internal:test_sqlfarm2:sqlfarm:secret"
tables = ["test_table2"]
connection_expire_seconds = 60

[options]
logging = true
treat_warning_as_error_sampling_rate = 0.01

[statsd]
sample_rate = 0.5
"#;

    #[test]
    fn parse_master_accepts_both_forms() {
        let params = parse_master("db1:3307:shire:eye:sauron").expect("five parts");
        assert_eq!(params.host, "db1");
        assert_eq!(params.port, 3307);
        assert_eq!(params.db, "shire");
        assert_eq!(params.user, "eye");
        assert_eq!(params.password, "sauron");

        let params = parse_master("db1:shire:eye:sauron").expect("four parts");
        assert_eq!(params.port, DEFAULT_PORT);
        assert_eq!(params.init_command, "set names utf8");
    }

    #[test]
    fn parse_master_rejects_garbage() {
        assert!(parse_master("db1:shire").is_err());
        assert!(parse_master("db1:port:shire:eye:sauron").is_err());
    }

    #[test]
    fn toml_config_loads_and_validates() {
        let config = StoreConfig::from_toml_str(SAMPLE).expect("config");
        assert_eq!(config.farms.len(), 2);
        assert_eq!(config.farms["farm2"].connection_expire_seconds, Some(60));
        assert!(config.options.logging);
        assert_eq!(config.statsd.as_ref().map(|s| s.sample_rate), Some(0.5));
        assert!(config.alerting.is_none());
    }

    #[test]
    fn config_without_wildcard_is_rejected() {
        let raw = SAMPLE.replace(r#"["test_table1", "*"]"#, r#"["test_table1"]"#);
        let err = StoreConfig::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("No default farm specified"));
    }

    #[test]
    fn empty_config_is_valid() {
        let config = StoreConfig::from_json_slice(b"{}").expect("empty");
        assert!(config.farms.is_empty());
    }

    #[test]
    fn sampling_rate_must_be_a_probability() {
        let raw = SAMPLE.replace("0.01", "1.5");
        assert!(StoreConfig::from_toml_str(&raw).is_err());
    }

    #[test]
    fn documents_are_sniffed() {
        let toml_config = StoreConfig::from_toml_str(SAMPLE).expect("toml");
        let json = toml_config.to_json().expect("json");
        let from_json = StoreConfig::from_document(json.as_bytes()).expect("json document");
        assert_eq!(from_json, toml_config);
        let from_toml = StoreConfig::from_document(SAMPLE.as_bytes()).expect("toml document");
        assert_eq!(from_toml, toml_config);
    }

    #[test]
    fn from_path_reads_files() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        file.write_all(SAMPLE.as_bytes()).expect("write");
        let config = StoreConfig::from_path(file.path()).expect("load");
        assert_eq!(config.farms["farm1"].tables, vec!["test_table1", "*"]);
    }

    #[test]
    fn environment_forces_options_on() {
        // Only show_warnings is touched here; it changes nothing but logging
        // for store tests running alongside.
        let options = OptionsConfig::default();
        std::env::set_var("SQLFARM_SHOW_WARNINGS", "1");
        let forced = RuntimeOptions::from_config(&options);
        std::env::remove_var("SQLFARM_SHOW_WARNINGS");
        assert!(forced.show_warnings);
        assert!(!forced.treat_warning_as_error);
    }

    #[test]
    fn override_map_parsing() {
        let map = parse_override("shire-online=>shire-offline ark-online=>ark-offline");
        assert_eq!(map.get("shire-online").map(String::as_str), Some("shire-offline"));
        assert_eq!(map.len(), 2);
        assert!(parse_override("broken ark=>x").is_empty());
    }
}
