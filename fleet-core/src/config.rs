//! Typed configuration (SPEC_FULL.md §4.8), layered the way the teacher's
//! services load theirs: compiled-in [`Default`] → an optional TOML file →
//! `FLEET_*` environment overrides, via `figment`.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Masks secrets the way the teacher's `SafeDisplay` trait does, so the
/// effective configuration can be logged at startup without leaking
/// credentials.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FleetConfig {
    pub db: DbConfig,
    pub tracing: TracingConfig,
    pub rate: RateConfig,
    pub timeouts: TimeoutConfig,
    pub classifier: ClassifierConfig,
    pub proxy: ProxyPolicyConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            db: DbConfig::default(),
            tracing: TracingConfig::default(),
            rate: RateConfig::default(),
            timeouts: TimeoutConfig::default(),
            classifier: ClassifierConfig::default(),
            proxy: ProxyPolicyConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl SafeDisplay for FleetConfig {
    fn to_safe_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(&mut out, "db:");
        let _ = writeln!(&mut out, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut out, "tracing:");
        let _ = writeln!(&mut out, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut out, "rate: {:?}", self.rate);
        let _ = writeln!(&mut out, "timeouts: {:?}", self.timeouts);
        let _ = writeln!(&mut out, "classifier: {:?}", self.classifier);
        let _ = writeln!(&mut out, "proxy: {:?}", self.proxy);
        let _ = writeln!(&mut out, "supervisor: {:?}", self.supervisor);
        out
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub schema: Option<String>,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "fleet".to_string(),
            username: "fleet".to_string(),
            password: "fleet".to_string(),
            schema: None,
            max_connections: 10,
        }
    }
}

impl SafeDisplay for DbConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "postgres://{}:****@{}:{}/{}{}, max_connections={}",
            self.username,
            self.host,
            self.port,
            self.database,
            self.schema
                .as_ref()
                .map(|s| format!("?schema={s}"))
                .unwrap_or_default(),
            self.max_connections
        )
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, Eq, PartialEq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub log_format: LogFormat,
    pub log_filter: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Text,
            log_filter: "info,fleet_core=debug,fleet_cli=debug".to_string(),
        }
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        format!("format={:?}, filter={}", self.log_format, self.log_filter)
    }
}

/// §4.2/§4.3 pacing and hourly-cap knobs, plus §9's resolution of the
/// `cycle_delay_minutes` vs. `max_messages_per_hour` open question.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RateConfig {
    pub max_messages_per_hour: u32,
    pub max_cycles: i32,
    pub delay_randomness: f64,
    #[serde(with = "humantime_serde")]
    pub cycle_delay: std::time::Duration,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            max_messages_per_hour: 20,
            max_cycles: 1,
            delay_randomness: 0.2,
            cycle_delay: std::time::Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(with = "humantime_serde")]
    pub page_load_timeout: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub search_timeout: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub send_timeout: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub stale_claim_grace: std::time::Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            page_load_timeout: std::time::Duration::from_secs(30),
            search_timeout: std::time::Duration::from_secs(15),
            send_timeout: std::time::Duration::from_secs(20),
            shutdown_grace: std::time::Duration::from_secs(30),
            stale_claim_grace: std::time::Duration::from_secs(10 * 60),
        }
    }
}

impl TimeoutConfig {
    pub fn total_send_budget(&self) -> std::time::Duration {
        self.page_load_timeout + self.search_timeout + self.send_timeout
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub max_attempts_before_block: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_attempts_before_block: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ProxyPolicyConfig {
    pub chat_not_found_threshold: f64,
    pub min_sample_size: u32,
}

impl Default for ProxyPolicyConfig {
    fn default() -> Self {
        Self {
            chat_not_found_threshold: 0.40,
            min_sample_size: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(with = "humantime_serde")]
    pub restart_backoff_base: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub restart_backoff_cap: std::time::Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_backoff_base: std::time::Duration::from_secs(1),
            restart_backoff_cap: std::time::Duration::from_secs(5 * 60),
        }
    }
}

/// Mirrors the teacher's `make_config_loader` helper: defaults, then an
/// optional file, then `FLEET_`-prefixed environment variables, last wins.
pub struct ConfigLoader {
    file: PathBuf,
}

impl ConfigLoader {
    pub fn new(file: &Path) -> Self {
        Self {
            file: file.to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<FleetConfig, figment::Error> {
        Figment::from(Serialized::defaults(FleetConfig::default()))
            .merge(Toml::file(&self.file))
            .merge(Env::prefixed("FLEET_").split("__"))
            .extract()
    }
}

pub fn make_config_loader() -> ConfigLoader {
    ConfigLoader::new(&PathBuf::from("config/fleet.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_loadable_without_a_file() {
        let loader = ConfigLoader::new(&PathBuf::from("does-not-exist.toml"));
        let config = loader.load().expect("default config should load");
        assert_eq!(config.rate.max_messages_per_hour, 20);
    }

    #[test]
    fn db_config_masks_password() {
        let db = DbConfig::default();
        let rendered = db.to_safe_string();
        assert!(!rendered.contains(&db.password));
        assert!(rendered.contains("****"));
    }
}
