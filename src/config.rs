use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_links_db")]
    pub links_db: PathBuf,
    #[serde(default)]
    pub resources: ResourcesConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_tick_interval", with = "duration_str")]
    pub tick_interval: Duration,
    #[serde(default = "default_host_ip_ttl", with = "duration_str")]
    pub host_ip_ttl: Duration,
    #[serde(default = "default_cpu_static_ttl", with = "duration_str")]
    pub cpu_static_ttl: Duration,
    #[serde(default = "default_cpu_dynamic_ttl", with = "duration_str")]
    pub cpu_dynamic_ttl: Duration,
    #[serde(default = "default_disks_ttl", with = "duration_str")]
    pub disks_ttl: Duration,
    #[serde(default = "default_gpus_ttl", with = "duration_str")]
    pub gpus_ttl: Duration,
    #[serde(default = "default_hardware_meta_ttl", with = "duration_str")]
    pub hardware_meta_ttl: Duration,
    #[serde(default = "default_gpu_tool_timeout", with = "duration_str")]
    pub gpu_tool_timeout: Duration,
    #[serde(default = "default_history_max_age", with = "duration_str")]
    pub history_max_age: Duration,
    #[serde(default = "default_history_max_points")]
    pub history_max_points: usize,
    #[serde(default = "default_top_processes")]
    pub top_processes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            links_db: default_links_db(),
            resources: ResourcesConfig::default(),
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            host_ip_ttl: default_host_ip_ttl(),
            cpu_static_ttl: default_cpu_static_ttl(),
            cpu_dynamic_ttl: default_cpu_dynamic_ttl(),
            disks_ttl: default_disks_ttl(),
            gpus_ttl: default_gpus_ttl(),
            hardware_meta_ttl: default_hardware_meta_ttl(),
            gpu_tool_timeout: default_gpu_tool_timeout(),
            history_max_age: default_history_max_age(),
            history_max_points: default_history_max_points(),
            top_processes: default_top_processes(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        Self::from_yaml(&text, &path_display)
    }

    /// Like [`Config::load_from_file`], but a missing file yields the defaults.
    /// Returns whether the file was found.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<(Self, bool), ConfigError> {
        match Self::load_from_file(path) {
            Ok(cfg) => Ok((cfg, true)),
            Err(ConfigError::Read { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Ok((Self::default(), false))
            }
            Err(err) => Err(err),
        }
    }

    pub fn from_yaml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.links_db.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "поле links_db не должно быть пустым".to_string(),
            ));
        }

        validate_resources(&self.resources)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_resources(cfg: &ResourcesConfig) -> Result<(), ConfigError> {
    let durations = [
        ("tick_interval", cfg.tick_interval),
        ("host_ip_ttl", cfg.host_ip_ttl),
        ("cpu_static_ttl", cfg.cpu_static_ttl),
        ("cpu_dynamic_ttl", cfg.cpu_dynamic_ttl),
        ("disks_ttl", cfg.disks_ttl),
        ("gpus_ttl", cfg.gpus_ttl),
        ("hardware_meta_ttl", cfg.hardware_meta_ttl),
        ("gpu_tool_timeout", cfg.gpu_tool_timeout),
        ("history_max_age", cfg.history_max_age),
    ];
    for (name, value) in durations {
        if value.is_zero() {
            return Err(ConfigError::Validation(format!(
                "resources.{name} должно быть > 0"
            )));
        }
    }

    if cfg.tick_interval < Duration::from_millis(100) {
        return Err(ConfigError::Validation(
            "resources.tick_interval должно быть >= 100ms".to_string(),
        ));
    }
    if cfg.history_max_points < 1 {
        return Err(ConfigError::Validation(
            "resources.history_max_points должно быть >= 1".to_string(),
        ));
    }
    if cfg.history_max_age < cfg.tick_interval {
        return Err(ConfigError::Validation(
            "resources.history_max_age должно быть >= resources.tick_interval".to_string(),
        ));
    }

    Ok(())
}

mod duration_str {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(raw.trim())
            .map_err(|e| D::Error::custom(format!("некорректная длительность '{raw}': {e}")))
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_links_db() -> PathBuf {
    PathBuf::from("./links.db.json")
}

const fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_host_ip_ttl() -> Duration {
    Duration::from_secs(30)
}

const fn default_cpu_static_ttl() -> Duration {
    Duration::from_secs(60)
}

const fn default_cpu_dynamic_ttl() -> Duration {
    if cfg!(target_os = "linux") {
        Duration::from_secs(2)
    } else {
        Duration::from_secs(5)
    }
}

const fn default_disks_ttl() -> Duration {
    Duration::from_secs(5)
}

const fn default_gpus_ttl() -> Duration {
    Duration::from_secs(5)
}

const fn default_hardware_meta_ttl() -> Duration {
    Duration::from_secs(30)
}

const fn default_gpu_tool_timeout() -> Duration {
    Duration::from_secs(2)
}

const fn default_history_max_age() -> Duration {
    Duration::from_secs(30 * 60)
}

const fn default_history_max_points() -> usize {
    2000
}

const fn default_top_processes() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = Config::from_yaml("{}", "test").expect("пустой конфиг валиден");
        assert_eq!(cfg.listen, "0.0.0.0:8080");
        assert_eq!(cfg.links_db, PathBuf::from("./links.db.json"));
        assert_eq!(cfg.resources.tick_interval, Duration::from_secs(1));
        assert_eq!(cfg.resources.history_max_age, Duration::from_secs(1800));
        assert_eq!(cfg.resources.history_max_points, 2000);
        assert!(cfg.resources.top_processes);
    }

    #[test]
    fn example_config_parses() {
        let cfg = Config::from_yaml(Config::example_yaml(), "config.yaml.example")
            .expect("пример конфигурации должен быть валидным");
        assert_eq!(cfg.resources.gpu_tool_timeout, Duration::from_secs(2));
        assert_eq!(cfg.resources.cpu_dynamic_ttl, default_cpu_dynamic_ttl());
    }

    #[test]
    fn human_durations_are_parsed() {
        let yaml = "listen: 127.0.0.1:9000\nresources:\n  tick_interval: 500ms\n  disks_ttl: 1m 30s\n";
        let cfg = Config::from_yaml(yaml, "test").expect("валидный конфиг");
        assert_eq!(cfg.resources.tick_interval, Duration::from_millis(500));
        assert_eq!(cfg.resources.disks_ttl, Duration::from_secs(90));
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let err = Config::from_yaml("resources:\n  gpus_ttl: soon\n", "test").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn rejects_invalid_values() {
        let cases = [
            "listen: not-an-address\n",
            "resources:\n  tick_interval: 10ms\n",
            "resources:\n  history_max_points: 0\n",
            "resources:\n  tick_interval: 10s\n  history_max_age: 5s\n",
            "resources:\n  disks_ttl: 0s\n",
        ];
        for yaml in cases {
            let err = Config::from_yaml(yaml, "test").unwrap_err();
            assert!(
                matches!(err, ConfigError::Validation(_)),
                "ожидалась ошибка валидации для {yaml:?}: {err}"
            );
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, found) = Config::load_or_default(dir.path().join("absent.yaml")).unwrap();
        assert!(!found);
        assert_eq!(cfg.listen, "0.0.0.0:8080");

        let path = dir.path().join("linksd.yaml");
        fs::write(&path, "listen: 127.0.0.1:1\n").unwrap();
        let (cfg, found) = Config::load_or_default(&path).unwrap();
        assert!(found);
        assert_eq!(cfg.listen, "127.0.0.1:1");
    }

    #[test]
    fn defaults_roundtrip_through_yaml() {
        let text = serde_yaml::to_string(&Config::default()).unwrap();
        let cfg = Config::from_yaml(&text, "roundtrip").unwrap();
        assert_eq!(cfg.resources.cpu_static_ttl, Duration::from_secs(60));
    }
}
