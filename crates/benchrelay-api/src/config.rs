use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use benchrelay_model::TemplateOverrides;
use benchrelay_repl::{AuditorConfig, BackoffPolicy, CoordinatorConfig, WorkerConfig};
use benchrelay_store::{ConsistencyPolicy, HttpStoreConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub leader_url: String,
    pub follower_urls: Vec<String>,
    pub queue_dir: PathBuf,
    pub username: Option<String>,
    pub password: Option<String>,
    pub environment: Option<String>,
    pub store_timeout_secs: u64,
    pub consistency: ConsistencyPolicy,
    pub leader_write_timeout_secs: u64,
    pub leader_retry_attempts: u32,
    pub retry_ceiling: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub unreachable_grace_secs: u64,
    pub health_probe_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub reconcile_tolerance_secs: u64,
    pub reconcile_repair: bool,
    pub number_of_shards: Option<u32>,
    pub number_of_replicas: Option<u32>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8460)),
            leader_url: String::from("http://localhost:9200"),
            follower_urls: Vec::new(),
            queue_dir: PathBuf::from("/var/lib/benchrelay/queues"),
            username: None,
            password: None,
            environment: None,
            store_timeout_secs: 60,
            consistency: ConsistencyPolicy::None,
            leader_write_timeout_secs: 30,
            leader_retry_attempts: 11,
            retry_ceiling: 10,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            unreachable_grace_secs: 10,
            health_probe_interval_secs: 5,
            reconcile_interval_secs: 300,
            reconcile_tolerance_secs: 60,
            reconcile_repair: false,
            number_of_shards: None,
            number_of_replicas: None,
        }
    }
}

impl RelayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: RelayConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: RelayConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Store connection settings for one backend URL.
    pub fn store_config(&self, base_url: &str) -> HttpStoreConfig {
        HttpStoreConfig {
            base_url: base_url.to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
            timeout: Duration::from_secs(self.store_timeout_secs),
            consistency: self.consistency,
        }
    }

    fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            leader_write_timeout: Duration::from_secs(self.leader_write_timeout_secs),
            leader_retry_attempts: self.leader_retry_attempts,
            leader_backoff: self.backoff_policy(),
            worker: WorkerConfig {
                retry_ceiling: self.retry_ceiling,
                backoff: self.backoff_policy(),
                unreachable_grace: Duration::from_secs(self.unreachable_grace_secs),
                health_probe_interval: Duration::from_secs(self.health_probe_interval_secs),
                ..WorkerConfig::default()
            },
            default_environment: self.environment.clone(),
        }
    }

    pub fn auditor_config(&self) -> AuditorConfig {
        AuditorConfig {
            interval: Duration::from_secs(self.reconcile_interval_secs),
            tolerance: Duration::from_secs(self.reconcile_tolerance_secs),
            repair: self.reconcile_repair,
            ..AuditorConfig::default()
        }
    }

    pub fn template_overrides(&self) -> TemplateOverrides {
        TemplateOverrides {
            number_of_shards: self.number_of_shards,
            number_of_replicas: self.number_of_replicas,
        }
    }

    /// Stable follower id for one URL: scheme stripped, trailing slash dropped.
    /// The id names the follower in lag reports, queue directories and the API.
    pub fn follower_id(url: &str) -> String {
        url.trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 8460)));
        assert_eq!(config.leader_url, "http://localhost:9200");
        assert!(config.follower_urls.is_empty());
        assert_eq!(config.queue_dir, PathBuf::from("/var/lib/benchrelay/queues"));
        assert!(config.username.is_none());
        assert!(config.environment.is_none());
        assert_eq!(config.store_timeout_secs, 60);
        assert_eq!(config.leader_retry_attempts, 11);
        assert_eq!(config.retry_ceiling, 10);
        assert_eq!(config.backoff_base_ms, 500);
        assert_eq!(config.backoff_max_ms, 30_000);
        assert_eq!(config.reconcile_interval_secs, 300);
        assert!(!config.reconcile_repair);
        assert!(config.number_of_shards.is_none());
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = RelayConfig {
            bind_addr: SocketAddr::from(([192, 168, 1, 1], 9000)),
            leader_url: String::from("http://leader:9200"),
            follower_urls: vec![
                String::from("http://dc2:9200"),
                String::from("http://dc3:9200"),
            ],
            queue_dir: PathBuf::from("/custom/queues"),
            username: Some(String::from("relay")),
            password: Some(String::from("secret")),
            environment: Some(String::from("nightly")),
            reconcile_repair: true,
            number_of_shards: Some(3),
            ..RelayConfig::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        let decoded: RelayConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.bind_addr, decoded.bind_addr);
        assert_eq!(config.leader_url, decoded.leader_url);
        assert_eq!(config.follower_urls, decoded.follower_urls);
        assert_eq!(config.queue_dir, decoded.queue_dir);
        assert_eq!(config.username, decoded.username);
        assert_eq!(config.environment, decoded.environment);
        assert_eq!(config.reconcile_repair, decoded.reconcile_repair);
        assert_eq!(config.number_of_shards, decoded.number_of_shards);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
bind_addr = "10.0.0.1:8080"
leader_url = "http://metrics-a:9200"
follower_urls = ["http://metrics-b:9200"]
queue_dir = "/toml/queues"
environment = "bare-metal"
store_timeout_secs = 30
consistency = "wait_for"
leader_write_timeout_secs = 15
leader_retry_attempts = 5
retry_ceiling = 8
backoff_base_ms = 250
backoff_max_ms = 10000
unreachable_grace_secs = 20
health_probe_interval_secs = 2
reconcile_interval_secs = 600
reconcile_tolerance_secs = 120
reconcile_repair = true
            "#
        )
        .unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([10, 0, 0, 1], 8080)));
        assert_eq!(config.leader_url, "http://metrics-a:9200");
        assert_eq!(config.follower_urls, vec!["http://metrics-b:9200"]);
        assert_eq!(config.queue_dir, PathBuf::from("/toml/queues"));
        assert_eq!(config.environment, Some("bare-metal".to_string()));
        assert_eq!(config.consistency, ConsistencyPolicy::WaitFor);
        assert_eq!(config.leader_retry_attempts, 5);
        assert_eq!(config.retry_ceiling, 8);
        assert_eq!(config.reconcile_interval_secs, 600);
        assert!(config.reconcile_repair);
        assert!(config.username.is_none());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "bind_addr": "127.0.0.1:9000",
                "leader_url": "http://localhost:19200",
                "follower_urls": [],
                "queue_dir": "/test/queues",
                "username": null,
                "password": null,
                "environment": null,
                "store_timeout_secs": 45,
                "consistency": "none",
                "leader_write_timeout_secs": 30,
                "leader_retry_attempts": 11,
                "retry_ceiling": 10,
                "backoff_base_ms": 500,
                "backoff_max_ms": 30000,
                "unreachable_grace_secs": 10,
                "health_probe_interval_secs": 5,
                "reconcile_interval_secs": 300,
                "reconcile_tolerance_secs": 60,
                "reconcile_repair": false,
                "number_of_shards": 2,
                "number_of_replicas": 1
            }}"#
        )
        .unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(config.leader_url, "http://localhost:19200");
        assert_eq!(config.store_timeout_secs, 45);
        assert_eq!(config.number_of_shards, Some(2));
        assert_eq!(config.number_of_replicas, Some(1));
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "bind_addr: 127.0.0.1:9000").unwrap();

        let err = RelayConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported config file extension"));
    }

    #[test]
    fn test_follower_id_from_url() {
        assert_eq!(RelayConfig::follower_id("http://dc2:9200"), "dc2:9200");
        assert_eq!(RelayConfig::follower_id("https://metrics-b:9200/"), "metrics-b:9200");
        assert_eq!(RelayConfig::follower_id("dc3:9200"), "dc3:9200");
    }

    #[test]
    fn test_derived_configs() {
        let config = RelayConfig {
            username: Some(String::from("relay")),
            password: Some(String::from("secret")),
            environment: Some(String::from("staging")),
            store_timeout_secs: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 2_000,
            retry_ceiling: 4,
            reconcile_tolerance_secs: 90,
            ..RelayConfig::default()
        };

        let store = config.store_config("http://follower:9200");
        assert_eq!(store.base_url, "http://follower:9200");
        assert_eq!(store.username, Some("relay".to_string()));
        assert_eq!(store.timeout, Duration::from_secs(10));

        let coord = config.coordinator_config();
        assert_eq!(coord.leader_retry_attempts, 11);
        assert_eq!(coord.worker.retry_ceiling, 4);
        assert_eq!(coord.worker.backoff.base, Duration::from_millis(100));
        assert_eq!(coord.worker.backoff.max, Duration::from_millis(2_000));
        assert_eq!(coord.default_environment, Some("staging".to_string()));

        let audit = config.auditor_config();
        assert_eq!(audit.tolerance, Duration::from_secs(90));
        assert!(!audit.repair);
    }
}
