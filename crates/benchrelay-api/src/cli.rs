use crate::config::RelayConfig;
use crate::http::RelayApi;
use anyhow::Result;
use benchrelay_repl::{FollowerSpec, ReconciliationAuditor, ReplicationCoordinator};
use benchrelay_store::{DocumentStore, HttpDocumentStore};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "benchrelayd")]
#[command(about = "Benchmark results relay CLI", long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = "http://localhost:8460")]
    pub server: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    Lag,
    DeadLetters {
        follower: Option<String>,
    },
    Replay {
        follower: String,
    },
    Reconcile {
        #[arg(long)]
        repair: bool,
    },
    Reports {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    Ingest {
        file: PathBuf,
    },
    Serve {
        #[arg(short, long, default_value = "/etc/benchrelay/relay.toml")]
        config: PathBuf,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Lag => self.lag().await,
            Command::DeadLetters { ref follower } => self.dead_letters(follower.as_deref()).await,
            Command::Replay { ref follower } => self.replay(follower).await,
            Command::Reconcile { repair } => self.reconcile(repair).await,
            Command::Reports { limit } => self.reports(limit).await,
            Command::Ingest { ref file } => self.ingest(file).await,
            Command::Serve { ref config } => self.serve(config).await,
        }
    }

    async fn lag(&self) -> Result<()> {
        let client = Client::new();
        let url = format!("{}/api/v1/replication/lag", self.server);

        let response = client.get(&url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("Request failed: {}", response.status());
        }

        #[derive(Deserialize)]
        struct FollowerLag {
            follower_id: String,
            state: String,
            backlog_depth: usize,
            oldest_pending_ms: Option<u64>,
            acked_total: u64,
            retried_total: u64,
            dead_lettered_total: u64,
        }

        let rows: Vec<FollowerLag> = response.json().await?;

        println!(
            "{:<24} {:<12} {:>8} {:>12} {:>10} {:>8} {:>6}",
            "FOLLOWER", "STATE", "BACKLOG", "OLDEST MS", "ACKED", "RETRIED", "DEAD"
        );
        println!("{}", "-".repeat(86));

        for row in rows {
            println!(
                "{:<24} {:<12} {:>8} {:>12} {:>10} {:>8} {:>6}",
                row.follower_id,
                row.state,
                row.backlog_depth,
                row.oldest_pending_ms
                    .map(|ms| ms.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                row.acked_total,
                row.retried_total,
                row.dead_lettered_total
            );
        }

        Ok(())
    }

    async fn dead_letters(&self, follower: Option<&str>) -> Result<()> {
        let client = Client::new();
        let url = match follower {
            Some(f) => format!(
                "{}/api/v1/replication/dead-letters?follower={}",
                self.server,
                urlencoding::encode(f)
            ),
            None => format!("{}/api/v1/replication/dead-letters", self.server),
        };

        let response = client.get(&url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("Request failed: {}", response.status());
        }

        #[derive(Deserialize)]
        struct DeadLetter {
            follower_id: String,
            seq: u64,
            doc_id: String,
            attempts: u32,
            error: String,
        }

        let records: Vec<DeadLetter> = response.json().await?;

        println!(
            "{:<24} {:>6} {:<44} {:>8}  {}",
            "FOLLOWER", "SEQ", "DOC ID", "ATTEMPTS", "ERROR"
        );
        println!("{}", "-".repeat(100));

        for record in records {
            println!(
                "{:<24} {:>6} {:<44} {:>8}  {}",
                record.follower_id, record.seq, record.doc_id, record.attempts, record.error
            );
        }

        Ok(())
    }

    async fn replay(&self, follower: &str) -> Result<()> {
        let client = Client::new();
        let url = format!(
            "{}/api/v1/replication/dead-letters/{}/replay",
            self.server,
            urlencoding::encode(follower)
        );

        let response = client.post(&url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("Request failed: {}", response.status());
        }

        #[derive(Deserialize)]
        struct ReplayResult {
            follower: String,
            replayed: usize,
        }

        let result: ReplayResult = response.json().await?;

        println!("Follower: {}", result.follower);
        println!("Replayed: {}", result.replayed);

        Ok(())
    }

    async fn reconcile(&self, repair: bool) -> Result<()> {
        let client = Client::new();
        let mut url = format!("{}/api/v1/reconciliation/run", self.server);
        if repair {
            url.push_str("?repair=true");
        }

        let response = client.post(&url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("Request failed: {}", response.status());
        }

        let reports: Vec<DriftRow> = response.json().await?;
        print_drift_rows(&reports);

        Ok(())
    }

    async fn reports(&self, limit: usize) -> Result<()> {
        let client = Client::new();
        let url = format!(
            "{}/api/v1/reconciliation/reports?limit={}",
            self.server, limit
        );

        let response = client.get(&url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("Request failed: {}", response.status());
        }

        let reports: Vec<DriftRow> = response.json().await?;
        print_drift_rows(&reports);

        Ok(())
    }

    async fn ingest(&self, file: &PathBuf) -> Result<()> {
        let contents = std::fs::read_to_string(file)?;
        let value: serde_json::Value = serde_json::from_str(&contents)?;

        let url = if value.is_array() {
            format!("{}/api/v1/results/batch", self.server)
        } else {
            format!("{}/api/v1/results", self.server)
        };

        let client = Client::new();
        let response = client.post(&url).json(&value).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Request failed: {} {}", status, body);
        }

        let receipt: serde_json::Value = response.json().await?;
        println!("{}", serde_json::to_string_pretty(&receipt)?);

        Ok(())
    }

    async fn serve(&self, config_path: &PathBuf) -> Result<()> {
        let config = if config_path.exists() {
            RelayConfig::from_file(config_path)?
        } else {
            tracing::warn!(
                "Config file not found, using defaults: {}",
                config_path.display()
            );
            RelayConfig::default()
        };
        let config = Arc::new(config);

        let leader: Arc<dyn DocumentStore> =
            Arc::new(HttpDocumentStore::new(config.store_config(&config.leader_url))?);

        let mut followers = Vec::new();
        for url in &config.follower_urls {
            followers.push(FollowerSpec {
                id: RelayConfig::follower_id(url),
                store: Arc::new(HttpDocumentStore::new(config.store_config(url))?)
                    as Arc<dyn DocumentStore>,
            });
        }

        let coordinator = Arc::new(ReplicationCoordinator::start(
            leader,
            followers,
            config.coordinator_config(),
            &config.queue_dir,
        )?);
        let auditor = Arc::new(ReconciliationAuditor::new(
            coordinator.clone(),
            config.auditor_config(),
        ));

        RelayApi::new(coordinator, auditor, config).serve().await
    }
}

#[derive(Deserialize)]
struct DriftRow {
    follower_id: String,
    window_end: String,
    leader_count: u64,
    follower_count: u64,
    missing_doc_ids: Vec<String>,
    drift: bool,
    repaired: usize,
}

fn print_drift_rows(reports: &[DriftRow]) {
    println!(
        "{:<24} {:>8} {:>8} {:<6} {:>8} {:<8}  {}",
        "FOLLOWER", "LEADER", "REPLICA", "DRIFT", "MISSING", "REPAIRED", "WINDOW END"
    );
    println!("{}", "-".repeat(100));

    for report in reports {
        println!(
            "{:<24} {:>8} {:>8} {:<6} {:>8} {:<8}  {}",
            report.follower_id,
            report.leader_count,
            report.follower_count,
            report.drift,
            report.missing_doc_ids.len(),
            report.repaired,
            report.window_end
        );
        for doc_id in &report.missing_doc_ids {
            println!("    missing: {}", doc_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_lag_subcommand() {
        let cli = Cli::parse_from(["benchrelayd", "lag"]);
        match cli.command {
            Command::Lag => {}
            _ => panic!("Expected Lag command"),
        }
    }

    #[test]
    fn test_cli_dead_letters_subcommand() {
        let cli = Cli::parse_from(["benchrelayd", "dead-letters"]);
        match &cli.command {
            Command::DeadLetters { follower } => assert!(follower.is_none()),
            _ => panic!("Expected DeadLetters command"),
        }

        let cli = Cli::parse_from(["benchrelayd", "dead-letters", "dc2:9200"]);
        match &cli.command {
            Command::DeadLetters { follower } => {
                assert_eq!(follower.as_deref(), Some("dc2:9200"))
            }
            _ => panic!("Expected DeadLetters command"),
        }
    }

    #[test]
    fn test_cli_replay_subcommand() {
        let cli = Cli::parse_from(["benchrelayd", "replay", "dc2:9200"]);
        match &cli.command {
            Command::Replay { follower } => assert_eq!(follower, "dc2:9200"),
            _ => panic!("Expected Replay command"),
        }
    }

    #[test]
    fn test_cli_reconcile_repair_flag() {
        let cli = Cli::parse_from(["benchrelayd", "reconcile"]);
        match cli.command {
            Command::Reconcile { repair } => assert!(!repair),
            _ => panic!("Expected Reconcile command"),
        }

        let cli = Cli::parse_from(["benchrelayd", "reconcile", "--repair"]);
        match cli.command {
            Command::Reconcile { repair } => assert!(repair),
            _ => panic!("Expected Reconcile command"),
        }
    }

    #[test]
    fn test_cli_reports_limit() {
        let cli = Cli::parse_from(["benchrelayd", "reports", "--limit", "5"]);
        match cli.command {
            Command::Reports { limit } => assert_eq!(limit, 5),
            _ => panic!("Expected Reports command"),
        }
    }

    #[test]
    fn test_cli_ingest_subcommand() {
        let cli = Cli::parse_from(["benchrelayd", "ingest", "/tmp/results.json"]);
        match &cli.command {
            Command::Ingest { file } => {
                assert_eq!(file, &PathBuf::from("/tmp/results.json"))
            }
            _ => panic!("Expected Ingest command"),
        }
    }

    #[test]
    fn test_cli_serve_default_config() {
        let cli = Cli::parse_from(["benchrelayd", "serve"]);
        match &cli.command {
            Command::Serve { config } => {
                assert_eq!(config, &PathBuf::from("/etc/benchrelay/relay.toml"))
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_with_server_flag() {
        let cli = Cli::parse_from(["benchrelayd", "--server", "http://custom:9000", "lag"]);
        assert_eq!(cli.server, "http://custom:9000");
    }
}
