use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tabled::{Table, Tabled};
use tracing::{info, warn};

use arpwarden::config::{Config, StaticGateway};
use arpwarden::engine::EngineStats;
use arpwarden::{DetectionEngine, DetectionEvent, MacAddr, OutputHandler, Packet, Severity, ShardedEngine};

#[derive(Parser)]
#[command(name = "arpwarden")]
#[command(author, version, about = "Rule-based ARP attack detection")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Verified gateway as <ip>=<mac> (repeatable)
    #[arg(short, long = "gateway", global = true, value_parser = parse_gateway)]
    pub gateways: Vec<StaticGateway>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run NDJSON packet records through the engine
    Replay {
        /// File with one JSON packet record per line
        file: PathBuf,

        /// Print detections as NDJSON
        #[arg(long)]
        json: bool,

        /// Evaluation lanes (1 = sequential, 0 = one per CPU)
        #[arg(short, long, default_value = "1")]
        workers: usize,
    },

    /// Validate the configuration and list rules in evaluation order
    CheckConfig,

    /// Print the default configuration
    DefaultConfig,
}

fn parse_gateway(s: &str) -> std::result::Result<StaticGateway, String> {
    let (ip, mac) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <ip>=<mac>, got '{}'", s))?;
    let ip: Ipv4Addr = ip
        .trim()
        .parse()
        .map_err(|e| format!("invalid gateway IP '{}': {}", ip, e))?;
    let mac: MacAddr = mac.trim().parse().map_err(|e| format!("{}", e))?;
    Ok(StaticGateway { ip, mac })
}

/// Table row for the rule listing
#[derive(Tabled)]
struct RuleRow {
    #[tabled(rename = "Rule")]
    id: String,
    #[tabled(rename = "Condition")]
    condition: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Threshold")]
    threshold: String,
    #[tabled(rename = "Cooldown")]
    cooldown: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
    #[tabled(rename = "Tags")]
    tags: String,
}

/// Table row for the stats summary
#[derive(Tabled)]
struct StatRow {
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: u64,
}

pub fn run_command(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::DefaultConfig => {
            print!("{}", Config::default_with_comments());
            Ok(())
        }
        Commands::CheckConfig => {
            let config = load_config(&cli)?;
            check_config(&config)
        }
        Commands::Replay {
            file,
            json,
            workers,
        } => {
            let config = load_config(&cli)?;
            replay(&config, file, *json, *workers)
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    config.gateway.static_gateways.extend(cli.gateways.iter().cloned());
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn check_config(config: &Config) -> Result<()> {
    let rules = config.build_rules()?;
    let rows: Vec<RuleRow> = rules
        .rules()
        .iter()
        .map(|r| RuleRow {
            id: r.id.clone(),
            condition: r.condition.name().to_string(),
            severity: r.severity.to_string(),
            threshold: format!("{:.2}", r.threshold),
            cooldown: format!("{}s", r.cooldown.num_seconds()),
            enabled: if r.enabled { "yes" } else { "no" }.to_string(),
            tags: r.tags.iter().cloned().collect::<Vec<_>>().join(","),
        })
        .collect();

    println!("{}", Table::new(rows));
    println!(
        "{} {} rules ({} enabled), history window {}s",
        "Configuration OK:".green().bold(),
        rules.len(),
        rules.enabled_count(),
        config.settings.history_window
    );
    Ok(())
}

fn print_event(event: &DetectionEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize detection {}: {}", event.id, e),
        }
        return;
    }

    let severity = match event.severity {
        Severity::Critical => event.severity.to_string().red().bold(),
        Severity::High => event.severity.to_string().red(),
        Severity::Medium => event.severity.to_string().yellow(),
        Severity::Low => event.severity.to_string().cyan(),
    };
    println!(
        "{} [{}] {} {}: {} ({:.2})",
        event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        severity,
        event.rule_id.bold(),
        event.source,
        event.description,
        event.confidence
    );
}

/// Parsed records from an NDJSON file; unparseable lines are skipped
fn read_packets(path: &Path) -> Result<(Vec<Packet>, usize)> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut packets = Vec::new();
    let mut skipped = 0;

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<Packet>(line) {
            Ok(packet) => packets.push(packet),
            Err(e) => {
                warn!("{}:{}: skipping record: {}", path.display(), lineno + 1, e);
                skipped += 1;
            }
        }
    }
    Ok((packets, skipped))
}

fn replay(config: &Config, file: &Path, json: bool, workers: usize) -> Result<()> {
    let (packets, skipped) = read_packets(file)?;
    info!("Replaying {} packets from {}", packets.len(), file.display());

    let stats = if workers == 1 {
        let engine = DetectionEngine::from_config(config)?;
        engine.start();
        for packet in packets {
            for event in engine.ingest(packet)? {
                print_event(&event, json);
            }
        }
        engine.stop();
        engine.stats()
    } else {
        let mut printer = OutputHandler::new(1);
        printer.add_callback(move |event| print_event(event, json));

        let engine = ShardedEngine::from_config(config, workers, Some(Arc::new(printer)))?;
        engine.start();
        for packet in packets {
            engine.submit(packet)?;
        }
        engine.shutdown()
    };

    print_stats(&stats, skipped as u64, json)
}

fn print_stats(stats: &EngineStats, skipped: u64, json: bool) -> Result<()> {
    if json {
        eprintln!("{}", serde_json::to_string(stats)?);
        return Ok(());
    }

    let rows = vec![
        StatRow { metric: "Records skipped".to_string(), value: skipped },
        StatRow { metric: "Packets ingested".to_string(), value: stats.packets_ingested },
        StatRow { metric: "Malformed dropped".to_string(), value: stats.malformed_dropped },
        StatRow { metric: "Rules evaluated".to_string(), value: stats.rules_evaluated },
        StatRow { metric: "Predicate failures".to_string(), value: stats.predicate_failures },
        StatRow { metric: "Detections emitted".to_string(), value: stats.detections_emitted },
        StatRow { metric: "Detections suppressed".to_string(), value: stats.detections_suppressed },
        StatRow { metric: "Rule set version".to_string(), value: stats.ruleset_version },
    ];
    println!("{}", Table::new(rows));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gateway() {
        let gw = parse_gateway("192.168.1.1=aa:aa:aa:aa:aa:aa").unwrap();
        assert_eq!(gw.ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(gw.mac, MacAddr([0xaa; 6]));

        assert!(parse_gateway("192.168.1.1").is_err());
        assert!(parse_gateway("192.168.1=aa:aa:aa:aa:aa:aa").is_err());
        assert!(parse_gateway("192.168.1.1=aa:aa").is_err());
    }

    #[test]
    fn test_read_packets_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.ndjson");
        std::fs::write(
            &path,
            concat!(
                r#"{"timestamp":"2024-01-01T00:00:00Z","operation":1,"src_mac":"02:00:00:00:00:01","dst_mac":"00:00:00:00:00:00","src_ip":"10.0.0.1","dst_ip":"10.0.0.2"}"#,
                "\n",
                "not json\n",
                "\n",
                r#"{"timestamp":"2024-01-01T00:00:01Z","operation":2,"src_mac":"02:00:00:00:00:02","dst_mac":"02:00:00:00:00:01","src_ip":"10.0.0.2","dst_ip":"10.0.0.1"}"#,
                "\n",
            ),
        )
        .unwrap();

        let (packets, skipped) = read_packets(&path).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(skipped, 1);
        assert!(packets[1].is_reply());
    }

    #[test]
    fn test_cli_parses_replay() {
        let cli = Cli::try_parse_from([
            "arpwarden",
            "--gateway",
            "10.0.0.1=bb:bb:bb:bb:bb:bb",
            "replay",
            "capture.ndjson",
            "--json",
            "--workers",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.gateways.len(), 1);
        match cli.command {
            Commands::Replay { json, workers, .. } => {
                assert!(json);
                assert_eq!(workers, 4);
            }
            _ => panic!("expected replay"),
        }
    }
}
