/// Command-line entry point: fetch and cache historical bars
use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use twsc::{
    broker::PaperSession,
    config::{load_config_or_default, write_default_config},
    BarSize, Bar, Contract, TwsClient,
};

#[derive(Parser)]
#[command(name = "twsc", about = "twsc: TWS historical bars with a Parquet cache")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch bars for one contract, serving what the cache already holds.
    Fetch {
        /// Stock symbol (e.g. AAPL).
        symbol: String,

        /// Bar size in TWS form (e.g. "5 mins").
        bar_size: String,

        /// Lookback ending now, in TWS form (e.g. "2 D").
        duration: String,

        /// Configuration file; defaults are used when it does not exist.
        #[arg(long, default_value = "twsc.toml")]
        config: PathBuf,

        /// Routing exchange. Defaults to SMART.
        #[arg(long)]
        exchange: Option<String>,

        /// Also write the bars to this CSV file.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Write a default configuration file.
    InitConfig {
        /// Destination path.
        #[arg(default_value = "twsc.toml")]
        path: PathBuf,
    },
}

fn write_csv(path: &Path, bars: &[Bar]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    for bar in bars {
        writer.serialize(bar)?;
    }
    writer.flush()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Commands::InitConfig { path } => {
            write_default_config(&path)?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
        Commands::Fetch {
            symbol,
            bar_size,
            duration,
            config,
            exchange,
            csv,
        } => fetch(&symbol, &bar_size, &duration, &config, exchange.as_deref(), csv.as_deref()),
    }
}

fn fetch(
    symbol: &str,
    bar_size: &str,
    duration: &str,
    config_path: &Path,
    exchange: Option<&str>,
    csv_path: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_config_or_default(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let bar_size = BarSize::parse(bar_size)?;
    let mut contract = Contract::stock(symbol);
    if let Some(exchange) = exchange {
        contract = contract.on_exchange(exchange);
    }

    info!("📋 twsc {} {} {}", contract.symbol, bar_size, duration);

    // Offline session: bars are synthetic, the cache is real
    let timeout = config.request_timeout();
    let (bars, coverage) = TwsClient::with_session(config, PaperSession::new(), |c| {
        let bars = c.get_historical_data_ending(&contract, bar_size, Utc::now(), duration, timeout)?;
        Ok((bars, c.cached_coverage(&contract, bar_size)))
    })?;

    println!("{} bars for {} ({})", bars.len(), contract.symbol, bar_size);
    if let (Some(first), Some(last)) = (bars.first(), bars.last()) {
        println!("  first: {}  close {:.2}", first.timestamp, first.close);
        println!("  last:  {}  close {:.2}", last.timestamp, last.close);
    }
    if let Some(coverage) = coverage {
        println!("  cached coverage: {}", coverage);
    }

    if let Some(path) = csv_path {
        write_csv(path, &bars)?;
        println!("  written to {}", path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch_args() {
        let cli = Cli::try_parse_from(["twsc", "fetch", "AAPL", "5 mins", "2 D", "--csv", "out.csv"]).unwrap();
        match cli.command {
            Commands::Fetch {
                symbol,
                bar_size,
                duration,
                config,
                exchange,
                csv,
            } => {
                assert_eq!(symbol, "AAPL");
                assert_eq!(bar_size, "5 mins");
                assert_eq!(duration, "2 D");
                assert_eq!(csv, Some(PathBuf::from("out.csv")));
                assert_eq!(config, PathBuf::from("twsc.toml"));
                assert_eq!(exchange, None);
            }
            Commands::InitConfig { .. } => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_parse_init_config_and_errors() {
        let cli = Cli::try_parse_from(["twsc", "init-config", "custom.toml"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::InitConfig { path } if path == PathBuf::from("custom.toml")
        ));
        assert!(Cli::try_parse_from(["twsc", "fetch", "AAPL"]).is_err());
        assert!(Cli::try_parse_from(["twsc", "fetch", "--bogus", "AAPL", "5 mins", "1 D"]).is_err());
    }

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bars.csv");
        let bar = Bar {
            timestamp: Utc::now(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            wap: 1.2,
            count: 3,
        };
        write_csv(&path, &[bar]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("timestamp,open,high,low,close,volume,wap,count"));
    }
}
