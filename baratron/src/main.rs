use std::path::PathBuf;
use std::time::Duration;

use baratron_client::{DeviceClient, Snapshot};
use clap::Parser;
use color_eyre::eyre::WrapErr;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

mod config;
use config::Config;

#[derive(Parser, Debug)]
#[command(name = "baratron")]
#[command(about = "Read and configure MKS eBaratron capacitance manometers")]
struct Cli {
    /// Hostname or IP address of the device
    ip: String,

    /// Print a snapshot every interval until Ctrl+C
    #[arg(long)]
    stream: bool,

    /// TCP port of the device
    #[arg(short, long)]
    port: Option<u16>,

    /// Per-request timeout in seconds
    #[arg(short, long, value_parser = parse_seconds)]
    timeout: Option<Duration>,

    /// Seconds between snapshots in stream mode
    #[arg(short, long, value_parser = parse_seconds)]
    interval: Option<Duration>,

    /// Write a field before reading, e.g. `--set "pressure units=mbar"`
    #[arg(long = "set", value_name = "FIELD=VALUE", value_parser = parse_assignment)]
    sets: Vec<(String, String)>,

    /// Path to the configuration file
    #[arg(short, long, default_value = "baratron.toml")]
    config: PathBuf,
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|_| format!("`{s}` is not a number"))?;
    let duration = Duration::try_from_secs_f64(secs)
        .map_err(|_| format!("`{s}` is not a usable number of seconds"))?;
    if duration < Duration::from_millis(1) {
        return Err(format!("`{s}` must be at least 0.001 seconds"));
    }
    Ok(duration)
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((field, value)) if !field.trim().is_empty() && !value.trim().is_empty() => {
            Ok((field.trim().to_owned(), value.trim().to_owned()))
        }
        _ => Err(format!("expected FIELD=VALUE, got `{s}`")),
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    // stdout carries the JSON output
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        Config::default()
    };
    if let Some(port) = cli.port {
        config.client.port = port;
    }
    if let Some(timeout) = cli.timeout {
        config.client = config.client.with_timeout(timeout);
    }
    if let Some(interval) = cli.interval {
        config.stream.interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    }
    config.validate()?;

    let client = DeviceClient::with_config(&cli.ip, config.client);

    for (field, value) in &cli.sets {
        let ack = client
            .set_named(field, value)
            .await
            .wrap_err_with(|| format!("failed to set {field} on {}", cli.ip))?;
        info!(%field, %ack, "Set acknowledged");
    }

    if cli.stream {
        stream(&client, config.stream.interval()).await?;
    } else {
        let snapshot = client
            .get_state()
            .await
            .wrap_err_with(|| format!("failed to read {}", cli.ip))?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    client.close();
    Ok(())
}

/// Prints one compact snapshot per tick until Ctrl+C. A failed poll is logged
/// and retried on the next tick.
async fn stream(client: &DeviceClient, interval: Duration) -> color_eyre::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = &mut shutdown => break,
            result = client.get_state() => result,
        };
        match result {
            Ok(snapshot) => print_line(&snapshot)?,
            Err(e) => warn!(host = client.host(), error = %e, "Poll failed"),
        }
    }

    info!("Received Ctrl+C, stopping stream");
    Ok(())
}

fn print_line(snapshot: &Snapshot) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string(snapshot)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from([
            "baratron",
            "10.0.0.5",
            "--stream",
            "--port",
            "8080",
            "--timeout",
            "0.5",
            "--set",
            "pressure units=mbar",
            "--set",
            "full-scale pressure=100",
        ])
        .unwrap();

        assert_eq!(cli.ip, "10.0.0.5");
        assert!(cli.stream);
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.timeout, Some(Duration::from_millis(500)));
        assert_eq!(cli.interval, None);
        assert_eq!(
            cli.sets,
            vec![
                ("pressure units".to_owned(), "mbar".to_owned()),
                ("full-scale pressure".to_owned(), "100".to_owned()),
            ]
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_seconds("0").is_err());
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("soon").is_err());
        assert!(parse_seconds("0.0004").is_err());
        assert!(parse_seconds("1e30").is_err());
        assert!(parse_seconds("inf").is_err());
        assert_eq!(parse_seconds("0.001"), Ok(Duration::from_millis(1)));
        assert_eq!(parse_seconds("1e15"), Ok(Duration::from_secs(1_000_000_000_000_000)));
        assert!(parse_assignment("pressure").is_err());
        assert!(parse_assignment("=5").is_err());
        assert!(Cli::try_parse_from(["baratron"]).is_err());
    }
}
