use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use baratron_client::sim::{DeviceHandle, Fault, SimulatedDevice};
use baratron_client::{CancellationToken, ClientConfig, DeviceClient, Field, Value};
use clap::Parser;
use rand::Rng;
use serde::Deserialize;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "baratron-harness")]
#[command(about = "Poll a fleet of simulated manometers to exercise the client under load")]
struct Cli {
    /// Path to the harness configuration file
    #[arg(short, long, default_value = "baratron-harness.toml")]
    config: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct HarnessConfig {
    device_count: usize,
    poll_interval_ms: u64,
    /// Zero runs until Ctrl+C
    duration_secs: u64,
    timeout_ms: u64,
    /// Probability that a device misbehaves on a given poll
    fault_rate: f64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            device_count: 50,
            poll_interval_ms: 1000,
            duration_secs: 30,
            timeout_ms: 500,
            fault_rate: 0.0,
        }
    }
}

impl HarnessConfig {
    fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HarnessConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

struct Device {
    handle: DeviceHandle,
    client: DeviceClient,
}

#[derive(Debug, Default)]
struct RoundStats {
    connected: usize,
    disconnected: usize,
    failed: usize,
    slowest: Duration,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "tracing=info,baratron_harness=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading harness configuration");
        HarnessConfig::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        HarnessConfig::default()
    };

    if config.poll_interval_ms == 0 || config.timeout_ms == 0 {
        return Err(color_eyre::eyre::eyre!(
            "poll_interval_ms and timeout_ms must be at least 1"
        ));
    }
    if !(0.0..=1.0).contains(&config.fault_rate) {
        return Err(color_eyre::eyre::eyre!(
            "fault_rate must be between 0 and 1, got {}",
            config.fault_rate
        ));
    }

    info!(
        device_count = config.device_count,
        poll_interval_ms = config.poll_interval_ms,
        duration_secs = config.duration_secs,
        fault_rate = config.fault_rate,
        "Starting harness"
    );

    let cancel = CancellationToken::new();
    let mut devices = Vec::with_capacity(config.device_count);
    for i in 0..config.device_count {
        let (addr, handle) = SimulatedDevice::spawn("127.0.0.1:0", cancel.clone()).await?;
        let client_config = ClientConfig::default()
            .with_port(addr.port())
            .with_timeout(Duration::from_millis(config.timeout_ms));
        devices.push(Arc::new(Device {
            handle,
            client: DeviceClient::with_config("127.0.0.1", client_config),
        }));
        if (i + 1) % 100 == 0 {
            info!(spawned = i + 1, "Simulated devices listening");
        }
    }
    info!(spawned = devices.len(), "All simulated devices listening");

    let deadline = (config.duration_secs > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(config.duration_secs));
    let mut ticker = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut totals = RoundStats::default();
    let mut rounds = 0usize;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = sleep_until(deadline) => {
                info!("Run duration reached");
                break;
            }
            _ = ticker.tick() => {}
        }

        for device in &devices {
            perturb(&device.handle, config.fault_rate, config.timeout_ms).await;
        }

        let stats = poll_round(&devices).await;
        rounds += 1;
        info!(
            round = rounds,
            connected = stats.connected,
            disconnected = stats.disconnected,
            failed = stats.failed,
            slowest_ms = stats.slowest.as_millis() as u64,
            "Poll round complete"
        );

        totals.connected += stats.connected;
        totals.disconnected += stats.disconnected;
        totals.failed += stats.failed;
        totals.slowest = totals.slowest.max(stats.slowest);
    }

    for device in &devices {
        device.client.close();
    }
    cancel.cancel();

    info!(
        rounds,
        connected = totals.connected,
        disconnected = totals.disconnected,
        failed = totals.failed,
        slowest_ms = totals.slowest.as_millis() as u64,
        "Harness shutdown complete"
    );
    Ok(())
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Moves the simulated reading and, with probability `fault_rate`, queues a
/// fault for the next request.
async fn perturb(handle: &DeviceHandle, fault_rate: f64, timeout_ms: u64) {
    let (pressure, fault) = {
        let mut rng = rand::rng();
        let pressure = rng.random_range(740.0..760.0);
        let fault = rng.random_bool(fault_rate).then(|| match rng.random_range(0..4) {
            0 => Fault::Delay(Duration::from_millis(timeout_ms.saturating_mul(2))),
            1 => Fault::Split(Duration::from_millis(timeout_ms / 4)),
            2 => Fault::Code(rng.random_range(1..10)),
            _ => Fault::HangUp,
        });
        (pressure, fault)
    };

    handle.set(Field::Pressure, Value::Float(pressure)).await;
    if let Some(fault) = fault {
        handle.inject(fault).await;
    }
}

async fn poll_round(devices: &[Arc<Device>]) -> RoundStats {
    let mut polls = JoinSet::new();
    for device in devices {
        let device = Arc::clone(device);
        polls.spawn(async move {
            let started = Instant::now();
            let result = device.client.get_state().await;
            (device, result, started.elapsed())
        });
    }

    let mut stats = RoundStats::default();
    while let Some(joined) = polls.join_next().await {
        match joined {
            Ok((_, Ok(snapshot), elapsed)) => {
                if snapshot.is_connected() {
                    stats.connected += 1;
                } else {
                    stats.disconnected += 1;
                }
                stats.slowest = stats.slowest.max(elapsed);
            }
            Ok((device, Err(e), elapsed)) => {
                warn!(host = device.client.host(), error = %e, "Poll failed");
                stats.failed += 1;
                stats.slowest = stats.slowest.max(elapsed);
            }
            Err(e) => {
                error!(error = %e, "Poll task panicked");
                stats.failed += 1;
            }
        }
    }
    stats
}
