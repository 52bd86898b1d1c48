mod backends;
mod config;
mod error;
mod matcher;
mod plan;
mod priority;
mod process;
mod rate;
mod reconcile;
mod speedtest;
mod teardown;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backends::cgroup::is_cgroup_v1_available;
use crate::backends::process::create_process_provider;
use crate::backends::shaping::ShapingBackend;
use crate::backends::shaping::linux_tc_utils::check_tc_available;
use crate::backends::shaping::tc_htb::TcHtbBackend;
use crate::config::{Direction, GlobalConfig};
use crate::plan::build_skeleton;
use crate::priority::resolve_bands;
use crate::reconcile::Reconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LoggingLevel {
    Trace,
    Debug,
    Info,
    #[value(alias = "warning")]
    Warn,
    #[value(alias = "critical")]
    Error,
}

impl From<LoggingLevel> for log::LevelFilter {
    fn from(level: LoggingLevel) -> Self {
        match level {
            LoggingLevel::Trace => log::LevelFilter::Trace,
            LoggingLevel::Debug => log::LevelFilter::Debug,
            LoggingLevel::Info => log::LevelFilter::Info,
            LoggingLevel::Warn => log::LevelFilter::Warn,
            LoggingLevel::Error => log::LevelFilter::Error,
        }
    }
}

/// Tollgate - per-process bandwidth limits and priorities for Linux
#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(version)]
#[command(about = "Live per-process traffic shaping with tc, IFB and net_cls cgroups", long_about = None)]
struct Args {
    /// The network device to be traffic shaped
    device: String,

    /// The YAML configuration file
    config: PathBuf,

    /// Seconds between checks for started or exited processes
    #[arg(short, long, default_value = "1", value_parser = parse_delay)]
    delay: Duration,

    /// The logging level (RUST_LOG takes precedence)
    #[arg(short, long, value_enum, ignore_case = true, default_value = "info")]
    logging_level: LoggingLevel,

    /// Determine the global download and upload rates with `speedtest` before
    /// starting
    #[arg(short, long)]
    speed_test: bool,

    /// Log every tc command and cgroup change instead of executing it
    #[arg(long)]
    dry_run: bool,

    /// IFB device used for download shaping (default: ifb-<DEVICE>)
    #[arg(long, value_name = "NAME")]
    ifb_device: Option<String>,
}

fn parse_delay(text: &str) -> Result<Duration, String> {
    let seconds: f64 = text
        .parse()
        .map_err(|_| format!("{:?} is not a number of seconds", text))?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err("delay must be a positive number of seconds".to_string());
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn interface_exists(device: &str) -> bool {
    sysinfo::Networks::new_with_refreshed_list()
        .list()
        .contains_key(device)
}

/// Forward SIGINT and SIGTERM to [`coalesce_signals`]
fn spawn_signal_listener(cancel: CancellationToken) -> Result<()> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = interrupt.recv() => "SIGINT",
                Some(()) = terminate.recv() => "SIGTERM",
                else => break,
            };
            if tx.send(name).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(coalesce_signals(rx, cancel));

    Ok(())
}

/// Cancel `cancel` on the first signal; later signals only log. Returns the
/// number of signals that requested a shutdown.
async fn coalesce_signals(
    mut signals: mpsc::Receiver<&'static str>,
    cancel: CancellationToken,
) -> usize {
    let mut shutdowns = 0;
    while let Some(name) = signals.recv().await {
        if cancel.is_cancelled() {
            log::warn!("Received {}, shutdown already in progress", name);
        } else {
            log::info!("Received {}, shutting down...", name);
            cancel.cancel();
            shutdowns += 1;
        }
    }
    shutdowns
}

async fn apply_speed_test(config: GlobalConfig) -> GlobalConfig {
    log::info!("Running speed test...");
    match speedtest::test_speed().await {
        Ok(result) => {
            log::info!(
                "Determined download speed: {}, upload speed: {}",
                result.download,
                result.upload
            );
            config.with_global_rates(Some(result.download), Some(result.upload))
        }
        Err(e) => {
            log::error!("Speed test failed: {}", e);
            log::error!(
                "Failed to automatically determine download and upload speed, falling back to configuration values"
            );
            config
        }
    }
}

fn create_backend(args: &Args) -> Result<Box<dyn ShapingBackend>> {
    if args.dry_run {
        log::info!("Dry run: no traffic control or cgroup changes will be made");
        return Ok(Box::new(TcHtbBackend::dry_run(
            &args.device,
            args.ifb_device.clone(),
        )));
    }

    if !check_tc_available() {
        bail!("TC (traffic control) is not available, install iproute2");
    }
    if !is_cgroup_v1_available() {
        bail!(
            "Cgroup v1 net_cls controller not found at {}. Mount it with: mount -t cgroup -o net_cls net_cls {}",
            backends::cgroup::NET_CLS_ROOT,
            backends::cgroup::NET_CLS_ROOT
        );
    }

    Ok(Box::new(TcHtbBackend::new(&args.device, args.ifb_device.clone())))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    pretty_env_logger::formatted_builder()
        .filter_level(args.logging_level.into())
        .parse_default_env()
        .init();

    if !args.dry_run && !nix::unistd::geteuid().is_root() {
        bail!("tollgate must run as root to change traffic control settings (try --dry-run)");
    }

    if !interface_exists(&args.device) {
        bail!("Network device {:?} not found", args.device);
    }

    let mut config = GlobalConfig::load(&args.device, &args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    if args.speed_test {
        config = apply_speed_test(config).await;
    }

    for direction in Direction::ALL {
        if config.limits(direction).rate.is_none() {
            log::info!(
                "No global {} rate specified, {} traffic prioritization won't work",
                direction,
                direction
            );
        }
    }

    let bands = resolve_bands(&config);
    let plan = build_skeleton(&config, &bands);
    for warning in plan.warnings() {
        log::warn!("{}", warning);
    }
    log::info!(
        "Loaded {} rule(s) for {}",
        config.rules.len(),
        config.interface
    );

    let backend = create_backend(&args)?;
    let provider = create_process_provider();

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone())?;

    let mut reconciler = Reconciler::new(config, plan, provider, backend, args.delay);
    let report = reconciler.run(cancel).await;

    if !report.is_clean() {
        for (key, message) in &report.failures {
            log::error!("Failed to remove {}: {}", key, message);
        }
        bail!(
            "{} shaping object(s) could not be removed, inspect `tc qdisc show dev {}`",
            report.failures.len(),
            args.device
        );
    }

    log::info!("✅ All shaping removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay("1").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_delay("0.25").unwrap(), Duration::from_millis(250));
        assert!(parse_delay("0").is_err());
        assert!(parse_delay("-1").is_err());
        assert!(parse_delay("soon").is_err());
    }

    #[test]
    fn test_cli_arguments() {
        let args = Args::try_parse_from([
            "tollgate", "eth0", "tollgate.yaml", "-d", "2.5", "-l", "WARNING", "--dry-run",
        ])
        .unwrap();
        assert_eq!(args.device, "eth0");
        assert_eq!(args.delay, Duration::from_millis(2500));
        assert_eq!(args.logging_level, LoggingLevel::Warn);
        assert!(args.dry_run);
        assert!(!args.speed_test);
        assert_eq!(args.ifb_device, None);

        let defaults = Args::try_parse_from(["tollgate", "wlan0", "c.yaml"]).unwrap();
        assert_eq!(defaults.delay, Duration::from_secs(1));
        assert_eq!(defaults.logging_level, LoggingLevel::Info);
    }

    #[tokio::test]
    async fn test_repeated_signal_cancels_once() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);
        let handler = tokio::spawn(coalesce_signals(rx, cancel.clone()));

        tx.send("SIGINT").await.unwrap();
        cancel.cancelled().await;
        tx.send("SIGTERM").await.unwrap();
        tx.send("SIGINT").await.unwrap();
        drop(tx);

        assert_eq!(handler.await.unwrap(), 1);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_after_loop_exit_is_ignored() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, rx) = mpsc::channel(4);
        let handler = tokio::spawn(coalesce_signals(rx, cancel));

        tx.send("SIGTERM").await.unwrap();
        drop(tx);
        assert_eq!(handler.await.unwrap(), 0);
    }
}
