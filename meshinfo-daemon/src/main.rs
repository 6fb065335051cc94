// Meshinfo daemon: replays captured bus traffic into the aggregation core.

use std::path::PathBuf;

use anyhow::Context;
use meshinfo_daemon::{config, source, BusRecord, Daemon};
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: meshinfo-daemon [--config PATH] [--replay PATH|-]";

struct Args {
    config: Option<PathBuf>,
    replay: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args {
        config: None,
        replay: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("meshinfo-daemon {}", VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(None);
            }
            "--config" => args.config = Some(it.next().context("--config needs a path")?.into()),
            "--replay" => args.replay = Some(it.next().context("--replay needs a path")?.into()),
            other => anyhow::bail!("unknown argument {other:?}\n{USAGE}"),
        }
    }
    Ok(Some(args))
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load(args.config.as_deref()).context("loading config")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, args.replay))
}

async fn run(cfg: config::Config, replay: Option<PathBuf>) -> anyhow::Result<()> {
    let daemon = Daemon::start(&cfg).await.context("starting daemon")?;
    info!(
        version = VERSION,
        backend = ?cfg.storage.backend,
        topics = ?cfg.bus.filters(),
        "meshinfo daemon started"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut source = tokio::spawn(run_source(replay, cfg.bus.filters(), daemon.ingest(), stop_rx));

    // A finite capture ends the run once consumed; otherwise wait for a signal.
    let finished = tokio::select! {
        r = shutdown_signal() => {
            r?;
            None
        }
        res = &mut source => Some(res),
    };
    info!("shutting down");
    let _ = stop_tx.send(true);
    let result = match finished {
        Some(res) => res,
        None => source.await,
    };
    match result {
        Ok(Ok(stats)) => info!(?stats, "source stopped"),
        Ok(Err(e)) => warn!(error = %e, "source failed"),
        Err(e) => warn!(error = %e, "source task panicked"),
    }

    let stats = daemon.service().stats().await;
    daemon.shutdown().await.context("flushing state")?;
    info!(
        nodes = stats.nodes,
        packets = stats.counters.packets_applied,
        decode_failures = stats.counters.decode_failures,
        "stopped"
    );
    Ok(())
}

async fn run_source(
    replay: Option<PathBuf>,
    filters: Vec<String>,
    tx: mpsc::Sender<BusRecord>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<source::ReplayStats, source::SourceError> {
    match replay {
        Some(p) if p.as_os_str() == "-" => {
            source::replay(BufReader::new(tokio::io::stdin()), &filters, tx, stop_rx).await
        }
        Some(p) => {
            let file = tokio::fs::File::open(&p).await?;
            source::replay(BufReader::new(file), &filters, tx, stop_rx).await
        }
        // No capture: stay up serving state until asked to stop.
        None => {
            drop(tx);
            let _ = stop_rx.changed().await;
            Ok(source::ReplayStats::default())
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
