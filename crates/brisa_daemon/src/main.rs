use std::{process::ExitCode, time::Duration};

use brisa::{
    config::Config,
    encryption::EncryptionPolicy,
    engine::{Engine, EngineEvent, EngineHandle},
    error::Error,
    torrent::TorrentId,
    utils::{kib_to_bytes_per_sec, to_human_readable},
};
use clap::Parser;
use tokio::{select, sync::broadcast, time::interval};
use tracing::{error, info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

mod args;
use args::Args;

/// Log to stdout and, if enabled in the config, to a file that rolls every
/// day in the data dir.
fn init_logging(args: &Args, config: &Config) -> Option<WorkerGuard> {
    let level = args.log_level.parse::<Level>().unwrap_or(Level::INFO);

    let (file_layer, guard) = match Config::project_dirs() {
        Some(dirs) if config.log => {
            let appender = tracing_appender::rolling::daily(dirs.data_dir(), "brisad.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .compact();
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(level))
        .with(fmt::layer().with_target(false).without_time().compact())
        .with(file_layer)
        .init();

    guard
}

/// Apply the CLI flags on top of the config file.
fn apply_args(config: &mut Config, args: &Args) {
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(dir) = &args.download_dir {
        config.download_dir = dir.clone();
    }
    if let Some(limit) = args.upload_limit {
        config.upload_limit = kib_to_bytes_per_sec(limit);
    }
    if let Some(limit) = args.download_limit {
        config.download_limit = kib_to_bytes_per_sec(limit);
    }
    if let Some(policy) = &args.encryption {
        match policy.parse::<EncryptionPolicy>() {
            Ok(policy) => config.encryption = policy,
            Err(e) => warn!("{e}, using {}", config.encryption),
        }
    }
    if args.no_dht {
        config.dht_enabled = false;
    }
    if args.anonymous {
        config.anonymous_mode = true;
    }
}

async fn add_torrents(engine: &EngineHandle, args: &Args) -> Vec<TorrentId> {
    let mut ids = Vec::new();

    for path in &args.torrent {
        let added = match tokio::fs::read(path).await {
            Ok(bytes) => engine.add_torrent(bytes, None).await,
            Err(e) => Err(e.into()),
        };
        match added {
            Ok(id) => ids.push(id),
            Err(e) => error!("could not add {path:?}: {e}"),
        }
    }

    for magnet in &args.magnet {
        match engine.add_magnet(magnet, None).await {
            Ok(id) => ids.push(id),
            Err(e) => error!("could not add magnet: {e}"),
        }
    }

    ids
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::Snapshot(snapshots) => {
            for s in snapshots {
                info!(
                    "{} [{}] {:.1}% {} peers {} seeds, down {}/s up {}/s",
                    s.name,
                    s.status,
                    s.progress * 100.0,
                    s.peers,
                    s.seeds,
                    to_human_readable(s.download_rate),
                    to_human_readable(s.upload_rate),
                );
            }
        }
        EngineEvent::Security(e) => info!("[{}] {}", e.kind, e.message),
        EngineEvent::TorrentError { id, message } => error!("{id}: {message}"),
        event => info!("{event:?}"),
    }
}

async fn run(args: Args, config: Config) -> Result<(), Error> {
    let engine = Engine::start(config).await?;
    let mut events = engine.subscribe();

    for ip in &args.block_ip {
        if let Err(e) = engine.block_ip(ip).await {
            warn!("{e}");
        }
    }

    let ids = add_torrents(&engine, &args).await;

    if !args.peer.is_empty() {
        for id in &ids {
            engine.add_peers(*id, args.peer.clone()).await?;
        }
    }

    let mut completed_interval = interval(Duration::from_secs(1));

    loop {
        select! {
            event = events.recv() => {
                match event {
                    Ok(event) => print_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("missed {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = completed_interval.tick(), if args.quit_after_complete => {
                if engine.all_torrents_completed().await? {
                    info!("all torrents are complete");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    engine.shutdown().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("could not load the config file: {e}");
            Config::default()
        }
    };

    let _guard = init_logging(&args, &config);
    apply_args(&mut config, &args);

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
