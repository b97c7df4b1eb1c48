mod core;
mod http;
mod media_session;
mod mpv;

use std::sync::Arc;

use chrono::Utc;
use onair_core::config::Config;
use onair_core::logger::DedupLogger;
use onair_core::platform;
use onair_core::playback::PlaybackEngine;
use onair_core::poller::{PlayFeed, Poller, PollerService};
use onair_core::resolver::{NowPlayingResolver, SnapshotProvider};
use onair_core::snapshot::{BootSnapshot, DurableSnapshotCache, ServerSnapshotCache};
use onair_core::store::{PlayStore, SqlitePlayStore};
use onair_core::upstream::HttpUpstream;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Keep HTTP client internals quiet unless RUST_LOG asks for them.
    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "info,onair_daemon=debug,onair_core=debug,hyper_util=warn,reqwest=warn",
                )
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // ── history + logging ────────────────────────────────────────────────────
    if let Some(parent) = config.store.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store: Arc<dyn PlayStore> = Arc::new(SqlitePlayStore::open(&config.store.db_path)?);
    info!("History store: {:?}", config.store.db_path);
    let logger = Arc::new(DedupLogger::new(store.clone(), config.logger_settings()?));

    // ── now-playing sync ─────────────────────────────────────────────────────
    let server_cache = Arc::new(ServerSnapshotCache::new(config.server_ttl()));
    let boot = match &config.daemon.boot_snapshot_file {
        Some(path) => BootSnapshot::from_file(path, config.boot_ttl()),
        None => BootSnapshot::absent(config.boot_ttl()),
    };
    let durable = Arc::new(DurableSnapshotCache::new(
        config.daemon.snapshot_cache_file.clone(),
        config.durable_ttl(),
    ));
    info!("Snapshot cache: {:?}", durable.path());

    let feed = if config.upstream.api_url.trim().is_empty() {
        warn!("upstream.api_url is not set, now-playing sync disabled");
        None
    } else {
        let upstream = HttpUpstream::new(
            config.upstream.api_url.clone(),
            config.upstream.edge_url.clone(),
            config.request_timeout(),
        )?;
        let feed = Arc::new(PlayFeed::new(
            Arc::new(upstream),
            logger,
            config.normalizer_options(),
        ));
        // The server tier only wins at startup if it is filled before the
        // resolver picks its first snapshot.
        if let Err(e) = feed
            .warm(&server_cache, &config.upstream.station_name, Utc::now())
            .await
        {
            warn!("Startup fetch failed, falling back to cached snapshots: {}", e);
        }
        Some(feed)
    };

    let providers: Vec<Arc<dyn SnapshotProvider>> = vec![
        server_cache.clone() as Arc<dyn SnapshotProvider>,
        Arc::new(boot),
        durable.clone(),
    ];
    let resolver = Arc::new(NowPlayingResolver::new(&providers, Utc::now()));

    let mut poller_service = feed.clone().map(|feed| {
        let poller = Poller::new(
            feed,
            resolver.clone(),
            server_cache,
            Some(durable),
            config.upstream.station_name.clone(),
        );
        let mut service = PollerService::new(poller, config.poll_interval());
        service.start();
        service
    });

    // ── playback ─────────────────────────────────────────────────────────────
    let media_session = Arc::new(media_session::PublishedMediaSession::new());
    let (mpv_tx, mpv_rx) = tokio::sync::mpsc::channel::<mpv::MpvEvent>(256);
    let backend = Arc::new(mpv::MpvStreamBackend::new(
        config.playback.stream_url.clone(),
        config.playback.default_volume,
        mpv_tx,
    ));
    let (engine, _engine_tx, engine_rx) = PlaybackEngine::new(
        config.retry_policy(),
        config.playback.default_volume,
        backend.clone(),
        media_session.clone(),
    );

    // Event channel: all external inputs funnel into DaemonCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::DaemonEvent>(256);
    let daemon_core = core::DaemonCore::new(
        engine,
        engine_rx,
        backend,
        mpv_rx,
        resolver.subscribe(),
        event_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                resolver,
                store,
                feed,
                cron_token: config.cron_token(),
                event_tx: event_tx.clone(),
                playback: daemon_core.reports(),
                media_session,
                station_name: config.upstream.station_name.clone(),
                suppress_window: config.logger_settings()?.suppress_window,
            },
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            let _ = shutdown_tx.send(core::DaemonEvent::Shutdown).await;
        }
    });
    drop(event_tx);

    info!("Daemon initialised, running event loop");
    let result = daemon_core.run(event_rx).await;

    if let Some(service) = poller_service.as_mut() {
        service.shutdown().await;
    }
    info!("Daemon stopped");
    result
}
