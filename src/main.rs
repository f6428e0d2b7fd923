//! Persona Relay - runs a conversational persona on a chat account.
//!
//! The chat network is reached through a bridge subprocess (persona-bridge)
//! speaking JSON-lines over stdio. Replies are generated with Claude.

mod bridge;
mod cli;
mod clock;
mod collector;
mod engine;
mod error;
mod model;
mod scheduler;
mod scoring;
mod settings;
mod store;
mod transport;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use bridge::{BridgeConfig, BridgeEvent, BridgeProcess, BridgeTransport, DEFAULT_RESPONSE_TIMEOUT};
use cli::Args;
use clock::SystemClock;
use collector::HistoryCollector;
use engine::{EngineConfig, InteractionEngine};
use model::{ClaudeClient, ReliableModel, RetryConfig};
use scoring::{ScoringConfig, ScoringEngine};
use settings::SettingsManager;
use store::ConversationStore;
use transport::Transport;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    init_logging(args.verbose);

    let data_dir = args
        .data_dir
        .clone()
        .or_else(|| bridge::default_data_dir().ok())
        .context("Could not determine data directory")?;
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
    info!("Using data directory: {:?}", data_dir);

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(|| data_dir.join("settings.json"));
    let settings = SettingsManager::load(&settings_path)
        .await
        .with_context(|| format!("Failed to load settings from {:?}", settings_path))?;
    info!("Using settings file: {:?}", settings_path);

    let bridge_path = args
        .bridge_path
        .clone()
        .or_else(|| bridge::find_bridge_binary().ok())
        .context("Could not find persona-bridge binary. Pass it with --bridge-path.")?;
    info!("Using bridge binary: {:?}", bridge_path);

    let config = BridgeConfig {
        binary_path: bridge_path,
        session_dir: data_dir.join("session"),
        verbose: args.verbose,
    };

    run(args, config, data_dir, settings).await
}

/// Initialize the tracing subscriber for logging
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info").add_directive(
            "persona_relay=info"
                .parse()
                .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

/// Cancelled on Ctrl+C or when a one-shot task has finished.
fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C, shutting down");
        trigger.cancel();
    });

    token
}

/// Yields once per SIGHUP. Never yields on platforms without it.
fn install_reload_handler() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to install SIGHUP handler, reload disabled: {}", e);
                    std::future::pending::<()>().await;
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _tx = tx;
            std::future::pending::<()>().await;
        }
    });

    rx
}

/// Build the components, start the bridge and dispatch its events until
/// shutdown.
async fn run(
    args: Args,
    config: BridgeConfig,
    data_dir: PathBuf,
    settings: SettingsManager,
) -> Result<()> {
    let store = Arc::new(ConversationStore::new(&data_dir));
    let scoring = Arc::new(ScoringEngine::new(
        Arc::clone(&store),
        settings.clone(),
        ScoringConfig::default(),
    ));
    let claude = Arc::new(ClaudeClient::new(
        args.anthropic_api_key.clone(),
        args.model.clone(),
    ));
    let model = Arc::new(ReliableModel::new(claude, RetryConfig::default()));

    let (event_tx, mut event_rx) = mpsc::channel::<BridgeEvent>(100);
    info!("Starting bridge...");
    let bridge = BridgeProcess::spawn(config, event_tx)
        .await
        .context("Failed to start bridge process")?;

    let bridge_transport = Arc::new(BridgeTransport::new(
        bridge.command_sender(),
        args.operator_thread,
        DEFAULT_RESPONSE_TIMEOUT,
    ));
    if args.operator_thread.is_none() {
        warn!("No operator thread configured, suppression notices will only be logged");
    }
    let transport: Arc<dyn Transport> = Arc::clone(&bridge_transport) as Arc<dyn Transport>;

    let engine = Arc::new(InteractionEngine::new(
        EngineConfig::default(),
        Arc::clone(&store),
        scoring,
        model,
        Arc::clone(&transport),
        settings.clone(),
        Arc::new(SystemClock),
    ));

    let shutdown = install_shutdown_handler();
    let mut reload = install_reload_handler();
    let mut collection_started = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break;
            }

            Some(()) = reload.recv() => {
                tokio::spawn(reload_settings(Arc::clone(&engine), settings.clone()));
            }

            event = event_rx.recv() => {
                let Some(event) = event else {
                    error!("Bridge process terminated unexpectedly");
                    break;
                };
                let Some(event) = bridge_transport.complete(event).await else {
                    continue;
                };

                match event {
                    BridgeEvent::Connected { self_id, name } => {
                        info!("Connected as {} ({})", name.as_deref().unwrap_or("unknown"), self_id);
                        engine.set_self_id(self_id);

                        if let Some(target) = collection_target(&args) {
                            if !collection_started {
                                collection_started = true;
                                spawn_collection(
                                    HistoryCollector::new(Arc::clone(&store), Arc::clone(&transport)),
                                    target,
                                    settings.clone(),
                                    self_id,
                                    shutdown.clone(),
                                );
                            }
                        } else if settings.is_persona_active() && !engine.is_running() {
                            if let Err(e) = engine.activate().await {
                                error!("Failed to activate persona: {:#}", e);
                            }
                        }
                    }
                    BridgeEvent::Message(msg) => {
                        if collection_target(&args).is_some() {
                            continue;
                        }
                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            engine.handle_event(msg).await;
                        });
                    }
                    BridgeEvent::Error { code, message } => {
                        error!("Bridge error [{}]: {}", code, message);
                    }
                    BridgeEvent::Log { level, message } => match level.as_str() {
                        "error" => error!("{}", message),
                        "warn" => warn!("{}", message),
                        "info" => info!("{}", message),
                        _ => debug!("{}", message),
                    },
                    BridgeEvent::LoggedOut { reason } => {
                        warn!("Logged out: {}", reason);
                        break;
                    }
                    other => {
                        debug!("Ignoring unmatched bridge response: {:?}", other);
                    }
                }
            }
        }
    }

    info!("Shutting down...");
    // Keep routing answers so an initiation in flight can finish.
    let stopping = engine.shutdown();
    tokio::pin!(stopping);
    loop {
        tokio::select! {
            _ = &mut stopping => break,
            Some(event) = event_rx.recv() => {
                if let Some(event) = bridge_transport.complete(event).await {
                    debug!("Dropping bridge event during shutdown: {:?}", event);
                }
            }
        }
    }
    bridge.shutdown().await?;
    Ok(())
}

/// Re-read the settings file and follow a change of the active flag.
async fn reload_settings(engine: Arc<InteractionEngine>, settings: SettingsManager) {
    let (old, new) = match settings.reload().await {
        Ok(pair) => pair,
        Err(e) => {
            error!("Failed to reload settings: {:#}", e);
            return;
        }
    };
    info!("Settings reloaded");
    engine.scoring().clear_cache().await;

    if old.persona_active == new.persona_active {
        return;
    }
    let result = if new.persona_active {
        engine.activate().await
    } else {
        engine.deactivate().await
    };
    if let Err(e) = result {
        error!("Failed to apply persona_active={}: {:#}", new.persona_active, e);
    }
}

#[derive(Debug, Clone, Copy)]
enum CollectionTarget {
    Thread(i64),
    AllDialogs,
}

fn collection_target(args: &Args) -> Option<CollectionTarget> {
    match (args.collect_history, args.collect_all) {
        (Some(thread_id), _) => Some(CollectionTarget::Thread(thread_id)),
        (None, true) => Some(CollectionTarget::AllDialogs),
        (None, false) => None,
    }
}

/// Run the one-shot history import, then request shutdown.
fn spawn_collection(
    collector: HistoryCollector,
    target: CollectionTarget,
    settings: SettingsManager,
    self_id: i64,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let current = settings.snapshot();
        let limit = current.history_limit;
        match target {
            CollectionTarget::Thread(thread_id) => {
                match collector.collect(thread_id, limit, Some(self_id)).await {
                    Ok(summary) => info!(
                        "History of thread {} collected: {} new of {} fetched",
                        thread_id, summary.stored, summary.fetched
                    ),
                    Err(e) => error!("History collection failed: {:#}", e),
                }
            }
            CollectionTarget::AllDialogs => {
                if let Err(e) = collector
                    .collect_all(limit, self_id, &current.excluded_threads)
                    .await
                {
                    error!("History collection failed: {:#}", e);
                }
            }
        }
        shutdown.cancel();
    });
}
