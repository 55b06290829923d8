//! Composition root for the email ingestion service (C11 Orchestrator).
//!
//! Wires together the shared store, session manager, dual-path ingestion
//! (polling + webhook), the batch worker pool, and the outbound
//! forwarder, then runs a monitoring loop until a shutdown signal or a
//! fatal session state is observed.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use ei_auth::{OAuthSettings, TokenProvider};
use ei_common::{PollingMode, SessionState};
use ei_config::AppConfig;
use ei_forward::{ForwarderConfig, OutboundForwarder, OutboundStaging};
use ei_poller::{GraphMailProvider, Poller, PollerConfig, RunMode};
use ei_queue::EmailQueue;
use ei_ratelimit::RateLimitGovernor;
use ei_session::SessionManager;
use ei_store::Store;
use ei_webhook::{SubscriptionManager, WebhookConfig, WebhookState};
use ei_worker::{BatchWorkerPool, MessageBus, MessageBusConfig, NoopAttachmentWriter, SpamFilter, WorkerPoolConfig};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    ei_common::logging::init_logging("ei-server");

    let config = AppConfig::load().map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
    info!("starting email ingestion service");

    let store = Arc::new(Store::connect(&config.store.redis_url).await?);
    let queue = Arc::new(EmailQueue::new(store.clone()));
    let session = Arc::new(SessionManager::new(store.clone(), queue.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    if let Err(e) = recover_or_start(&session, &config).await {
        error!(error = %e, "failed to start session");
        return Err(anyhow::anyhow!(e));
    }

    let rate_limit = Arc::new(RateLimitGovernor::new(store.clone(), shutdown_rx.clone()));
    let tokens = Arc::new(TokenProvider::new(
        store.clone(),
        OAuthSettings {
            client_id: config.oauth.client_id.clone(),
            client_secret: config.oauth.client_secret.clone(),
            token_endpoint: config.oauth.token_endpoint.clone(),
        },
    ));
    let provider: Arc<dyn ei_common::provider::MailProvider> =
        Arc::new(GraphMailProvider::new(config.oauth.graph_api_base_url.clone()));

    let poller = Arc::new(Poller::new(
        store.clone(),
        queue.clone(),
        session.clone(),
        rate_limit.clone(),
        tokens.clone(),
        provider.clone(),
        PollerConfig {
            polling_interval: Duration::from_secs(config.polling.polling_interval_secs),
            max_poll_pages: config.polling.max_poll_pages,
            rate_limit_threshold: config.rate_limit.threshold,
            rate_limit_window: Duration::from_secs(config.rate_limit.window_seconds),
            rate_limit_retry_delay: Duration::from_secs(config.rate_limit.retry_delay_seconds),
            ..PollerConfig::default()
        },
        shutdown_rx.clone(),
    ));

    let staging = Arc::new(OutboundStaging::new(store.clone()));
    let bus = Arc::new(MessageBus::new(MessageBusConfig {
        uri: config.message_bus.url.clone(),
        exchange: config.message_bus.exchange.clone(),
        routing_key: config.message_bus.routing_key.clone(),
    }));
    let spam_filter = SpamFilter::new(config.spam_patterns.clone());
    let worker_pool = Arc::new(BatchWorkerPool::new(
        queue.clone(),
        session.clone(),
        staging.clone(),
        bus,
        spam_filter,
        Arc::new(NoopAttachmentWriter),
        WorkerPoolConfig {
            batch_size: config.polling.batch_size as u64,
            max_workers: config.polling.max_workers,
            ..WorkerPoolConfig::default()
        },
        shutdown_rx.clone(),
    ));

    let forwarder = Arc::new(OutboundForwarder::new(
        staging,
        ForwarderConfig {
            persistence_base_url: config.forwarder.persistence_base_url.clone(),
            batch_size: config.forwarder.batch_size,
            ..ForwarderConfig::default()
        },
        shutdown_rx.clone(),
    ));

    // Phase 1: batch worker pool.
    let pool_handle = {
        let worker_pool = worker_pool.clone();
        tokio::spawn(async move { worker_pool.run().await })
    };

    let forwarder_handle = {
        let forwarder = forwarder.clone();
        tokio::spawn(async move { forwarder.run().await })
    };

    // Phase 2: webhook receiver, non-fatal if it fails to bind/subscribe.
    let webhook_enabled = config.http.webhook_port != 0;
    let mut webhook_server_handle = None;
    let mut subscription_manager = None;
    if webhook_enabled {
        match start_webhook(&config, store.clone(), queue.clone(), session.clone(), rate_limit.clone(), tokens.clone(), provider.clone(), poller.clone(), shutdown_rx.clone()).await
        {
            Ok((server_handle, subscriptions)) => {
                webhook_server_handle = Some(server_handle);
                subscription_manager = Some(subscriptions);
            }
            Err(e) => warn!(error = %e, "webhook receiver failed to start, continuing with polling only"),
        }
    }

    // Phase 3: drain any backlog with one eager poll, then pick the
    // steady-state path.
    if let Err(e) = poller.run(RunMode::OneShot).await {
        warn!(error = %e, "initial poll failed");
        let _ = session.increment_polling_errors(1).await;
    }
    if let Err(e) = session.complete_initial_polling().await {
        warn!(error = %e, "failed to record initial polling completion");
    }

    let poller_handle = {
        let poller = poller.clone();
        let mode = if webhook_enabled { RunMode::Manual } else { RunMode::Scheduled };
        tokio::spawn(async move { poller.run(mode).await })
    };

    info!("email ingestion service is up");
    monitor(session.clone(), shutdown_tx, shutdown_rx.clone()).await;

    info!("shutdown signal received, draining in-flight work");
    if let Some(subscriptions) = subscription_manager {
        if let Err(e) = subscriptions.stop().await {
            warn!(error = %e, "failed to unsubscribe webhook on shutdown");
        }
    }
    if let Some(handle) = webhook_server_handle {
        handle.abort();
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    let _ = tokio::join!(pool_handle, forwarder_handle, poller_handle);

    if let Err(e) = session.terminate_session("orchestrator shutdown").await {
        warn!(error = %e, "failed to record session termination");
    }

    info!("email ingestion service stopped");
    Ok(())
}

async fn recover_or_start(session: &SessionManager, config: &AppConfig) -> ei_common::Result<()> {
    match session.current_state().await? {
        Some(SessionState::FailedToStart) | Some(SessionState::SessionError) => {
            warn!("recovering from a previous failed/error session state");
            session.recover_from_error().await?;
        }
        Some(state) if state != SessionState::Terminated && state != SessionState::Idle => {
            warn!(?state, "previous session still active, terminating before restart");
            session.terminate_session("superseded by new orchestrator instance").await?;
        }
        _ => {}
    }

    let webhook_enabled = config.http.webhook_port != 0;
    let polling_mode = if webhook_enabled { PollingMode::Manual } else { PollingMode::Scheduled };
    match session.start_session(webhook_enabled, config.polling.polling_interval_secs, polling_mode).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = session.mark_start_failed(&e.to_string()).await;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn start_webhook(
    config: &AppConfig,
    store: Arc<Store>,
    queue: Arc<EmailQueue>,
    session: Arc<SessionManager>,
    rate_limit: Arc<RateLimitGovernor>,
    tokens: Arc<TokenProvider>,
    provider: Arc<dyn ei_common::provider::MailProvider>,
    poller: Arc<Poller>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<(tokio::task::JoinHandle<()>, Arc<SubscriptionManager>)> {
    let notification_url = std::env::var("WEBHOOK_NOTIFICATION_URL")
        .unwrap_or_else(|_| format!("http://localhost:{}/webhook", config.http.webhook_port));

    let subscriptions = Arc::new(SubscriptionManager::new(
        config.oauth.graph_api_base_url.clone(),
        store,
        tokens.clone(),
        notification_url,
    ));
    subscriptions.start().await?;

    let fallback_poller = poller.clone();
    let state = WebhookState {
        queue,
        session,
        rate_limit,
        tokens,
        provider,
        config: WebhookConfig { error_threshold: 5, rate_limit_threshold: config.rate_limit.threshold, ..WebhookConfig::default() },
        error_count: Arc::new(AtomicU32::new(0)),
        fallback: Arc::new(move || {
            let poller = fallback_poller.clone();
            Box::pin(async move {
                if let Err(e) = poller.trigger().await {
                    error!(error = %e, "fallback poll trigger failed");
                }
            })
        }),
    };

    let router = ei_webhook::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http.webhook_port)).await?;
    info!(port = config.http.webhook_port, "webhook receiver listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "webhook server exited");
        }
    });

    let renewal_shutdown = shutdown.clone();
    let renewal_subscriptions = subscriptions.clone();
    tokio::spawn(async move { renewal_subscriptions.run_renewal_loop(renewal_shutdown).await });

    Ok((server_handle, subscriptions))
}

async fn monitor(session: Arc<SessionManager>, shutdown_tx: tokio::sync::watch::Sender<bool>, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                match session.current_state().await {
                    Ok(Some(SessionState::SessionError)) => {
                        error!("session entered error state, triggering shutdown");
                        let _ = shutdown_tx.send(true);
                    }
                    Ok(Some(SessionState::Terminated)) => {
                        info!("session terminated, exiting monitoring loop");
                        return;
                    }
                    Ok(Some(state)) => info!(?state, "session heartbeat"),
                    Ok(None) => warn!("no session record found during monitoring"),
                    Err(e) => warn!(error = %e, "failed to read session state"),
                }
            }
            _ = shutdown_signal() => {
                let _ = shutdown_tx.send(true);
                return;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
