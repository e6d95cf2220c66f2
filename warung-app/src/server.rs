//! Component wiring and the HTTP server.

use crate::config::WarungConfig;
use crate::dev_worker::{self, EchoWorker};
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use warung_channels::{ChannelSender, NoopSender, WhatsAppCloudSender};
use warung_core::outbound::SENT_KEY_PREFIX;
use warung_core::{
    ConversationCache, DedupGuard, FlushWorker, JobDispatcher, JobTracker, LocalTaskQueue,
    MemoryKv, MessageBuffer, MessageIngest, OutboundPublisher, SqliteJobStore, TimeoutSweeper,
};

const DEDUP_KEY_PREFIX: &str = "dedup:";

pub struct AppState {
    pub ingest: MessageIngest,
    pub tracker: Arc<JobTracker>,
    pub retry_attempts: u32,
    pub channel_id: String,
    pub started_at: Instant,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = WarungConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = %path.display(),
        port = cfg.server.port,
        debounce_ms = cfg.pipeline.debounce_ms,
        max_delay_ms = cfg.pipeline.max_delay_ms,
        whatsapp_enabled = cfg.whatsapp.enabled,
        jobs_db = %cfg.storage.jobs_db_path,
        echo_worker = cfg.dev.echo_worker,
        "config ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = WarungConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    tracing::info!(
        config_path = %cfg_path.display(),
        %addr,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let shutdown = CancellationToken::new();

    // Pipeline components share one kv substrate and one job ledger.
    let kv = Arc::new(MemoryKv::new());
    let dedup_ttl = Duration::from_secs(cfg.pipeline.dedup_ttl_seconds);
    let ingest_guard = if cfg.pipeline.dedup_disabled {
        tracing::warn!("inbound dedup disabled; every delivery will be admitted");
        DedupGuard::disabled(kv.clone())
    } else {
        DedupGuard::new(kv.clone(), DEDUP_KEY_PREFIX, dedup_ttl)
    };
    let buffer = Arc::new(MessageBuffer::new(kv.clone(), cfg.buffer_config()));
    let conversations = Arc::new(ConversationCache::new(
        kv.clone(),
        Duration::from_secs(cfg.pipeline.conversation_ttl_seconds),
    ));
    let store = Arc::new(SqliteJobStore::open(&cfg.storage.jobs_db_path).await?);
    let (tracker, notify_rx) = JobTracker::new(store, cfg.pipeline.queue_capacity);
    let (queue, task_rx) = LocalTaskQueue::new(cfg.pipeline.queue_capacity);
    let dispatcher = Arc::new(JobDispatcher::new(
        tracker.clone(),
        Arc::new(queue),
        conversations.clone(),
        cfg.pipeline.retry_attempts,
    ));
    let ingest = MessageIngest::new(
        ingest_guard,
        buffer.clone(),
        conversations.clone(),
        dispatcher.clone(),
    );

    let sender: Arc<dyn ChannelSender> = if cfg.whatsapp.enabled {
        Arc::new(WhatsAppCloudSender::new(
            &cfg.whatsapp.access_token,
            &cfg.whatsapp.phone_number_id,
        )?)
    } else {
        tracing::warn!("whatsapp disabled; replies go to the noop channel");
        Arc::new(NoopSender)
    };
    let channel_id = sender.channel_id().to_string();

    // Outbound dedup stays on even when inbound dedup is off: replayed
    // terminal notifications must never reach the customer twice.
    let outbound = Arc::new(OutboundPublisher::new(
        sender,
        DedupGuard::new(kv.clone(), SENT_KEY_PREFIX, dedup_ttl),
        conversations.clone(),
        cfg.outbound_config(),
        shutdown.clone(),
    ));

    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    workers.push(outbound.start(notify_rx));
    workers.push(
        Arc::new(FlushWorker::new(
            buffer,
            dispatcher,
            Duration::from_millis(cfg.pipeline.flush_tick_ms),
            shutdown.clone(),
        ))
        .start(),
    );
    workers.push(
        Arc::new(TimeoutSweeper::new(
            tracker.clone(),
            conversations,
            Duration::from_secs(cfg.pipeline.job_timeout_seconds),
            Duration::from_millis(cfg.pipeline.sweep_tick_ms),
            shutdown.clone(),
        ))
        .start(),
    );
    if cfg.dev.echo_worker {
        workers.push(
            EchoWorker::new(
                tracker.clone(),
                cfg.dev.echo_prefix.clone(),
                Duration::from_millis(cfg.dev.echo_latency_ms),
                shutdown.clone(),
            )
            .start(task_rx),
        );
    } else {
        workers.push(dev_worker::spawn_queue_logger(task_rx, shutdown.clone()));
    }

    let state = Arc::new(AppState {
        ingest,
        tracker,
        retry_attempts: cfg.pipeline.retry_attempts,
        channel_id,
        started_at,
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "warung serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    // Cancel the workers; the flush worker drains open buffers on its way
    // out and the outbound publisher drains queued notifications.
    shutdown.cancel();
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::error!(%e, "worker task panicked during shutdown");
        }
    }
    tracing::info!("worker shutdown completed");
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind failed for {addr}: {e}"))?;
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
