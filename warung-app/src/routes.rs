//! HTTP surface: webhook intake, job status/transition, health.

use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use warung_channels::{ConversationKey, InboundEvent, MessageId};
use warung_core::{IngestOutcome, JobStatus, PipelineError, retry::with_backoff};

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/health", get(get_health))
        .route("/api/v1/webhook/whatsapp", post(post_whatsapp_webhook))
        .route("/api/v1/jobs/{id}", get(get_job))
        .route("/api/v1/jobs/{id}/transition", post(post_job_transition))
}

/// WAHA-style webhook envelope: the session name identifies the tenant, the
/// payload carries the message.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub event: String,
    pub session: String,
    pub payload: WebhookMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub from: String,
    #[serde(default)]
    pub body: Option<String>,
    /// Unix seconds as the provider sends them.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default, rename = "fromMe")]
    pub from_me: bool,
}

impl WebhookEnvelope {
    /// Map the provider envelope onto a pipeline event. `None` when the
    /// session/chat pair does not form a valid conversation key.
    fn to_event(&self, now: DateTime<Utc>) -> Option<InboundEvent> {
        let conversation = ConversationKey::parse(&self.session, &self.payload.from)?;
        let received_at = self.timestamp_utc().unwrap_or(now);
        Some(InboundEvent {
            event_id: self
                .payload
                .id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(MessageId::new),
            conversation,
            text: self.payload.body.clone().unwrap_or_default(),
            from_me: self.payload.from_me,
            received_at,
        })
    }

    fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        let ts = self.payload.timestamp?;
        Utc.timestamp_opt(ts, 0).single()
    }
}

#[tracing::instrument(level = "info", skip_all, fields(session = %envelope.session))]
async fn post_whatsapp_webhook(
    Extension(state): Extension<Arc<AppState>>,
    Json(envelope): Json<WebhookEnvelope>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !envelope.event.is_empty() && envelope.event != "message" {
        return ack(false, "ignored", serde_json::json!({ "reason": "unhandled event" }));
    }

    let Some(event) = envelope.to_event(Utc::now()) else {
        tracing::warn!(from = %envelope.payload.from, "unroutable webhook payload");
        return ack(
            false,
            "ignored",
            serde_json::json!({ "reason": "invalid conversation" }),
        );
    };

    let outcome = with_backoff("ingest", state.retry_attempts, || {
        state.ingest.handle_event(event.clone())
    })
    .await;

    // The provider retries non-2xx deliveries itself and would amplify an
    // internal outage; always acknowledge, record whether we accepted.
    match outcome {
        Ok(IngestOutcome::Buffered { fragments, flush_in }) => ack(
            true,
            "buffered",
            serde_json::json!({
                "fragments": fragments,
                "flush_in_ms": flush_in.as_millis() as u64,
            }),
        ),
        Ok(IngestOutcome::Dispatched(job_id)) => {
            ack(true, "dispatched", serde_json::json!({ "job_id": job_id }))
        }
        Ok(IngestOutcome::Duplicate) => ack(true, "duplicate", serde_json::json!({})),
        Ok(IngestOutcome::Ignored(reason)) => {
            ack(true, "ignored", serde_json::json!({ "reason": reason }))
        }
        Err(e) => {
            tracing::error!(%e, "webhook ingest failed after retries");
            ack(false, "error", serde_json::json!({}))
        }
    }
}

fn ack(
    accepted: bool,
    outcome: &str,
    detail: serde_json::Value,
) -> (StatusCode, Json<serde_json::Value>) {
    let mut body = serde_json::json!({
        "accepted": accepted,
        "outcome": outcome,
    });
    if let (Some(body_map), Some(detail_map)) = (body.as_object_mut(), detail.as_object()) {
        for (k, v) in detail_map {
            body_map.insert(k.clone(), v.clone());
        }
    }
    (StatusCode::OK, Json(body))
}

#[tracing::instrument(level = "debug", skip_all, fields(job_id = %id))]
async fn get_job(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match state.tracker.status(id).await {
        Ok(Some(job)) => Ok(Json(job_body(&job))),
        Ok(None) => Err(error_response(
            StatusCode::NOT_FOUND,
            format!("job {id} not found"),
        )),
        Err(e) => Err(pipeline_error_response(e)),
    }
}

/// Report-back contract for the external AI worker.
#[derive(Debug, Deserialize)]
struct TransitionRequest {
    status: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[tracing::instrument(level = "info", skip_all, fields(job_id = %id))]
async fn post_job_transition(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let target = JobStatus::parse(&request.status)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))?;
    let job = state
        .tracker
        .transition(id, target, request.result, request.error)
        .await
        .map_err(pipeline_error_response)?;
    Ok(Json(job_body(&job)))
}

async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "channel": state.channel_id,
    }))
}

fn job_body(job: &warung_core::Job) -> serde_json::Value {
    serde_json::json!({
        "id": job.id,
        "tenant": job.conversation.tenant,
        "chat": job.conversation.chat,
        "status": job.status,
        "result": job.result,
        "error": job.error,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
    })
}

fn pipeline_error_response(e: PipelineError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PipelineError::InvariantViolation(_) => StatusCode::CONFLICT,
        PipelineError::Transient(_) | PipelineError::Channel(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, e.to_string())
}

fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message })))
}
