//! Actix Web HTTP server.
//!
//! Exposes Anthropic-compatible endpoints:
//! - `POST /v1/messages`
//! - `GET /v1/models`
//! - `GET /health`
//!
//! Every `/v1/messages` call goes through the shared [`AdmissionQueue`]
//! before it touches the backend.

use std::convert::Infallible;

use actix_cors::Cors;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, ResponseError};
use anyhow::{Context, Result};
use bytes::Bytes;
use localbridge_queue::AdmissionQueue;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    backend::BackendClient,
    config::ProxyConfig,
    error::ProxyError,
    routing::ModelRouter,
    streaming::{relay_stream, TranslationSession},
    translation,
    types::{MessagesRequest, ModelList, Usage},
};

/// Largest request body accepted on `/v1/messages`.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared state handed to every request handler.
pub struct AppState {
    pub config: ProxyConfig,
    pub queue: AdmissionQueue,
    pub backend: BackendClient,
    pub router: ModelRouter,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let backend = BackendClient::new(config.backend_url.clone(), config.timeout())?;
        Ok(Self {
            queue: AdmissionQueue::new(config.queue_options()),
            router: ModelRouter::new(config.models.clone()),
            backend,
            config,
        })
    }
}

/// Register routes. Used by [`serve`] and by tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
        .route("/health", web::get().to(health_check))
        .route("/v1/messages", web::post().to(handle_messages))
        .route("/v1/models", web::get().to(list_models));
}

pub async fn serve(config: ProxyConfig) -> Result<()> {
    let addr = config.bind_addr();
    if config.api_key.is_none() {
        warn!("PROXY_API_KEY is not set; accepting unauthenticated requests");
    }

    let state = web::Data::new(AppState::new(config).context("failed to initialise proxy")?);
    info!(
        addr = %addr,
        backend = %state.backend.endpoint(),
        concurrency = state.queue.limit(),
        max_pending = ?state.config.max_pending,
        timeout_ms = state.config.timeout_ms,
        "localbridge-proxy listening"
    );

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Cors::permissive())
            .configure(configure)
    })
    .bind(&addr)
    .with_context(|| format!("failed to bind {}", addr))?
    .run()
    .await
    .context("server error")?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    queue: QueueHealth,
    timeout_ms: u64,
}

#[derive(Debug, Serialize)]
struct QueueHealth {
    pending: usize,
    running: usize,
    limit: usize,
    max_pending: Option<usize>,
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let stats = state.queue.stats();
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        queue: QueueHealth {
            pending: stats.pending,
            running: stats.running,
            limit: stats.limit,
            max_pending: stats.max_pending,
        },
        timeout_ms: state.config.timeout_ms,
    })
}

/// Accept either `Authorization: Bearer <key>` or `x-api-key: <key>`.
fn authorize(config: &ProxyConfig, req: &HttpRequest) -> Result<(), ProxyError> {
    let Some(expected) = config.api_key.as_deref() else {
        return Ok(());
    };

    let headers = req.headers();
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    if bearer == Some(expected) || api_key == Some(expected) {
        Ok(())
    } else {
        Err(ProxyError::Unauthorized)
    }
}

async fn list_models(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ProxyError> {
    authorize(&state.config, &req)?;
    Ok(HttpResponse::Ok().json(ModelList::from_ids(state.router.models())))
}

async fn handle_messages(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, ProxyError> {
    authorize(&state.config, &req)?;

    let request: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

    let backend_model = state
        .router
        .pick_model(&translation::prompt_text(&request))
        .to_string();
    let echoed_model = request
        .model
        .clone()
        .unwrap_or_else(|| backend_model.clone());

    debug!(
        requested_model = ?request.model,
        %backend_model,
        stream = request.is_streaming(),
        messages = request.messages.len(),
        "routing decision"
    );

    if request.is_streaming() {
        stream_messages(&state, &request, backend_model, echoed_model)
    } else {
        complete_messages(&state, &request, backend_model, echoed_model).await
    }
}

async fn complete_messages(
    state: &AppState,
    request: &MessagesRequest,
    backend_model: String,
    echoed_model: String,
) -> Result<HttpResponse, ProxyError> {
    let chat = translation::build_chat_request(request, &backend_model, false);
    let backend = state.backend.clone();

    let ticket = state
        .queue
        .enqueue(move || async move { backend.complete(&chat).await })?;
    info!(
        model = %backend_model,
        stream = false,
        pending = state.queue.pending(),
        "request queued"
    );

    let message_id = translation::new_message_id();
    let outcome = ticket.await.map_err(ProxyError::from).and_then(|r| r);

    Ok(match outcome {
        Ok(output) => HttpResponse::Ok().json(translation::message_response(
            message_id,
            echoed_model,
            output.text,
            output.usage,
        )),
        Err(e) => {
            error!(error = %e, %backend_model, "completion failed");
            HttpResponse::build(e.status_code()).json(translation::message_response(
                message_id,
                echoed_model,
                e.describe(),
                Usage::default(),
            ))
        }
    })
}

fn stream_messages(
    state: &AppState,
    request: &MessagesRequest,
    backend_model: String,
    echoed_model: String,
) -> Result<HttpResponse, ProxyError> {
    let chat = translation::build_chat_request(request, &backend_model, true);
    let backend = state.backend.clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let session = TranslationSession::new(tx, translation::new_message_id(), echoed_model);

    let ticket = state
        .queue
        .enqueue(move || relay_stream(backend, chat, session))?;
    info!(
        model = %backend_model,
        stream = true,
        pending = state.queue.pending(),
        "request queued"
    );

    // Terminal events go out only after the job has released its slot.
    tokio::spawn(async move {
        match ticket.await {
            Ok(outcome) => outcome.finish(),
            Err(e) => debug!(error = %e, "streaming job abandoned"),
        }
    });

    let body = async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            yield Ok::<_, Infallible>(frame);
        }
    };

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("cache-control", "no-cache"))
        .streaming(body))
}
