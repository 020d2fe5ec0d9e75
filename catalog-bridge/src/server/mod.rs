//! HTTP surface and service wiring.

use crate::{
    bridge::{QueuePublisher, RequestOutcome, RequestPublisher, SyncBridge},
    error::BridgeError,
    poller::{Poller, PollerSettings},
    products::{ProductFindAllRequest, ProductList, ProductListCodec},
    queue::{QueueClient, SqsQueueClient},
    reaper::Reaper,
    registry::CorrelationRegistry,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use catalog_bridge_common::{
    config::Config,
    helpers::{
        shutdown_handler::ShutdownHandler,
        sqs::{create_sqs_client, load_sdk_config},
        task_monitor::TaskMonitor,
    },
};
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::net::TcpListener;

pub type ProductBridge<P> = SyncBridge<ProductList, P>;

pub struct AppState<P> {
    bridge:   Arc<ProductBridge<P>>,
    shutdown: ShutdownHandler,
    ready:    Arc<AtomicBool>,
}

impl<P> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self {
            bridge:   Arc::clone(&self.bridge),
            shutdown: self.shutdown.clone(),
            ready:    Arc::clone(&self.ready),
        }
    }
}

impl<P: RequestPublisher + 'static> AppState<P> {
    pub fn new(
        bridge: Arc<ProductBridge<P>>,
        shutdown: ShutdownHandler,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            bridge,
            shutdown,
            ready,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub shutting_down:    bool,
    pub pending_requests: usize,
    pub tracked_ids:      usize,
}

#[derive(Debug, Deserialize)]
pub struct FindAllParams {
    pub uuid:   Option<String>,
    pub limit:  Option<i32>,
    pub offset: Option<i32>,
}

pub fn router<P: RequestPublisher + 'static>(state: AppState<P>) -> Router {
    Router::new()
        .route("/health", get(health::<P>))
        .route("/ready", get(ready::<P>))
        .route("/api/products", get(find_all::<P>))
        .with_state(state)
}

async fn health<P: RequestPublisher + 'static>(
    State(state): State<AppState<P>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        shutting_down:    state.shutdown.is_shutting_down(),
        pending_requests: state.shutdown.requests_pending_completion(),
        tracked_ids:      state.bridge.registry().len(),
    })
}

async fn ready<P: RequestPublisher + 'static>(State(state): State<AppState<P>>) -> Response {
    // Ready only once the poller runs, and no longer once shutdown started.
    if state.ready.load(Ordering::SeqCst) && !state.shutdown.is_shutting_down() {
        "ready".into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

async fn find_all<P: RequestPublisher + 'static>(
    State(state): State<AppState<P>>,
    Query(params): Query<FindAllParams>,
) -> Response {
    let Some(correlation_id) = params.uuid else {
        tracing::info!("Product request without uuid");
        return empty_list(StatusCode::BAD_REQUEST);
    };

    let request = ProductFindAllRequest::new(correlation_id.as_str(), params.limit, params.offset);
    let body = match serde_json::to_string(&request) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(correlation_id, error = %err, "Failed to serialize product request");
            return empty_list(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let timeout = state.bridge.default_timeout();
    match state.bridge.request(&correlation_id, &body, timeout).await {
        RequestOutcome::Ok(products) => {
            tracing::info!(correlation_id, count = products.len(), "Returning products");
            (StatusCode::OK, Json(products)).into_response()
        }
        RequestOutcome::InProgress => empty_list(StatusCode::ACCEPTED),
        RequestOutcome::Timeout => StatusCode::NO_CONTENT.into_response(),
        RequestOutcome::Error(BridgeError::Validation { .. }) => {
            empty_list(StatusCode::BAD_REQUEST)
        }
        RequestOutcome::Error(err) => {
            tracing::error!(correlation_id, error = %err, "Product request failed");
            empty_list(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn empty_list(status: StatusCode) -> Response {
    (status, Json(ProductList::new())).into_response()
}

/// Serves `router` on `listener` until shutdown starts. In-flight HTTP
/// requests are allowed to finish.
pub async fn serve<P: RequestPublisher + 'static>(
    listener: TcpListener,
    state: AppState<P>,
) -> Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .wrap_err("http server error")
}

/// Entry point of the service binary: builds the SQS clients and runs until
/// a shutdown signal arrives.
pub async fn server_main(config: Config) -> Result<()> {
    let shutdown_handler = ShutdownHandler::new(config.shutdown_drain_timeout());
    shutdown_handler.wait_for_shutdown_signal().await;

    let sdk_config = load_sdk_config(config.aws.as_ref()).await;
    let long_poll_wait = usize::try_from(config.long_poll_wait_seconds)
        .wrap_err("long_poll_wait_seconds must not be negative")?;
    // Separate clients: the poller owns the one it receives with.
    let poll_client = SqsQueueClient::new(create_sqs_client(&sdk_config, long_poll_wait));
    let publish_client = SqsQueueClient::new(create_sqs_client(&sdk_config, 0));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .wrap_err("http listener bind error")?;

    run_service(&config, listener, poll_client, publish_client, shutdown_handler).await
}

/// Runs the poller, the reaper and the HTTP server until `shutdown_handler`
/// fires or one of them exits, then drains.
///
/// The poller and reaper keep running while in-flight requests drain, so
/// those requests can still receive their replies.
pub async fn run_service<Q>(
    config: &Config,
    listener: TcpListener,
    poll_client: Q,
    publish_client: Q,
    shutdown_handler: ShutdownHandler,
) -> Result<()>
where
    Q: QueueClient + 'static,
{
    let background_shutdown = ShutdownHandler::new(config.shutdown_drain_timeout());
    let registry = Arc::new(CorrelationRegistry::<ProductList>::new());
    let bridge = Arc::new(SyncBridge::new(
        Arc::clone(&registry),
        QueuePublisher::new(publish_client, config.requests_queue_url.clone()),
        shutdown_handler.clone(),
        config.request_timeout(),
    ));

    let mut task_monitor = TaskMonitor::new();

    let mut poller = Poller::new(
        poll_client,
        ProductListCodec::new(),
        Arc::clone(&registry),
        PollerSettings::from_config(config),
        background_shutdown.clone(),
    );
    task_monitor.spawn("poller", async move { poller.run().await });

    let reaper = Reaper::new(
        Arc::clone(&registry),
        config.reaper_interval(),
        config.reaper_grace_period(),
        background_shutdown.clone(),
    );
    task_monitor.spawn("reaper", async move { reaper.run().await });

    let ready = Arc::new(AtomicBool::new(false));
    let state = AppState::new(bridge, shutdown_handler.clone(), Arc::clone(&ready));
    tracing::info!(
        address = ?listener.local_addr().ok(),
        "HTTP server listening"
    );
    task_monitor.spawn("http", serve(listener, state));

    ready.store(true, Ordering::SeqCst);
    tracing::info!("Service ready");

    let outcome = tokio::select! {
        _ = shutdown_handler.cancelled() => Ok(()),
        report = task_monitor.next_exit() => Err(report),
    };
    ready.store(false, Ordering::SeqCst);
    if let Err(err) = &outcome {
        tracing::error!("Background task failed: {:?}", err);
        shutdown_handler.trigger_manual_shutdown();
    }

    tracing::info!(
        pending = shutdown_handler.requests_pending_completion(),
        "Shutting down, draining pending requests"
    );
    shutdown_handler.wait_for_pending_requests_completion().await;

    background_shutdown.trigger_manual_shutdown();
    task_monitor
        .join_all(config.shutdown_drain_timeout())
        .await?;
    tracing::info!(tracked = registry.len(), "Service stopped");

    outcome
}
