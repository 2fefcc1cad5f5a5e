use std::{collections::HashMap, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::State,
    http::{Request, Response, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::any,
};
use tracing::{error, info};

use crate::{
    api::PromotionRequest,
    transport::{HttpRequest, HttpResponse, MAX_HTTP_BODY_BYTES, SharedRuntime, handle_request},
};

/// Periodic promotion settings for the background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionSchedule {
    pub interval: Duration,
    pub max_rows: usize,
}

#[derive(Clone)]
struct AppState {
    runtime: SharedRuntime,
}

pub fn router(runtime: SharedRuntime) -> Router {
    Router::new()
        .fallback(any(dispatch))
        .with_state(AppState { runtime })
        .layer(axum::extract::DefaultBodyLimit::max(MAX_HTTP_BODY_BYTES))
}

pub fn serve_http_with_axum(
    runtime: SharedRuntime,
    bind_addr: &str,
    worker_threads: usize,
    promotion: Option<PromotionSchedule>,
) -> Result<(), String> {
    let worker_threads = worker_threads.max(1);
    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build tokio runtime: {e}"))?;

    let bind_addr = bind_addr.to_string();
    tokio_runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| format!("failed to bind {bind_addr}: {e}"))?;
        info!(%bind_addr, worker_threads, "http transport listening");

        if let Some(schedule) = promotion {
            tokio::spawn(run_promotion_worker(runtime.clone(), schedule));
        }

        axum::serve(listener, router(runtime))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| format!("axum server failed: {e}"))
    })
}

async fn run_promotion_worker(runtime: SharedRuntime, schedule: PromotionSchedule) {
    info!(
        interval_ms = schedule.interval.as_millis() as u64,
        max_rows = schedule.max_rows,
        "promotion worker started"
    );
    let mut ticker = tokio::time::interval(schedule.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let worker_runtime = runtime.clone();
        let request = PromotionRequest {
            max_rows: schedule.max_rows,
            branch_override: None,
        };
        // The store blocks on its lock and on disk I/O.
        match tokio::task::spawn_blocking(move || worker_runtime.run_promotion(request)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!(error = %err, "promotion worker pass failed"),
            Err(err) => error!(error = %err, "promotion worker task panicked"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install shutdown signal handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> impl IntoResponse {
    let method = request.method().to_string();
    let target = request
        .uri()
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let mut headers = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }

    let body = match to_bytes(request.into_body(), MAX_HTTP_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            return response_from_transport(HttpResponse::bad_request(&format!(
                "request body error: {err}"
            )));
        }
    };

    let request = HttpRequest {
        method,
        target,
        headers,
        body,
    };

    let runtime = state.runtime.clone();
    match tokio::task::spawn_blocking(move || handle_request(&runtime, &request)).await {
        Ok(response) => response_from_transport(response),
        Err(err) => response_from_transport(HttpResponse::internal_server_error(&format!(
            "request handler failed: {err}"
        ))),
    }
}

fn response_from_transport(response: HttpResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    out.headers_mut().insert(
        CONTENT_TYPE,
        response
            .content_type
            .parse()
            .unwrap_or(axum::http::HeaderValue::from_static("application/json")),
    );
    out
}
