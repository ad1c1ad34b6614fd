use crate::error::PipelineError;
use crate::gateway::RegistrationGateway;
use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path},
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use chrono::Utc;
use hyper::Server;
use serde_json::{json, Value};
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Maps pipeline errors onto the HTTP contract: `{ "error": message }`
/// with a status per error kind.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::DuplicateDevice(_) => StatusCode::CONFLICT,
            PipelineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "device_pipeline",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn register(
    Extension(gateway): Extension<RegistrationGateway>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(body) = body.map_err(|e| PipelineError::InvalidRequest(e.body_text()))?;
    let accepted = gateway.register(&body).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::to_value(accepted).map_err(PipelineError::from)?),
    ))
}

async fn device_status(
    Extension(gateway): Extension<RegistrationGateway>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = gateway.get_status(&device_id).await?;
    Ok(Json(serde_json::to_value(record).map_err(PipelineError::from)?))
}

async fn list_devices(
    Extension(gateway): Extension<RegistrationGateway>,
) -> ApiResult<Json<Value>> {
    let records = gateway.list().await?;
    Ok(Json(json!({
        "count": records.len(),
        "devices": records,
    })))
}

/// Stand-in downstream ingestion system: acknowledges whatever it receives.
async fn mock_ingestion(body: Json<Value>) -> impl IntoResponse {
    let device_id = body.get("deviceId").cloned().unwrap_or(Value::Null);
    info!(device_id = %device_id, "Mock ingestion received registration");
    Json(json!({
        "status": "acknowledged",
        "deviceId": device_id,
        "receivedAt": Utc::now().to_rfc3339(),
    }))
}

async fn metrics_text() -> Response {
    match crate::metrics::render() {
        Some(text) => text.into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Build the router with every route and CORS applied.
pub fn create_router(gateway: RegistrationGateway) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/register", post(register))
        .route("/api/devices/:device_id", get(device_status))
        .route("/api/ingestion/mock", post(mock_ingestion))
        .layer(Extension(gateway))
        .layer(ServiceBuilder::new().layer(cors))
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    gateway: RegistrationGateway,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    listener
        .set_nonblocking(true)
        .context("Failed to make listener non-blocking")?;
    let app = create_router(gateway);
    Server::from_tcp(listener)
        .context("Failed to adopt listener")?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;
    Ok(())
}

/// Bind `addr` and serve the registration API until `shutdown` resolves.
pub async fn start_server<F>(
    gateway: RegistrationGateway,
    addr: SocketAddr,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener =
        TcpListener::bind(addr).with_context(|| format!("Failed to bind {addr}"))?;
    let local = listener.local_addr()?;

    info!("HTTP server running on http://{}", local);
    info!("Register:     POST http://{}/api/devices/register", local);
    info!("Health check: http://{}/health", local);

    serve(listener, gateway, shutdown).await?;
    info!("HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (PipelineError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (PipelineError::DuplicateDevice("x".into()), StatusCode::CONFLICT),
            (PipelineError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                PipelineError::QueueFull {
                    queue: "q".into(),
                    capacity: 1,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (PipelineError::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }
}
