// Quota Holder - Web Server
// JSON-over-HTTP adapter for the typed call surface

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use clap::Parser;
use quotaholder::{
    dispatch, logging, Context, EngineConfig, QuotaError, QuotaHolder, Request, Response,
    DEFAULT_CONFIG_FILE, VERSION,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
struct AppState {
    holder: Arc<QuotaHolder>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<QuotaError>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(error: QuotaError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Query string of the pending-commissions shortcut
#[derive(Deserialize)]
struct KeyQuery {
    #[serde(default)]
    key: String,
}

fn status_for(error: &QuotaError) -> StatusCode {
    match error {
        QuotaError::Authorization(_) => StatusCode::FORBIDDEN,
        QuotaError::NotFound(_) => StatusCode::NOT_FOUND,
        QuotaError::Validation(_) => StatusCode::BAD_REQUEST,
        QuotaError::Conflict(_)
        | QuotaError::NotEmpty { .. }
        | QuotaError::InvalidCommission { .. } => StatusCode::CONFLICT,
        QuotaError::LimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        QuotaError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Run a request on the blocking pool; the holder takes std locks and does disk I/O
async fn run(state: &AppState, request: Request) -> axum::response::Response {
    let holder = Arc::clone(&state.holder);
    let call = request.name();

    let outcome = tokio::task::spawn_blocking(move || dispatch(&holder, request))
        .await
        .unwrap_or_else(|e| Err(QuotaError::Storage(format!("call panicked: {}", e))));

    match outcome {
        Ok(response) => (StatusCode::OK, Json(ApiResponse::ok(response))).into_response(),
        Err(e) => {
            if matches!(e, QuotaError::Storage(_)) {
                error!(call, error = %e, "Call failed");
            }
            (status_for(&e), Json(ApiResponse::<Response>::err(e))).into_response()
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok(HealthResponse {
        status: "OK",
        version: VERSION,
    }))
}

/// POST /api/call - Run one typed request
async fn call(State(state): State<AppState>, body: String) -> axum::response::Response {
    match Request::from_json(&body) {
        Ok(request) => run(&state, request).await,
        Err(e) => (status_for(&e), Json(ApiResponse::<Response>::err(e))).into_response(),
    }
}

/// GET /api/entities/:entity/pending?key=... - Pending serials of an entity
async fn pending_commissions(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Query(query): Query<KeyQuery>,
) -> axum::response::Response {
    let request = Request::GetPendingCommissions {
        context: Context::new(&entity, &query.key),
    };
    run(&state, request).await
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/call", post(call))
        .route("/entities/:entity/pending", get(pending_commissions))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[derive(Parser)]
#[command(name = "quotaholder-server")]
#[command(about = "Quota holder HTTP server", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the listen address from the config
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = EngineConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    logging::init(&config.log_filter);

    println!("🌐 Quota Holder - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let holder = QuotaHolder::open_sqlite(&config)?;
    println!("✓ Database opened: {:?}", config.database);

    let state = AppState {
        holder: Arc::new(holder),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    info!(listen = %config.server.listen, "Server listening");

    println!("\n🚀 Server running on http://{}", config.server.listen);
    println!("   API: POST http://{}/api/call", config.server.listen);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn app() -> Router {
        let holder = QuotaHolder::in_memory(&EngineConfig::default()).unwrap();
        router(AppState {
            holder: Arc::new(holder),
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(HttpRequest::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["status"], "OK");
    }

    #[tokio::test]
    async fn test_call_and_error_status() {
        let app = app();

        let body = serde_json::json!({
            "call": "get_entity",
            "entity": "system",
            "key": ""
        });
        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/call")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["reply"], "entity");
        assert_eq!(json["data"]["data"]["name"], "system");

        let response = app
            .clone()
            .oneshot(
                HttpRequest::get("/api/entities/system/pending?key=wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(
                HttpRequest::post("/api/call")
                    .body(Body::from("{\"call\": \"nope\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "Validation");
    }
}
