//! Wiring for the HTTP side-port and the gRPC listener.

use crate::config::PaymentRequestConfig;
use crate::grpc::{
    proto::{payment_request_service_server::PaymentRequestServiceServer, FILE_DESCRIPTOR_SET},
    PaymentRequestServiceImpl,
};
use crate::services::{
    get_metrics, http_metrics_middleware, init_metrics, Database, JsonSheetExporter,
    LedgerService, LifecycleManager,
};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::grpc::trace_context_interceptor;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tonic::transport::Server as GrpcServer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

#[derive(Clone)]
pub struct AppState {
    pub config: PaymentRequestConfig,
    pub db: Arc<Database>,
    pub manager: Arc<LifecycleManager>,
}

#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
}

/// Liveness: the ledger database answers.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "payment-request-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "payment-request-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Both listeners bound, plus the lifecycle manager they serve.
pub struct Application {
    http_port: u16,
    grpc_port: u16,
    http_listener: TcpListener,
    grpc_listener: TcpListener,
    state: AppState,
}

impl Application {
    pub async fn build(config: PaymentRequestConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Skips migrations, for databases whose schema is managed elsewhere.
    pub async fn build_without_migrations(config: PaymentRequestConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: PaymentRequestConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let ledger: Arc<dyn LedgerService> = db.clone();
        let manager = Arc::new(LifecycleManager::new(
            ledger,
            Arc::new(JsonSheetExporter),
            config.ledger.timeout(),
        ));

        let state = AppState {
            config: config.clone(),
            db,
            manager,
        };

        let (http_listener, http_port) = bind_listener("HTTP", config.common.port).await?;
        let (grpc_listener, grpc_port) =
            bind_listener("gRPC", config.common.grpc_port()).await?;

        tracing::info!(
            http_port = http_port,
            grpc_port = grpc_port,
            ledger_timeout_secs = config.ledger.timeout_secs,
            "Payment request service listeners bound"
        );

        Ok(Self {
            http_port,
            grpc_port,
            http_listener,
            grpc_listener,
            state,
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn grpc_port(&self) -> u16 {
        self.grpc_port
    }

    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Serve both listeners. Returns when either one fails.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            db: self.state.db.clone(),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(http_metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(health_state);

        let payment_request_service = PaymentRequestServiceImpl::new(self.state.manager.clone());

        let (mut health_reporter, grpc_health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<PaymentRequestServiceServer<PaymentRequestServiceImpl>>()
            .await;

        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| {
                std::io::Error::other(format!("Failed to build reflection service: {}", e))
            })?;

        let grpc_trace_layer = TraceLayer::new_for_grpc()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG));

        let payment_request_service_with_interceptor =
            PaymentRequestServiceServer::with_interceptor(
                payment_request_service,
                trace_context_interceptor,
            );

        let incoming = tokio_stream::wrappers::TcpListenerStream::new(self.grpc_listener);
        let grpc_server = GrpcServer::builder()
            .layer(grpc_trace_layer)
            .add_service(grpc_health_service)
            .add_service(reflection_service)
            .add_service(payment_request_service_with_interceptor)
            .serve_with_incoming(incoming);

        tracing::info!(
            service = "payment-request-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            grpc_port = self.grpc_port,
            "Service ready to accept connections"
        );

        tokio::select! {
            result = axum::serve(self.http_listener, http_router) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "HTTP server error");
                    return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
                }
            }
            result = grpc_server => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "gRPC server error");
                    return Err(std::io::Error::other(format!("gRPC server error: {}", e)));
                }
            }
        }

        Ok(())
    }
}

async fn bind_listener(kind: &str, port: u16) -> Result<(TcpListener, u16), AppError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(error = %e, addr = %addr, listener = kind, "Failed to bind listener");
        AppError::from(e)
    })?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}
