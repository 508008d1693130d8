use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bidstamp_api::{
    bucket_for, ApiError, BidStampApi, BucketResult, SntpTimeSource, SystemTimeSource,
    TimeSource, API_CONTRACT_VERSION,
};
use bidstamp_core::{
    BidRecord, StoredDocument, TimeSyncRecord, TimestampSelection, TransactionId,
};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: BidStampApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: &'static str,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_contract_version: &'static str,
    api_contract_version: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TimeSourceArg {
    Ntp,
    System,
}

#[derive(Debug, Parser)]
#[command(name = "bidstamp-service")]
#[command(about = "HTTP service recording bids and NTP-stamped time-sync records")]
struct Args {
    #[arg(long, env = "BIDSTAMP_DB", default_value = "./bidstamp.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "BIDSTAMP_BIND", default_value = "127.0.0.1:5000")]
    bind: SocketAddr,
    #[arg(long, env = "BIDSTAMP_TIME_SOURCE", value_enum, default_value_t = TimeSourceArg::Ntp)]
    time_source: TimeSourceArg,
    #[arg(long, env = "BIDSTAMP_NTP_SERVER", default_value = "pool.ntp.org:123")]
    ntp_server: String,
    #[arg(
        long,
        env = "BIDSTAMP_NTP_TIMEOUT_MS",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    ntp_timeout_ms: u64,
}

impl Args {
    fn build_time_source(&self) -> Arc<dyn TimeSource> {
        match self.time_source {
            TimeSourceArg::Ntp => Arc::new(SntpTimeSource::new(
                self.ntp_server.clone(),
                Duration::from_millis(self.ntp_timeout_ms),
            )),
            TimeSourceArg::System => Arc::new(SystemTimeSource),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error,
            message: message.into(),
        }
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        let message = err.to_string();
        match err {
            ApiError::Storage(_) => {
                tracing::error!(error = %message, "storage failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", message)
            }
            ApiError::TimeSource(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "TIME_SOURCE_UNAVAILABLE", message)
            }
            ApiError::NoTimestamps(_) => Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message),
        }
    }
}

/// Run a store-bound API call on the blocking pool.
async fn run_blocking<T, F>(call: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result.map_err(ServiceError::from),
        Err(err) => Err(ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            format!("blocking task failed: {err}"),
        )),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/bids", post(submit_bid))
        .route("/bids/new_bid", get(query_new_bid).post(submit_bid))
        .route("/time", post(submit_time_sync))
        .route("/bids/new_time", get(query_new_time).post(submit_time_sync))
        .route("/bids/:txid", get(query_timestamps))
        .route("/bids/:txid/selected", get(select_timestamp))
        .route("/bids/:txid/bucket", get(transaction_bucket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let time_source = args.build_time_source();
    tracing::info!(
        db = %args.db.display(),
        bind = %args.bind,
        time_source = %time_source.describe(),
        "starting bidstamp service"
    );
    let api = BidStampApi::open(&args.db, time_source)?;

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(
        listener,
        app(ServiceState { api: api.clone() }).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    api.shutdown()?;
    tracing::info!("bidstamp service stopped");
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
    })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn submit_bid(
    State(state): State<ServiceState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(payload): Json<Value>,
) -> Result<Json<StoredDocument<BidRecord>>, ServiceError> {
    let owner = peer.ip().to_string();
    let stored = run_blocking(move || state.api.submit_bid(payload, &owner)).await?;
    Ok(Json(stored))
}

async fn submit_time_sync(
    State(state): State<ServiceState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(payload): Json<Value>,
) -> Result<Json<StoredDocument<TimeSyncRecord>>, ServiceError> {
    let client_ip = peer.ip().to_string();
    let stored = run_blocking(move || state.api.submit_time_sync(payload, &client_ip)).await?;
    Ok(Json(stored))
}

async fn query_timestamps(
    State(state): State<ServiceState>,
    Path(txid): Path<String>,
) -> Result<Json<Vec<String>>, ServiceError> {
    let txid = TransactionId::new(txid);
    let timestamps = run_blocking(move || state.api.query_timestamps(&txid)).await?;
    Ok(Json(timestamps))
}

// The alias routes shadow `/bids/:txid` for these two literal ids.
async fn query_new_bid(
    state: State<ServiceState>,
) -> Result<Json<Vec<String>>, ServiceError> {
    query_timestamps(state, Path("new_bid".to_string())).await
}

async fn query_new_time(
    state: State<ServiceState>,
) -> Result<Json<Vec<String>>, ServiceError> {
    query_timestamps(state, Path("new_time".to_string())).await
}

async fn select_timestamp(
    State(state): State<ServiceState>,
    Path(txid): Path<String>,
) -> Result<Json<TimestampSelection>, ServiceError> {
    let txid = TransactionId::new(txid);
    let selection = run_blocking(move || state.api.select_timestamp(&txid)).await?;
    Ok(Json(selection))
}

async fn transaction_bucket(Path(txid): Path<String>) -> Json<BucketResult> {
    Json(bucket_for(&TransactionId::new(txid)))
}
