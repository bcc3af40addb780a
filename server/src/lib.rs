//! HTTP API of the Keyward issuer host.
//!
//! Routes:
//! - `GET /`: health banner
//! - `GET|POST /api/v1/check_license`: Revocation Channel
//! - `POST|GET /api/v1/connections`: client usage reports
//! - `GET /api/v1/licenses`: administrative listing

pub mod connections;

pub use connections::ConnectionLog;

use axum::{
    Router,
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use chrono::Utc;
use keyward_license::{
    CHECK_LICENSE_PATH, CONNECTIONS_PATH, CheckLicenseRequest, CheckLicenseResponse,
    ConnectionAck, ConnectionRecord, ConnectionReport, DEFAULT_SERVER_PORT, DisplayState,
    LICENSES_PATH, LicenseError, LicenseRegistry, LicenseResult, LicenseSummary, RegistryConfig,
    ResponseStatus,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Issuer host settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// SQLite file shared by the registry and the connection log.
    pub database_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_SERVER_PORT,
            database_path: RegistryConfig::default().database_path,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<LicenseRegistry>,
    pub connections: ConnectionLog,
}

impl AppState {
    pub fn new(registry: Arc<LicenseRegistry>, connections: ConnectionLog) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// Opens the registry and connection log from configuration.
    pub fn open(config: &ServerConfig) -> LicenseResult<Self> {
        Ok(Self::new(
            Arc::new(LicenseRegistry::open(&config.database_path)?),
            ConnectionLog::open(&config.database_path)?,
        ))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HealthResponse {
    pub service: String,
    pub version: String,
    pub status: ResponseStatus,
}

/// A handler failure reported as HTTP 500 with a JSON body.
struct ApiError(LicenseError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(CheckLicenseResponse::error(self.0.to_string())),
        )
            .into_response()
    }
}

/// Runs blocking registry/log work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> LicenseResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(LicenseError::Storage(format!("worker task failed: {e}"))))?
        .map_err(ApiError)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "keyward".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: ResponseStatus::Ok,
    })
}

async fn check_license_get(
    State(state): State<AppState>,
    Query(request): Query<CheckLicenseRequest>,
) -> Response {
    answer_check(&state, request.license_id).await
}

/// Accepts a JSON body, falling back to the query string when the body is
/// empty.
async fn check_license_post(
    State(state): State<AppState>,
    Query(query): Query<CheckLicenseRequest>,
    body: Bytes,
) -> Response {
    let license_id = if body.iter().all(u8::is_ascii_whitespace) {
        query.license_id
    } else {
        match serde_json::from_slice::<CheckLicenseRequest>(&body) {
            Ok(request) => request.license_id.or(query.license_id),
            Err(e) => {
                warn!(error = %e, "malformed revocation query");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(CheckLicenseResponse::error(format!("invalid request body: {e}"))),
                )
                    .into_response();
            }
        }
    };
    answer_check(&state, license_id).await
}

/// Only a positively revoked registry entry produces `revoked: true`.
async fn answer_check(state: &AppState, license_id: Option<String>) -> Response {
    let Some(id) = license_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
    else {
        return Json(CheckLicenseResponse::not_revoked("no license id supplied")).into_response();
    };

    let registry = Arc::clone(&state.registry);
    let lookup = id.clone();
    let entry = match blocking(move || registry.find_by_short_or_registry_id(&lookup)).await {
        Ok(entry) => entry,
        Err(e) => return e.into_response(),
    };

    let response = match entry {
        None => CheckLicenseResponse::not_revoked("license not found"),
        Some(entry) => match entry.display_state(state.registry.now()) {
            DisplayState::Revoked => {
                info!(license_id = %id, "revocation reported to client");
                CheckLicenseResponse::revoked()
            }
            DisplayState::Expired => CheckLicenseResponse::not_revoked("license has expired"),
            DisplayState::Active => CheckLicenseResponse::not_revoked("license is active"),
        },
    };
    Json(response).into_response()
}

async fn report_connection(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(mut report): Json<ConnectionReport>,
) -> Response {
    if report.device_id.trim().is_empty() || report.license_short_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ConnectionAck {
                status: ResponseStatus::Error,
                message: "device_id and license_short_id are required".to_string(),
                reported_at: None,
            }),
        )
            .into_response();
    }
    if report.client_address.trim().is_empty() {
        report.client_address = peer.ip().to_string();
    }

    let log = state.connections.clone();
    match blocking(move || log.record(&report, Utc::now())).await {
        Ok(record) => {
            info!(
                device = %record.device_id,
                license = %record.license_short_id,
                address = %record.client_address,
                "client connection reported"
            );
            Json(ConnectionAck {
                status: ResponseStatus::Ok,
                message: "connection recorded".to_string(),
                reported_at: Some(record.reported_at),
            })
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn list_connections(
    State(state): State<AppState>,
) -> Result<Json<Vec<ConnectionRecord>>, ApiError> {
    let log = state.connections.clone();
    blocking(move || log.list()).await.map(Json)
}

async fn list_licenses(
    State(state): State<AppState>,
) -> Result<Json<Vec<LicenseSummary>>, ApiError> {
    let registry = Arc::clone(&state.registry);
    blocking(move || registry.summaries()).await.map(Json)
}

/// Build the HTTP API router.
///
/// The connection report route reads the peer address, so the router must
/// be served with `into_make_service_with_connect_info::<SocketAddr>()`
/// (see [`serve`]).
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route(
            CHECK_LICENSE_PATH,
            get(check_license_get).post(check_license_post),
        )
        .route(
            CONNECTIONS_PATH,
            get(list_connections).post(report_connection),
        )
        .route(LICENSES_PATH, get(list_licenses))
        .with_state(state)
}

/// Serves the API on `listener` until the future is dropped or fails.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
