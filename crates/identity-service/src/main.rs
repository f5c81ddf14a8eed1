use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use identity_api::{IdentifyRequest, IdentifyResponse, IdentityApi, API_CONTRACT_VERSION};
use identity_core::{ConsolidatedIdentity, Contact, ContactId, IdentityError};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const BANNER: &str = "Identity reconciliation service is running";
const RETRY_AFTER_SECONDS: &str = "1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    kind: &'static str,
    retryable: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "identity-service")]
#[command(about = "HTTP service reconciling contact observations into identities")]
struct Args {
    #[arg(long, env = "IDENTITY_DB", default_value = "./identity.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "IDENTITY_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    /// Overrides the port of `--bind`.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
    #[arg(long, env = "IDENTITY_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    busy_timeout_ms: u64,
}

impl Args {
    fn listen_addr(&self) -> SocketAddr {
        let mut addr = self.bind;
        if let Some(port) = self.port {
            addr.set_port(port);
        }
        addr
    }
}

impl ServiceError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            kind,
            retryable: false,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

fn status_for(err: &IdentityError) -> StatusCode {
    match err {
        IdentityError::Validation(_) => StatusCode::BAD_REQUEST,
        IdentityError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        IdentityError::NotFound(_) => StatusCode::NOT_FOUND,
        IdentityError::Consistency(_)
        | IdentityError::DanglingLink { .. }
        | IdentityError::LinkCycle(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<IdentityError>() {
            Some(identity_err) => Self {
                retryable: identity_err.is_retryable(),
                ..Self::new(status_for(identity_err), identity_err.kind(), identity_err.to_string())
            },
            None => Self::internal(format!("{err:#}")),
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", rejection.body_text())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, kind = self.kind, error = %self.error, "request failed");
        }
        let retry_after = self.retryable.then_some(RETRY_AFTER_SECONDS);
        let mut response = (self.status, Json(self)).into_response();
        if let Some(seconds) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static(seconds));
        }
        response
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run a store-backed operation off the async workers, inside the caller's span.
async fn run_blocking<T, F>(state: &ServiceState, operation: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&IdentityApi) -> Result<T> + Send + 'static,
{
    let api = state.api.clone();
    let span = tracing::Span::current();
    match tokio::task::spawn_blocking(move || span.in_scope(|| operation(&api))).await {
        Ok(result) => result.map_err(ServiceError::from),
        Err(err) => Err(ServiceError::internal(format!("blocking task failed: {err}"))),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/identify", post(identify))
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity", get(db_integrity))
        .route("/v1/contacts", get(contact_list))
        .route("/v1/contacts/:contact_id", get(contact_show))
        .route("/v1/contacts/:contact_id/identity", get(identity_show))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let addr = args.listen_addr();
    let state = ServiceState {
        api: IdentityApi::new(args.db.clone()).with_busy_timeout(args.busy_timeout_ms),
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, db = %args.db.display(), "identity service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn banner() -> &'static str {
    BANNER
}

async fn identify(
    State(state): State<ServiceState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ServiceError> {
    let request_id = Ulid::new();
    let span = tracing::info_span!("identify", %request_id);
    identify_request(state, payload).instrument(span).await
}

async fn identify_request(
    state: ServiceState,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ServiceError> {
    let Json(request) = payload?;
    let resolution = run_blocking(&state, move |api| api.identify(request)).await?;
    tracing::info!(
        primary_id = %resolution.identity.primary_contact_id,
        created = ?resolution.created,
        merged = resolution.demoted.len(),
        "identify completed"
    );
    Ok(Json(IdentifyResponse::from(resolution)))
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<identity_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = run_blocking(&state, IdentityApi::schema_status).await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<identity_api::MigrateResult>>, ServiceError> {
    let result = run_blocking(&state, move |api| api.migrate(request.dry_run)).await?;
    Ok(Json(envelope(result)))
}

async fn db_integrity(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<identity_store_sqlite::IntegrityReport>>, ServiceError> {
    let report = run_blocking(&state, IdentityApi::integrity_check).await?;
    Ok(Json(envelope(report)))
}

async fn contact_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Contact>>>, ServiceError> {
    let contacts = run_blocking(&state, IdentityApi::contact_list).await?;
    Ok(Json(envelope(contacts)))
}

async fn contact_show(
    State(state): State<ServiceState>,
    Path(contact_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<Contact>>, ServiceError> {
    let contact = run_blocking(&state, move |api| api.contact_show(ContactId(contact_id))).await?;
    Ok(Json(envelope(contact)))
}

async fn identity_show(
    State(state): State<ServiceState>,
    Path(contact_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<ConsolidatedIdentity>>, ServiceError> {
    let identity =
        run_blocking(&state, move |api| api.identity_show(ContactId(contact_id))).await?;
    Ok(Json(envelope(identity)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("identity-service-{}.sqlite3", ulid::Ulid::new()))
    }

    async fn response_text(response: Response) -> String {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response_text(response).await;
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<String>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body)),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        dispatch(router, request).await
    }

    async fn dispatch(router: &Router, request: Request<axum::body::Body>) -> Response {
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn header_text<'a>(response: &'a Response, name: header::HeaderName) -> Option<&'a str> {
        response.headers().get(name).and_then(|value| value.to_str().ok())
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = ServiceState { api: IdentityApi::new(unique_temp_db_path()) };
        let router = app(state);

        let response = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn root_returns_liveness_banner() {
        let state = ServiceState { api: IdentityApi::new(unique_temp_db_path()) };
        let router = app(state);

        let response = send(&router, "GET", "/", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_text(response).await, BANNER);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let state = ServiceState { api: IdentityApi::new(unique_temp_db_path()) };
        let router = app(state);

        let response = send(&router, "GET", "/v1/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_text(response).await;
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/identify"));
        assert!(body.contains("/v1/contacts/{contact_id}/identity"));
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn identify_creates_links_and_merges_contacts() {
        let db_path = unique_temp_db_path();
        let router = app(ServiceState { api: IdentityApi::new(db_path.clone()) });

        let first = send(
            &router,
            "POST",
            "/identify",
            Some(r#"{"email":"lorraine@hillvalley.edu","phoneNumber":"123456"}"#.to_string()),
        )
        .await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(
            response_json(first).await,
            serde_json::json!({
                "contact": {
                    "primaryContactId": 1,
                    "emails": ["lorraine@hillvalley.edu"],
                    "phoneNumbers": ["123456"],
                    "secondaryContactIds": []
                }
            })
        );

        let second = send(
            &router,
            "POST",
            "/identify",
            Some(r#"{"email":"mcfly@hillvalley.edu","phoneNumber":123456}"#.to_string()),
        )
        .await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(
            response_json(second).await,
            serde_json::json!({
                "contact": {
                    "primaryContactId": 1,
                    "emails": ["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"],
                    "phoneNumbers": ["123456"],
                    "secondaryContactIds": [2]
                }
            })
        );

        let third = send(
            &router,
            "POST",
            "/identify",
            Some(r#"{"email":"biffsucks@hillvalley.edu","phoneNumber":"717171"}"#.to_string()),
        )
        .await;
        assert_eq!(third.status(), StatusCode::OK);

        let merged = send(
            &router,
            "POST",
            "/identify",
            Some(r#"{"email":"mcfly@hillvalley.edu","phoneNumber":"717171"}"#.to_string()),
        )
        .await;
        assert_eq!(merged.status(), StatusCode::OK);
        assert_eq!(
            response_json(merged).await,
            serde_json::json!({
                "contact": {
                    "primaryContactId": 1,
                    "emails": [
                        "lorraine@hillvalley.edu",
                        "mcfly@hillvalley.edu",
                        "biffsucks@hillvalley.edu"
                    ],
                    "phoneNumbers": ["123456", "717171"],
                    "secondaryContactIds": [2, 3]
                }
            })
        );

        let identity = send(&router, "GET", "/v1/contacts/3/identity", None).await;
        assert_eq!(identity.status(), StatusCode::OK);
        let identity_value = response_json(identity).await;
        assert_eq!(
            identity_value
                .get("data")
                .and_then(|data| data.get("primaryContactId"))
                .and_then(serde_json::Value::as_i64),
            Some(1)
        );

        let contacts = send(&router, "GET", "/v1/contacts", None).await;
        assert_eq!(contacts.status(), StatusCode::OK);
        let contacts_value = response_json(contacts).await;
        assert_eq!(
            contacts_value.get("data").and_then(serde_json::Value::as_array).map(Vec::len),
            Some(3)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn identify_rejects_payload_without_email_or_phone() {
        let db_path = unique_temp_db_path();
        let router = app(ServiceState { api: IdentityApi::new(db_path.clone()) });

        for body in ["{}", r#"{"email":null,"phoneNumber":null}"#, r#"{"email":""}"#] {
            let response = send(&router, "POST", "/identify", Some(body.to_string())).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body={body}");
            let value = response_json(response).await;
            assert_eq!(value.get("kind").and_then(serde_json::Value::as_str), Some("validation"));
        }

        let malformed =
            send(&router, "POST", "/identify", Some("{\"email\":".to_string())).await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn missing_contact_maps_to_not_found() {
        let db_path = unique_temp_db_path();
        let router = app(ServiceState { api: IdentityApi::new(db_path.clone()) });

        let response = send(&router, "GET", "/v1/contacts/404", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = response_json(response).await;
        assert_eq!(value.get("kind").and_then(serde_json::Value::as_str), Some("not_found"));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn migrate_and_integrity_endpoints_report_status() {
        let db_path = unique_temp_db_path();
        let router = app(ServiceState { api: IdentityApi::new(db_path.clone()) });

        let dry_run = send(
            &router,
            "POST",
            "/v1/db/migrate",
            Some(serde_json::json!({ "dry_run": true }).to_string()),
        )
        .await;
        assert_eq!(dry_run.status(), StatusCode::OK);
        let dry_run_value = response_json(dry_run).await;
        assert_eq!(
            dry_run_value
                .get("data")
                .and_then(|data| data.get("would_apply_versions"))
                .cloned(),
            Some(serde_json::json!([1]))
        );

        let applied = send(
            &router,
            "POST",
            "/v1/db/migrate",
            Some(serde_json::json!({ "dry_run": false }).to_string()),
        )
        .await;
        assert_eq!(applied.status(), StatusCode::OK);

        let integrity = send(&router, "GET", "/v1/db/integrity", None).await;
        assert_eq!(integrity.status(), StatusCode::OK);
        let integrity_value = response_json(integrity).await;
        assert_eq!(
            integrity_value
                .get("data")
                .and_then(|data| data.get("quick_check_ok"))
                .and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-008
    #[test]
    fn port_overrides_bind_address() {
        let args = Args::parse_from(["identity-service", "--bind", "0.0.0.0:3000", "--port", "8080"]);
        assert_eq!(args.listen_addr().to_string(), "0.0.0.0:8080");
    }

    // Test IDs: TSVC-009
    #[tokio::test]
    async fn identify_answers_cors_preflight_from_any_origin() {
        let router = app(ServiceState { api: IdentityApi::new(unique_temp_db_path()) });

        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/identify")
            .header(header::ORIGIN, "https://intake.example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = dispatch(&router, preflight).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_text(&response, header::ACCESS_CONTROL_ALLOW_ORIGIN), Some("*"));
        assert_eq!(header_text(&response, header::ACCESS_CONTROL_ALLOW_METHODS), Some("*"));

        let banner = Request::builder()
            .method("GET")
            .uri("/")
            .header(header::ORIGIN, "https://intake.example.com")
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = dispatch(&router, banner).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_text(&response, header::ACCESS_CONTROL_ALLOW_ORIGIN), Some("*"));
    }

    // Test IDs: TSVC-010
    #[tokio::test]
    async fn locked_store_maps_to_retryable_service_unavailable() {
        let db_path = unique_temp_db_path();
        let router =
            app(ServiceState { api: IdentityApi::new(db_path.clone()).with_busy_timeout(10) });

        let seeded = send(
            &router,
            "POST",
            "/identify",
            Some(r#"{"email":"george@hillvalley.edu","phoneNumber":"555"}"#.to_string()),
        )
        .await;
        assert_eq!(seeded.status(), StatusCode::OK);

        let blocker = rusqlite::Connection::open(&db_path)
            .unwrap_or_else(|err| panic!("failed to open lock holder: {err}"));
        blocker
            .execute_batch("BEGIN IMMEDIATE;")
            .unwrap_or_else(|err| panic!("failed to take write lock: {err}"));

        let locked = send(
            &router,
            "POST",
            "/identify",
            Some(r#"{"email":"lorraine@hillvalley.edu","phoneNumber":"555"}"#.to_string()),
        )
        .await;
        assert_eq!(locked.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(header_text(&locked, header::RETRY_AFTER), Some(RETRY_AFTER_SECONDS));
        let value = response_json(locked).await;
        assert_eq!(value.get("kind").and_then(serde_json::Value::as_str), Some("store_unavailable"));
        assert_eq!(value.get("retryable").and_then(serde_json::Value::as_bool), Some(true));

        blocker
            .execute_batch("ROLLBACK;")
            .unwrap_or_else(|err| panic!("failed to release write lock: {err}"));
        drop(blocker);

        let contacts = send(&router, "GET", "/v1/contacts", None).await;
        assert_eq!(contacts.status(), StatusCode::OK);
        let contacts_value = response_json(contacts).await;
        assert_eq!(
            contacts_value.get("data").and_then(serde_json::Value::as_array).map(Vec::len),
            Some(1)
        );

        let _ = std::fs::remove_file(&db_path);
    }
}
