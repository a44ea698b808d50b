//! HTTP gateway.
//!
//! A thin JSON front-end over [`Liath`]. Every handler moves the blocking
//! work (script execution, sqlite I/O) onto the blocking pool. Failures come
//! back as `{"status": "error", "error": <kind>, "message": ...}`.
//!
//! | Method | Path                | Body                                   |
//! |--------|---------------------|----------------------------------------|
//! | POST   | `/login`            | `{username, password}`                 |
//! | POST   | `/create_user`      | `{username, password}`                 |
//! | POST   | `/query`            | `{namespace, query, format?}`          |
//! | POST   | `/create_namespace` | `{namespace, packages?}`               |
//! | GET    | `/list_namespaces`  |                                        |
//! | POST   | `/install_package`  | `{namespace, package}`                 |

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::config::GatewayConfig;
use crate::engine::OutputFormat;
use crate::error::Error;
use crate::Liath;

/// Error body plus status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NamespaceNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Error::UserAlreadyExists => StatusCode::CONFLICT,
            Error::ScriptTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Sqlite(_) | Error::Io(_) | Error::StorageClosed(_) | Error::General(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "error": self.kind,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

/// Run `f` on the blocking pool.
async fn blocking<T, F>(liath: &Arc<Liath>, f: F) -> std::result::Result<T, ApiError>
where
    F: FnOnce(&Liath) -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let liath = Arc::clone(liath);
    tokio::task::spawn_blocking(move || f(&liath))
        .await
        .map_err(|e| ApiError::internal(format!("worker failed: {e}")))?
        .map_err(ApiError::from)
}

#[derive(Debug, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    namespace: String,
    query: String,
    #[serde(default)]
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateNamespaceRequest {
    namespace: String,
    #[serde(default)]
    packages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InstallPackageRequest {
    namespace: String,
    package: String,
}

async fn login(
    State(liath): State<Arc<Liath>>,
    body: std::result::Result<Json<Credentials>, JsonRejection>,
) -> ApiResult {
    let Json(creds) = body?;
    blocking(&liath, move |db| db.require_user(&creds.username, &creds.password)).await?;
    Ok(Json(json!({"status": "success", "message": "Logged in successfully"})))
}

async fn create_user(
    State(liath): State<Arc<Liath>>,
    body: std::result::Result<Json<Credentials>, JsonRejection>,
) -> ApiResult {
    let Json(creds) = body?;
    blocking(&liath, move |db| db.create_user(&creds.username, &creds.password)).await?;
    Ok(Json(json!({"status": "success", "message": "User created successfully"})))
}

async fn query(
    State(liath): State<Arc<Liath>>,
    body: std::result::Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let format: OutputFormat = match request.format.as_deref() {
        Some(raw) => raw.parse().map_err(ApiError::from)?,
        None => OutputFormat::Dict,
    };

    let output = blocking(&liath, move |db| {
        db.execute_with(&request.namespace, &request.query, format)
    })
    .await?;

    let result = match output.rendered {
        Some(text) => Value::String(text),
        None => serde_json::to_value(&output.value)
            .map_err(|e| ApiError::internal(e.to_string()))?,
    };
    Ok(Json(json!({"status": "success", "format": format.to_string(), "result": result})))
}

async fn create_namespace(
    State(liath): State<Arc<Liath>>,
    body: std::result::Result<Json<CreateNamespaceRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let name = request.namespace.clone();
    blocking(&liath, move |db| {
        db.create_namespace(&request.namespace, &request.packages).map(|_| ())
    })
    .await?;
    Ok(Json(json!({"status": "success", "message": format!("Namespace {name} created")})))
}

async fn list_namespaces(State(liath): State<Arc<Liath>>) -> ApiResult {
    let namespaces = blocking(&liath, |db| Ok(db.list_namespaces())).await?;
    Ok(Json(json!({"status": "success", "namespaces": namespaces})))
}

async fn install_package(
    State(liath): State<Arc<Liath>>,
    body: std::result::Result<Json<InstallPackageRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let (namespace, package) = (request.namespace.clone(), request.package.clone());
    let added = blocking(&liath, move |db| {
        db.install_package(&request.namespace, &request.package)
    })
    .await?;
    let message = if added {
        format!("Package {package} installed successfully in namespace {namespace}")
    } else {
        format!("Package {package} already installed in namespace {namespace}")
    };
    Ok(Json(json!({"status": "success", "installed": added, "message": message})))
}

/// Routes and middleware, without binding a socket.
pub fn router(liath: Arc<Liath>, config: &GatewayConfig) -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/create_user", post(create_user))
        .route("/query", post(query))
        .route("/create_namespace", post(create_namespace))
        .route("/list_namespaces", get(list_namespaces))
        .route("/install_package", post(install_package))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.body_limit_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
        .with_state(liath)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(liath: Arc<Liath>, config: GatewayConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(address = %addr, "Gateway listening");

    axum::serve(listener, router(liath, &config))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server failed")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
