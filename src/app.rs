use crate::app_state::SharedAppState;
use crate::error::DmrppError;
use crate::manifest_store::{StoreEntry, StoreOutcome};
use crate::metrics::{metrics_handler, record_response_metrics, request_counter};
use crate::models::{self, Manifest};
use crate::validated_json::ValidatedJson;

use axum::{
    extract::{Path, State},
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;

use tower::Layer;
use tower::ServiceBuilder;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::trace::TraceLayer;

static HEADER_DTYPE: header::HeaderName = header::HeaderName::from_static("x-dmrpp-dtype");
static HEADER_SHAPE: header::HeaderName = header::HeaderName::from_static("x-dmrpp-shape");
static HEADER_BYTE_ORDER: header::HeaderName =
    header::HeaderName::from_static("x-dmrpp-byte-order");

impl IntoResponse for models::ArrayBuffer {
    fn into_response(self) -> Response {
        let shape = match serde_json::to_string(&self.shape) {
            Ok(shape) => shape,
            Err(err) => return DmrppError::from(err).into_response(),
        };
        (
            [
                (
                    &header::CONTENT_TYPE,
                    mime::APPLICATION_OCTET_STREAM.to_string(),
                ),
                (&HEADER_DTYPE, self.element_type.to_string()),
                (&HEADER_SHAPE, shape),
                (&HEADER_BYTE_ORDER, self.byte_order.to_string()),
            ],
            self.data,
        )
            .into_response()
    }
}

/// Body of a successful store.
#[derive(Serialize)]
struct Stored {
    name: String,
    outcome: StoreOutcome,
}

/// Service type of the application.
pub type Service = NormalizePath<Router>;

/// Returns a [axum::Router] for the application.
///
/// # Arguments
///
/// * `state`: Shared application state
pub fn router(state: SharedAppState) -> Router {
    fn v1(state: SharedAppState) -> Router {
        Router::new()
            .route("/manifests", get(list_manifests))
            .route(
                "/manifests/:name",
                get(get_manifest).put(put_manifest).delete(delete_manifest),
            )
            .route("/read", post(read))
            .layer(
                ServiceBuilder::new().layer(
                    TraceLayer::new_for_http()
                        .on_request(request_counter)
                        .on_response(record_response_metrics),
                ),
            )
            .with_state(state)
    }

    Router::new()
        .route("/.well-known/dmrpp-store", get(banner))
        .route("/metrics", get(metrics_handler))
        .nest("/v1", v1(state))
}

/// Returns the application [Service], which also strips trailing slashes from request paths.
///
/// # Arguments
///
/// * `state`: Shared application state
pub fn service(state: SharedAppState) -> Service {
    NormalizePathLayer::trim_trailing_slash().layer(router(state))
}

async fn banner() -> &'static str {
    concat!("dmrpp-store ", env!("CARGO_PKG_VERSION"))
}

/// List the stored manifests.
async fn list_manifests(
    State(state): State<SharedAppState>,
) -> Result<Json<Vec<StoreEntry>>, DmrppError> {
    Ok(Json(state.store.entries()?))
}

/// Return a stored manifest as JSON.
async fn get_manifest(
    State(state): State<SharedAppState>,
    Path(name): Path<String>,
) -> Result<Response, DmrppError> {
    let handle = state
        .store
        .is_available(&name)
        .await?
        .ok_or(DmrppError::ManifestNotFound { name })?;
    let bytes = handle.bytes().await?;
    Ok((
        [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
        bytes,
    )
        .into_response())
}

/// Store a manifest given as a JSON body.
///
/// The manifest's source must be one the reader is allowed to fetch from.
async fn put_manifest(
    State(state): State<SharedAppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Stored>), DmrppError> {
    let manifest = Manifest::from_json(&body)?;
    state
        .reader
        .fetcher()
        .admit(&manifest.source_file_identifier)
        .await?;
    let outcome = state.store.store(&name, &manifest).await?;
    let status = match outcome {
        StoreOutcome::Stored => StatusCode::CREATED,
        StoreOutcome::AlreadyPresent | StoreOutcome::Replaced => StatusCode::OK,
    };
    Ok((status, Json(Stored { name, outcome })))
}

/// Remove a stored manifest.
async fn delete_manifest(
    State(state): State<SharedAppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, DmrppError> {
    state.store.remove(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Read part of a variable.
///
/// The manifest stays read-locked until the read completes.
#[tracing::instrument(level = "DEBUG", skip(state))]
async fn read(
    State(state): State<SharedAppState>,
    ValidatedJson(request): ValidatedJson<models::ReadRequest>,
) -> Result<models::ArrayBuffer, DmrppError> {
    let handle = state
        .store
        .is_available(&request.manifest)
        .await?
        .ok_or_else(|| DmrppError::ManifestNotFound {
            name: request.manifest.clone(),
        })?;
    let manifest = handle.manifest().await?;
    let buffer = state
        .reader
        .read(
            &manifest,
            &request.variable,
            request.selection.as_deref(),
            request.byte_order,
        )
        .await?;
    drop(handle);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::app_state::AppState;
    use crate::cli::CommandLineArgs;
    use crate::test_utils::{i32_le, quadrant_source};

    use axum::body::Body;
    use axum::http::{self, Request};
    use clap::Parser;
    use regex::Regex;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestApp {
        _dir: tempfile::TempDir,
        service: Service,
    }

    /// An application over a temporary store holding the quadrant manifest under `quadrant`.
    ///
    /// Local sources are confined to a `data` directory holding `quadrant.h5`. A manifest
    /// pointing at `/etc/passwd` is stored directly under `escape`.
    async fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let local_root = dir.path().join("data");
        std::fs::create_dir(&local_root).unwrap();
        let (mut manifest, data) = quadrant_source();
        std::fs::write(local_root.join("quadrant.h5"), &data).unwrap();
        manifest.source_file_identifier = "quadrant.h5".to_string();

        let store_path = dir.path().join("store");
        let args = CommandLineArgs::parse_from([
            "dmrpp-store",
            "--store-path",
            store_path.to_str().unwrap(),
            "--local-root",
            local_root.to_str().unwrap(),
        ]);
        let state = Arc::new(AppState::new(&args).unwrap());
        state.store.store("quadrant", &manifest).await.unwrap();
        manifest.source_file_identifier = "/etc/passwd".to_string();
        state.store.store("escape", &manifest).await.unwrap();
        TestApp {
            _dir: dir,
            service: service(state),
        }
    }

    async fn call(app: &TestApp, request: Request<Body>) -> Response {
        app.service.clone().oneshot(request).await.unwrap()
    }

    fn read_request(body: &str) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri("/v1/read")
            .header(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        hyper::body::to_bytes(response.into_body()).await.unwrap()
    }

    #[tokio::test]
    async fn banner_and_metrics() {
        let app = app().await;
        let response = call(
            &app,
            Request::get("/.well-known/dmrpp-store").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(StatusCode::OK, response.status());
        assert!(String::from_utf8(body_bytes(response).await.to_vec())
            .unwrap()
            .starts_with("dmrpp-store "));
        let response = call(&app, Request::get("/metrics").body(Body::empty()).unwrap()).await;
        assert_eq!(StatusCode::OK, response.status());
    }

    #[tokio::test]
    async fn read_whole_variable() {
        let app = app().await;
        let response = call(
            &app,
            read_request(r#"{"manifest": "quadrant", "variable": "/quadrant", "byte_order": "little"}"#),
        )
        .await;
        assert_eq!(StatusCode::OK, response.status());
        let headers = response.headers();
        assert_eq!("int32", headers[&HEADER_DTYPE]);
        assert_eq!("[4,4]", headers[&HEADER_SHAPE]);
        assert_eq!("little", headers[&HEADER_BYTE_ORDER]);
        assert_eq!(
            mime::APPLICATION_OCTET_STREAM.as_ref(),
            headers[header::CONTENT_TYPE]
        );
        let expected = i32_le(&[0, 1, -1, -1, 2, 3, -1, -1, -1, -1, 10, 11, -1, -1, 12, 13]);
        assert_eq!(expected, body_bytes(response).await.to_vec());
    }

    #[tokio::test]
    async fn read_selection() {
        let app = app().await;
        let response = call(
            &app,
            read_request(
                r#"{"manifest": "quadrant", "variable": "/quadrant", "byte_order": "big",
                    "selection": [[1, 2, 3], {"start": 2, "stride": 1, "stop": 3}]}"#,
            ),
        )
        .await;
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!("[2,2]", response.headers()[&HEADER_SHAPE]);
        let expected: Vec<u8> = [-1_i32, -1, 12, 13]
            .iter()
            .flat_map(|value| value.to_be_bytes())
            .collect();
        assert_eq!(expected, body_bytes(response).await.to_vec());
    }

    #[tokio::test]
    async fn read_errors() {
        let app = app().await;
        let response = call(
            &app,
            read_request(r#"{"manifest": "nope", "variable": "/quadrant"}"#),
        )
        .await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());

        let response = call(
            &app,
            read_request(r#"{"manifest": "quadrant", "variable": "/missing"}"#),
        )
        .await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());

        let response = call(
            &app,
            read_request(
                r#"{"manifest": "quadrant", "variable": "/quadrant", "selection": [[0, 1, 4], [0, 1, 0]]}"#,
            ),
        )
        .await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
        let body = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        let re = Regex::new(r"invalid selection for variable /quadrant").unwrap();
        assert!(re.is_match(&body), "body: {body}");

        let response = call(
            &app,
            read_request(
                r#"{"manifest": "quadrant", "variable": "/quadrant", "selection": [[0, 0, 1], [0, 1, 0]]}"#,
            ),
        )
        .await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
        let body = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        let re = Regex::new(r"request data is not valid").unwrap();
        assert!(re.is_match(&body), "body: {body}");
    }

    #[tokio::test]
    async fn manifest_lifecycle() {
        let app = app().await;
        let response = call(
            &app,
            Request::get("/v1/manifests/quadrant/").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(StatusCode::OK, response.status());
        let manifest = body_bytes(response).await;
        Manifest::from_json(&manifest).unwrap();

        let put = |body: Bytes| {
            Request::put("/v1/manifests/copy")
                .header(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
                .body(Body::from(body))
                .unwrap()
        };
        let response = call(&app, put(manifest.clone())).await;
        assert_eq!(StatusCode::CREATED, response.status());
        let response = call(&app, put(manifest.clone())).await;
        assert_eq!(StatusCode::OK, response.status());
        let body = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(body.contains("already_present"), "body: {body}");

        let response = call(&app, Request::get("/v1/manifests").body(Body::empty()).unwrap()).await;
        let body = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(body.contains("\"name\":\"copy\""), "body: {body}");

        let delete = || Request::delete("/v1/manifests/copy").body(Body::empty()).unwrap();
        assert_eq!(StatusCode::NO_CONTENT, call(&app, delete()).await.status());
        assert_eq!(StatusCode::NOT_FOUND, call(&app, delete()).await.status());

        let response = call(&app, put(Bytes::from_static(b"{}"))).await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
    }

    #[tokio::test]
    async fn put_refuses_sources_outside_local_root() {
        let app = app().await;
        let response = call(
            &app,
            Request::get("/v1/manifests/quadrant").body(Body::empty()).unwrap(),
        )
        .await;
        let mut manifest = Manifest::from_json(&body_bytes(response).await).unwrap();

        for (source, status) in [
            ("/etc/passwd", StatusCode::FORBIDDEN),
            ("../store/ledger.txt", StatusCode::FORBIDDEN),
            ("s3://bucket/quadrant.h5", StatusCode::UNPROCESSABLE_ENTITY),
            ("https://example.com/quadrant.h5", StatusCode::UNPROCESSABLE_ENTITY),
        ] {
            manifest.source_file_identifier = source.to_string();
            let response = call(
                &app,
                Request::put("/v1/manifests/outside")
                    .header(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
                    .body(Body::from(serde_json::to_vec(&manifest).unwrap()))
                    .unwrap(),
            )
            .await;
            assert_eq!(status, response.status(), "source {source}");
        }

        let response = call(
            &app,
            Request::get("/v1/manifests/outside").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }

    #[tokio::test]
    async fn read_refuses_sources_outside_local_root() {
        let app = app().await;
        let response = call(
            &app,
            read_request(r#"{"manifest": "escape", "variable": "/quadrant"}"#),
        )
        .await;
        assert_eq!(StatusCode::FORBIDDEN, response.status());
        let body = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(body.contains("access to source /etc/passwd is denied"), "body: {body}");
    }
}
