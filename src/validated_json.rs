//! Axum extractor that deserialises and validates JSON

use crate::error::DmrppError;

use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Json},
    http::Request,
};
use serde::de::DeserializeOwned;
use validator::Validate;

/// An axum extractor based on the Json extractor that also performs validation using the validator
/// crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S, B> FromRequest<S, B> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
    Json<T>: FromRequest<S, B, Rejection = JsonRejection>,
    B: Send + 'static,
{
    type Rejection = DmrppError;

    /// Extract a `ValidatedJson` from a `Request`.
    async fn from_request(req: Request<B>, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::ReadRequest;

    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        response::Response,
        routing::post,
        Router,
    };
    use regex::Regex;
    use tower::ServiceExt;

    async fn echo(ValidatedJson(request): ValidatedJson<ReadRequest>) -> String {
        format!(
            "{} {} {:?}",
            request.manifest,
            request.variable,
            request.selection.map(|selection| selection.len())
        )
    }

    async fn request(body: &'static str) -> (StatusCode, String) {
        let response: Response = Router::new()
            .route("/", post(echo))
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/")
                    .header(http::header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn assert_matches(pattern: &str, body: &str) {
        let re = Regex::new(pattern).unwrap();
        assert!(re.is_match(body), "body: {body}");
    }

    #[tokio::test]
    async fn ok() {
        let (status, body) =
            request(r#"{"manifest": "m", "variable": "/v", "selection": [[0, 1, 3]]}"#).await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!("m /v Some(1)", body);
    }

    #[tokio::test]
    async fn invalid_json() {
        let (status, body) = request("{\"").await;
        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_matches(r"Failed to parse the request body as JSON", &body);
    }

    #[tokio::test]
    async fn unknown_field() {
        let (status, body) = request(r#"{"manifest": "m", "variable": "/v", "dtype": "int32"}"#).await;
        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_matches(r"unknown field `dtype`", &body);
    }

    #[tokio::test]
    async fn empty_variable() {
        let (status, body) = request(r#"{"manifest": "m", "variable": ""}"#).await;
        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_matches(r"request data is not valid", &body);
        assert_matches(r"variable must not be empty", &body);
    }

    #[tokio::test]
    async fn start_after_stop() {
        let (status, body) =
            request(r#"{"manifest": "m", "variable": "/v", "selection": [[4, 1, 3]]}"#).await;
        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_matches(r"Selection start must not exceed stop", &body);
    }
}
