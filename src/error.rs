//! Error handling.

use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_smithy_types::byte_stream::error::Error as ByteStreamError;
use axum::{
    extract::rejection::JsonRejection,
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ndarray::ShapeError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};
use zune_inflate::errors::InflateDecodeErrors;

/// Errors raised by the filter pipeline while decoding a single chunk.
///
/// These carry no chunk identity; [crate::reader] wraps them in a [DmrppError] variant that does.
#[derive(Debug, Error)]
pub enum FilterError {
    /// Inflate failed
    #[error("failed to inflate data")]
    Inflate(#[from] InflateDecodeErrors),

    /// Deflate failed
    #[error("failed to deflate data")]
    Deflate(#[source] std::io::Error),

    /// Decoded length did not match the chunk's expected length
    #[error("decoded length {actual} does not match expected length {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Fletcher32 checksum mismatch
    #[error("fletcher32 checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// Data too short to carry a fletcher32 checksum
    #[error("{length} bytes is too short to carry a fletcher32 checksum")]
    MissingChecksum { length: usize },

    /// The shuffle filter needs a non-zero element size
    #[error("shuffle filter requires a non-zero element size")]
    ZeroElementSize,

    /// Filter kind this pipeline cannot decode
    #[error("unsupported filter {id} ({name})")]
    Unsupported { id: u32, name: String },
}

/// Error type for manifest building, reading and storage.
///
/// The variants map onto the failure taxonomy of the service. Build-time errors local to one
/// variable are collected by [crate::builder::StorageLayoutExtractor] rather than returned.
#[derive(Debug, Error)]
pub enum DmrppError {
    /// The source file could not be opened or is not a supported format
    #[error("failed to open source {source_id}: {reason}")]
    SourceOpenFailure { source_id: String, reason: String },

    /// A storage layout the builder cannot describe
    #[error("unsupported storage layout for variable {variable}: {reason}")]
    UnsupportedLayout { variable: String, reason: String },

    /// A filter outside deflate, shuffle and fletcher32
    #[error("unsupported filter {id} ({name}) on variable {variable}")]
    UnsupportedFilter {
        variable: String,
        id: u32,
        name: String,
    },

    /// An element type the operation cannot handle
    #[error("unsupported element type {type_name} for variable {variable}")]
    UnsupportedElementType { variable: String, type_name: String },

    /// Companion metadata needed to synthesize a variable is absent or malformed
    #[error("missing required metadata for variable {variable}: {reason}")]
    MissingRequiredMetadata { variable: String, reason: String },

    /// A chunk recorded in the chunk map is inconsistent
    #[error("invalid chunk at {position:?}: {reason}")]
    InvalidChunk { position: Vec<u64>, reason: String },

    /// A manifest whose chunk map does not describe its variable
    #[error("invalid manifest for variable {variable}")]
    InvalidManifest {
        variable: String,
        #[source]
        cause: Box<DmrppError>,
    },

    /// A declared fill value does not parse as the element type
    #[error("invalid fill value {value:?} for type {type_name}")]
    InvalidFillValue { value: String, type_name: String },

    /// Fetching one of a chunk's blocks failed
    #[error(
        "failed to fetch chunk {position:?} of variable {variable} \
         (bytes {offset}..{end} of {source_id})",
        end = .offset + .length
    )]
    ChunkFetchFailure {
        source_id: String,
        variable: String,
        position: Vec<u64>,
        offset: u64,
        length: u64,
        #[source]
        cause: Box<DmrppError>,
    },

    /// Decoding a fetched chunk failed
    #[error("failed to decode chunk {position:?} of variable {variable} from {source_id}")]
    ChunkDecodeFailure {
        source_id: String,
        variable: String,
        position: Vec<u64>,
        #[source]
        cause: FilterError,
    },

    /// A fletcher32 checksum did not verify
    #[error("checksum verification failed for chunk {position:?} of variable {variable} from {source_id}")]
    FilterVerificationFailure {
        source_id: String,
        variable: String,
        position: Vec<u64>,
        #[source]
        cause: FilterError,
    },

    /// Read attempted against a manifest that has not been built and stored
    #[error("manifest {name} not found")]
    ManifestNotFound { name: String },

    /// Read attempted against a variable the manifest does not describe
    #[error("variable {variable} not found in manifest for {source_id}")]
    VariableNotFound { source_id: String, variable: String },

    /// Invalid hyperslab selection
    #[error("invalid selection for variable {variable}: {reason}")]
    InvalidSelection { variable: String, reason: String },

    /// No fetcher handles the source identifier's scheme
    #[error("no byte range fetcher for source {source_id}")]
    UnsupportedSourceScheme { source_id: String },

    /// A local source outside the local root
    #[error("access to source {source_id} is denied")]
    SourceAccessDenied { source_id: String },

    /// An HTTP source answered a range request with an unexpected status
    #[error("HTTP source {source_id} responded with status {status}")]
    HttpStatus { source_id: String, status: u16 },

    /// Error sending a request to an HTTP source
    #[error("error retrieving data over HTTP")]
    Http(#[from] reqwest::Error),

    /// Remove attempted on a manifest that is locked
    #[error("manifest {name} is locked")]
    StoreLockContention { name: String },

    /// Manifest store filesystem failure
    #[error("manifest store I/O error on {path}")]
    StoreIo {
        path: String,
        #[source]
        cause: std::io::Error,
    },

    /// Manifest store index failure
    #[error("manifest store index error")]
    StoreIndex(#[from] sled::Error),

    /// Insufficient memory to process a read
    #[error("Insufficient memory to process request ({requested} > {total})")]
    InsufficientMemory { requested: usize, total: usize },

    /// Error converting from bytes to a type
    #[error("failed to convert from bytes to {type_name}")]
    FromBytes { type_name: &'static str },

    /// I/O error
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Error (de)serialising JSON
    #[error("failed to (de)serialise JSON")]
    Json(#[from] serde_json::Error),

    /// Error deserialising request data
    #[error("request data is not valid")]
    RequestDataJsonRejection(#[from] JsonRejection),

    /// Error validating request data (single error)
    #[error("request data is not valid")]
    RequestDataValidationSingle(#[from] validator::ValidationError),

    /// Error validating request data (multiple errors)
    #[error("request data is not valid")]
    RequestDataValidation(#[from] validator::ValidationErrors),

    /// Error reading object data from S3
    #[error("error receiving object from S3 storage")]
    S3ByteStream(#[from] ByteStreamError),

    /// Missing Content-Length header in S3 response.
    #[error("S3 response missing Content-Length header")]
    S3ContentLengthMissing,

    /// Error while retrieving an object from S3
    #[error("error retrieving object from S3 storage")]
    S3GetObject(#[from] SdkError<GetObjectError>),

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// Error creating ndarray view from shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ShapeError),

    /// Error formatting a timestamp
    #[error("failed to format timestamp")]
    TimeFormat(#[from] time::error::Format),

    /// A chunk task panicked or was cancelled
    #[error("chunk task failed")]
    TaskFailure(#[from] tokio::task::JoinError),

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),
}

impl DmrppError {
    /// Wrap an I/O error with the store path it occurred on.
    pub(crate) fn store_io(path: &std::path::Path, cause: std::io::Error) -> Self {
        DmrppError::StoreIo {
            path: path.display().to_string(),
            cause,
        }
    }
}

impl IntoResponse for DmrppError {
    /// Convert from a `DmrppError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Main error message
    message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    fn new<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        let mut causes = Vec::new();
        let mut current = error.source();
        while let Some(source) = current {
            causes.push(source.to_string());
            current = source.source();
        }
        causes.dedup();
        ErrorBody {
            message: error.to_string(),
            caused_by: (!causes.is_empty()).then_some(causes),
        }
    }
}

/// A response to send in error cases
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl ErrorResponse {
    /// Return a new ErrorResponse
    ///
    /// # Arguments
    ///
    /// * `status`: HTTP status of the response
    /// * `error`: The error that occurred. This will be formatted into a suitable `ErrorBody`
    fn new<E>(status: StatusCode, error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        ErrorResponse {
            status,
            error: ErrorBody::new(error),
        }
    }
}

/// Returns the HTTP status used to report an error.
fn status_of(error: &DmrppError) -> StatusCode {
    match error {
        DmrppError::InvalidSelection { .. }
        | DmrppError::InvalidFillValue { .. }
        | DmrppError::InvalidManifest { .. }
        | DmrppError::InsufficientMemory { .. }
        | DmrppError::Json(_)
        | DmrppError::RequestDataJsonRejection(_)
        | DmrppError::RequestDataValidationSingle(_)
        | DmrppError::RequestDataValidation(_)
        | DmrppError::ShapeInvalid(_) => StatusCode::BAD_REQUEST,

        DmrppError::ManifestNotFound { .. } | DmrppError::VariableNotFound { .. } => {
            StatusCode::NOT_FOUND
        }

        DmrppError::SourceAccessDenied { .. } => StatusCode::FORBIDDEN,

        DmrppError::StoreLockContention { .. } => StatusCode::CONFLICT,

        DmrppError::UnsupportedLayout { .. }
        | DmrppError::UnsupportedFilter { .. }
        | DmrppError::UnsupportedElementType { .. }
        | DmrppError::UnsupportedSourceScheme { .. }
        | DmrppError::MissingRequiredMetadata { .. } => StatusCode::UNPROCESSABLE_ENTITY,

        DmrppError::ChunkFetchFailure { cause, .. } => match cause.as_ref() {
            DmrppError::S3GetObject(SdkError::ServiceError(service_error))
                if service_error.err().is_no_such_key() =>
            {
                StatusCode::NOT_FOUND
            }
            DmrppError::HttpStatus { status: 404, .. } => StatusCode::NOT_FOUND,
            DmrppError::SourceAccessDenied { .. } => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_GATEWAY,
        },

        DmrppError::SourceOpenFailure { .. }
        | DmrppError::InvalidChunk { .. }
        | DmrppError::ChunkDecodeFailure { .. }
        | DmrppError::FilterVerificationFailure { .. }
        | DmrppError::StoreIo { .. }
        | DmrppError::StoreIndex(_)
        | DmrppError::FromBytes { .. }
        | DmrppError::Io(_)
        | DmrppError::S3ByteStream(_)
        | DmrppError::S3ContentLengthMissing
        | DmrppError::S3GetObject(_)
        | DmrppError::HttpStatus { .. }
        | DmrppError::Http(_)
        | DmrppError::SemaphoreAcquireError(_)
        | DmrppError::TaskFailure(_)
        | DmrppError::TimeFormat(_)
        | DmrppError::TryFromInt(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<DmrppError> for ErrorResponse {
    /// Convert from a `DmrppError` into an `ErrorResponse`.
    fn from(error: DmrppError) -> Self {
        let response = ErrorResponse::new(status_of(&error), &error);

        // Log server errors.
        if response.status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        response
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        match serde_json::to_string_pretty(&self) {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hyper::HeaderMap;

    // Jump through the hoops to get the body as a string.
    async fn body_string(response: Response) -> String {
        String::from_utf8(
            hyper::body::to_bytes(response.into_body())
                .await
                .unwrap()
                .to_vec(),
        )
        .unwrap()
    }

    async fn test_dmrpp_error(
        error: DmrppError,
        status: StatusCode,
        message: &str,
        caused_by: Option<Vec<&'static str>>,
    ) {
        let response = error.into_response();
        assert_eq!(status, response.status());
        let mut headers = HeaderMap::new();
        headers.insert(&header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert_eq!(headers, *response.headers());
        let error_response: ErrorResponse =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(message.to_string(), error_response.error.message);
        let caused_by = caused_by.map(|cb| cb.iter().map(|s| s.to_string()).collect());
        assert_eq!(caused_by, error_response.error.caused_by);
    }

    #[tokio::test]
    async fn source_open_failure() {
        let error = DmrppError::SourceOpenFailure {
            source_id: "/data/foo.h5".to_string(),
            reason: "bad signature".to_string(),
        };
        let message = "failed to open source /data/foo.h5: bad signature";
        test_dmrpp_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, None).await;
    }

    #[tokio::test]
    async fn unsupported_filter() {
        let error = DmrppError::UnsupportedFilter {
            variable: "/sst".to_string(),
            id: 32001,
            name: "blosc".to_string(),
        };
        let message = "unsupported filter 32001 (blosc) on variable /sst";
        test_dmrpp_error(error, StatusCode::UNPROCESSABLE_ENTITY, message, None).await;
    }

    #[tokio::test]
    async fn missing_required_metadata() {
        let error = DmrppError::MissingRequiredMetadata {
            variable: "/lat".to_string(),
            reason: "root attribute Latitude Step is absent".to_string(),
        };
        let message =
            "missing required metadata for variable /lat: root attribute Latitude Step is absent";
        test_dmrpp_error(error, StatusCode::UNPROCESSABLE_ENTITY, message, None).await;
    }

    #[tokio::test]
    async fn chunk_fetch_failure() {
        let io_error = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let error = DmrppError::ChunkFetchFailure {
            source_id: "/data/foo.h5".to_string(),
            variable: "/sst".to_string(),
            position: vec![0, 2],
            offset: 100,
            length: 20,
            cause: Box::new(DmrppError::Io(io_error)),
        };
        let message = "failed to fetch chunk [0, 2] of variable /sst (bytes 100..120 of /data/foo.h5)";
        let caused_by = Some(vec!["I/O error", "short read"]);
        test_dmrpp_error(error, StatusCode::BAD_GATEWAY, message, caused_by).await;
    }

    #[tokio::test]
    async fn chunk_fetch_failure_http_not_found() {
        let error = DmrppError::ChunkFetchFailure {
            source_id: "https://example.com/foo.h5".to_string(),
            variable: "/sst".to_string(),
            position: vec![0],
            offset: 0,
            length: 8,
            cause: Box::new(DmrppError::HttpStatus {
                source_id: "https://example.com/foo.h5".to_string(),
                status: 404,
            }),
        };
        let message = "failed to fetch chunk [0] of variable /sst \
                       (bytes 0..8 of https://example.com/foo.h5)";
        let caused_by = Some(vec![
            "HTTP source https://example.com/foo.h5 responded with status 404",
        ]);
        test_dmrpp_error(error, StatusCode::NOT_FOUND, message, caused_by).await;
    }

    #[tokio::test]
    async fn chunk_fetch_failure_access_denied() {
        let error = DmrppError::ChunkFetchFailure {
            source_id: "/etc/passwd".to_string(),
            variable: "/sst".to_string(),
            position: vec![0],
            offset: 0,
            length: 8,
            cause: Box::new(DmrppError::SourceAccessDenied {
                source_id: "/etc/passwd".to_string(),
            }),
        };
        let message = "failed to fetch chunk [0] of variable /sst (bytes 0..8 of /etc/passwd)";
        let caused_by = Some(vec!["access to source /etc/passwd is denied"]);
        test_dmrpp_error(error, StatusCode::FORBIDDEN, message, caused_by).await;
    }

    #[tokio::test]
    async fn source_access_denied() {
        let error = DmrppError::SourceAccessDenied {
            source_id: "/etc/passwd".to_string(),
        };
        let message = "access to source /etc/passwd is denied";
        test_dmrpp_error(error, StatusCode::FORBIDDEN, message, None).await;
    }

    #[tokio::test]
    async fn chunk_decode_failure() {
        let error = DmrppError::ChunkDecodeFailure {
            source_id: "/data/foo.h5".to_string(),
            variable: "/sst".to_string(),
            position: vec![2],
            cause: FilterError::LengthMismatch {
                expected: 8,
                actual: 6,
            },
        };
        let message = "failed to decode chunk [2] of variable /sst from /data/foo.h5";
        let caused_by = Some(vec!["decoded length 6 does not match expected length 8"]);
        test_dmrpp_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, caused_by).await;
    }

    #[tokio::test]
    async fn filter_verification_failure() {
        let error = DmrppError::FilterVerificationFailure {
            source_id: "/data/foo.h5".to_string(),
            variable: "/sst".to_string(),
            position: vec![0],
            cause: FilterError::ChecksumMismatch {
                stored: 1,
                computed: 2,
            },
        };
        let message = "checksum verification failed for chunk [0] of variable /sst from /data/foo.h5";
        let caused_by = Some(vec![
            "fletcher32 checksum mismatch (stored 0x00000001, computed 0x00000002)",
        ]);
        test_dmrpp_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, caused_by).await;
    }

    #[tokio::test]
    async fn manifest_not_found() {
        let error = DmrppError::ManifestNotFound {
            name: "foo.h5".to_string(),
        };
        test_dmrpp_error(error, StatusCode::NOT_FOUND, "manifest foo.h5 not found", None).await;
    }

    #[tokio::test]
    async fn store_lock_contention() {
        let error = DmrppError::StoreLockContention {
            name: "foo.h5".to_string(),
        };
        test_dmrpp_error(error, StatusCode::CONFLICT, "manifest foo.h5 is locked", None).await;
    }

    #[tokio::test]
    async fn invalid_selection() {
        let error = DmrppError::InvalidSelection {
            variable: "/sst".to_string(),
            reason: "stride must be at least 1".to_string(),
        };
        let message = "invalid selection for variable /sst: stride must be at least 1";
        test_dmrpp_error(error, StatusCode::BAD_REQUEST, message, None).await;
    }

    #[tokio::test]
    async fn request_data_validation() {
        let mut validation_errors = validator::ValidationErrors::new();
        let validation_error = validator::ValidationError::new("foo");
        validation_errors.add("bar", validation_error);
        let error = DmrppError::RequestDataValidation(validation_errors);
        let message = "request data is not valid";
        let caused_by = Some(vec!["bar: Validation error: foo [{}]"]);
        test_dmrpp_error(error, StatusCode::BAD_REQUEST, message, caused_by).await;
    }

    #[tokio::test]
    async fn semaphore_acquire_error() {
        let sem = tokio::sync::Semaphore::new(1);
        sem.close();
        let error = DmrppError::SemaphoreAcquireError(sem.acquire().await.unwrap_err());
        let message = "error acquiring resources";
        let caused_by = Some(vec!["semaphore closed"]);
        test_dmrpp_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, caused_by).await;
    }

    #[tokio::test]
    async fn insufficient_memory() {
        let error = DmrppError::InsufficientMemory {
            requested: 2,
            total: 1,
        };
        let message = "Insufficient memory to process request (2 > 1)";
        test_dmrpp_error(error, StatusCode::BAD_REQUEST, message, None).await;
    }
}
