use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("asset not found: {0}")]
    AssetNotFound(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("software not found: {0}")]
    SoftwareNotFound(String),

    #[error("group has children: {0}")]
    GroupHasChildren(String),

    #[error("duplicate group name: {0}")]
    DuplicateGroupName(String),

    #[error("duplicate agent id in tenant: {0}")]
    DuplicateAsset(String),

    #[error("asset already in group")]
    AssetAlreadyInGroup,

    #[error("asset not in group")]
    AssetNotInGroup,

    #[error("group depth exceeded (max {0})")]
    GroupDepthExceeded(usize),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported event kind: {0}")]
    UnsupportedEventKind(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("kv store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("broker error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code, also used by the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::AssetNotFound(_) => "ASSET_NOT_FOUND",
            CoreError::GroupNotFound(_) => "GROUP_NOT_FOUND",
            CoreError::SoftwareNotFound(_) => "SOFTWARE_NOT_FOUND",
            CoreError::GroupHasChildren(_) => "GROUP_HAS_CHILDREN",
            CoreError::DuplicateGroupName(_) => "DUPLICATE_GROUP_NAME",
            CoreError::DuplicateAsset(_) => "DUPLICATE_ASSET",
            CoreError::AssetAlreadyInGroup => "ASSET_ALREADY_IN_GROUP",
            CoreError::AssetNotInGroup => "ASSET_NOT_IN_GROUP",
            CoreError::GroupDepthExceeded(_) => "GROUP_DEPTH_EXCEEDED",
            CoreError::InvalidRequest(_) | CoreError::UnsupportedEventKind(_) => "INVALID_REQUEST",
            CoreError::Unauthorized(_) => "UNAUTHORIZED",
            CoreError::Forbidden(_) => "FORBIDDEN",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Whether a retry can reasonably succeed. Decode, schema and size
    /// failures are terminal; network-shaped failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Serialization(_)
            | CoreError::UnsupportedEventKind(_)
            | CoreError::InvalidRequest(_)
            | CoreError::Cancelled => false,
            CoreError::Kafka(e) => !matches!(
                e,
                rdkafka::error::KafkaError::MessageProduction(
                    rdkafka::types::RDKafkaErrorCode::MessageSizeTooLarge
                )
            ),
            CoreError::Database(_)
            | CoreError::Redis(_)
            | CoreError::Io(_)
            | CoreError::Sink(_)
            | CoreError::Timeout(_) => true,
            _ => false,
        }
    }

    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        CoreError::InvalidRequest(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        CoreError::Config(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        CoreError::Internal(msg.into())
    }

    pub fn sink<S: Into<String>>(msg: S) -> Self {
        CoreError::Sink(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        CoreError::Timeout(msg.into())
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::AssetNotFound(_)
            | CoreError::GroupNotFound(_)
            | CoreError::SoftwareNotFound(_)
            | CoreError::AssetNotInGroup => StatusCode::NOT_FOUND,
            CoreError::GroupHasChildren(_)
            | CoreError::DuplicateGroupName(_)
            | CoreError::DuplicateAsset(_)
            | CoreError::AssetAlreadyInGroup => StatusCode::CONFLICT,
            CoreError::GroupDepthExceeded(_)
            | CoreError::InvalidRequest(_)
            | CoreError::UnsupportedEventKind(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal detail stays in the logs, not on the wire.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_taxonomy_is_stable() {
        assert_eq!(CoreError::AssetNotFound("x".into()).code(), "ASSET_NOT_FOUND");
        assert_eq!(CoreError::DuplicateAsset("a".into()).code(), "DUPLICATE_ASSET");
        assert_eq!(CoreError::GroupDepthExceeded(5).code(), "GROUP_DEPTH_EXCEEDED");
        assert_eq!(
            CoreError::UnsupportedEventKind("registry_write".into()).code(),
            "INVALID_REQUEST"
        );
        assert_eq!(CoreError::Internal("boom".into()).code(), "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn response_envelope_carries_code_and_message() {
        let response = CoreError::GroupHasChildren("Engineering".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "GROUP_HAS_CHILDREN");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Engineering"));
    }

    #[tokio::test]
    async fn internal_detail_stays_out_of_the_response() {
        let response = CoreError::Internal("connection string with password".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(body["error"]["message"], "internal error");
    }

    #[test]
    fn decode_failures_are_terminal() {
        let err: CoreError = serde_json::from_str::<serde_json::Value>("not json")
            .unwrap_err()
            .into();
        assert!(!err.is_retryable());
        assert!(CoreError::Timeout("fetch".into()).is_retryable());
        assert!(!CoreError::Cancelled.is_retryable());
    }
}
