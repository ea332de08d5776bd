//! Maps [`ProxyError`] onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

use crate::domain::errors::ProxyError;

/// Status code for each error kind.
#[must_use]
pub const fn status_for(error: &ProxyError) -> StatusCode {
    match error {
        ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
        ProxyError::Forbidden { .. } => StatusCode::FORBIDDEN,
        ProxyError::Pipeline(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ProxyError::UpstreamFetch { .. } | ProxyError::Transform { .. } => StatusCode::BAD_GATEWAY,
        ProxyError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if self.is_client_error() {
            debug!(kind = self.kind(), error = %self, "Request rejected");
        } else {
            error!(kind = self.kind(), error = %self, "Request failed");
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.kind(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{PipelineError, StorageError, ValidationError};
    use test_case::test_case;

    #[test_case(ValidationError::single("url is required").into(), StatusCode::BAD_REQUEST ; "validation")]
    #[test_case(ProxyError::forbidden("nope"), StatusCode::FORBIDDEN ; "forbidden")]
    #[test_case(ProxyError::upstream("down"), StatusCode::BAD_GATEWAY ; "upstream")]
    #[test_case(PipelineError::unsupported("sepia").into(), StatusCode::UNPROCESSABLE_ENTITY ; "pipeline")]
    #[test_case(ProxyError::transform("codec"), StatusCode::BAD_GATEWAY ; "transform")]
    #[test_case(StorageError::io("disk").into(), StatusCode::INTERNAL_SERVER_ERROR ; "storage")]
    fn test_status_mapping(error: ProxyError, expected: StatusCode) {
        assert_eq!(error.into_response().status(), expected);
    }
}
