//! Request-scoped error taxonomy and its mapping onto status codes. Error
//! bodies are always `{"error": <message>}`; messages never carry
//! credentials or token bytes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// Write attempted in read-only mode.
    ReadOnly,
    Conflict(String),
    /// A required capability was denied; answered locally, no cluster call.
    CapabilityDenied { capability: String },
    /// Cluster client or mirror not ready.
    NotReady(String),
    /// Upstream cluster error passed through with its own status.
    Upstream(StatusCode, String),
    Unsupported(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ReadOnly => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::CapabilityDenied { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(code, _) => *code,
            ApiError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(m)
            | ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::NotReady(m)
            | ApiError::Unsupported(m)
            | ApiError::Internal(m) => m.clone(),
            ApiError::ReadOnly => "read-only mode: write operations disabled".to_string(),
            ApiError::CapabilityDenied { capability } => {
                format!("capability denied: {}", capability)
            }
            ApiError::Upstream(_, m) => m.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({ "error": self.message() }));
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<kube::Error> for ApiError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => {
                let status =
                    StatusCode::from_u16(ae.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                match ae.code {
                    404 => ApiError::NotFound(ae.message),
                    409 => ApiError::Conflict(ae.message),
                    _ => ApiError::Upstream(status, ae.message),
                }
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<vantage_image::ImageError> for ApiError {
    fn from(e: vantage_image::ImageError) -> Self {
        use vantage_image::ImageError::*;
        match &e {
            NotFound(_) => ApiError::NotFound(e.to_string()),
            Auth(_) | Registry(_) => ApiError::Upstream(StatusCode::BAD_GATEWAY, e.to_string()),
            LimitsExceeded(_) => {
                ApiError::Upstream(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            Cancelled => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<vantage_helm::ReleaseError> for ApiError {
    fn from(e: vantage_helm::ReleaseError) -> Self {
        use vantage_helm::ReleaseError::*;
        match &e {
            NotFound(_) => ApiError::NotFound(e.to_string()),
            Unsupported(_) => ApiError::Unsupported(e.to_string()),
            Storage(_) => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::ReadOnly.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            ApiError::CapabilityDenied { capability: "portForward".into() }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Conflict("busy".into()).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn capability_denial_message_names_the_capability() {
        let e = ApiError::CapabilityDenied { capability: "portForward".into() };
        assert_eq!(e.message(), "capability denied: portForward");
    }
}
