use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::hub::{HubError, LifecycleError};

/// Generic response structure shared by all API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseBody<T: Serialize> {
    status_code: u16,
    data: T,
}

impl<T: Serialize> ResponseBody<T> {
    pub fn new(status: StatusCode, data: T) -> Self {
        Self {
            status_code: status.as_u16(),
            data,
        }
    }
}

impl HubError {
    fn status_code(&self) -> StatusCode {
        match self {
            HubError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            HubError::VerificationFailed(_) => StatusCode::CONFLICT,
            HubError::Lifecycle(LifecycleError::Transition(_)) => StatusCode::CONFLICT,
            HubError::Lifecycle(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status_code = status.as_u16(), "Request refused");
        }
        (status, Json(ResponseBody::new(status, self.to_string()))).into_response()
    }
}
