use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

/// Input problems. Reported as 400 and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`{0}` must not be empty")]
    Blank(&'static str),
    #[error("malformed request body: {0}")]
    Body(String),
    #[error("invalid namespace: {0}")]
    Namespace(String),
    #[error("job {0:?} is not in the catalog")]
    UnknownJob(String),
}

impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        warn!(error = %self, "request rejected");
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

/// Failures while building a client for a resolved credential.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("CA bundle is not valid PEM: {0}")]
    CaBundle(#[source] reqwest::Error),
    #[error("bearer token contains characters not allowed in an HTTP header")]
    Token,
    #[error("failed to build HTTP client: {0}")]
    Http(#[source] reqwest::Error),
    #[error("failed to build Kubernetes client config: {0}")]
    Kubeconfig(String),
    #[error("failed to build Kubernetes client: {0}")]
    Kube(#[from] kube::Error),
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(
        "job {name:?} already exists in namespace {namespace}; \
         delete the previous run before starting it again ({message})"
    )]
    Conflict {
        name: String,
        namespace: String,
        message: String,
    },
    #[error("create jobs=denied ({message}) in namespace {namespace}")]
    Forbidden { namespace: String, message: String },
    #[error("cluster rejected the job with status {code}: {message}")]
    Rejected { code: u16, message: String },
    #[error("create call failed: {0}")]
    Transport(#[source] kube::Error),
}

/// Everything `POST /api/run-job` can answer with besides success.
#[derive(Error, Debug)]
pub enum RunJobError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("preflight failed:\n{0}")]
    Preflight(String),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

impl RunJobError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RunJobError::Validation(_) => StatusCode::BAD_REQUEST,
            RunJobError::Preflight(_) => StatusCode::SERVICE_UNAVAILABLE,
            RunJobError::Submit(SubmitError::Forbidden { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            RunJobError::Submit(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RunJobError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            error!(code = code.as_u16(), error = %self, "run-job failed");
        } else {
            warn!(code = code.as_u16(), error = %self, "run-job rejected");
        }
        (code, self.to_string()).into_response()
    }
}
