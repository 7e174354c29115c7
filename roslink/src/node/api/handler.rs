use dxr::{DxrError, TryToValue, Value};

use crate::xmlrpc::protocol::{ApiResponse, RPC_ERROR, RPC_FAILURE};

pub type HandlerResult = Result<HandlerResponse, HandlerFailure>;

/// A non-success outcome, carried back to the caller through the standard
/// `(code, message, value)` triplet.
#[derive(Debug)]
pub struct HandlerFailure {
    pub code: i32,
    pub message: String,
}

impl From<DxrError> for HandlerFailure {
    fn from(value: DxrError) -> Self {
        invalid_request(format!("Invalid parameters: {value}"))
    }
}

impl From<HandlerFailure> for ApiResponse {
    fn from(value: HandlerFailure) -> Self {
        ApiResponse::Failure {
            code: value.code,
            message: value.message,
        }
    }
}

pub fn server_error(message: impl Into<String>) -> HandlerFailure {
    HandlerFailure {
        code: RPC_FAILURE,
        message: message.into(),
    }
}

pub fn invalid_request(message: impl Into<String>) -> HandlerFailure {
    HandlerFailure {
        code: RPC_ERROR,
        message: message.into(),
    }
}

pub struct HandlerResponse {
    msg: String,
    data: Value,
}

impl HandlerResponse {
    pub fn new<D>(msg: impl Into<String>, data: D) -> Result<Self, HandlerFailure>
    where
        D: TryToValue,
    {
        Ok(Self {
            msg: msg.into(),
            data: data
                .try_to_value()
                .map_err(|e| server_error(format!("Failed to encode response: {e}")))?,
        })
    }
}

impl From<HandlerResponse> for ApiResponse {
    fn from(value: HandlerResponse) -> Self {
        ApiResponse::Success(value.msg, value.data)
    }
}

#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, params: &[Value]) -> HandlerResult;
}
