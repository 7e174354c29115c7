use dxr::{TryFromValue, TryToValue, Value};

pub mod client;

pub const RPC_SUCCESS: i32 = 1;
pub const RPC_FAILURE: i32 = 0;
pub const RPC_ERROR: i32 = -1;

type ResponseTuple = (i32, String, Value);

/// The ROS1 master/slave API response convention: every method returns a
/// `(code, statusMessage, value)` triplet where `1` means success, `0` a
/// failure to complete and `-1` a caller error.
///
/// More information: <https://wiki.ros.org/ROS/Master_Slave_APIs>
pub enum ApiResponse {
    Success(String, Value),
    Failure { code: i32, message: String },
}

impl ApiResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        ApiResponse::Failure {
            code: RPC_FAILURE,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        ApiResponse::Failure {
            code: RPC_ERROR,
            message: message.into(),
        }
    }
}

impl TryToValue for ApiResponse {
    fn try_to_value(&self) -> Result<Value, dxr::DxrError> {
        match self {
            ApiResponse::Success(msg, data) => (RPC_SUCCESS, msg, data.clone()),
            ApiResponse::Failure { code, message } => (*code, message, Value::i4(0)),
        }
        .try_to_value()
    }
}

impl TryFromValue for ApiResponse {
    fn try_from_value(value: &Value) -> Result<Self, dxr::DxrError> {
        let (status_code, message, data) = ResponseTuple::try_from_value(value)?;

        match status_code {
            RPC_SUCCESS => Ok(ApiResponse::Success(message, data)),
            RPC_FAILURE | RPC_ERROR => Ok(ApiResponse::Failure {
                code: status_code,
                message,
            }),
            mystery_code => Err(dxr::DxrError::InvalidData {
                error: format!("Invalid ROS status code: {mystery_code}"),
            }),
        }
    }
}
