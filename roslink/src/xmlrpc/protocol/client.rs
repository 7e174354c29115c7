use std::time::Duration;

use dxr::{DxrError, Fault, FaultResponse, MethodCall, MethodResponse, TryFromValue, Value};
use url::Url;

use crate::xmlrpc::protocol::ApiResponse;

// A slimmed-down dxr_client with the ROS1 response convention baked in.

/// HTTP timeout applied to master and slave calls unless overridden.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The response did not match the `(code, message, value)` shape, or the
    /// value did not convert to the caller's expected type.
    #[error("malformed ROS API result: {0}")]
    MalformedResult(String),
    /// The callee answered with a non-success status code.
    #[error("remote ROS API error (code {code}): {message}")]
    Remote { code: i32, message: String },
    #[error(transparent)]
    Net(#[from] reqwest::Error),
    #[error(transparent)]
    RpcFault(#[from] Fault),
}

impl From<DxrError> for ClientError {
    fn from(value: DxrError) -> Self {
        ClientError::MalformedResult(value.to_string())
    }
}

#[derive(Clone)]
pub struct Client {
    url: Url,
    client: reqwest::Client,
}

impl Client {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    pub async fn call_raw(&self, method: &str, params: Vec<Value>) -> Result<Value, ClientError> {
        self.call_with_timeout(method, params, DEFAULT_CALL_TIMEOUT)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let body = Self::request_to_body(&MethodCall::new(method, params))?;

        let request = self
            .client
            .post(self.url.clone())
            .timeout(timeout)
            .body(body)
            .build()?;

        let response = self.client.execute(request).await?;

        Self::response_to_result(&response.text().await?)
    }

    fn request_to_body(call: &MethodCall) -> Result<String, DxrError> {
        let body = [
            r#"<?xml version="1.0"?>"#,
            dxr::serialize_xml(call)
                .map_err(|error| DxrError::invalid_data(error.to_string()))?
                .as_str(),
            "",
        ]
        .join("\n");

        Ok(body)
    }

    fn response_to_result(raw_response: &str) -> Result<Value, ClientError> {
        if let Ok(fault) = dxr::deserialize_xml::<FaultResponse>(raw_response) {
            return Err(Fault::try_from(fault)?.into());
        }

        let response: MethodResponse = dxr::deserialize_xml(raw_response)
            .map_err(|e| ClientError::MalformedResult(e.to_string()))?;

        // The status message attached to successes is discarded; only the
        // value matters to callers.
        match ApiResponse::try_from_value(&response.inner())? {
            ApiResponse::Success(_, data) => Ok(data),
            ApiResponse::Failure { code, message } => Err(ClientError::Remote { code, message }),
        }
    }
}
