use md5::{Digest, Md5};

use crate::msg::MessageType;

pub mod client;
pub mod server;

/// Status byte preceding every RPC response frame.
pub const RPC_SUCCESS: u8 = 1;
pub const RPC_FAILURE: u8 = 0;

/// Metadata for one service: the request and response types plus the
/// service-level fingerprint exchanged during the handshake.
#[derive(Debug, Clone)]
pub struct ServiceType {
    name: String,
    md5sum: String,
    request: MessageType,
    response: MessageType,
}

impl ServiceType {
    /// A runtime-defined service; the fingerprint covers both definition
    /// texts, mirroring [`MessageType::dynamic`].
    pub fn dynamic(name: impl Into<String>, request: MessageType, response: MessageType) -> Self {
        let mut hasher = Md5::new();
        hasher.update(request.definition().as_bytes());
        hasher.update(b"---\n");
        hasher.update(response.definition().as_bytes());
        let md5sum = format!("{:x}", hasher.finalize());

        ServiceType {
            name: name.into(),
            md5sum,
            request,
            response,
        }
    }

    /// A service whose fingerprint was produced by a generator over the
    /// canonical `.srv` text.
    pub fn with_md5(
        name: impl Into<String>,
        md5sum: impl Into<String>,
        request: MessageType,
        response: MessageType,
    ) -> Self {
        ServiceType {
            name: name.into(),
            md5sum: md5sum.into(),
            request,
            response,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn md5sum(&self) -> &str {
        &self.md5sum
    }

    pub fn request(&self) -> &MessageType {
        &self.request
    }

    pub fn response(&self) -> &MessageType {
        &self.response
    }
}
