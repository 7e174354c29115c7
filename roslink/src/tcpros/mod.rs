use std::{collections::HashMap, io};

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::{msg::MessageType, time::Time};

pub mod header;
pub mod listener;
pub mod publication;
pub mod service;
pub mod subscription;

pub const ROS_WILDCARD: &str = "*";

/// A peer advertised an incompatible message fingerprint or type name.
/// Either mismatch aborts the connection before any data frames flow.
#[derive(thiserror::Error, Debug)]
pub enum HeaderMismatch {
    #[error("md5sum mismatch: {expected} != {actual}")]
    Md5 { expected: String, actual: String },
    #[error("message type mismatch: {expected} != {actual}")]
    Type { expected: String, actual: String },
}

fn are_fields_compatible(lhs: &str, rhs: &str) -> bool {
    lhs == rhs || lhs == ROS_WILDCARD || rhs == ROS_WILDCARD
}

/// Failure while establishing or running one TCPROS connection.
#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Header(#[from] header::HeaderError),
    #[error("incompatible headers: {0}")]
    Mismatch(#[from] HeaderMismatch),
}

#[derive(Debug, Clone)]
pub struct Topic {
    pub name: String,
    pub spec: TopicSpec,
}

impl Topic {
    pub fn new(name: impl Into<String>, msg_type: &MessageType) -> Self {
        Topic {
            name: name.into(),
            spec: TopicSpec {
                md5sum: msg_type.md5sum().to_string(),
                msg_type: msg_type.name().to_string(),
                msg_definition: msg_type.definition().to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopicSpec {
    pub md5sum: String,
    pub msg_type: String,
    pub msg_definition: String,
}

impl TopicSpec {
    pub fn validate_compatibility(
        &self,
        md5sum: &str,
        msg_type: &str,
    ) -> Result<(), HeaderMismatch> {
        if !are_fields_compatible(&self.md5sum, md5sum) {
            return Err(HeaderMismatch::Md5 {
                expected: self.md5sum.clone(),
                actual: md5sum.to_string(),
            });
        }

        if !are_fields_compatible(&self.msg_type, msg_type) {
            return Err(HeaderMismatch::Type {
                expected: self.msg_type.clone(),
                actual: msg_type.to_string(),
            });
        }

        Ok(())
    }
}

/// Metadata delivered alongside every inbound message, available to
/// subscriber callbacks that ask for it.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub publisher_name: String,
    pub receipt_time: Time,
    pub connection_header: HashMap<String, String>,
}

/// Read one TCPROS frame body (`u32 length` prefix stripped).
pub async fn read_tcpros_frame<R>(reader: &mut R) -> Result<Vec<u8>, io::Error>
where
    R: AsyncReadExt + Unpin,
{
    let body_length = reader.read_u32_le().await?;

    let mut buffer = vec![0u8; body_length as usize];
    reader.read_exact(&mut buffer).await?;

    Ok(buffer)
}

/// Build the on-wire form of one frame: `u32 length` then the body.
pub fn frame(body: &[u8]) -> Bytes {
    let mut framed = Vec::with_capacity(body.len() + 4);
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(body);
    Bytes::from(framed)
}
