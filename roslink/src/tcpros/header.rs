//! TCPROS connection-header codec.
//!
//! A header is a `u32` total length followed by repeated `u32` field length
//! plus `key=value` ASCII fields. See <http://wiki.ros.org/ROS/TCPROS> and
//! <http://wiki.ros.org/ROS/Connection%20Header>.

use std::{collections::HashMap, string::FromUtf8Error};

use byteorder::{ByteOrder, LittleEndian};
use tokio::io::AsyncReadExt;

use crate::tcpros;

const ERROR_FIELD: &str = "error";

fn default_callerid() -> String {
    String::from("unknown callerid")
}

#[derive(thiserror::Error, Debug)]
pub enum HeaderError {
    #[error("header had an invalid length: expected {expected}, actual {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("field did not match the key=value format: {0}")]
    InvalidFormat(String),
    #[error("invalid boolean field value: {0}")]
    InvalidBool(String),
    #[error("required header field missing: {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("peer reported a TCPROS error: {0}")]
    Peer(String),
}

/// The raw `key=value` fields of one header frame, in wire order.
#[derive(Debug, Clone, Default)]
pub struct RawHeader {
    fields: Vec<(String, String)>,
}

impl RawHeader {
    pub fn new() -> Self {
        RawHeader::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    pub fn push_bool(&mut self, key: impl Into<String>, value: bool) {
        self.push(key, if value { "1" } else { "0" });
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, key: &'static str) -> Result<String, HeaderError> {
        self.get(key)
            .map(str::to_string)
            .ok_or(HeaderError::MissingField(key))
    }

    fn get_bool(&self, key: &str) -> Result<bool, HeaderError> {
        match self.get(key) {
            None | Some("0") => Ok(false),
            Some("1") => Ok(true),
            Some(other) => Err(HeaderError::InvalidBool(other.to_string())),
        }
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.fields.iter().cloned().collect()
    }

    /// Encode including the leading total-length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; 4];

        for (key, value) in &self.fields {
            let field = format!("{key}={value}");
            buffer.extend_from_slice(&(field.len() as u32).to_le_bytes());
            buffer.extend_from_slice(field.as_bytes());
        }

        let total = (buffer.len() - 4) as u32;
        LittleEndian::write_u32(&mut buffer[..4], total);
        buffer
    }

    /// Parse a header frame body (total-length prefix already stripped).
    ///
    /// A peer that includes an `error` field rarely sends anything else, so
    /// the parse aborts with `Peer` as soon as one is seen.
    pub fn from_body(body: &[u8]) -> Result<Self, HeaderError> {
        let mut fields = Vec::new();
        let mut cursor = 0usize;

        while cursor < body.len() {
            if body.len() - cursor < 4 {
                return Err(HeaderError::InvalidLength {
                    expected: cursor + 4,
                    actual: body.len(),
                });
            }

            let field_length = LittleEndian::read_u32(&body[cursor..cursor + 4]) as usize;
            cursor += 4;

            if body.len() - cursor < field_length {
                return Err(HeaderError::InvalidLength {
                    expected: cursor + field_length,
                    actual: body.len(),
                });
            }

            let raw_field = String::from_utf8(body[cursor..cursor + field_length].to_vec())?;
            cursor += field_length;

            let (key, value) = raw_field
                .split_once('=')
                .ok_or_else(|| HeaderError::InvalidFormat(raw_field.clone()))?;

            if key == ERROR_FIELD {
                return Err(HeaderError::Peer(value.to_string()));
            }

            fields.push((key.to_string(), value.to_string()));
        }

        Ok(RawHeader { fields })
    }

    pub async fn from_async_read<R>(reader: &mut R) -> Result<Self, HeaderError>
    where
        R: AsyncReadExt + Unpin,
    {
        Self::from_body(&tcpros::read_tcpros_frame(reader).await?)
    }
}

/// Header sent by a subscriber when dialing a publisher.
#[derive(Debug, Clone)]
pub struct SubscriberHeader {
    pub caller_id: String,
    pub topic: String,
    pub md5sum: String,
    pub msg_type: String,
    pub msg_definition: String,
    pub tcp_nodelay: bool,
}

impl SubscriberHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = RawHeader::new();
        raw.push("callerid", &self.caller_id);
        raw.push("topic", &self.topic);
        raw.push("md5sum", &self.md5sum);
        raw.push("type", &self.msg_type);
        raw.push("message_definition", &self.msg_definition);
        raw.push_bool("tcp_nodelay", self.tcp_nodelay);
        raw.to_bytes()
    }

    pub fn from_raw(raw: &RawHeader) -> Result<Self, HeaderError> {
        Ok(SubscriberHeader {
            caller_id: raw.get("callerid").map(str::to_string).unwrap_or_else(default_callerid),
            topic: raw.require("topic")?,
            md5sum: raw.require("md5sum")?,
            msg_type: raw.require("type")?,
            msg_definition: raw.get("message_definition").unwrap_or_default().to_string(),
            tcp_nodelay: raw.get_bool("tcp_nodelay")?,
        })
    }
}

/// Header a publisher replies with after validating a subscriber.
#[derive(Debug, Clone)]
pub struct PublisherHeader {
    pub caller_id: String,
    pub topic: String,
    pub md5sum: String,
    pub msg_type: String,
    pub latching: bool,
}

impl PublisherHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = RawHeader::new();
        raw.push("callerid", &self.caller_id);
        raw.push("topic", &self.topic);
        raw.push("md5sum", &self.md5sum);
        raw.push("type", &self.msg_type);
        raw.push_bool("latching", self.latching);
        raw.to_bytes()
    }

    pub fn from_raw(raw: &RawHeader) -> Result<Self, HeaderError> {
        Ok(PublisherHeader {
            caller_id: raw.get("callerid").map(str::to_string).unwrap_or_else(default_callerid),
            topic: raw.get("topic").unwrap_or_default().to_string(),
            md5sum: raw.require("md5sum")?,
            msg_type: raw.require("type")?,
            latching: raw.get_bool("latching")?,
        })
    }
}

/// Header sent by a service client when opening an RPC connection.
#[derive(Debug, Clone)]
pub struct ServiceClientHeader {
    pub caller_id: String,
    pub service: String,
    pub md5sum: String,
    pub msg_type: String,
    pub persistent: bool,
}

impl ServiceClientHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = RawHeader::new();
        raw.push("callerid", &self.caller_id);
        raw.push("service", &self.service);
        raw.push("md5sum", &self.md5sum);
        raw.push("type", &self.msg_type);
        raw.push_bool("persistent", self.persistent);
        raw.to_bytes()
    }

    pub fn from_raw(raw: &RawHeader) -> Result<Self, HeaderError> {
        Ok(ServiceClientHeader {
            caller_id: raw.get("callerid").map(str::to_string).unwrap_or_else(default_callerid),
            service: raw.require("service")?,
            md5sum: raw.require("md5sum")?,
            msg_type: raw.get("type").unwrap_or(tcpros::ROS_WILDCARD).to_string(),
            persistent: raw.get_bool("persistent")?,
        })
    }

    /// The master does not track service types; clients discover them by
    /// sending a probe header and reading the server's reply.
    pub fn probe(caller_id: &str, service: &str) -> Vec<u8> {
        let mut raw = RawHeader::new();
        raw.push("callerid", caller_id);
        raw.push("service", service);
        raw.push("md5sum", tcpros::ROS_WILDCARD);
        raw.push_bool("probe", true);
        raw.to_bytes()
    }
}

/// Header a service server replies with.
#[derive(Debug, Clone)]
pub struct ServiceServerHeader {
    pub caller_id: String,
    pub md5sum: String,
    pub msg_type: String,
}

impl ServiceServerHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = RawHeader::new();
        raw.push("callerid", &self.caller_id);
        raw.push("md5sum", &self.md5sum);
        raw.push("type", &self.msg_type);
        raw.to_bytes()
    }

    pub fn from_raw(raw: &RawHeader) -> Result<Self, HeaderError> {
        Ok(ServiceServerHeader {
            caller_id: raw.get("callerid").map(str::to_string).unwrap_or_else(default_callerid),
            md5sum: raw.require("md5sum")?,
            msg_type: raw.require("type")?,
        })
    }
}

/// Reply written to a peer whose handshake was rejected.
pub fn error_header(message: &str) -> Vec<u8> {
    let mut raw = RawHeader::new();
    raw.push(ERROR_FIELD, message);
    raw.to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Captured from a live rostopic session (the ROS wiki's reference
    // handshake bytes).
    fn wiki_header_bytes() -> Vec<u8> {
        let mut raw = RawHeader::new();
        raw.push("callerid", "/rostopic_4767_1316912741557");
        raw.push("topic", "/chatter");
        raw.push("md5sum", "992ce8a1687cec8c8bd883ec73ca41d1");
        raw.push("type", "std_msgs/String");
        raw.push("message_definition", "string data\n\n");
        raw.push("latching", "1");
        raw.to_bytes()
    }

    #[test]
    fn encode_matches_reference_layout() {
        let bytes = wiki_header_bytes();

        // Leading total length covers everything after itself.
        let total = LittleEndian::read_u32(&bytes[..4]) as usize;
        assert_eq!(total, bytes.len() - 4);

        // First field is the callerid entry.
        let first_len = LittleEndian::read_u32(&bytes[4..8]) as usize;
        assert_eq!(
            &bytes[8..8 + first_len],
            b"callerid=/rostopic_4767_1316912741557"
        );
    }

    #[test]
    fn publisher_header_round_trip() {
        let bytes = wiki_header_bytes();
        let raw = RawHeader::from_body(&bytes[4..]).unwrap();
        let header = PublisherHeader::from_raw(&raw).unwrap();

        assert_eq!(header.caller_id, "/rostopic_4767_1316912741557");
        assert_eq!(header.topic, "/chatter");
        assert_eq!(header.md5sum, "992ce8a1687cec8c8bd883ec73ca41d1");
        assert_eq!(header.msg_type, "std_msgs/String");
        assert!(header.latching);
    }

    #[test]
    fn missing_required_field_is_reported() {
        let mut raw = RawHeader::new();
        raw.push("topic", "/chatter");

        assert!(matches!(
            SubscriberHeader::from_raw(&raw),
            Err(HeaderError::MissingField("md5sum"))
        ));
    }

    #[test]
    fn error_field_aborts_the_parse() {
        let body = error_header("no such topic");

        assert!(matches!(
            RawHeader::from_body(&body[4..]),
            Err(HeaderError::Peer(msg)) if msg == "no such topic"
        ));
    }

    #[test]
    fn truncated_field_is_invalid() {
        let mut body = wiki_header_bytes()[4..].to_vec();
        body.truncate(body.len() - 3);

        assert!(matches!(
            RawHeader::from_body(&body),
            Err(HeaderError::InvalidLength { .. })
        ));
    }

    #[test]
    fn absent_callerid_uses_placeholder() {
        let mut raw = RawHeader::new();
        raw.push("topic", "/chatter");
        raw.push("md5sum", "abc");
        raw.push("type", "std_msgs/String");

        let header = SubscriberHeader::from_raw(&raw).unwrap();
        assert_eq!(header.caller_id, "unknown callerid");
    }
}
