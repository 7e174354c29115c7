//! Runtime message model: explicit schemas, type metadata, and
//! dynamically-typed message instances.
//!
//! Parsing `.msg` definition text into a schema is the concern of a message
//! generator and is not done here; callers construct [`MessageSchema`]
//! values directly (see the `std_msgs` helpers in the test crates for
//! examples).

mod dynamic;
mod schema;

use std::sync::Arc;

use md5::{Digest, Md5};

pub use {
    dynamic::{DynamicMessage, Value},
    schema::{Arity, FieldSpec, FieldType, MessageSchema},
};

/// Metadata describing one wire-level message type.
///
/// Two peers exchange `md5sum` and `name` during the TCPROS handshake and
/// refuse to talk when they disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageType {
    name: String,
    md5sum: String,
    definition: String,
    schema: Arc<MessageSchema>,
}

impl MessageType {
    /// A runtime-defined type: the fingerprint is the MD5 of the definition
    /// text, keeping the md5-matches-definition invariant without a
    /// canonicalizing parser.
    pub fn dynamic(
        name: impl Into<String>,
        definition: impl Into<String>,
        schema: MessageSchema,
    ) -> Self {
        let definition = definition.into();

        let mut hasher = Md5::new();
        hasher.update(definition.as_bytes());
        let md5sum = format!("{:x}", hasher.finalize());

        MessageType {
            name: name.into(),
            md5sum,
            definition,
            schema: Arc::new(schema),
        }
    }

    /// A type whose fingerprint was computed elsewhere (e.g. by a message
    /// generator over the canonical text form). Required for interop with
    /// non-roslink peers.
    pub fn with_md5(
        name: impl Into<String>,
        definition: impl Into<String>,
        md5sum: impl Into<String>,
        schema: MessageSchema,
    ) -> Self {
        MessageType {
            name: name.into(),
            md5sum: md5sum.into(),
            definition: definition.into(),
            schema: Arc::new(schema),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn md5sum(&self) -> &str {
        &self.md5sum
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn schema(&self) -> &Arc<MessageSchema> {
        &self.schema
    }

    /// Construct the zero-valued message of this type.
    pub fn new_message(&self) -> DynamicMessage {
        DynamicMessage::new(self.schema.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_type_fingerprints_its_definition() {
        let ty = MessageType::dynamic(
            "demo_msgs/Empty",
            "# no fields\n",
            MessageSchema::default(),
        );

        // Stable: md5 of the definition text itself.
        assert_eq!(ty.md5sum().len(), 32);
        assert_eq!(
            ty.md5sum(),
            MessageType::dynamic("other/Name", "# no fields\n", MessageSchema::default()).md5sum()
        );
    }
}
