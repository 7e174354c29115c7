use std::sync::Arc;

/// Wire-level type of a single message field.
///
/// The schema is plain data produced at runtime (by a `.msg` parser or by
/// hand in tests); the codec walks it field by field. Nested messages carry
/// their own schema by reference so shared sub-messages are stored once.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String,
    Time,
    Duration,
    Nested(Arc<MessageSchema>),
}

/// Whether a field is a scalar, a fixed-length array (no wire prefix), or a
/// variable-length array (u32 count prefix). The arity always comes from the
/// field descriptor, never from the value being encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Scalar,
    Fixed(u32),
    Dynamic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    pub arity: Arity,
}

impl FieldSpec {
    pub fn scalar(name: impl Into<String>, ty: FieldType) -> Self {
        FieldSpec {
            name: name.into(),
            ty,
            arity: Arity::Scalar,
        }
    }

    pub fn fixed_array(name: impl Into<String>, ty: FieldType, len: u32) -> Self {
        FieldSpec {
            name: name.into(),
            ty,
            arity: Arity::Fixed(len),
        }
    }

    pub fn dynamic_array(name: impl Into<String>, ty: FieldType) -> Self {
        FieldSpec {
            name: name.into(),
            ty,
            arity: Arity::Dynamic,
        }
    }
}

/// Ordered field list of one message type. Declaration order is the wire
/// order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageSchema {
    fields: Vec<FieldSpec>,
}

impl MessageSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        MessageSchema { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }
}
