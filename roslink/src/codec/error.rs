/// Errors produced by the wire codec.
///
/// `Field` wraps a nested failure with the offending field's name so that a
/// deeply nested decode reports a usable path instead of a bare byte count.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("buffer too short: needed {needed} byte(s), {remaining} remaining")]
    ShortBuffer { needed: usize, remaining: usize },
    #[error("unexpected negative size: {0}")]
    NegativeSize(i64),
    #[error("field \"{name}\": {source}")]
    Field {
        name: String,
        #[source]
        source: Box<CodecError>,
    },
    #[error("value does not match field type: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("fixed array length mismatch: declared {declared}, value has {actual}")]
    FixedArrayLength { declared: u32, actual: usize },
    #[error("message has no field named \"{0}\"")]
    UnknownField(String),
}

impl CodecError {
    /// Attach a field name to an error bubbling out of a sub-decode.
    pub fn in_field(self, name: &str) -> Self {
        CodecError::Field {
            name: name.to_string(),
            source: Box::new(self),
        }
    }
}

pub type CodecResult<T> = Result<T, CodecError>;
