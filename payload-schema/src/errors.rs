//! Error types for schema construction, the binary schema format, and the
//! decode/encode drivers.
//!
//! Fatal conditions are errors; observational conditions (`out_of_range`
//! quality tags, unknown TLV tags under a non-`error` policy, trailing bytes
//! on non-strict schemas) surface through [`DecodeResult`] instead and never
//! abort a call.
//!
//! [`DecodeResult`]: crate::decoder::DecodeResult

use crate::value::{Record, Value};
use thiserror::Error;

/// Errors raised while building a [`Schema`] from its definition tree.
///
/// [`Schema`]: crate::schema::Schema
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema version must be a positive integer")]
    InvalidVersion,

    #[error("schema must declare exactly one of `fields` or `ports`")]
    FieldsOrPorts,

    #[error("field `{0}` is defined twice in the same scope")]
    DuplicateField(String),

    #[error("reference `${0}` does not resolve to an earlier field")]
    UnresolvedReference(String),

    #[error("unknown definition `{0}` in `use`")]
    UnknownDefinition(String),

    #[error("definition `{0}` is part of a `use` cycle")]
    RecursiveUse(String),

    #[error("unknown field type `{0}`")]
    UnknownType(String),

    #[error("invalid bit notation `{0}`")]
    InvalidBitNotation(String),

    #[error("invalid transform `{0}`")]
    InvalidTransform(String),

    #[error("invalid predicate `{0}`")]
    InvalidPredicate(String),

    #[error("invalid byte order `{0}` (expected `big` or `little`)")]
    InvalidByteOrder(String),

    #[error("nibble decimals wider than one byte are not supported (`{0}`)")]
    MultiByteDecimal(String),

    #[error("legacy `formula` expressions are not supported")]
    UnsupportedFormula,

    #[error("field `{name}`: {reason}")]
    InvalidField { name: String, reason: String },
}

/// Errors raised by the compact binary schema loader and writer.
#[derive(Debug, Error)]
pub enum BinarySchemaError {
    #[error("bad magic, expected `PS`")]
    BadMagic,

    #[error("unsupported binary schema version {0}")]
    UnsupportedVersion(u8),

    #[error("binary schema truncated at offset {0}")]
    Truncated(usize),

    #[error("field record {index}: unknown option kind {kind:#04x}")]
    UnknownOption { index: usize, kind: u8 },

    #[error("field record {index}: unknown type code {code:#04x}")]
    UnknownTypeCode { index: usize, code: u8 },

    #[error("field record {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },

    #[error("schema cannot be expressed in the binary format: {0}")]
    Unrepresentable(String),
}

/// Fatal decode conditions: `short-buffer`, `undefined-variable`,
/// `match-no-case`, `unknown-tag` under the `error` policy, strict
/// `trailing-bytes`, `unsupported`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("short buffer: need {needed} byte(s) at offset {offset}, {available} available")]
    ShortBuffer {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("undefined variable `${0}`")]
    UndefinedVariable(String),

    #[error("match `{name}`: no case for selector value {value}")]
    MatchNoCase { name: String, value: Value },

    #[error("TLV `{name}`: unknown tag {tag}")]
    UnknownTag { name: String, tag: String },

    #[error("{0} byte(s) left after decoding (schema is strict)")]
    TrailingBytes(usize),

    #[error("repeat `{name}` produced {count} item(s), outside {min}..={max}")]
    RepeatBounds {
        name: String,
        count: usize,
        min: usize,
        max: usize,
    },

    #[error("no sub-schema for port {0}")]
    NoPortSchema(u32),

    #[error("schema routes by port but the metadata carries none")]
    MissingPort,

    #[error("field `{field}`: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("unsupported construct: {0}")]
    Unsupported(String),
}

/// A failed decode: the tagged error plus whatever was decoded before the
/// failure and the byte position the cursor had reached.
#[derive(Debug, Error)]
#[error("{error} (at byte {position})")]
pub struct DecodeFailure {
    #[source]
    pub error: DecodeError,
    pub partial: Record,
    pub position: usize,
}

/// Fatal encode conditions: `missing-input`, `flag-mismatch`,
/// `match-no-case`, `unsupported`.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("missing input for field `{0}`")]
    MissingInput(String),

    #[error("flags field `{field}` is {given:#x} but the present groups imply {computed:#x}")]
    FlagMismatch {
        field: String,
        given: u64,
        computed: u64,
    },

    #[error("match `{name}`: no case for selector value {value}")]
    MatchNoCase { name: String, value: Value },

    #[error("field `{field}`: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("schema routes by port; use `encode_with_port`")]
    MissingPort,

    #[error("no sub-schema for port {0}")]
    NoPortSchema(u32),

    #[error("unsupported construct: {0}")]
    Unsupported(String),
}

impl DecodeError {
    /// Attaches a field name to errors minted below the field layer.
    pub(crate) fn for_field(self, name: &str) -> Self {
        match self {
            DecodeError::InvalidValue { field, reason } if field.is_empty() => {
                DecodeError::InvalidValue {
                    field: name.to_string(),
                    reason,
                }
            }
            other => other,
        }
    }
}

impl EncodeError {
    /// Attaches a field name to errors minted below the field layer.
    pub(crate) fn for_field(self, name: &str) -> Self {
        match self {
            EncodeError::InvalidValue { field, reason } if field.is_empty() => {
                EncodeError::InvalidValue {
                    field: name.to_string(),
                    reason,
                }
            }
            other => other,
        }
    }
}
