//! # payload-schema
//!
//! A bidirectional binary payload codec driven by declarative schemas.
//!
//! A schema describes how an opaque byte string encodes a tree of named
//! values: primitive numeric fields, bit-packed sub-byte groups,
//! tag-dispatched variants, flag-conditional groups, bounded repetitions,
//! and derived fields. Given a schema and a buffer, [`Schema::decode`]
//! produces a structured record; given a schema and a record,
//! [`Schema::encode`] produces the exact byte sequence that would
//! round-trip through the decoder.
//!
//! The schema tree is accepted pre-parsed (any serde front-end can produce
//! a [`SchemaDef`]); a compact binary representation for constrained
//! devices loads through [`load_schema_binary`].
//!
//! ## Example
//!
//! ```
//! use payload_schema::{build_schema, SchemaDef, Value};
//!
//! let def: SchemaDef = serde_yaml::from_str(r#"
//!     name: dl-temp
//!     version: 1
//!     fields:
//!       - { name: temperature, type: s16, div: 10, add: -40, unit: Cel }
//! "#).unwrap();
//! let schema = build_schema(def).unwrap();
//!
//! let result = schema.decode(&[0x00, 0xE7], None).unwrap();
//! assert_eq!(result.record.get("temperature"), Some(&Value::Float(-16.9)));
//!
//! let bytes = schema.encode(&result.record).unwrap();
//! assert_eq!(bytes, vec![0x00, 0xE7]);
//! ```
//!
//! Decode and encode are pure functions over `(schema, input)`: a compiled
//! [`Schema`] is immutable and may be shared across threads freely.

pub mod binary;
pub mod bitfield;
pub mod compute;
pub mod cursor;
pub mod decoder;
pub mod encoder;
pub mod errors;
pub mod metadata;
pub mod modifier;
pub mod schema;
pub mod scope;
pub mod value;

pub use binary::{load_schema_binary, load_schema_binary_with, write_schema_binary};
pub use cursor::ByteOrder;
pub use decoder::DecodeResult;
pub use errors::{BinarySchemaError, DecodeError, DecodeFailure, EncodeError, SchemaError};
pub use metadata::Metadata;
pub use modifier::Quality;
pub use schema::{Direction, FieldMeta, Schema, SchemaDef};
pub use value::{Record, Value};

/// Compiles a pre-parsed schema tree. See [`Schema::build`].
pub fn build_schema(def: SchemaDef) -> Result<Schema, SchemaError> {
    Schema::build(def)
}

/// Decodes a payload. See [`Schema::decode`].
pub fn decode(
    schema: &Schema,
    payload: &[u8],
    metadata: Option<&Metadata>,
) -> Result<DecodeResult, DecodeFailure> {
    schema.decode(payload, metadata)
}

/// Encodes a record. See [`Schema::encode`].
pub fn encode(schema: &Schema, record: &Record) -> Result<Vec<u8>, EncodeError> {
    schema.encode(record)
}

/// Per-field metadata (`unit`, `resolution`, `ipso`, …) by dotted path.
/// See [`Schema::field_metadata`].
pub fn field_metadata<'s>(schema: &'s Schema, path: &str) -> Option<&'s FieldMeta> {
    schema.field_metadata(path)
}
