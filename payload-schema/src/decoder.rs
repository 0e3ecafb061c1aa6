//! The decode driver.
//!
//! Walks a compiled schema's field list against a [`Cursor`], dispatching
//! each field variant to its handler. Handlers share a lexical [`Scope`] so
//! later constructs can reference earlier values by `$name`. The walk
//! produces an ordered [`Record`], a parallel quality map (only fields
//! declaring a `valid_range` appear), and a warnings list for the non-fatal
//! conditions.
//!
//! On failure the driver stops and returns a [`DecodeFailure`] carrying the
//! tagged error, the partial record, and the byte position reached.

use crate::bitfield::{sign_extend, BitPos};
use crate::cursor::{ByteOrder, Cursor};
use crate::errors::{DecodeError, DecodeFailure};
use crate::metadata::{lookup_path, port_of, Metadata};
use crate::modifier::Quality;
use crate::schema::{
    Field, FieldKind, MatchDefault, RepeatCount, RepeatSpec, Schema, Selector, TagLayout, TlvCase,
    TlvRepeat, TlvSpec, UnknownTagPolicy, BytesFormat, CountSource,
};
use crate::scope::Scope;
use crate::value::{Record, Value};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use indexmap::IndexMap;
use log::{debug, trace, warn};
use serde::Serialize;

/// Everything a successful decode produces.
#[derive(Debug, Serialize)]
pub struct DecodeResult {
    pub record: Record,
    /// Quality tags, keyed by dotted field path. Present only for fields
    /// declaring a `valid_range`.
    #[serde(rename = "_quality")]
    pub quality: IndexMap<String, Quality>,
    #[serde(rename = "_warnings")]
    pub warnings: Vec<String>,
    pub bytes_consumed: usize,
    pub trailing_bytes: usize,
}

impl Schema {
    /// Decodes `payload` into a structured record.
    ///
    /// `metadata` supplies the transport port (for `ports` schemas) and any
    /// values the schema's `metadata` list asks to be copied into the
    /// result.
    pub fn decode(
        &self,
        payload: &[u8],
        metadata: Option<&Metadata>,
    ) -> Result<DecodeResult, DecodeFailure> {
        let port = port_of(metadata);
        let fields = match self.fields_for_port(port) {
            Some(fields) => fields,
            None => {
                let error = match port {
                    None => DecodeError::MissingPort,
                    Some(port) => DecodeError::NoPortSchema(port),
                };
                return Err(DecodeFailure {
                    error,
                    partial: Record::new(),
                    position: 0,
                });
            }
        };
        if let Some(port) = port {
            debug!("routing to port {port} sub-schema");
        }

        let mut walker = Walker {
            byte_order: self.byte_order,
            scope: Scope::new(),
            quality: IndexMap::new(),
            warnings: Vec::new(),
        };
        if let Some(metadata) = metadata {
            for name in &self.metadata {
                if let Some(value) = lookup_path(metadata, name) {
                    walker.scope.bind(name, value.clone());
                }
            }
        }

        let mut record = Record::new();
        let mut cursor = Cursor::new(payload);
        if let Err(error) = walker.decode_fields(fields, &mut cursor, &mut record, "") {
            return Err(DecodeFailure {
                error,
                partial: record,
                position: cursor.position(),
            });
        }
        cursor.reconcile();
        let bytes_consumed = cursor.position();

        if let Some(metadata) = metadata {
            for name in &self.metadata {
                match lookup_path(metadata, name) {
                    Some(value) => {
                        record.insert(name.clone(), value.clone());
                    }
                    None => walker
                        .warnings
                        .push(format!("metadata `{name}` was not supplied")),
                }
            }
        }

        let trailing_bytes = cursor.remaining();
        if trailing_bytes > 0 {
            if self.strict {
                return Err(DecodeFailure {
                    error: DecodeError::TrailingBytes(trailing_bytes),
                    partial: record,
                    position: bytes_consumed,
                });
            }
            warn!("{trailing_bytes} trailing byte(s) not decoded");
            walker
                .warnings
                .push(format!("{trailing_bytes} trailing byte(s) not decoded"));
        }

        Ok(DecodeResult {
            record,
            quality: walker.quality,
            warnings: walker.warnings,
            bytes_consumed,
            trailing_bytes,
        })
    }
}

struct Walker {
    byte_order: ByteOrder,
    scope: Scope,
    quality: IndexMap<String, Quality>,
    warnings: Vec<String>,
}

fn child_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

impl Walker {
    fn decode_fields(
        &mut self,
        fields: &[Field],
        cursor: &mut Cursor<'_>,
        record: &mut Record,
        path: &str,
    ) -> Result<(), DecodeError> {
        for field in fields {
            self.decode_field(field, cursor, record, path)?;
            if field.consume {
                cursor.reconcile();
            }
        }
        Ok(())
    }

    fn decode_field(
        &mut self,
        field: &Field,
        cursor: &mut Cursor<'_>,
        record: &mut Record,
        path: &str,
    ) -> Result<(), DecodeError> {
        trace!("decoding `{}` at byte {}", field.name, cursor.position());
        match &field.kind {
            FieldKind::UInt { width, endian } => {
                let order = endian.unwrap_or(self.byte_order);
                let bits = cursor.read_uint(*width, order)?;
                let raw = match field.modifiers.encoding {
                    Some(encoding) => Value::Int(encoding.decode(bits, width * 8)),
                    None => Value::UInt(bits),
                };
                self.finish(field, raw, record, path)
            }
            FieldKind::Int { width, endian } => {
                let order = endian.unwrap_or(self.byte_order);
                let raw = match field.modifiers.encoding {
                    Some(encoding) => {
                        Value::Int(encoding.decode(cursor.read_uint(*width, order)?, width * 8))
                    }
                    None => Value::Int(cursor.read_int(*width, order)?),
                };
                self.finish(field, raw, record, path)
            }
            FieldKind::Float { width, endian } => {
                let order = endian.unwrap_or(self.byte_order);
                let raw = Value::Float(cursor.read_float(*width, order)?);
                self.finish(field, raw, record, path)
            }
            FieldKind::Bool { bit } => {
                let bit_value = match bit {
                    Some(bit) => cursor.read_bit_range(1, *bit, 1),
                    None => cursor.read_bits(1, 1),
                }
                .map_err(|e| e.for_field(&field.name))?;
                self.finish(field, Value::Bool(bit_value == 1), record, path)
            }
            FieldKind::Bits(spec) => {
                let bits = match spec.pos {
                    BitPos::Range { start, width } => {
                        cursor.read_bit_range(spec.window, start, width)
                    }
                    BitPos::Sequential { width } => cursor.read_bits(spec.window, width),
                }
                .map_err(|e| e.for_field(&field.name))?;
                let width = spec.pos.width();
                let raw = match field.modifiers.encoding {
                    Some(encoding) => Value::Int(encoding.decode(bits, width)),
                    None if spec.signed => Value::Int(sign_extend(bits, width)),
                    None => Value::UInt(bits),
                };
                self.finish(field, raw, record, path)
            }
            FieldKind::Decimal { signed } => {
                let byte = cursor.read_bytes(1)?[0];
                let (hi, lo) = (byte >> 4, byte & 0xF);
                let value = if *signed {
                    // High nibble is the sign: 0x0 positive, 0xF negative.
                    if hi != 0x0 && hi != 0xF {
                        self.warnings.push(format!(
                            "`{}`: {hi:#x} is not a sign nibble",
                            field.name
                        ));
                    }
                    let magnitude = f64::from(lo) / 10.0;
                    if hi == 0xF {
                        -magnitude
                    } else {
                        magnitude
                    }
                } else {
                    if hi > 9 || lo > 9 {
                        self.warnings.push(format!(
                            "`{}`: {byte:#04x} holds a nibble above 9",
                            field.name
                        ));
                    }
                    f64::from(hi) + f64::from(lo) / 10.0
                };
                self.finish(field, Value::Float(value), record, path)
            }
            FieldKind::Ascii { length } => {
                let bytes = cursor.read_bytes(*length)?;
                let text = String::from_utf8_lossy(bytes).into_owned();
                self.finish(field, Value::Str(text), record, path)
            }
            FieldKind::Bytes { length, format } => {
                let bytes = cursor.read_bytes(*length)?;
                let value = match format {
                    BytesFormat::Raw => Value::Bytes(bytes.to_vec()),
                    BytesFormat::Hex {
                        separator,
                        uppercase,
                    } => {
                        let rendered = if *uppercase {
                            hex::encode_upper(bytes)
                        } else {
                            hex::encode(bytes)
                        };
                        let rendered = match separator {
                            None => rendered,
                            Some(sep) => {
                                let pairs: Vec<&str> = rendered
                                    .as_bytes()
                                    .chunks(2)
                                    .map(|pair| std::str::from_utf8(pair).unwrap_or(""))
                                    .collect();
                                pairs.join(&sep.to_string())
                            }
                        };
                        Value::Str(rendered)
                    }
                    BytesFormat::Base64 => Value::Str(BASE64.encode(bytes)),
                };
                self.finish(field, value, record, path)
            }
            FieldKind::Skip { length } => cursor.skip(*length),
            FieldKind::Enum {
                width,
                endian,
                cases,
            } => {
                let order = endian.unwrap_or(self.byte_order);
                let raw = cursor.read_uint(*width, order)? as i64;
                let label = cases
                    .iter()
                    .find(|(key, _)| *key == raw)
                    .map(|(_, label)| label.clone())
                    .unwrap_or_else(|| format!("unknown({raw})"));
                self.finish(field, Value::Str(label), record, path)
            }
            FieldKind::BitfieldString {
                window,
                parts,
                separator,
            } => {
                cursor
                    .open_window(*window, true)
                    .map_err(|e| e.for_field(&field.name))?;
                let mut rendered = Vec::with_capacity(parts.len());
                for part in parts {
                    let bits = match part.pos {
                        BitPos::Range { start, width } => {
                            cursor.read_bit_range(part.window, start, width)
                        }
                        BitPos::Sequential { width } => cursor.read_bits(part.window, width),
                    }
                    .map_err(|e| e.for_field(&field.name))?;
                    rendered.push(bits.to_string());
                }
                cursor.reconcile();
                self.finish(field, Value::Str(rendered.join(separator)), record, path)
            }
            FieldKind::Computed(computed) => {
                let value = computed.eval(&self.scope)?;
                self.finish(field, Value::Float(value), record, path)
            }
            FieldKind::Literal(value) => self.finish(field, value.clone(), record, path),
            FieldKind::Object { fields } => {
                let mut nested = Record::new();
                self.scope.push();
                let nested_path = child_path(path, &field.name);
                let result = self.decode_fields(fields, cursor, &mut nested, &nested_path);
                self.scope.pop();
                result?;
                self.scope
                    .bind(field.scope_name(), Value::Map(nested.clone()));
                record.insert(field.name.clone(), Value::Map(nested));
                Ok(())
            }
            FieldKind::ByteGroup { size, fields } => {
                cursor
                    .open_window(*size, true)
                    .map_err(|e| e.for_field(&field.name))?;
                self.decode_fields(fields, cursor, record, path)?;
                cursor.reconcile();
                Ok(())
            }
            FieldKind::Match(spec) => self.decode_match(field, spec, cursor, record, path),
            FieldKind::Flagged { source, groups } => {
                let flags = self
                    .scope
                    .resolve(source)
                    .ok_or_else(|| {
                        DecodeError::UndefinedVariable(
                            source.trim_start_matches('$').to_string(),
                        )
                    })?
                    .as_u64()
                    .ok_or_else(|| DecodeError::InvalidValue {
                        field: source.clone(),
                        reason: "flags reference is not an unsigned integer".into(),
                    })?;
                for group in groups {
                    if (flags >> group.bit) & 1 == 1 {
                        trace!("flag bit {} set, decoding its group", group.bit);
                        self.decode_fields(&group.fields, cursor, record, path)?;
                    }
                }
                Ok(())
            }
            FieldKind::Tlv(spec) => self.decode_tlv(field, spec, cursor, record, path),
            FieldKind::Repeat(spec) => self.decode_repeat(field, spec, cursor, record, path),
        }
    }

    /// Runs the modifier pipeline, stores the value, binds the scope name,
    /// and files the quality tag.
    fn finish(
        &mut self,
        field: &Field,
        raw: Value,
        record: &mut Record,
        path: &str,
    ) -> Result<(), DecodeError> {
        let numeric_pipeline = raw.as_f64().is_some()
            || (!field.modifiers.lookup.is_empty() && raw.as_i64().is_some());
        let (value, quality) = if numeric_pipeline {
            field
                .modifiers
                .apply(raw, &self.scope)
                .map_err(|e| e.for_field(&field.name))?
        } else {
            (raw, None)
        };
        if let Some(quality) = quality {
            let key = child_path(path, &field.name);
            if quality == Quality::OutOfRange {
                warn!("`{key}` is out of range");
            }
            self.quality.insert(key, quality);
        }
        self.scope.bind(field.scope_name(), value.clone());
        record.insert(field.name.clone(), value);
        Ok(())
    }

    fn decode_match(
        &mut self,
        field: &Field,
        spec: &crate::schema::MatchSpec,
        cursor: &mut Cursor<'_>,
        record: &mut Record,
        path: &str,
    ) -> Result<(), DecodeError> {
        let name = if field.name.is_empty() {
            "match"
        } else {
            &field.name
        };
        let selector = match &spec.selector {
            Selector::Ref(reference) => self
                .scope
                .resolve(reference)
                .cloned()
                .ok_or_else(|| {
                    DecodeError::UndefinedVariable(
                        reference.trim_start_matches('$').to_string(),
                    )
                })?,
            Selector::Expr(expr) => Value::Float(expr.eval(&self.scope)?),
        };
        let chosen = selector
            .as_i64()
            .and_then(|v| spec.cases.iter().find(|case| case.pattern.matches(v)));
        match chosen {
            Some(case) => {
                debug!("match `{name}`: selector {selector} hit {:?}", case.pattern);
                self.decode_fields(&case.fields, cursor, record, path)
            }
            None => match &spec.default {
                MatchDefault::Error => Err(DecodeError::MatchNoCase {
                    name: name.to_string(),
                    value: selector,
                }),
                MatchDefault::Skip => {
                    debug!("match `{name}`: selector {selector} unmatched, skipping");
                    Ok(())
                }
                MatchDefault::Fields(fields) => {
                    debug!("match `{name}`: selector {selector} takes the default case");
                    self.decode_fields(fields, cursor, record, path)
                }
            },
        }
    }

    fn decode_tlv(
        &mut self,
        field: &Field,
        spec: &TlvSpec,
        cursor: &mut Cursor<'_>,
        record: &mut Record,
        path: &str,
    ) -> Result<(), DecodeError> {
        let name = if field.name.is_empty() { "tlv" } else { &field.name };
        loop {
            if spec.repeat == TlvRepeat::UntilEnd && cursor.at_end() {
                break;
            }
            let tag = self.read_tag(spec, cursor)?;
            let length = if spec.length_size > 0 {
                Some(cursor.read_uint(spec.length_size as u32, self.byte_order)? as usize)
            } else {
                None
            };
            match spec.cases.iter().find(|case| case.tag == tag) {
                Some(case) => {
                    debug!("TLV `{name}`: tag {tag:?}");
                    self.decode_tlv_body(spec, case, length, cursor, record, path)?;
                }
                None => {
                    let rendered = format!("{tag:?}");
                    match spec.on_unknown {
                        UnknownTagPolicy::Error => {
                            return Err(DecodeError::UnknownTag {
                                name: name.to_string(),
                                tag: rendered,
                            })
                        }
                        UnknownTagPolicy::Skip => match length {
                            Some(n) => {
                                cursor.skip(n)?;
                                self.warnings.push(format!(
                                    "TLV `{name}`: skipped unknown tag {rendered}"
                                ));
                            }
                            None => {
                                self.warnings.push(format!(
                                    "TLV `{name}`: unknown tag {rendered} without a length, \
                                     consumption stopped"
                                ));
                                break;
                            }
                        },
                        UnknownTagPolicy::Raw => {
                            let n = length.unwrap_or_else(|| cursor.remaining());
                            let bytes = cursor.read_bytes(n)?.to_vec();
                            let key = format!(
                                "unknown_{}",
                                tag.iter()
                                    .map(|v| v.to_string())
                                    .collect::<Vec<_>>()
                                    .join("_")
                            );
                            self.warnings.push(format!(
                                "TLV `{name}`: captured unknown tag {rendered} as `{key}`"
                            ));
                            record.insert(key, Value::Bytes(bytes));
                            if length.is_none() {
                                break;
                            }
                        }
                    }
                }
            }
            if spec.repeat == TlvRepeat::Once {
                break;
            }
        }
        Ok(())
    }

    fn read_tag(&mut self, spec: &TlvSpec, cursor: &mut Cursor<'_>) -> Result<Vec<i64>, DecodeError> {
        match &spec.tag {
            TagLayout::Plain { size } => {
                Ok(vec![cursor.read_uint(*size, self.byte_order)? as i64])
            }
            TagLayout::Composite { fields } => {
                let mut components = Vec::with_capacity(fields.len());
                for tag_field in fields {
                    let value = match &tag_field.kind {
                        FieldKind::UInt { width, endian } => {
                            cursor.read_uint(*width, endian.unwrap_or(self.byte_order))? as i64
                        }
                        FieldKind::Int { width, endian } => {
                            cursor.read_int(*width, endian.unwrap_or(self.byte_order))?
                        }
                        _ => unreachable!("composite tags are validated to be integers"),
                    };
                    // Tag components dispatch; they are visible to the body
                    // as variables but never enter the record.
                    self.scope.bind(tag_field.scope_name(), Value::Int(value));
                    components.push(value);
                }
                Ok(components)
            }
        }
    }

    fn decode_tlv_body(
        &mut self,
        spec: &TlvSpec,
        case: &TlvCase,
        length: Option<usize>,
        cursor: &mut Cursor<'_>,
        record: &mut Record,
        path: &str,
    ) -> Result<(), DecodeError> {
        let body_len = length.or(case.length);
        let mut emit = |walker: &mut Self,
                        cursor: &mut Cursor<'_>|
         -> Result<(), DecodeError> {
            if spec.merge {
                walker.decode_fields(&case.fields, cursor, record, path)
            } else {
                let name = case.name.clone().unwrap_or_else(|| {
                    format!(
                        "case_{}",
                        case.tag
                            .iter()
                            .map(|v| v.to_string())
                            .collect::<Vec<_>>()
                            .join("_")
                    )
                });
                let mut nested = Record::new();
                walker.scope.push();
                let nested_path = child_path(path, &name);
                let result =
                    walker.decode_fields(&case.fields, cursor, &mut nested, &nested_path);
                walker.scope.pop();
                result?;
                record.insert(name, Value::Map(nested));
                Ok(())
            }
        };
        match body_len {
            Some(n) => {
                let mut body = cursor.take(n)?;
                emit(self, &mut body)?;
                body.reconcile();
                if !body.at_end() {
                    self.warnings.push(format!(
                        "TLV case {:?} left {} byte(s) of its body",
                        case.tag,
                        body.remaining()
                    ));
                }
                Ok(())
            }
            None => emit(self, cursor),
        }
    }

    fn decode_repeat(
        &mut self,
        field: &Field,
        spec: &RepeatSpec,
        cursor: &mut Cursor<'_>,
        record: &mut Record,
        path: &str,
    ) -> Result<(), DecodeError> {
        let base = child_path(path, &field.name);
        let mut items = Vec::new();

        let mut decode_item = |walker: &mut Self,
                               cursor: &mut Cursor<'_>,
                               index: usize|
         -> Result<Value, DecodeError> {
            let mut item = Record::new();
            walker.scope.push();
            let item_path = format!("{base}.{index}");
            let result = walker.decode_fields(&spec.fields, cursor, &mut item, &item_path);
            walker.scope.pop();
            result?;
            Ok(Value::Map(item))
        };

        match &spec.count {
            RepeatCount::Fixed(n) => {
                for i in 0..*n {
                    items.push(decode_item(self, cursor, i)?);
                }
            }
            RepeatCount::CountField(reference) => {
                let n = self.resolve_count(reference)?;
                for i in 0..n {
                    items.push(decode_item(self, cursor, i)?);
                }
            }
            RepeatCount::ByteLength(source) => {
                let n = match source {
                    CountSource::Fixed(n) => *n,
                    CountSource::Ref(reference) => self.resolve_count(reference)?,
                };
                let mut body = cursor.take(n)?;
                while !body.at_end() {
                    let before = body.position();
                    items.push(decode_item(self, &mut body, items.len())?);
                    body.reconcile();
                    if body.position() == before {
                        self.warnings.push(format!(
                            "repeat `{}` stopped: an iteration consumed no bytes",
                            field.name
                        ));
                        break;
                    }
                }
            }
            RepeatCount::UntilEnd => {
                while !cursor.at_end() {
                    let before = cursor.position();
                    items.push(decode_item(self, cursor, items.len())?);
                    cursor.reconcile();
                    if cursor.position() == before {
                        self.warnings.push(format!(
                            "repeat `{}` stopped: an iteration consumed no bytes",
                            field.name
                        ));
                        break;
                    }
                }
            }
        }

        let min = spec.min.unwrap_or(0);
        let max = spec.max.unwrap_or(usize::MAX);
        if items.len() < min || items.len() > max {
            return Err(DecodeError::RepeatBounds {
                name: field.name.clone(),
                count: items.len(),
                min,
                max,
            });
        }

        self.scope
            .bind(field.scope_name(), Value::List(items.clone()));
        record.insert(field.name.clone(), Value::List(items));
        Ok(())
    }

    fn resolve_count(&self, reference: &str) -> Result<usize, DecodeError> {
        let value = self.scope.resolve(reference).ok_or_else(|| {
            DecodeError::UndefinedVariable(reference.trim_start_matches('$').to_string())
        })?;
        value
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| DecodeError::InvalidValue {
                field: reference.to_string(),
                reason: format!("count must be a non-negative integer, got {value}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDef;

    fn schema(yaml: &str) -> Schema {
        let def: SchemaDef = serde_yaml::from_str(yaml).unwrap();
        Schema::build(def).unwrap()
    }

    fn decode(yaml: &str, payload: &[u8]) -> DecodeResult {
        schema(yaml).decode(payload, None).unwrap()
    }

    #[test]
    fn object_fields_nest_and_scope() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - { name: id, type: u8 }
              - name: env
                type: object
                fields:
                  - { name: raw, type: u8 }
                  - { name: scaled, type: number, ref: $raw, div: 2 }
        "#;
        let result = decode(yaml, &[0x07, 0x0A]);
        assert_eq!(result.record.get("id"), Some(&Value::UInt(7)));
        let Some(Value::Map(env)) = result.record.get("env") else {
            panic!("expected a nested record")
        };
        assert_eq!(env.get("raw"), Some(&Value::UInt(10)));
        assert_eq!(env.get("scaled"), Some(&Value::Float(5.0)));
    }

    #[test]
    fn var_binds_an_alternative_scope_name() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - { name: n, type: u8, var: item_count }
              - name: items
                type: repeat
                count_field: $item_count
                fields:
                  - { name: v, type: u8 }
        "#;
        let result = decode(yaml, &[0x02, 0x0A, 0x0B]);
        let Some(Value::List(items)) = result.record.get("items") else {
            panic!("expected a list")
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn repeat_until_end_consumes_the_buffer() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - name: samples
                type: repeat
                until: end
                fields:
                  - { name: v, type: u16, div: 10 }
        "#;
        let result = decode(yaml, &[0x00, 0x64, 0x00, 0xC8]);
        let Some(Value::List(items)) = result.record.get("samples") else {
            panic!("expected a list")
        };
        assert_eq!(items.len(), 2);
        let Value::Map(first) = &items[0] else {
            panic!("expected maps")
        };
        assert_eq!(first.get("v"), Some(&Value::Float(10.0)));
        assert_eq!(result.trailing_bytes, 0);
    }

    #[test]
    fn repeat_bounds_abort() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - name: samples
                type: repeat
                until: end
                min: 3
                fields:
                  - { name: v, type: u8 }
        "#;
        let failure = schema(yaml).decode(&[0x01], None).unwrap_err();
        assert!(matches!(
            failure.error,
            DecodeError::RepeatBounds { count: 1, min: 3, .. }
        ));
    }

    #[test]
    fn strict_schemas_reject_trailing_bytes() {
        let yaml = r#"
            name: t
            version: 1
            strict: true
            fields:
              - { name: x, type: u8 }
        "#;
        let failure = schema(yaml).decode(&[0x01, 0x02], None).unwrap_err();
        assert!(matches!(failure.error, DecodeError::TrailingBytes(1)));
        assert_eq!(failure.partial.get("x"), Some(&Value::UInt(1)));
    }

    #[test]
    fn non_strict_schemas_report_trailing_bytes() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - { name: x, type: u8 }
        "#;
        let result = decode(yaml, &[0x01, 0x02, 0x03]);
        assert_eq!(result.trailing_bytes, 2);
        assert_eq!(result.bytes_consumed, 1);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn ports_route_by_metadata() {
        let yaml = r#"
            name: t
            version: 1
            ports:
              1:
                fields:
                  - { name: a, type: u8 }
              2:
                fields:
                  - { name: b, type: u8 }
        "#;
        let schema = schema(yaml);
        let mut metadata = Metadata::new();
        metadata.insert("port".into(), Value::UInt(2));
        let result = schema.decode(&[0x2A], Some(&metadata)).unwrap();
        assert_eq!(result.record.get("b"), Some(&Value::UInt(42)));

        metadata.insert("port".into(), Value::UInt(9));
        let failure = schema.decode(&[0x2A], Some(&metadata)).unwrap_err();
        assert!(matches!(failure.error, DecodeError::NoPortSchema(9)));

        let failure = schema.decode(&[0x2A], None).unwrap_err();
        assert!(matches!(failure.error, DecodeError::MissingPort));
    }

    #[test]
    fn declared_metadata_enriches_the_record() {
        let yaml = r#"
            name: t
            version: 1
            metadata: [received_at, "rx_metadata.0.rssi"]
            fields:
              - { name: x, type: u8 }
        "#;
        let mut gateway = Record::new();
        gateway.insert("rssi".into(), Value::Int(-101));
        let mut metadata = Metadata::new();
        metadata.insert("received_at".into(), Value::from("2024-05-01T12:00:00Z"));
        metadata.insert("rx_metadata".into(), Value::List(vec![Value::Map(gateway)]));
        let result = schema(yaml).decode(&[0x01], Some(&metadata)).unwrap();
        assert_eq!(
            result.record.get("received_at"),
            Some(&Value::from("2024-05-01T12:00:00Z"))
        );
        assert_eq!(
            result.record.get("rx_metadata.0.rssi"),
            Some(&Value::Int(-101))
        );
        // Payload fields come first; metadata enrichment follows.
        assert_eq!(result.record.get_index(0).unwrap().0, "x");
    }

    #[test]
    fn enum_labels_and_unknown_formatting() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - name: state
                type: enum
                lookup: [[0, idle], [1, active]]
        "#;
        assert_eq!(
            decode(yaml, &[0x01]).record.get("state"),
            Some(&Value::from("active"))
        );
        assert_eq!(
            decode(yaml, &[0x07]).record.get("state"),
            Some(&Value::from("unknown(7)"))
        );
    }

    #[test]
    fn bitfield_string_renders_versions() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - name: firmware
                type: bitfield_string
                length: 2
                parts: ["u16[12:15]", "u16[6:11]", "u16[0:5]"]
        "#;
        // 0x1234 -> major 1, minor 0b001000 = 8, patch 0b110100 = 52
        let result = decode(yaml, &[0x12, 0x34]);
        assert_eq!(result.record.get("firmware"), Some(&Value::from("1.8.52")));
        assert_eq!(result.bytes_consumed, 2);
    }

    #[test]
    fn unknown_tlv_tag_raw_capture() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - name: channels
                type: tlv
                length_size: 1
                on_unknown: raw
                cases:
                  - tag: 1
                    fields:
                      - { name: battery, type: u8 }
        "#;
        let result = decode(yaml, &[0x01, 0x01, 0x64, 0x09, 0x02, 0xAA, 0xBB]);
        assert_eq!(result.record.get("battery"), Some(&Value::UInt(100)));
        assert_eq!(
            result.record.get("unknown_9"),
            Some(&Value::Bytes(vec![0xAA, 0xBB]))
        );
        assert_eq!(result.warnings.len(), 1);
    }
}
