//! The encode driver.
//!
//! Mirrors the decoder: walks the compiled field list, pulls each value out
//! of the input record, reverses the modifier pipeline, and emits bytes.
//! Computed and literal fields are purely derived outputs and are never
//! encoded.
//!
//! Selector-bearing constructs are reconstructed from the record itself: a
//! flagged group's flags value is recomputed from which groups are present
//! (and verified against an explicit value, `flag-mismatch` on
//! disagreement), repeat count fields are back-filled from list lengths, and
//! TLV emission follows the record's key order so a decoded record encodes
//! back to the exact original byte sequence.

use crate::bitfield::{mask, BitPos};
use crate::cursor::{ByteOrder, WriteCursor};
use crate::errors::EncodeError;
use crate::schema::{
    BytesFormat, CountSource, Field, FieldKind, MatchDefault, RepeatCount, RepeatSpec, Schema,
    Selector, TagLayout, TlvCase, TlvRepeat, TlvSpec,
};
use crate::scope::Scope;
use crate::value::{Record, Value};
use ahash::AHashMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, trace};

impl Schema {
    /// Encodes `record` into the byte sequence the decoder would have
    /// produced it from. Fails with `missing-port` on a `ports` schema; use
    /// [`Schema::encode_with_port`] there.
    pub fn encode(&self, record: &Record) -> Result<Vec<u8>, EncodeError> {
        if self.routes_by_port() {
            return Err(EncodeError::MissingPort);
        }
        let fields = self.fields_for_port(None).expect("non-port schema");
        encode_inner(self.byte_order, fields, record)
    }

    /// Encodes against the sub-schema of `port`.
    pub fn encode_with_port(&self, record: &Record, port: u32) -> Result<Vec<u8>, EncodeError> {
        let fields = self
            .fields_for_port(Some(port))
            .ok_or(EncodeError::NoPortSchema(port))?;
        encode_inner(self.byte_order, fields, record)
    }
}

fn encode_inner(
    byte_order: ByteOrder,
    fields: &[Field],
    record: &Record,
) -> Result<Vec<u8>, EncodeError> {
    let mut walker = Writer {
        byte_order,
        scope: Scope::new(),
        flags: AHashMap::new(),
        counts: AHashMap::new(),
        prepared_repeats: AHashMap::new(),
    };
    walker.prepare(fields, record)?;
    let mut cursor = WriteCursor::new();
    walker.encode_fields(fields, &mut cursor, record)?;
    Ok(cursor.into_bytes())
}

struct Writer {
    byte_order: ByteOrder,
    scope: Scope,
    /// Flags values recomputed from group presence, keyed by the flags
    /// field's scope name.
    flags: AHashMap<String, u64>,
    /// Count and byte-length values back-filled from lists, keyed by the
    /// count field's scope name.
    counts: AHashMap<String, u64>,
    /// Pre-encoded bodies of `byte_length` repeats, keyed by repeat name.
    prepared_repeats: AHashMap<String, Vec<u8>>,
}

impl Writer {
    /// Pre-pass: derives flags masks, repeat counts, and byte lengths from
    /// the record before any byte is written (their source fields precede
    /// the constructs that explain them).
    fn prepare(&mut self, fields: &[Field], record: &Record) -> Result<(), EncodeError> {
        for field in fields {
            match &field.kind {
                FieldKind::Flagged { source, groups } => {
                    let mut computed = 0u64;
                    for group in groups {
                        if group_present(&group.fields, record) {
                            computed |= 1 << group.bit;
                            self.prepare(&group.fields, record)?;
                        }
                    }
                    let key = source.trim_start_matches('$').to_string();
                    *self.flags.entry(key).or_insert(0) |= computed;
                }
                FieldKind::Repeat(spec) => {
                    let Some(Value::List(items)) = record.get(&field.name) else {
                        continue; // missing list surfaces as missing-input later
                    };
                    match &spec.count {
                        RepeatCount::CountField(reference) => {
                            let key = reference.trim_start_matches('$').to_string();
                            self.counts.insert(key, items.len() as u64);
                        }
                        RepeatCount::ByteLength(CountSource::Ref(reference)) => {
                            let bytes = self.encode_repeat_items(spec, items, &field.name)?;
                            let key = reference.trim_start_matches('$').to_string();
                            self.counts.insert(key, bytes.len() as u64);
                            self.prepared_repeats.insert(field.name.clone(), bytes);
                        }
                        _ => {}
                    }
                }
                FieldKind::Object { fields } => {
                    if let Some(Value::Map(nested)) = record.get(&field.name) {
                        self.prepare(fields, nested)?;
                    }
                }
                FieldKind::Match(spec) => {
                    for case in &spec.cases {
                        self.prepare(&case.fields, record)?;
                    }
                    if let MatchDefault::Fields(fields) = &spec.default {
                        self.prepare(fields, record)?;
                    }
                }
                FieldKind::Tlv(spec) if spec.merge => {
                    for case in &spec.cases {
                        self.prepare(&case.fields, record)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn encode_fields(
        &mut self,
        fields: &[Field],
        cursor: &mut WriteCursor,
        record: &Record,
    ) -> Result<(), EncodeError> {
        for field in fields {
            self.encode_field(field, cursor, record)?;
            if field.consume {
                cursor.reconcile();
            }
        }
        Ok(())
    }

    fn encode_field(
        &mut self,
        field: &Field,
        cursor: &mut WriteCursor,
        record: &Record,
    ) -> Result<(), EncodeError> {
        trace!("encoding `{}` at byte {}", field.name, cursor.position());
        match &field.kind {
            FieldKind::UInt { width, endian } => {
                let bits = self.int_bits(field, record, width * 8, false)?;
                cursor.write_uint(bits, *width, endian.unwrap_or(self.byte_order));
                Ok(())
            }
            FieldKind::Int { width, endian } => {
                let bits = self.int_bits(field, record, width * 8, true)?;
                cursor.write_uint(bits, *width, endian.unwrap_or(self.byte_order));
                Ok(())
            }
            FieldKind::Float { width, endian } => {
                let value = self.required(field, record)?.clone();
                let raw = field
                    .modifiers
                    .reverse(&value)
                    .map_err(|e| e.for_field(&field.name))?;
                cursor.write_float(raw, *width, endian.unwrap_or(self.byte_order));
                self.scope.bind(field.scope_name(), value);
                Ok(())
            }
            FieldKind::Bool { bit } => {
                let value = self.required(field, record)?;
                let set = value.as_bool().ok_or_else(|| EncodeError::InvalidValue {
                    field: field.name.clone(),
                    reason: format!("expected a boolean, got a {}", value.kind()),
                })?;
                match bit {
                    Some(bit) => cursor.write_bit_range(1, *bit, 1, u64::from(set)),
                    None => cursor.write_bits(1, 1, u64::from(set)),
                }
                self.scope.bind(field.scope_name(), Value::Bool(set));
                Ok(())
            }
            FieldKind::Bits(spec) => {
                let width = spec.pos.width();
                let bits = self.int_bits(field, record, width, spec.signed)?;
                match spec.pos {
                    BitPos::Range { start, width } => {
                        cursor.write_bit_range(spec.window, start, width, bits)
                    }
                    BitPos::Sequential { width } => cursor.write_bits(spec.window, width, bits),
                }
                Ok(())
            }
            FieldKind::Decimal { signed } => {
                let value = self.required(field, record)?.clone();
                let raw = field
                    .modifiers
                    .reverse(&value)
                    .map_err(|e| e.for_field(&field.name))?;
                let tenths = (raw * 10.0).round() as i64;
                let byte = if *signed {
                    if tenths.unsigned_abs() > 9 {
                        return Err(self.out_of_range(field, raw));
                    }
                    let sign = if tenths < 0 { 0xF0 } else { 0x00 };
                    sign | tenths.unsigned_abs() as u8
                } else {
                    if !(0..=99).contains(&tenths) {
                        return Err(self.out_of_range(field, raw));
                    }
                    ((tenths / 10) << 4) as u8 | (tenths % 10) as u8
                };
                cursor.write_bytes(&[byte]);
                self.scope.bind(field.scope_name(), value);
                Ok(())
            }
            FieldKind::Ascii { length } => {
                let value = self.required(field, record)?;
                let text = value.as_str().ok_or_else(|| EncodeError::InvalidValue {
                    field: field.name.clone(),
                    reason: format!("expected a string, got a {}", value.kind()),
                })?;
                if text.len() != *length {
                    return Err(EncodeError::InvalidValue {
                        field: field.name.clone(),
                        reason: format!("string is {} byte(s), field is {length}", text.len()),
                    });
                }
                cursor.write_bytes(text.as_bytes());
                Ok(())
            }
            FieldKind::Bytes { length, format } => {
                let value = self.required(field, record)?;
                let bytes = self.bytes_input(field, value, format)?;
                if bytes.len() != *length {
                    return Err(EncodeError::InvalidValue {
                        field: field.name.clone(),
                        reason: format!("{} byte(s) supplied, field is {length}", bytes.len()),
                    });
                }
                cursor.write_bytes(&bytes);
                Ok(())
            }
            FieldKind::Skip { length } => {
                cursor.write_bytes(&vec![0u8; *length]);
                Ok(())
            }
            FieldKind::Enum {
                width,
                endian,
                cases,
            } => {
                let value = self.required(field, record)?;
                let raw = match value {
                    Value::Str(label) => cases
                        .iter()
                        .find(|(_, l)| l == label)
                        .map(|(k, _)| *k)
                        .or_else(|| {
                            label
                                .strip_prefix("unknown(")
                                .and_then(|rest| rest.strip_suffix(')'))
                                .and_then(|n| n.parse().ok())
                        })
                        .ok_or_else(|| EncodeError::InvalidValue {
                            field: field.name.clone(),
                            reason: format!("`{label}` is not an enum label"),
                        })?,
                    other => other.as_i64().ok_or_else(|| EncodeError::InvalidValue {
                        field: field.name.clone(),
                        reason: format!("expected a label or integer, got a {}", other.kind()),
                    })?,
                };
                check_unsigned_width(field, raw, width * 8)?;
                cursor.write_uint(raw as u64, *width, endian.unwrap_or(self.byte_order));
                self.scope.bind(field.scope_name(), value.clone());
                Ok(())
            }
            FieldKind::BitfieldString {
                window,
                parts,
                separator,
            } => {
                let value = self.required(field, record)?;
                let text = value.as_str().ok_or_else(|| EncodeError::InvalidValue {
                    field: field.name.clone(),
                    reason: format!("expected a string, got a {}", value.kind()),
                })?;
                let components: Vec<&str> = text.split(separator.as_str()).collect();
                if components.len() != parts.len() {
                    return Err(EncodeError::InvalidValue {
                        field: field.name.clone(),
                        reason: format!(
                            "`{text}` has {} component(s), field has {}",
                            components.len(),
                            parts.len()
                        ),
                    });
                }
                cursor.open_window(*window, true);
                for (part, component) in parts.iter().zip(components) {
                    let bits: u64 =
                        component
                            .parse()
                            .map_err(|_| EncodeError::InvalidValue {
                                field: field.name.clone(),
                                reason: format!("`{component}` is not a number"),
                            })?;
                    match part.pos {
                        BitPos::Range { start, width } => {
                            cursor.write_bit_range(part.window, start, width, bits)
                        }
                        BitPos::Sequential { width } => {
                            cursor.write_bits(part.window, width, bits)
                        }
                    }
                }
                cursor.reconcile();
                Ok(())
            }
            // Derived outputs: never encoded.
            FieldKind::Computed(_) | FieldKind::Literal(_) => Ok(()),
            FieldKind::Object { fields } => {
                let Some(Value::Map(nested)) = record.get(&field.name) else {
                    return Err(EncodeError::MissingInput(field.name.clone()));
                };
                self.scope.push();
                let result = self.encode_fields(fields, cursor, nested);
                self.scope.pop();
                result?;
                self.scope
                    .bind(field.scope_name(), Value::Map(nested.clone()));
                Ok(())
            }
            FieldKind::ByteGroup { size, fields } => {
                cursor.open_window(*size, true);
                self.encode_fields(fields, cursor, record)?;
                cursor.reconcile();
                Ok(())
            }
            FieldKind::Match(spec) => {
                let name = if field.name.is_empty() {
                    "match"
                } else {
                    field.name.as_str()
                };
                let selector = match &spec.selector {
                    Selector::Ref(reference) => {
                        self.scope.resolve(reference).cloned().ok_or_else(|| {
                            EncodeError::MissingInput(
                                reference.trim_start_matches('$').to_string(),
                            )
                        })?
                    }
                    Selector::Expr(expr) => {
                        Value::Float(expr.eval(&self.scope).map_err(|_| {
                            EncodeError::InvalidValue {
                                field: name.to_string(),
                                reason: "selector expression did not evaluate".into(),
                            }
                        })?)
                    }
                };
                let chosen = selector
                    .as_i64()
                    .and_then(|v| spec.cases.iter().find(|case| case.pattern.matches(v)));
                match chosen {
                    Some(case) => self.encode_fields(&case.fields, cursor, record),
                    None => match &spec.default {
                        MatchDefault::Error => Err(EncodeError::MatchNoCase {
                            name: name.to_string(),
                            value: selector,
                        }),
                        MatchDefault::Skip => Ok(()),
                        MatchDefault::Fields(fields) => {
                            self.encode_fields(fields, cursor, record)
                        }
                    },
                }
            }
            FieldKind::Flagged { source, groups } => {
                let key = source.trim_start_matches('$');
                let flags = self.flags.get(key).copied().unwrap_or(0);
                for group in groups {
                    if (flags >> group.bit) & 1 == 1 {
                        self.encode_fields(&group.fields, cursor, record)?;
                    }
                }
                Ok(())
            }
            FieldKind::Tlv(spec) => self.encode_tlv(field, spec, cursor, record),
            FieldKind::Repeat(spec) => self.encode_repeat(field, spec, cursor, record),
        }
    }

    /// Fetches the value of a required field, consulting back-filled flags
    /// and counts when the record omits them.
    fn required<'r>(&self, field: &Field, record: &'r Record) -> Result<&'r Value, EncodeError> {
        record
            .get(&field.name)
            .ok_or_else(|| EncodeError::MissingInput(field.name.clone()))
    }

    /// Resolves an integer field down to the raw bit pattern to emit:
    /// record value (or back-filled flags/count), reversed pipeline, range
    /// check, integer re-encoding.
    fn int_bits(
        &mut self,
        field: &Field,
        record: &Record,
        width_bits: u32,
        signed: bool,
    ) -> Result<u64, EncodeError> {
        let scope_name = field.scope_name();
        let backfilled = self
            .flags
            .get(scope_name)
            .or_else(|| self.counts.get(scope_name))
            .copied();

        let value = match (record.get(&field.name), backfilled) {
            (Some(value), Some(expected)) => {
                // An explicit value must agree with the presence pattern.
                let given = value.as_u64().unwrap_or(u64::MAX);
                if given != expected {
                    if self.flags.contains_key(scope_name) {
                        return Err(EncodeError::FlagMismatch {
                            field: field.name.clone(),
                            given,
                            computed: expected,
                        });
                    }
                    return Err(EncodeError::InvalidValue {
                        field: field.name.clone(),
                        reason: format!(
                            "value {given} disagrees with the derived count {expected}"
                        ),
                    });
                }
                value.clone()
            }
            (Some(value), None) => value.clone(),
            (None, Some(expected)) => {
                debug!("back-filling `{}` = {expected}", field.name);
                Value::UInt(expected)
            }
            (None, None) => return Err(EncodeError::MissingInput(field.name.clone())),
        };

        let raw = if field.modifiers.is_numeric_identity() {
            value.as_f64().ok_or_else(|| EncodeError::InvalidValue {
                field: field.name.clone(),
                reason: format!("expected a number, got a {}", value.kind()),
            })?
        } else {
            field
                .modifiers
                .reverse(&value)
                .map_err(|e| e.for_field(&field.name))?
        };
        let rounded = raw.round();
        if (raw - rounded).abs() > 1e-6 {
            return Err(EncodeError::InvalidValue {
                field: field.name.clone(),
                reason: format!("{value} does not reverse to an integral raw value"),
            });
        }
        let raw = rounded as i64;

        self.scope.bind(scope_name, value);

        if let Some(encoding) = field.modifiers.encoding {
            return encoding
                .encode(raw, width_bits)
                .map_err(|e| e.for_field(&field.name));
        }
        if signed {
            check_signed_width(field, raw, width_bits)?;
            Ok((raw as u64) & mask(width_bits))
        } else {
            check_unsigned_width(field, raw, width_bits)?;
            Ok(raw as u64)
        }
    }

    fn bytes_input(
        &self,
        field: &Field,
        value: &Value,
        format: &BytesFormat,
    ) -> Result<Vec<u8>, EncodeError> {
        let invalid = |reason: String| EncodeError::InvalidValue {
            field: field.name.clone(),
            reason,
        };
        match (format, value) {
            (_, Value::Bytes(bytes)) => Ok(bytes.clone()),
            (BytesFormat::Hex { separator, .. }, Value::Str(text)) => {
                let mut cleaned: String =
                    text.chars().filter(|c| !c.is_whitespace()).collect();
                if let Some(sep) = separator {
                    cleaned.retain(|c| c != *sep);
                }
                hex::decode(&cleaned).map_err(|_| invalid(format!("`{text}` is not hex")))
            }
            (BytesFormat::Base64, Value::Str(text)) => BASE64
                .decode(text)
                .map_err(|_| invalid(format!("`{text}` is not base64"))),
            _ => Err(invalid(format!(
                "expected bytes{}, got a {}",
                match format {
                    BytesFormat::Raw => "",
                    BytesFormat::Hex { .. } => " or a hex string",
                    BytesFormat::Base64 => " or a base64 string",
                },
                value.kind()
            ))),
        }
    }

    fn encode_tlv(
        &mut self,
        field: &Field,
        spec: &TlvSpec,
        cursor: &mut WriteCursor,
        record: &Record,
    ) -> Result<(), EncodeError> {
        // Emission follows the record's key order so decode -> encode
        // reproduces the original entry sequence.
        let mut emitted = 0usize;
        for key in record.keys() {
            let case = match spec.cases.iter().find(|case| {
                if spec.merge {
                    case.fields
                        .first()
                        .map(|first| &first.name == key)
                        .unwrap_or(false)
                } else {
                    case_record_name(case) == *key
                }
            }) {
                Some(case) => case,
                None => continue,
            };
            self.emit_tlv_case(spec, case, cursor, record)?;
            emitted += 1;
            if spec.repeat == TlvRepeat::Once {
                break;
            }
        }
        if emitted == 0 && spec.repeat == TlvRepeat::Once {
            let name = if field.name.is_empty() {
                "tlv".to_string()
            } else {
                field.name.clone()
            };
            return Err(EncodeError::MissingInput(name));
        }
        Ok(())
    }

    fn emit_tlv_case(
        &mut self,
        spec: &TlvSpec,
        case: &TlvCase,
        cursor: &mut WriteCursor,
        record: &Record,
    ) -> Result<(), EncodeError> {
        match &spec.tag {
            TagLayout::Plain { size } => {
                cursor.write_uint(case.tag[0] as u64, *size, self.byte_order);
            }
            TagLayout::Composite { fields } => {
                for (tag_field, component) in fields.iter().zip(&case.tag) {
                    match &tag_field.kind {
                        FieldKind::UInt { width, endian } | FieldKind::Int { width, endian } => {
                            cursor.write_int(
                                *component,
                                *width,
                                endian.unwrap_or(self.byte_order),
                            );
                        }
                        _ => unreachable!("composite tags are validated to be integers"),
                    }
                }
            }
        }

        let body_record: &Record = if spec.merge {
            record
        } else {
            match record.get(&case_record_name(case)) {
                Some(Value::Map(nested)) => nested,
                _ => return Err(EncodeError::MissingInput(case_record_name(case))),
            }
        };

        if spec.length_size > 0 {
            let mut body = WriteCursor::new();
            self.encode_fields(&case.fields, &mut body, body_record)?;
            let bytes = body.into_bytes();
            cursor.write_uint(bytes.len() as u64, spec.length_size as u32, self.byte_order);
            cursor.write_bytes(&bytes);
        } else {
            self.encode_fields(&case.fields, cursor, body_record)?;
        }
        Ok(())
    }

    fn encode_repeat(
        &mut self,
        field: &Field,
        spec: &RepeatSpec,
        cursor: &mut WriteCursor,
        record: &Record,
    ) -> Result<(), EncodeError> {
        let Some(value) = record.get(&field.name) else {
            return Err(EncodeError::MissingInput(field.name.clone()));
        };
        let Value::List(items) = value else {
            return Err(EncodeError::InvalidValue {
                field: field.name.clone(),
                reason: format!("expected a list, got a {}", value.kind()),
            });
        };
        if let RepeatCount::Fixed(n) = &spec.count {
            if items.len() != *n {
                return Err(EncodeError::InvalidValue {
                    field: field.name.clone(),
                    reason: format!("{} item(s) supplied, schema fixes {n}", items.len()),
                });
            }
        }
        let bytes = match self.prepared_repeats.remove(&field.name) {
            Some(bytes) => bytes,
            None => self.encode_repeat_items(spec, items, &field.name)?,
        };
        cursor.write_bytes(&bytes);
        self.scope.bind(field.scope_name(), value.clone());
        Ok(())
    }

    fn encode_repeat_items(
        &mut self,
        spec: &RepeatSpec,
        items: &[Value],
        name: &str,
    ) -> Result<Vec<u8>, EncodeError> {
        let mut body = WriteCursor::new();
        for item in items {
            let Value::Map(item_record) = item else {
                return Err(EncodeError::InvalidValue {
                    field: name.to_string(),
                    reason: format!("list items must be maps, got a {}", item.kind()),
                });
            };
            self.scope.push();
            let result = self.encode_fields(&spec.fields, &mut body, item_record);
            self.scope.pop();
            result?;
        }
        Ok(body.into_bytes())
    }

    fn out_of_range(&self, field: &Field, raw: f64) -> EncodeError {
        EncodeError::InvalidValue {
            field: field.name.clone(),
            reason: format!("raw value {raw} does not fit the field"),
        }
    }
}

fn case_record_name(case: &TlvCase) -> String {
    case.name.clone().unwrap_or_else(|| {
        format!(
            "case_{}",
            case.tag
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("_")
        )
    })
}

/// A flagged group counts as present when any of its value-producing fields
/// appears in the record; encoding then demands the rest.
fn group_present(fields: &[Field], record: &Record) -> bool {
    fields.iter().any(|field| match &field.kind {
        FieldKind::Skip { .. } => false,
        FieldKind::ByteGroup { fields, .. } => group_present(fields, record),
        FieldKind::Match(_) | FieldKind::Flagged { .. } | FieldKind::Tlv(_) => false,
        _ => record.contains_key(&field.name),
    })
}

fn check_unsigned_width(field: &Field, raw: i64, width_bits: u32) -> Result<(), EncodeError> {
    if raw < 0 || (raw as u64) > mask(width_bits) {
        return Err(EncodeError::InvalidValue {
            field: field.name.clone(),
            reason: format!("{raw} does not fit in {width_bits} unsigned bit(s)"),
        });
    }
    Ok(())
}

fn check_signed_width(field: &Field, raw: i64, width_bits: u32) -> Result<(), EncodeError> {
    let min = -(1i64 << (width_bits - 1));
    let max = (1i64 << (width_bits - 1)) - 1;
    if raw < min || raw > max {
        return Err(EncodeError::InvalidValue {
            field: field.name.clone(),
            reason: format!("{raw} does not fit in {width_bits} signed bit(s)"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDef;

    fn schema(yaml: &str) -> Schema {
        let def: SchemaDef = serde_yaml::from_str(yaml).unwrap();
        Schema::build(def).unwrap()
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn reverses_fixed_point_scaling() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - { name: temperature, type: s16, div: 10, add: -40 }
        "#;
        let bytes = schema(yaml)
            .encode(&record(&[("temperature", Value::Float(-16.9))]))
            .unwrap();
        assert_eq!(bytes, vec![0x00, 0xE7]);
    }

    #[test]
    fn missing_input_is_fatal() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - { name: x, type: u8 }
        "#;
        assert!(matches!(
            schema(yaml).encode(&Record::new()),
            Err(EncodeError::MissingInput(name)) if name == "x"
        ));
    }

    #[test]
    fn width_overflow_is_rejected() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - { name: x, type: u8 }
        "#;
        assert!(matches!(
            schema(yaml).encode(&record(&[("x", Value::Int(300))])),
            Err(EncodeError::InvalidValue { .. })
        ));
    }

    #[test]
    fn flags_are_recomputed_from_presence() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - { name: flags, type: u8 }
              - type: flagged
                on: $flags
                groups:
                  - bit: 0
                    fields: [{ name: a, type: u8 }]
                  - bit: 1
                    fields: [{ name: b, type: u8 }]
        "#;
        // Only `b` present: flags byte must come out as 0b10.
        let bytes = schema(yaml)
            .encode(&record(&[("b", Value::UInt(7))]))
            .unwrap();
        assert_eq!(bytes, vec![0x02, 0x07]);
    }

    #[test]
    fn explicit_flags_must_agree() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - { name: flags, type: u8 }
              - type: flagged
                on: $flags
                groups:
                  - bit: 0
                    fields: [{ name: a, type: u8 }]
        "#;
        let err = schema(yaml)
            .encode(&record(&[("flags", Value::UInt(0)), ("a", Value::UInt(1))]))
            .unwrap_err();
        assert!(matches!(
            err,
            EncodeError::FlagMismatch {
                given: 0,
                computed: 1,
                ..
            }
        ));
    }

    #[test]
    fn count_field_is_backfilled() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - { name: n, type: u8 }
              - name: items
                type: repeat
                count_field: $n
                fields:
                  - { name: v, type: u8 }
        "#;
        let items = Value::List(vec![
            Value::Map(record(&[("v", Value::UInt(0xAA))])),
            Value::Map(record(&[("v", Value::UInt(0xBB))])),
        ]);
        let bytes = schema(yaml)
            .encode(&record(&[("items", items)]))
            .unwrap();
        assert_eq!(bytes, vec![0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn byte_length_is_backfilled() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - { name: len, type: u8 }
              - name: items
                type: repeat
                byte_length: $len
                fields:
                  - { name: v, type: u16 }
        "#;
        let items = Value::List(vec![
            Value::Map(record(&[("v", Value::UInt(0x0102))])),
            Value::Map(record(&[("v", Value::UInt(0x0304))])),
        ]);
        let bytes = schema(yaml)
            .encode(&record(&[("items", items)]))
            .unwrap();
        assert_eq!(bytes, vec![0x04, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn computed_fields_are_never_encoded() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - { name: raw, type: u16 }
              - { name: scaled, type: number, ref: $raw, div: 50 }
        "#;
        let bytes = schema(yaml)
            .encode(&record(&[
                ("raw", Value::UInt(600)),
                ("scaled", Value::Float(12.0)),
            ]))
            .unwrap();
        assert_eq!(bytes, vec![0x02, 0x58]);
    }

    #[test]
    fn skip_pads_with_zeroes() {
        let yaml = r#"
            name: t
            version: 1
            fields:
              - { name: x, type: u8 }
              - { type: skip, length: 2 }
              - { name: y, type: u8 }
        "#;
        let bytes = schema(yaml)
            .encode(&record(&[("x", Value::UInt(1)), ("y", Value::UInt(2))]))
            .unwrap();
        assert_eq!(bytes, vec![0x01, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn ports_require_an_explicit_port() {
        let yaml = r#"
            name: t
            version: 1
            ports:
              2:
                fields:
                  - { name: x, type: u8 }
        "#;
        let schema = schema(yaml);
        let input = record(&[("x", Value::UInt(9))]);
        assert!(matches!(
            schema.encode(&input),
            Err(EncodeError::MissingPort)
        ));
        assert_eq!(schema.encode_with_port(&input, 2).unwrap(), vec![0x09]);
        assert!(matches!(
            schema.encode_with_port(&input, 3),
            Err(EncodeError::NoPortSchema(3))
        ));
    }
}
