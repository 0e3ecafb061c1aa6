//! Compact binary schema representation for constrained devices.
//!
//! Wire layout (all multi-byte scalars little-endian):
//!
//! | Offset | Bytes | Meaning                                              |
//! |--------|-------|------------------------------------------------------|
//! | 0..1   | 2     | Magic `'P' 'S'`                                      |
//! | 2      | 1     | Format version (1)                                   |
//! | 3      | 1     | Global flags: bit 0 = byte order (0 big, 1 little)   |
//! | 4      | 1     | Field count `N`                                      |
//! | 5…     | 4·N+… | Field records, each optionally followed by a trailer |
//!
//! A field record is four bytes: a type byte (bit 7 = options trailer
//! present, bit 6 = per-field little-endian override, bits 5..0 = type
//! code), a modifier-exponent byte (signed power of ten for `mult`, 0 =
//! none, sentinel `0x81` = ×0.5), and a 16-bit IPSO semantic ID (0 = none).
//!
//! When bit 7 is set, the record is followed by a trailer: one total-length
//! byte, then `(kind, len, payload…)` options carrying the field name,
//! byte length, lookup table, polynomial coefficients, bit coordinates,
//! `div`/`add`, valid range, and unit. The loader rejects unknown option
//! kinds unless the caller opts into ignoring them.
//!
//! Only flat field lists are expressible; structural constructs belong to
//! the full textual schema.

use crate::bitfield::{BitPos, BitSpec};
use crate::cursor::ByteOrder;
use crate::errors::BinarySchemaError;
use crate::modifier::Modifiers;
use crate::schema::{
    BytesFormat, Field, FieldKind, FieldMeta, Schema, SchemaBody, Direction,
};
use crate::value::Value;
use log::debug;

const MAGIC: [u8; 2] = *b"PS";
const FORMAT_VERSION: u8 = 1;

const FLAG_LITTLE_ENDIAN: u8 = 0x01;

const REC_EXTENDED: u8 = 0x80;
const REC_LITTLE: u8 = 0x40;
const REC_TYPE_MASK: u8 = 0x3F;

/// Sentinel exponent meaning `mult: 0.5`.
const EXP_HALF: u8 = 0x81;

mod type_code {
    pub const U8: u8 = 0x01;
    pub const U16: u8 = 0x02;
    pub const U24: u8 = 0x03;
    pub const U32: u8 = 0x04;
    pub const U64: u8 = 0x05;
    pub const S8: u8 = 0x09;
    pub const S16: u8 = 0x0A;
    pub const S24: u8 = 0x0B;
    pub const S32: u8 = 0x0C;
    pub const S64: u8 = 0x0D;
    pub const F16: u8 = 0x11;
    pub const F32: u8 = 0x12;
    pub const F64: u8 = 0x13;
    pub const BOOL: u8 = 0x18;
    pub const UDEC: u8 = 0x19;
    pub const SDEC: u8 = 0x1A;
    pub const ASCII: u8 = 0x20;
    pub const BYTES: u8 = 0x21;
    pub const HEX: u8 = 0x22;
    pub const BASE64: u8 = 0x23;
    pub const SKIP: u8 = 0x24;
    pub const ENUM: u8 = 0x28;
    pub const BITS: u8 = 0x29;
}

mod option_kind {
    pub const NAME: u8 = 0x01;
    pub const LENGTH: u8 = 0x02;
    pub const LOOKUP: u8 = 0x03;
    pub const POLYNOMIAL: u8 = 0x04;
    pub const BIT_COORDS: u8 = 0x05;
    pub const DIV: u8 = 0x06;
    pub const ADD: u8 = 0x07;
    pub const VALID_RANGE: u8 = 0x08;
    pub const UNIT: u8 = 0x09;
    pub const MULT: u8 = 0x0A;
}

const COORD_SIGNED: u8 = 0x01;
const COORD_SEQUENTIAL: u8 = 0x02;

/// Loads a compact binary schema, rejecting unknown trailer options.
pub fn load_schema_binary(bytes: &[u8]) -> Result<Schema, BinarySchemaError> {
    load_schema_binary_with(bytes, false)
}

/// Loads a compact binary schema. With `ignore_unknown`, unrecognized
/// trailer options are skipped instead of rejected.
pub fn load_schema_binary_with(
    bytes: &[u8],
    ignore_unknown: bool,
) -> Result<Schema, BinarySchemaError> {
    let mut reader = Reader { bytes, pos: 0 };
    if reader.take(2)? != MAGIC {
        return Err(BinarySchemaError::BadMagic);
    }
    let version = reader.byte()?;
    if version != FORMAT_VERSION {
        return Err(BinarySchemaError::UnsupportedVersion(version));
    }
    let flags = reader.byte()?;
    let byte_order = if flags & FLAG_LITTLE_ENDIAN != 0 {
        ByteOrder::Little
    } else {
        ByteOrder::Big
    };
    let count = reader.byte()? as usize;
    debug!("loading binary schema: {count} field(s), {byte_order:?} order");

    let mut fields = Vec::with_capacity(count);
    for index in 0..count {
        fields.push(read_field(&mut reader, index, ignore_unknown)?);
    }
    if reader.pos != bytes.len() {
        return Err(BinarySchemaError::InvalidRecord {
            index: count,
            reason: format!("{} byte(s) after the last record", bytes.len() - reader.pos),
        });
    }

    Ok(Schema {
        name: "binary".into(),
        version: i64::from(FORMAT_VERSION),
        byte_order,
        strict: false,
        direction: Direction::Bidirectional,
        metadata: Vec::new(),
        body: SchemaBody::Fields(fields),
        test_vectors: Vec::new(),
    })
}

/// Writes the binary form of a schema. Only flat field lists without
/// structural constructs are representable.
pub fn write_schema_binary(schema: &Schema) -> Result<Vec<u8>, BinarySchemaError> {
    let SchemaBody::Fields(fields) = &schema.body else {
        return Err(BinarySchemaError::Unrepresentable(
            "port routing".into(),
        ));
    };
    if fields.len() > u8::MAX as usize {
        return Err(BinarySchemaError::Unrepresentable(format!(
            "{} fields (the format carries at most 255)",
            fields.len()
        )));
    }
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(FORMAT_VERSION);
    out.push(match schema.byte_order {
        ByteOrder::Big => 0,
        ByteOrder::Little => FLAG_LITTLE_ENDIAN,
    });
    out.push(fields.len() as u8);
    for field in fields {
        write_field(&mut out, field)?;
    }
    Ok(out)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BinarySchemaError> {
        if self.pos + n > self.bytes.len() {
            return Err(BinarySchemaError::Truncated(self.pos));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, BinarySchemaError> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16, BinarySchemaError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn f64_le(&mut self) -> Result<f64, BinarySchemaError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(buf))
    }
}

#[derive(Default)]
struct Options {
    name: Option<String>,
    length: Option<usize>,
    lookup: Vec<(i64, Value)>,
    polynomial: Option<Vec<f64>>,
    coords: Option<(BitSpec, bool)>,
    div: Option<f64>,
    add: Option<f64>,
    mult: Option<f64>,
    valid_range: Option<(f64, f64)>,
    unit: Option<String>,
}

fn read_field(
    reader: &mut Reader<'_>,
    index: usize,
    ignore_unknown: bool,
) -> Result<Field, BinarySchemaError> {
    let type_byte = reader.byte()?;
    let exponent = reader.byte()?;
    let ipso = reader.u16_le()?;
    let endian = if type_byte & REC_LITTLE != 0 {
        Some(ByteOrder::Little)
    } else {
        None
    };

    let mut options = Options::default();
    if type_byte & REC_EXTENDED != 0 {
        read_options(reader, index, ignore_unknown, &mut options)?;
    }

    let mut mult = options.mult;
    if mult.is_none() && exponent != 0 {
        mult = Some(if exponent == EXP_HALF {
            0.5
        } else {
            10f64.powi(i32::from(exponent as i8))
        });
    }

    let invalid = |reason: &str| BinarySchemaError::InvalidRecord {
        index,
        reason: reason.to_string(),
    };
    let need_length = || options.length.ok_or_else(|| invalid("missing length option"));

    let code = type_byte & REC_TYPE_MASK;
    let kind = match code {
        type_code::U8 => FieldKind::UInt { width: 1, endian },
        type_code::U16 => FieldKind::UInt { width: 2, endian },
        type_code::U24 => FieldKind::UInt { width: 3, endian },
        type_code::U32 => FieldKind::UInt { width: 4, endian },
        type_code::U64 => FieldKind::UInt { width: 8, endian },
        type_code::S8 => FieldKind::Int { width: 1, endian },
        type_code::S16 => FieldKind::Int { width: 2, endian },
        type_code::S24 => FieldKind::Int { width: 3, endian },
        type_code::S32 => FieldKind::Int { width: 4, endian },
        type_code::S64 => FieldKind::Int { width: 8, endian },
        type_code::F16 => FieldKind::Float { width: 2, endian },
        type_code::F32 => FieldKind::Float { width: 4, endian },
        type_code::F64 => FieldKind::Float { width: 8, endian },
        type_code::BOOL => FieldKind::Bool {
            bit: options.coords.map(|(spec, _)| match spec.pos {
                BitPos::Range { start, .. } => start,
                BitPos::Sequential { .. } => 0,
            }),
        },
        type_code::UDEC => FieldKind::Decimal { signed: false },
        type_code::SDEC => FieldKind::Decimal { signed: true },
        type_code::ASCII => FieldKind::Ascii {
            length: need_length()?,
        },
        type_code::BYTES => FieldKind::Bytes {
            length: need_length()?,
            format: BytesFormat::Raw,
        },
        type_code::HEX => FieldKind::Bytes {
            length: need_length()?,
            format: BytesFormat::Hex {
                separator: None,
                uppercase: false,
            },
        },
        type_code::BASE64 => FieldKind::Bytes {
            length: need_length()?,
            format: BytesFormat::Base64,
        },
        type_code::SKIP => FieldKind::Skip {
            length: need_length()?,
        },
        type_code::ENUM => {
            let cases = options
                .lookup
                .iter()
                .map(|(k, v)| match v {
                    Value::Str(s) => Ok((*k, s.clone())),
                    _ => Err(invalid("enum lookup labels must be strings")),
                })
                .collect::<Result<Vec<_>, _>>()?;
            FieldKind::Enum {
                width: options.length.unwrap_or(1) as u32,
                endian,
                cases,
            }
        }
        type_code::BITS => {
            let (spec, _) = options
                .coords
                .ok_or_else(|| invalid("missing bit coordinates"))?;
            FieldKind::Bits(spec)
        }
        code => return Err(BinarySchemaError::UnknownTypeCode { index, code }),
    };

    let lookup = if matches!(kind, FieldKind::Enum { .. }) {
        Vec::new()
    } else {
        options.lookup
    };
    Ok(Field {
        name: options.name.unwrap_or_else(|| format!("field_{index}")),
        var: None,
        kind,
        modifiers: Modifiers {
            lookup,
            polynomial: options.polynomial,
            mult,
            div: options.div,
            add: options.add,
            valid_range: options.valid_range,
            ..Default::default()
        },
        meta: FieldMeta {
            unit: options.unit,
            ipso: (ipso != 0).then_some(ipso),
            valid_range: options.valid_range,
            ..Default::default()
        },
        consume: false,
    })
}

fn read_options(
    reader: &mut Reader<'_>,
    index: usize,
    ignore_unknown: bool,
    options: &mut Options,
) -> Result<(), BinarySchemaError> {
    let total = reader.byte()? as usize;
    let end = reader.pos + total;
    if end > reader.bytes.len() {
        return Err(BinarySchemaError::Truncated(reader.pos));
    }
    while reader.pos < end {
        let kind = reader.byte()?;
        let len = reader.byte()? as usize;
        if reader.pos + len > end {
            return Err(BinarySchemaError::Truncated(reader.pos));
        }
        let payload_end = reader.pos + len;
        let invalid = |reason: &str| BinarySchemaError::InvalidRecord {
            index,
            reason: reason.to_string(),
        };
        match kind {
            option_kind::NAME => {
                let bytes = reader.take(len)?;
                options.name = Some(
                    std::str::from_utf8(bytes)
                        .map_err(|_| invalid("field name is not UTF-8"))?
                        .to_string(),
                );
            }
            option_kind::LENGTH => {
                if len != 2 {
                    return Err(invalid("length option must be 2 bytes"));
                }
                options.length = Some(reader.u16_le()? as usize);
            }
            option_kind::LOOKUP => {
                while reader.pos < payload_end {
                    let key_bytes = reader.take(4)?;
                    let key = i32::from_le_bytes([
                        key_bytes[0],
                        key_bytes[1],
                        key_bytes[2],
                        key_bytes[3],
                    ]);
                    let label_len = reader.byte()? as usize;
                    let label = std::str::from_utf8(reader.take(label_len)?)
                        .map_err(|_| invalid("lookup label is not UTF-8"))?
                        .to_string();
                    options.lookup.push((i64::from(key), Value::Str(label)));
                }
            }
            option_kind::POLYNOMIAL => {
                let count = reader.byte()? as usize;
                let mut coefficients = Vec::with_capacity(count);
                for _ in 0..count {
                    coefficients.push(reader.f64_le()?);
                }
                options.polynomial = Some(coefficients);
            }
            option_kind::BIT_COORDS => {
                if len != 4 {
                    return Err(invalid("bit coordinates must be 4 bytes"));
                }
                let window = u32::from(reader.byte()?);
                let start = u32::from(reader.byte()?);
                let width = u32::from(reader.byte()?);
                let flags = reader.byte()?;
                let pos = if flags & COORD_SEQUENTIAL != 0 {
                    BitPos::Sequential { width }
                } else {
                    BitPos::Range { start, width }
                };
                options.coords = Some((
                    BitSpec {
                        window,
                        pos,
                        signed: flags & COORD_SIGNED != 0,
                    },
                    true,
                ));
            }
            option_kind::DIV => options.div = Some(reader.f64_le()?),
            option_kind::ADD => options.add = Some(reader.f64_le()?),
            option_kind::MULT => options.mult = Some(reader.f64_le()?),
            option_kind::VALID_RANGE => {
                options.valid_range = Some((reader.f64_le()?, reader.f64_le()?));
            }
            option_kind::UNIT => {
                let bytes = reader.take(len)?;
                options.unit = Some(
                    std::str::from_utf8(bytes)
                        .map_err(|_| invalid("unit is not UTF-8"))?
                        .to_string(),
                );
            }
            kind if ignore_unknown => {
                debug!("ignoring unknown option kind {kind:#04x}");
                reader.take(len)?;
            }
            kind => return Err(BinarySchemaError::UnknownOption { index, kind }),
        }
        if reader.pos != payload_end {
            return Err(invalid("option payload length mismatch"));
        }
    }
    Ok(())
}

fn write_field(out: &mut Vec<u8>, field: &Field) -> Result<(), BinarySchemaError> {
    let unrepresentable = |what: &str| {
        BinarySchemaError::Unrepresentable(format!("field `{}`: {what}", field.name))
    };
    let mut endian = None;
    let (code, length, coords): (u8, Option<usize>, Option<(BitSpec, bool)>) = match &field.kind {
        FieldKind::UInt { width, endian: e } => {
            endian = *e;
            let code = match width {
                1 => type_code::U8,
                2 => type_code::U16,
                3 => type_code::U24,
                4 => type_code::U32,
                _ => type_code::U64,
            };
            (code, None, None)
        }
        FieldKind::Int { width, endian: e } => {
            endian = *e;
            let code = match width {
                1 => type_code::S8,
                2 => type_code::S16,
                3 => type_code::S24,
                4 => type_code::S32,
                _ => type_code::S64,
            };
            (code, None, None)
        }
        FieldKind::Float { width, endian: e } => {
            endian = *e;
            let code = match width {
                2 => type_code::F16,
                4 => type_code::F32,
                _ => type_code::F64,
            };
            (code, None, None)
        }
        FieldKind::Bool { bit } => (
            type_code::BOOL,
            None,
            bit.map(|bit| {
                (
                    BitSpec {
                        window: 1,
                        pos: BitPos::Range {
                            start: bit,
                            width: 1,
                        },
                        signed: false,
                    },
                    true,
                )
            }),
        ),
        FieldKind::Decimal { signed: false } => (type_code::UDEC, None, None),
        FieldKind::Decimal { signed: true } => (type_code::SDEC, None, None),
        FieldKind::Ascii { length } => (type_code::ASCII, Some(*length), None),
        FieldKind::Bytes {
            length,
            format: BytesFormat::Raw,
        } => (type_code::BYTES, Some(*length), None),
        FieldKind::Bytes {
            length,
            format: BytesFormat::Hex { .. },
        } => (type_code::HEX, Some(*length), None),
        FieldKind::Bytes {
            length,
            format: BytesFormat::Base64,
        } => (type_code::BASE64, Some(*length), None),
        FieldKind::Skip { length } => (type_code::SKIP, Some(*length), None),
        FieldKind::Enum { width, endian: e, .. } => {
            endian = *e;
            (type_code::ENUM, Some(*width as usize), None)
        }
        FieldKind::Bits(spec) => (type_code::BITS, None, Some((*spec, true))),
        FieldKind::BitfieldString { .. } => return Err(unrepresentable("bitfield strings")),
        FieldKind::Computed(_) | FieldKind::Literal(_) => {
            return Err(unrepresentable("derived fields"))
        }
        FieldKind::Object { .. }
        | FieldKind::ByteGroup { .. }
        | FieldKind::Match(_)
        | FieldKind::Flagged { .. }
        | FieldKind::Tlv(_)
        | FieldKind::Repeat(_) => return Err(unrepresentable("structural constructs")),
    };
    if field.modifiers.encoding.is_some()
        || !field.modifiers.match_value.is_empty()
        || !field.modifiers.transform.is_empty()
        || field.modifiers.guard.is_some()
    {
        return Err(unrepresentable("transforms and re-encodings"));
    }

    // The exponent byte carries common mult values; anything else becomes an
    // explicit option.
    let (exponent, mult_option) = match field.modifiers.mult {
        None => (0u8, None),
        Some(m) if m == 0.5 => (EXP_HALF, None),
        Some(m) => match power_of_ten(m) {
            Some(e) => (e as u8, None),
            None => (0u8, Some(m)),
        },
    };

    let mut trailer = Vec::new();
    push_option(&mut trailer, option_kind::NAME, field.name.as_bytes());
    if let Some(length) = length {
        let length = u16::try_from(length).map_err(|_| unrepresentable("length over 65535"))?;
        push_option(&mut trailer, option_kind::LENGTH, &length.to_le_bytes());
    }
    let lookup: &[(i64, Value)] = match &field.kind {
        FieldKind::Enum { cases, .. } => {
            // Reuse the lookup option for enum labels.
            let mut payload = Vec::new();
            for (key, label) in cases {
                let key = i32::try_from(*key).map_err(|_| unrepresentable("enum key width"))?;
                payload.extend_from_slice(&key.to_le_bytes());
                payload.push(
                    u8::try_from(label.len())
                        .map_err(|_| unrepresentable("enum label over 255 bytes"))?,
                );
                payload.extend_from_slice(label.as_bytes());
            }
            push_option(&mut trailer, option_kind::LOOKUP, &payload);
            &[]
        }
        _ => &field.modifiers.lookup,
    };
    if !lookup.is_empty() {
        let mut payload = Vec::new();
        for (key, value) in lookup {
            let Value::Str(label) = value else {
                return Err(unrepresentable("non-string lookup values"));
            };
            let key = i32::try_from(*key).map_err(|_| unrepresentable("lookup key width"))?;
            payload.extend_from_slice(&key.to_le_bytes());
            payload.push(
                u8::try_from(label.len())
                    .map_err(|_| unrepresentable("lookup label over 255 bytes"))?,
            );
            payload.extend_from_slice(label.as_bytes());
        }
        push_option(&mut trailer, option_kind::LOOKUP, &payload);
    }
    if let Some(coefficients) = &field.modifiers.polynomial {
        let mut payload = vec![u8::try_from(coefficients.len())
            .map_err(|_| unrepresentable("polynomial degree"))?];
        for c in coefficients {
            payload.extend_from_slice(&c.to_le_bytes());
        }
        push_option(&mut trailer, option_kind::POLYNOMIAL, &payload);
    }
    if let Some((spec, _)) = coords {
        let (start, width, mut flags) = match spec.pos {
            BitPos::Range { start, width } => (start, width, 0u8),
            BitPos::Sequential { width } => (0, width, COORD_SEQUENTIAL),
        };
        if spec.signed {
            flags |= COORD_SIGNED;
        }
        push_option(
            &mut trailer,
            option_kind::BIT_COORDS,
            &[spec.window as u8, start as u8, width as u8, flags],
        );
    }
    if let Some(m) = mult_option {
        push_option(&mut trailer, option_kind::MULT, &m.to_le_bytes());
    }
    if let Some(d) = field.modifiers.div {
        push_option(&mut trailer, option_kind::DIV, &d.to_le_bytes());
    }
    if let Some(a) = field.modifiers.add {
        push_option(&mut trailer, option_kind::ADD, &a.to_le_bytes());
    }
    if let Some((lo, hi)) = field.modifiers.valid_range {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&lo.to_le_bytes());
        payload.extend_from_slice(&hi.to_le_bytes());
        push_option(&mut trailer, option_kind::VALID_RANGE, &payload);
    }
    if let Some(unit) = &field.meta.unit {
        push_option(&mut trailer, option_kind::UNIT, unit.as_bytes());
    }
    if trailer.len() > u8::MAX as usize {
        return Err(unrepresentable("options over 255 bytes"));
    }

    let mut type_byte = code;
    if endian == Some(ByteOrder::Little) {
        type_byte |= REC_LITTLE;
    }
    if !trailer.is_empty() {
        type_byte |= REC_EXTENDED;
    }
    out.push(type_byte);
    out.push(exponent);
    out.extend_from_slice(&field.meta.ipso.unwrap_or(0).to_le_bytes());
    if !trailer.is_empty() {
        out.push(trailer.len() as u8);
        out.extend_from_slice(&trailer);
    }
    Ok(())
}

fn push_option(trailer: &mut Vec<u8>, kind: u8, payload: &[u8]) {
    trailer.push(kind);
    trailer.push(payload.len() as u8);
    trailer.extend_from_slice(payload);
}

fn power_of_ten(m: f64) -> Option<i8> {
    for e in -38i8..=38 {
        let candidate = 10f64.powi(i32::from(e));
        if (m / candidate - 1.0).abs() < 1e-12 {
            return Some(e);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDef;
    use crate::value::{Record, Value as V};

    fn schema(yaml: &str) -> Schema {
        let def: SchemaDef = serde_yaml::from_str(yaml).unwrap();
        Schema::build(def).unwrap()
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        assert!(matches!(
            load_schema_binary(b"XX\x01\x00\x00"),
            Err(BinarySchemaError::BadMagic)
        ));
        assert!(matches!(
            load_schema_binary(b"PS\x07\x00\x00"),
            Err(BinarySchemaError::UnsupportedVersion(7))
        ));
        assert!(matches!(
            load_schema_binary(b"PS"),
            Err(BinarySchemaError::Truncated(_))
        ));
    }

    #[test]
    fn minimal_schema_round_trips() {
        let original = schema(
            r#"
            name: t
            version: 1
            fields:
              - { name: temperature, type: s16, div: 10, add: -40, ipso: 3303, unit: Cel }
              - { name: battery, type: u8, mult: 0.5 }
              - { name: raw, type: bytes, length: 4 }
        "#,
        );
        let bytes = write_schema_binary(&original).unwrap();
        assert_eq!(&bytes[0..2], b"PS");
        let loaded = load_schema_binary(&bytes).unwrap();

        let payload = [0x00, 0xE7, 0xC8, 0xAA, 0xBB, 0xCC, 0xDD];
        let a = original.decode(&payload, None).unwrap().record;
        let b = loaded.decode(&payload, None).unwrap().record;
        assert_eq!(a, b);
        assert_eq!(b.get("temperature"), Some(&V::Float(-16.9)));
        assert_eq!(b.get("battery"), Some(&V::Float(100.0)));
        assert_eq!(
            loaded.field_metadata("temperature").unwrap().ipso,
            Some(3303)
        );
    }

    #[test]
    fn lookup_and_bitfields_survive() {
        let original = schema(
            r#"
            name: t
            version: 1
            fields:
              - name: mode
                type: u8
                lookup: [[0, idle], [1, active]]
              - { name: low, type: "u8[0:3]" }
              - { name: high, type: "u8[4:7]" }
        "#,
        );
        let bytes = write_schema_binary(&original).unwrap();
        let loaded = load_schema_binary(&bytes).unwrap();
        let decoded = loaded.decode(&[0x01, 0xA5], None).unwrap().record;
        assert_eq!(decoded.get("mode"), Some(&V::from("active")));
        assert_eq!(decoded.get("low"), Some(&V::UInt(5)));
        assert_eq!(decoded.get("high"), Some(&V::UInt(10)));
    }

    #[test]
    fn structural_constructs_are_unrepresentable() {
        let original = schema(
            r#"
            name: t
            version: 1
            fields:
              - name: env
                type: object
                fields:
                  - { name: x, type: u8 }
        "#,
        );
        assert!(matches!(
            write_schema_binary(&original),
            Err(BinarySchemaError::Unrepresentable(_))
        ));
    }

    #[test]
    fn unknown_options_are_rejected_unless_opted_out() {
        // One u8 field with an unknown option kind 0x7F.
        let bytes = [
            b'P', b'S', 1, 0, 1, // header
            0x81, 0, 0, 0, // extended u8 record
            4,    // trailer length
            0x7F, 2, 0xDE, 0xAD, // unknown option
        ];
        assert!(matches!(
            load_schema_binary(&bytes),
            Err(BinarySchemaError::UnknownOption { kind: 0x7F, .. })
        ));
        let loaded = load_schema_binary_with(&bytes, true).unwrap();
        let decoded = loaded.decode(&[0x2A], None).unwrap().record;
        assert_eq!(decoded.get("field_0"), Some(&V::UInt(42)));
    }

    #[test]
    fn encode_round_trips_through_the_binary_form() {
        let original = schema(
            r#"
            name: t
            version: 1
            fields:
              - { name: a, type: u16, div: 100 }
              - { name: b, type: s8 }
        "#,
        );
        let loaded = load_schema_binary(&write_schema_binary(&original).unwrap()).unwrap();
        let mut record = Record::new();
        record.insert("a".into(), V::Float(3.21));
        record.insert("b".into(), V::Int(-5));
        assert_eq!(loaded.encode(&record).unwrap(), vec![0x01, 0x41, 0xFB]);
    }
}
