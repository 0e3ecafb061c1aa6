//! Schema model: the serde-facing definition tree and the compiled,
//! read-only form the codec drivers walk.
//!
//! A schema arrives as a [`SchemaDef`], the language-neutral tree an
//! external text front-end (YAML, JSON, ...) deserializes, and is compiled
//! into a [`Schema`] by [`Schema::build`]. Compilation parses type and bit
//! notations, inlines `definitions` referenced through `use:`, checks that
//! field names are unique per lexical scope and that every `$name` reference
//! resolves to an earlier field, and rejects the constructs this
//! implementation deliberately refuses (multi-byte nibble decimals, legacy
//! `formula` expressions).
//!
//! A compiled schema is immutable; any number of threads may decode and
//! encode against it concurrently.

use crate::bitfield::{BitPos, BitSpec};
use crate::compute::{
    CmpOp, Computed, ComputedSource, ComputeExpr, ComputeOp, Guard, GuardPred, Operand,
};
use crate::cursor::ByteOrder;
use crate::errors::SchemaError;
use crate::modifier::{IntEncoding, MatchValueArm, Modifiers, Predicate, TransformOp};
use crate::value::{Record, Value};
use ahash::AHashSet;
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Definition tree (serde-facing)
// ---------------------------------------------------------------------------

/// Top level of the pre-parsed schema tree.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDef {
    pub name: String,
    pub version: i64,
    #[serde(default)]
    pub byte_order: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub definitions: IndexMap<String, Vec<FieldDef>>,
    #[serde(default)]
    pub metadata: Vec<String>,
    #[serde(default)]
    pub fields: Option<Vec<FieldDef>>,
    #[serde(default)]
    pub ports: Option<BTreeMap<u32, PortDef>>,
    #[serde(default)]
    pub test_vectors: Vec<TestVectorDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortDef {
    #[serde(default)]
    pub name: Option<String>,
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestVectorDef {
    #[serde(default)]
    pub description: Option<String>,
    /// Payload as hex text.
    pub payload: String,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub expect: IndexMap<String, LiteralDef>,
}

/// A schema-tree literal: lookup values, constants, expected test results.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LiteralDef {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<LiteralDef>),
    Map(IndexMap<String, LiteralDef>),
}

impl From<LiteralDef> for Value {
    fn from(def: LiteralDef) -> Value {
        match def {
            LiteralDef::Null => Value::Null,
            LiteralDef::Bool(v) => Value::Bool(v),
            LiteralDef::Int(v) => Value::Int(v),
            LiteralDef::Float(v) => Value::Float(v),
            LiteralDef::Str(v) => Value::Str(v),
            LiteralDef::List(items) => Value::List(items.into_iter().map(Value::from).collect()),
            LiteralDef::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// One node of the definition tree. Deliberately permissive: which
/// attributes are meaningful depends on `type`, and compilation validates
/// the rest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FieldDef {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub field_type: Option<String>,
    pub length: Option<usize>,
    pub size: Option<usize>,
    pub endian: Option<String>,
    pub signed: Option<bool>,
    pub bit: Option<u32>,
    pub consume: bool,
    pub var: Option<String>,

    // Modifier pipeline
    pub mult: Option<f64>,
    pub div: Option<f64>,
    pub add: Option<f64>,
    pub lookup: Option<Vec<(i64, LiteralDef)>>,
    pub match_value: Option<Vec<MatchValueDef>>,
    pub transform: Option<Vec<String>>,
    pub encoding: Option<String>,
    pub valid_range: Option<(f64, f64)>,

    // Semantic tags
    pub unit: Option<String>,
    pub resolution: Option<f64>,
    pub ipso: Option<u16>,
    pub senml: Option<String>,
    pub unece: Option<String>,

    // Computed fields
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    pub polynomial: Option<Vec<f64>>,
    pub compute: Option<ComputeDef>,
    pub guard: Option<GuardDef>,
    pub formula: Option<String>,
    pub value: Option<LiteralDef>,

    // Structural constructs
    pub fields: Option<Vec<FieldDef>>,
    pub on: Option<String>,
    pub cases: Option<Vec<CaseDef>>,
    pub default: Option<DefaultDef>,
    pub groups: Option<Vec<FlagGroupDef>>,
    pub tag_size: Option<usize>,
    pub length_size: Option<usize>,
    pub tag_fields: Option<Vec<FieldDef>>,
    pub on_unknown: Option<String>,
    pub merge: Option<bool>,
    pub repeat: Option<String>,
    pub count: Option<usize>,
    pub count_field: Option<String>,
    pub byte_length: Option<CountDef>,
    pub until: Option<String>,
    pub min: Option<usize>,
    pub max: Option<usize>,

    // Reusable definitions
    #[serde(rename = "use")]
    pub use_def: Option<String>,
    pub prefix: Option<String>,

    // bitfield_string / hex rendering
    pub parts: Option<Vec<String>>,
    pub separator: Option<String>,
    pub uppercase: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchValueDef {
    pub when: String,
    #[serde(default)]
    pub mult: Option<f64>,
    #[serde(default)]
    pub div: Option<f64>,
    #[serde(default)]
    pub add: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputeDef {
    pub op: String,
    pub a: OperandDef,
    pub b: OperandDef,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OperandDef {
    Num(f64),
    Ref(String),
    Expr(Box<ComputeDef>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardDef {
    #[serde(rename = "if")]
    pub predicates: Vec<GuardPredDef>,
    #[serde(rename = "else")]
    pub else_value: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardPredDef {
    pub field: String,
    pub op: String,
    pub value: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaseDef {
    /// Match pattern (literal, set, `lo..hi` range, or `_`).
    #[serde(default)]
    pub when: Option<PatternDef>,
    /// TLV tag (scalar, or one component per composite tag field).
    #[serde(default)]
    pub tag: Option<PatternDef>,
    #[serde(default)]
    pub name: Option<String>,
    /// Implicit body length for TLVs without a length field.
    #[serde(default)]
    pub length: Option<usize>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PatternDef {
    Int(i64),
    List(Vec<i64>),
    Str(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DefaultDef {
    Policy(String),
    Fields(Vec<FieldDef>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagGroupDef {
    pub bit: u32,
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CountDef {
    Fixed(usize),
    Ref(String),
}

// ---------------------------------------------------------------------------
// Compiled model
// ---------------------------------------------------------------------------

/// Transfer direction hint. Does not change codec semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Uplink,
    Downlink,
    #[default]
    Bidirectional,
}

/// Externally visible per-field metadata (`field_metadata` API).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct FieldMeta {
    pub unit: Option<String>,
    pub resolution: Option<f64>,
    pub ipso: Option<u16>,
    pub senml: Option<String>,
    pub unece: Option<String>,
    pub valid_range: Option<(f64, f64)>,
}

/// A compiled, validated, read-only schema.
#[derive(Debug)]
pub struct Schema {
    pub name: String,
    pub version: i64,
    pub byte_order: ByteOrder,
    pub strict: bool,
    pub direction: Direction,
    pub metadata: Vec<String>,
    pub(crate) body: SchemaBody,
    pub test_vectors: Vec<TestVector>,
}

#[derive(Debug)]
pub(crate) enum SchemaBody {
    Fields(Vec<Field>),
    Ports(BTreeMap<u32, PortSchema>),
}

#[derive(Debug)]
pub struct PortSchema {
    pub name: Option<String>,
    pub(crate) fields: Vec<Field>,
}

/// A schema-embedded conformance vector, consumed by external validators.
#[derive(Debug, Clone)]
pub struct TestVector {
    pub description: Option<String>,
    pub payload: Vec<u8>,
    pub port: Option<u32>,
    pub expect: Record,
}

#[derive(Debug)]
pub(crate) struct Field {
    pub name: String,
    pub var: Option<String>,
    pub kind: FieldKind,
    pub modifiers: Modifiers,
    pub meta: FieldMeta,
    pub consume: bool,
}

impl Field {
    /// The name this field binds in the variable scope.
    pub fn scope_name(&self) -> &str {
        self.var.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug)]
pub(crate) enum FieldKind {
    UInt {
        width: u32,
        endian: Option<ByteOrder>,
    },
    Int {
        width: u32,
        endian: Option<ByteOrder>,
    },
    Float {
        width: u32,
        endian: Option<ByteOrder>,
    },
    Bool {
        bit: Option<u32>,
    },
    Bits(BitSpec),
    /// Single-byte nibble decimal, reported in tenths.
    Decimal {
        signed: bool,
    },
    Ascii {
        length: usize,
    },
    Bytes {
        length: usize,
        format: BytesFormat,
    },
    Skip {
        length: usize,
    },
    Enum {
        width: u32,
        endian: Option<ByteOrder>,
        cases: Vec<(i64, String)>,
    },
    BitfieldString {
        window: u32,
        parts: Vec<BitSpec>,
        separator: String,
    },
    Computed(Computed),
    Literal(Value),
    Object {
        fields: Vec<Field>,
    },
    ByteGroup {
        size: u32,
        fields: Vec<Field>,
    },
    Match(MatchSpec),
    Flagged {
        source: String,
        groups: Vec<FlagGroup>,
    },
    Tlv(TlvSpec),
    Repeat(RepeatSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BytesFormat {
    Raw,
    Hex {
        separator: Option<char>,
        uppercase: bool,
    },
    Base64,
}

#[derive(Debug)]
pub(crate) struct MatchSpec {
    pub selector: Selector,
    pub cases: Vec<MatchCase>,
    pub default: MatchDefault,
}

#[derive(Debug)]
pub(crate) enum Selector {
    Ref(String),
    Expr(ComputeExpr),
}

#[derive(Debug)]
pub(crate) struct MatchCase {
    pub pattern: CasePattern,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CasePattern {
    Literal(i64),
    Set(Vec<i64>),
    Range(i64, i64),
}

impl CasePattern {
    pub fn matches(&self, v: i64) -> bool {
        match self {
            CasePattern::Literal(k) => v == *k,
            CasePattern::Set(set) => set.contains(&v),
            CasePattern::Range(lo, hi) => v >= *lo && v <= *hi,
        }
    }
}

#[derive(Debug)]
pub(crate) enum MatchDefault {
    Error,
    Skip,
    Fields(Vec<Field>),
}

#[derive(Debug)]
pub(crate) struct FlagGroup {
    pub bit: u32,
    pub fields: Vec<Field>,
}

#[derive(Debug)]
pub(crate) struct TlvSpec {
    pub tag: TagLayout,
    /// 0 = no length field; body length is implicit per case.
    pub length_size: usize,
    pub cases: Vec<TlvCase>,
    pub on_unknown: UnknownTagPolicy,
    pub merge: bool,
    pub repeat: TlvRepeat,
}

#[derive(Debug)]
pub(crate) enum TagLayout {
    Plain { size: u32 },
    Composite { fields: Vec<Field> },
}

#[derive(Debug)]
pub(crate) struct TlvCase {
    /// One component for a plain tag, one per composite tag field.
    pub tag: Vec<i64>,
    pub name: Option<String>,
    pub length: Option<usize>,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnknownTagPolicy {
    Skip,
    Error,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlvRepeat {
    UntilEnd,
    Once,
}

#[derive(Debug)]
pub(crate) struct RepeatSpec {
    pub count: RepeatCount,
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub fields: Vec<Field>,
}

#[derive(Debug)]
pub(crate) enum RepeatCount {
    Fixed(usize),
    CountField(String),
    ByteLength(CountSource),
    UntilEnd,
}

#[derive(Debug)]
pub(crate) enum CountSource {
    Ref(String),
    Fixed(usize),
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

impl Schema {
    /// Compiles a definition tree into a read-only schema.
    pub fn build(def: SchemaDef) -> Result<Schema, SchemaError> {
        if def.version < 1 {
            return Err(SchemaError::InvalidVersion);
        }
        let byte_order = parse_byte_order(def.byte_order.as_deref())?;
        let direction = match def.direction.as_deref() {
            None => Direction::Bidirectional,
            Some("uplink") => Direction::Uplink,
            Some("downlink") => Direction::Downlink,
            Some("bidirectional") => Direction::Bidirectional,
            Some(other) => {
                return Err(SchemaError::InvalidField {
                    name: "direction".into(),
                    reason: format!("unknown direction `{other}`"),
                })
            }
        };

        let mut compiler = Compiler {
            definitions: def.definitions,
            scopes: vec![AHashSet::new()],
        };
        for name in &def.metadata {
            // Metadata values are bound before the walk; later fields may
            // reference them.
            compiler.scopes[0].insert(name.clone());
        }

        let body = match (def.fields, def.ports) {
            (Some(fields), None) => SchemaBody::Fields(compiler.compile_fields(&fields)?),
            (None, Some(ports)) => {
                let mut compiled = BTreeMap::new();
                for (port, port_def) in ports {
                    compiler.push_scope();
                    let fields = compiler.compile_fields(&port_def.fields)?;
                    compiler.pop_scope();
                    compiled.insert(
                        port,
                        PortSchema {
                            name: port_def.name,
                            fields,
                        },
                    );
                }
                SchemaBody::Ports(compiled)
            }
            _ => return Err(SchemaError::FieldsOrPorts),
        };

        let mut test_vectors = Vec::with_capacity(def.test_vectors.len());
        for vector in def.test_vectors {
            let cleaned: String = vector
                .payload
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            let payload = hex::decode(&cleaned).map_err(|_| SchemaError::InvalidField {
                name: "test_vectors".into(),
                reason: format!("`{}` is not hex", vector.payload),
            })?;
            test_vectors.push(TestVector {
                description: vector.description,
                payload,
                port: vector.port,
                expect: vector
                    .expect
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            });
        }

        Ok(Schema {
            name: def.name,
            version: def.version,
            byte_order,
            strict: def.strict,
            direction,
            metadata: def.metadata,
            body,
            test_vectors,
        })
    }

    /// Looks up the metadata of a field by dotted path (nested objects and
    /// repeat groups use their field name as a path segment).
    pub fn field_metadata(&self, path: &str) -> Option<&FieldMeta> {
        let segments: Vec<&str> = path.split('.').collect();
        match &self.body {
            SchemaBody::Fields(fields) => find_meta(fields, &segments),
            SchemaBody::Ports(ports) => ports
                .values()
                .find_map(|port| find_meta(&port.fields, &segments)),
        }
    }

    pub(crate) fn fields_for_port(&self, port: Option<u32>) -> Option<&[Field]> {
        match (&self.body, port) {
            (SchemaBody::Fields(fields), _) => Some(fields),
            (SchemaBody::Ports(ports), Some(port)) => {
                ports.get(&port).map(|p| p.fields.as_slice())
            }
            (SchemaBody::Ports(_), None) => None,
        }
    }

    pub(crate) fn routes_by_port(&self) -> bool {
        matches!(self.body, SchemaBody::Ports(_))
    }
}

fn find_meta<'a>(fields: &'a [Field], segments: &[&str]) -> Option<&'a FieldMeta> {
    let (head, rest) = segments.split_first()?;
    for field in fields {
        if field.name == *head {
            match &field.kind {
                FieldKind::Object { fields } | FieldKind::Repeat(RepeatSpec { fields, .. })
                    if !rest.is_empty() =>
                {
                    return find_meta(fields, rest);
                }
                _ if rest.is_empty() => return Some(&field.meta),
                _ => {}
            }
        }
        // Merged constructs are transparent to paths.
        let nested = match &field.kind {
            FieldKind::ByteGroup { fields, .. } => find_meta(fields, segments),
            FieldKind::Match(spec) => spec
                .cases
                .iter()
                .find_map(|case| find_meta(&case.fields, segments)),
            FieldKind::Flagged { groups, .. } => groups
                .iter()
                .find_map(|group| find_meta(&group.fields, segments)),
            FieldKind::Tlv(spec) if spec.merge => spec
                .cases
                .iter()
                .find_map(|case| find_meta(&case.fields, segments)),
            _ => None,
        };
        if nested.is_some() {
            return nested;
        }
    }
    None
}

fn parse_byte_order(s: Option<&str>) -> Result<ByteOrder, SchemaError> {
    match s {
        None | Some("big") => Ok(ByteOrder::Big),
        Some("little") => Ok(ByteOrder::Little),
        Some(other) => Err(SchemaError::InvalidByteOrder(other.to_string())),
    }
}

struct Compiler {
    definitions: IndexMap<String, Vec<FieldDef>>,
    /// Names declared so far, one set per lexical scope.
    scopes: Vec<AHashSet<String>>,
}

impl Compiler {
    fn push_scope(&mut self) {
        self.scopes.push(AHashSet::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: &str) -> Result<(), SchemaError> {
        let frame = self.scopes.last_mut().expect("compiler always has a scope");
        if !frame.insert(name.to_string()) {
            return Err(SchemaError::DuplicateField(name.to_string()));
        }
        Ok(())
    }

    fn check_ref(&self, reference: &str) -> Result<(), SchemaError> {
        let name = reference.strip_prefix('$').unwrap_or(reference);
        if self.scopes.iter().any(|frame| frame.contains(name)) {
            Ok(())
        } else {
            Err(SchemaError::UnresolvedReference(name.to_string()))
        }
    }

    fn compile_fields(&mut self, defs: &[FieldDef]) -> Result<Vec<Field>, SchemaError> {
        let mut use_stack = Vec::new();
        self.compile_fields_inner(defs, &mut use_stack)
    }

    fn compile_fields_inner(
        &mut self,
        defs: &[FieldDef],
        use_stack: &mut Vec<String>,
    ) -> Result<Vec<Field>, SchemaError> {
        let mut fields = Vec::with_capacity(defs.len());
        for def in defs {
            if let Some(target) = &def.use_def {
                if use_stack.iter().any(|seen| seen == target) {
                    return Err(SchemaError::RecursiveUse(target.clone()));
                }
                let mut inlined = self.expand_use(target, def.prefix.as_deref())?;
                // A single-field definition may be renamed at the `use` site.
                if let Some(new_name) = &def.name {
                    if inlined.len() != 1 {
                        return Err(SchemaError::InvalidField {
                            name: new_name.clone(),
                            reason: format!(
                                "`{target}` holds {} fields; only single-field \
                                 definitions can be renamed",
                                inlined.len()
                            ),
                        });
                    }
                    inlined[0].name = Some(new_name.clone());
                }
                use_stack.push(target.clone());
                let compiled = self.compile_fields_inner(&inlined, use_stack);
                use_stack.pop();
                fields.extend(compiled?);
                continue;
            }
            fields.push(self.compile_field(def, use_stack)?);
        }
        Ok(fields)
    }

    /// Resolves a `use:` reference by lexical inlining, applying an optional
    /// name prefix to the definition's own fields and the references between
    /// them.
    fn expand_use(
        &self,
        target: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<FieldDef>, SchemaError> {
        let defs = self
            .definitions
            .get(target)
            .ok_or_else(|| SchemaError::UnknownDefinition(target.to_string()))?;
        let mut cloned = defs.clone();
        if let Some(prefix) = prefix {
            let local: AHashSet<String> = defs
                .iter()
                .flat_map(|d| d.name.iter().chain(d.var.iter()))
                .cloned()
                .collect();
            for def in &mut cloned {
                apply_prefix(def, prefix, &local);
            }
        }
        Ok(cloned)
    }

    fn compile_field(
        &mut self,
        def: &FieldDef,
        use_stack: &mut Vec<String>,
    ) -> Result<Field, SchemaError> {
        let type_str = def.field_type.as_deref().unwrap_or("u8");
        let name = def.name.clone().unwrap_or_default();
        let named = |reason: &str| SchemaError::InvalidField {
            name: if name.is_empty() {
                type_str.to_string()
            } else {
                name.clone()
            },
            reason: reason.to_string(),
        };

        if def.formula.is_some() {
            return Err(SchemaError::UnsupportedFormula);
        }
        if def.compute.is_some() && type_str != "number" {
            return Err(named("`compute` is only valid on `number` fields"));
        }

        let endian = match def.endian.as_deref() {
            None => None,
            Some(s) => Some(parse_byte_order(Some(s))?),
        };

        let kind = match type_str {
            "u8" | "u16" | "u24" | "u32" | "u64" | "s8" | "s16" | "s24" | "s32" | "s64" => {
                let width = int_width(type_str).ok_or_else(|| {
                    SchemaError::UnknownType(type_str.to_string())
                })?;
                if type_str.starts_with('s') {
                    FieldKind::Int { width, endian }
                } else {
                    FieldKind::UInt { width, endian }
                }
            }
            "f16" => FieldKind::Float { width: 2, endian },
            "f32" => FieldKind::Float { width: 4, endian },
            "f64" => FieldKind::Float { width: 8, endian },
            "bool" => FieldKind::Bool { bit: def.bit },
            "udec" | "sdec" => {
                if def.length.unwrap_or(1) != 1 {
                    return Err(SchemaError::MultiByteDecimal(name.clone()));
                }
                FieldKind::Decimal {
                    signed: type_str == "sdec",
                }
            }
            "ascii" => FieldKind::Ascii {
                length: def.length.ok_or_else(|| named("`length` is required"))?,
            },
            "bytes" => FieldKind::Bytes {
                length: def.length.ok_or_else(|| named("`length` is required"))?,
                format: BytesFormat::Raw,
            },
            "hex" => FieldKind::Bytes {
                length: def.length.ok_or_else(|| named("`length` is required"))?,
                format: BytesFormat::Hex {
                    separator: def.separator.as_ref().and_then(|s| s.chars().next()),
                    uppercase: def.uppercase,
                },
            },
            "base64" => FieldKind::Bytes {
                length: def.length.ok_or_else(|| named("`length` is required"))?,
                format: BytesFormat::Base64,
            },
            "skip" => FieldKind::Skip {
                length: def.length.ok_or_else(|| named("`length` is required"))?,
            },
            "enum" => {
                let width = def.length.unwrap_or(1);
                if !(1..=8).contains(&width) {
                    return Err(named("enum width must be 1..=8 bytes"));
                }
                let pairs = def
                    .lookup
                    .as_ref()
                    .ok_or_else(|| named("`lookup` is required"))?;
                let mut cases = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    match value {
                        LiteralDef::Str(s) => cases.push((*key, s.clone())),
                        _ => return Err(named("enum lookup values must be strings")),
                    }
                }
                FieldKind::Enum {
                    width: width as u32,
                    endian,
                    cases,
                }
            }
            "bitfield_string" => {
                let notations = def
                    .parts
                    .as_ref()
                    .ok_or_else(|| named("`parts` is required"))?;
                let mut parts = Vec::with_capacity(notations.len());
                for notation in notations {
                    parts.push(
                        BitSpec::parse(notation)
                            .ok_or_else(|| SchemaError::InvalidBitNotation(notation.clone()))?,
                    );
                }
                let window = def
                    .length
                    .map(|l| l as u32)
                    .unwrap_or_else(|| parts.iter().map(|p| p.window).max().unwrap_or(1));
                FieldKind::BitfieldString {
                    window,
                    parts,
                    separator: def.separator.clone().unwrap_or_else(|| ".".into()),
                }
            }
            "number" => FieldKind::Computed(self.compile_computed(def, &named)?),
            "string" => FieldKind::Literal(
                def.value
                    .clone()
                    .map(Value::from)
                    .ok_or_else(|| named("`value` is required"))?,
            ),
            "object" => {
                let defs = def
                    .fields
                    .as_ref()
                    .ok_or_else(|| named("`fields` is required"))?;
                self.push_scope();
                let fields = self.compile_fields_inner(defs, use_stack)?;
                self.pop_scope();
                FieldKind::Object { fields }
            }
            "byte_group" => self.compile_byte_group(def, use_stack, &named)?,
            "match" => FieldKind::Match(self.compile_match(def, use_stack, &named)?),
            "flagged" => {
                let source = def.on.clone().ok_or_else(|| named("`on` is required"))?;
                self.check_ref(&source)?;
                let group_defs = def
                    .groups
                    .as_ref()
                    .ok_or_else(|| named("`groups` is required"))?;
                let mut groups = Vec::with_capacity(group_defs.len());
                for group in group_defs {
                    groups.push(FlagGroup {
                        bit: group.bit,
                        fields: self.compile_fields_inner(&group.fields, use_stack)?,
                    });
                }
                FieldKind::Flagged { source, groups }
            }
            "tlv" => FieldKind::Tlv(self.compile_tlv(def, use_stack, &named)?),
            "repeat" => FieldKind::Repeat(self.compile_repeat(def, use_stack, &named)?),
            other => {
                // Bit notations double as field types.
                let spec = BitSpec::parse(other)
                    .ok_or_else(|| SchemaError::UnknownType(other.to_string()))?;
                let spec = BitSpec {
                    signed: def.signed.unwrap_or(spec.signed),
                    ..spec
                };
                FieldKind::Bits(spec)
            }
        };

        // Constructs that merge fields into the surrounding record have
        // already declared their inner names; value-producing leaves declare
        // their own.
        if produces_value(&kind) {
            if name.is_empty() {
                return Err(named("a name is required"));
            }
            self.declare(&name)?;
            if let Some(var) = &def.var {
                self.declare(var)?;
            }
        }

        let modifiers = self.compile_modifiers(def, matches!(kind, FieldKind::Computed(_)))?;

        Ok(Field {
            name,
            var: def.var.clone(),
            kind,
            modifiers,
            meta: FieldMeta {
                unit: def.unit.clone(),
                resolution: def.resolution,
                ipso: def.ipso,
                senml: def.senml.clone(),
                unece: def.unece.clone(),
                valid_range: def.valid_range,
            },
            consume: def.consume,
        })
    }

    fn compile_byte_group(
        &mut self,
        def: &FieldDef,
        use_stack: &mut Vec<String>,
        named: &dyn Fn(&str) -> SchemaError,
    ) -> Result<FieldKind, SchemaError> {
        let defs = def
            .fields
            .as_ref()
            .ok_or_else(|| named("`fields` is required"))?;
        let fields = self.compile_fields_inner(defs, use_stack)?;
        let mut max_positional = 0u32;
        let mut sequential_bits = 0u32;
        for field in &fields {
            match &field.kind {
                FieldKind::Bits(spec) => match spec.pos {
                    BitPos::Range { start, width } => {
                        max_positional = max_positional.max(start + width)
                    }
                    BitPos::Sequential { width } => sequential_bits += width,
                },
                FieldKind::Bool { bit } => match bit {
                    Some(bit) => max_positional = max_positional.max(bit + 1),
                    None => sequential_bits += 1,
                },
                _ => return Err(named("byte groups may only contain bit-mode fields")),
            }
        }
        let inferred = max_positional
            .div_ceil(8)
            .max(sequential_bits.div_ceil(8))
            .max(1);
        let size = def.size.map(|s| s as u32).unwrap_or(inferred);
        if max_positional.div_ceil(8) > size || sequential_bits.div_ceil(8) > size {
            return Err(named("the group's bits exceed its declared size"));
        }
        Ok(FieldKind::ByteGroup { size, fields })
    }

    fn compile_match(
        &mut self,
        def: &FieldDef,
        use_stack: &mut Vec<String>,
        named: &dyn Fn(&str) -> SchemaError,
    ) -> Result<MatchSpec, SchemaError> {
        let selector = match (&def.on, &def.compute) {
            (Some(reference), None) => {
                self.check_ref(reference)?;
                Selector::Ref(reference.clone())
            }
            (None, Some(compute)) => Selector::Expr(self.compile_expr(compute)?),
            _ => return Err(named("a selector (`on` or `compute`) is required")),
        };
        let case_defs = def
            .cases
            .as_ref()
            .ok_or_else(|| named("`cases` is required"))?;
        let mut cases = Vec::new();
        let mut default = match &def.default {
            None => None,
            Some(DefaultDef::Policy(policy)) => Some(match policy.as_str() {
                "error" => MatchDefault::Error,
                "skip" => MatchDefault::Skip,
                other => return Err(named(&format!("unknown default policy `{other}`"))),
            }),
            Some(DefaultDef::Fields(defs)) => {
                Some(MatchDefault::Fields(self.compile_alternative(defs, use_stack)?))
            }
        };
        for case in case_defs {
            let pattern = case
                .when
                .as_ref()
                .ok_or_else(|| named("match cases need a `when` pattern"))?;
            let fields = self.compile_alternative(&case.fields, use_stack)?;
            match pattern {
                PatternDef::Int(v) => cases.push(MatchCase {
                    pattern: CasePattern::Literal(*v),
                    fields,
                }),
                PatternDef::List(set) => cases.push(MatchCase {
                    pattern: CasePattern::Set(set.clone()),
                    fields,
                }),
                PatternDef::Str(s) if s == "_" => default = Some(MatchDefault::Fields(fields)),
                PatternDef::Str(s) => {
                    let (lo, hi) = s
                        .split_once("..")
                        .and_then(|(lo, hi)| {
                            Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?))
                        })
                        .ok_or_else(|| named(&format!("invalid case pattern `{s}`")))?;
                    cases.push(MatchCase {
                        pattern: CasePattern::Range(lo, hi),
                        fields,
                    });
                }
            }
        }
        let default = default.ok_or_else(|| {
            named("a default is required (`error`, `skip`, or a `_` case)")
        })?;
        Ok(MatchSpec {
            selector,
            cases,
            default,
        })
    }

    fn compile_tlv(
        &mut self,
        def: &FieldDef,
        use_stack: &mut Vec<String>,
        named: &dyn Fn(&str) -> SchemaError,
    ) -> Result<TlvSpec, SchemaError> {
        let tag = match &def.tag_fields {
            Some(defs) => {
                // Composite tag components dispatch only; they bind no
                // record entry, so they compile in a throwaway scope.
                self.push_scope();
                let fields = self.compile_fields_inner(defs, use_stack)?;
                self.pop_scope();
                for field in &fields {
                    if !matches!(field.kind, FieldKind::UInt { .. } | FieldKind::Int { .. }) {
                        return Err(named("composite tag fields must be plain integers"));
                    }
                }
                TagLayout::Composite { fields }
            }
            None => TagLayout::Plain {
                size: def.tag_size.unwrap_or(1) as u32,
            },
        };
        let tag_arity = match &tag {
            TagLayout::Plain { .. } => 1,
            TagLayout::Composite { fields } => fields.len(),
        };
        let case_defs = def
            .cases
            .as_ref()
            .ok_or_else(|| named("`cases` is required"))?;
        let mut cases = Vec::with_capacity(case_defs.len());
        for case in case_defs {
            let tag_values = match case.tag.as_ref().ok_or_else(|| named("TLV cases need a `tag`"))? {
                PatternDef::Int(v) => vec![*v],
                PatternDef::List(values) => values.clone(),
                PatternDef::Str(s) => return Err(named(&format!("invalid tag `{s}`"))),
            };
            if tag_values.len() != tag_arity {
                return Err(named("tag arity does not match the tag layout"));
            }
            cases.push(TlvCase {
                tag: tag_values,
                name: case.name.clone(),
                length: case.length,
                fields: self.compile_alternative(&case.fields, use_stack)?,
            });
        }
        let on_unknown = match def.on_unknown.as_deref() {
            None | Some("skip") => UnknownTagPolicy::Skip,
            Some("error") => UnknownTagPolicy::Error,
            Some("raw") => UnknownTagPolicy::Raw,
            Some(other) => return Err(named(&format!("unknown tag policy `{other}`"))),
        };
        let repeat = match def.repeat.as_deref() {
            None | Some("until_end") => TlvRepeat::UntilEnd,
            Some("once") => TlvRepeat::Once,
            Some(other) => return Err(named(&format!("unknown repeat mode `{other}`"))),
        };
        Ok(TlvSpec {
            tag,
            length_size: def.length_size.unwrap_or(0),
            cases,
            on_unknown,
            merge: def.merge.unwrap_or(true),
            repeat,
        })
    }

    fn compile_repeat(
        &mut self,
        def: &FieldDef,
        use_stack: &mut Vec<String>,
        named: &dyn Fn(&str) -> SchemaError,
    ) -> Result<RepeatSpec, SchemaError> {
        let count = match (&def.count, &def.count_field, &def.byte_length, &def.until) {
            (Some(n), None, None, None) => RepeatCount::Fixed(*n),
            (None, Some(reference), None, None) => {
                self.check_ref(reference)?;
                RepeatCount::CountField(reference.clone())
            }
            (None, None, Some(CountDef::Ref(reference)), None) => {
                self.check_ref(reference)?;
                RepeatCount::ByteLength(CountSource::Ref(reference.clone()))
            }
            (None, None, Some(CountDef::Fixed(n)), None) => {
                RepeatCount::ByteLength(CountSource::Fixed(*n))
            }
            (None, None, None, Some(until)) if until == "end" => RepeatCount::UntilEnd,
            _ => {
                return Err(named(
                    "exactly one of `count`, `count_field`, `byte_length`, `until: end` is required",
                ))
            }
        };
        let defs = def
            .fields
            .as_ref()
            .ok_or_else(|| named("`fields` is required"))?;
        // Each iteration opens a fresh scope.
        self.push_scope();
        let fields = self.compile_fields_inner(defs, use_stack)?;
        self.pop_scope();
        Ok(RepeatSpec {
            count,
            min: def.min,
            max: def.max,
            fields,
        })
    }

    /// Compiles the fields of one alternative branch (a match or TLV case):
    /// duplicates are checked within the branch, while the declared names
    /// stay visible to later references in the surrounding scope.
    fn compile_alternative(
        &mut self,
        defs: &[FieldDef],
        use_stack: &mut Vec<String>,
    ) -> Result<Vec<Field>, SchemaError> {
        self.push_scope();
        let fields = self.compile_fields_inner(defs, use_stack)?;
        let branch = self.scopes.pop().expect("branch scope just pushed");
        let parent = self.scopes.last_mut().expect("compiler always has a scope");
        parent.extend(branch);
        Ok(fields)
    }

    fn compile_computed(
        &mut self,
        def: &FieldDef,
        named: &dyn Fn(&str) -> SchemaError,
    ) -> Result<Computed, SchemaError> {
        let source = if let Some(coefficients) = &def.polynomial {
            let reference = def
                .reference
                .clone()
                .ok_or_else(|| named("`polynomial` needs a `ref`"))?;
            self.check_ref(&reference)?;
            ComputedSource::Polynomial {
                reference,
                coefficients: coefficients.clone(),
            }
        } else if let Some(compute) = &def.compute {
            ComputedSource::Expr(self.compile_expr(compute)?)
        } else if let Some(reference) = &def.reference {
            self.check_ref(reference)?;
            ComputedSource::Ref(reference.clone())
        } else {
            return Err(named("one of `ref`, `polynomial`, `compute` is required"));
        };
        Ok(Computed {
            source,
            guard: def.guard.as_ref().map(|g| self.compile_guard(g)).transpose()?,
        })
    }

    fn compile_expr(&self, def: &ComputeDef) -> Result<ComputeExpr, SchemaError> {
        let op = ComputeOp::parse(&def.op)
            .ok_or_else(|| SchemaError::InvalidPredicate(def.op.clone()))?;
        Ok(ComputeExpr {
            op,
            a: self.compile_operand(&def.a)?,
            b: self.compile_operand(&def.b)?,
        })
    }

    fn compile_operand(&self, def: &OperandDef) -> Result<Operand, SchemaError> {
        Ok(match def {
            OperandDef::Num(v) => Operand::Literal(*v),
            OperandDef::Ref(reference) => {
                self.check_ref(reference)?;
                Operand::Ref(reference.clone())
            }
            OperandDef::Expr(inner) => Operand::Expr(Box::new(self.compile_expr(inner)?)),
        })
    }

    fn compile_guard(&self, def: &GuardDef) -> Result<Guard, SchemaError> {
        let mut predicates = Vec::with_capacity(def.predicates.len());
        for pred in &def.predicates {
            self.check_ref(&pred.field)?;
            predicates.push(GuardPred {
                reference: pred.field.clone(),
                op: CmpOp::parse(&pred.op)
                    .ok_or_else(|| SchemaError::InvalidPredicate(pred.op.clone()))?,
                value: pred.value,
            });
        }
        Ok(Guard {
            predicates,
            else_value: def.else_value,
        })
    }

    fn compile_modifiers(
        &self,
        def: &FieldDef,
        computed: bool,
    ) -> Result<Modifiers, SchemaError> {
        let encoding = match def.encoding.as_deref() {
            None => None,
            Some(s) => Some(
                IntEncoding::parse(s)
                    .ok_or_else(|| SchemaError::UnknownType(format!("encoding `{s}`")))?,
            ),
        };
        let lookup = def
            .lookup
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect();
        let mut match_value = Vec::new();
        for arm in def.match_value.iter().flatten() {
            match_value.push(MatchValueArm {
                when: Predicate::parse(&arm.when)
                    .ok_or_else(|| SchemaError::InvalidPredicate(arm.when.clone()))?,
                mult: arm.mult,
                div: arm.div,
                add: arm.add,
            });
        }
        let mut transform = Vec::new();
        for op in def.transform.iter().flatten() {
            transform.push(
                TransformOp::parse(op)
                    .ok_or_else(|| SchemaError::InvalidTransform(op.clone()))?,
            );
        }
        // Computed fields own their polynomial and guard; everything that
        // reaches the pipeline stage here belongs to byte-backed fields.
        let (polynomial, guard) = if computed {
            (None, None)
        } else {
            (
                def.polynomial.clone(),
                def.guard.as_ref().map(|g| self.compile_guard(g)).transpose()?,
            )
        };
        Ok(Modifiers {
            encoding,
            lookup,
            polynomial,
            guard,
            match_value,
            mult: def.mult,
            div: def.div,
            add: def.add,
            transform,
            valid_range: def.valid_range,
        })
    }
}

fn int_width(type_str: &str) -> Option<u32> {
    Some(match &type_str[1..] {
        "8" => 1,
        "16" => 2,
        "24" => 3,
        "32" => 4,
        "64" => 8,
        _ => return None,
    })
}

/// Whether this field kind inserts a named entry into the record.
fn produces_value(kind: &FieldKind) -> bool {
    !matches!(
        kind,
        FieldKind::Skip { .. }
            | FieldKind::ByteGroup { .. }
            | FieldKind::Match(_)
            | FieldKind::Flagged { .. }
            | FieldKind::Tlv(_)
    )
}

/// Rewrites a definition's field names and intra-definition references with
/// `prefix` when the `use:` site asks for one.
fn apply_prefix(def: &mut FieldDef, prefix: &str, local: &AHashSet<String>) {
    let rename = |name: &mut Option<String>| {
        if let Some(name) = name {
            if local.contains(name.as_str()) {
                *name = format!("{prefix}{name}");
            }
        }
    };
    rename(&mut def.name);
    rename(&mut def.var);
    let reref = |reference: &mut String| {
        let bare = reference.strip_prefix('$').unwrap_or(reference);
        if local.contains(bare) {
            *reference = format!("${prefix}{bare}");
        }
    };
    if let Some(r) = &mut def.reference {
        reref(r);
    }
    if let Some(r) = &mut def.on {
        reref(r);
    }
    if let Some(r) = &mut def.count_field {
        reref(r);
    }
    if let Some(CountDef::Ref(r)) = &mut def.byte_length {
        reref(r);
    }
    if let Some(compute) = &mut def.compute {
        prefix_compute(compute, prefix, local);
    }
    if let Some(guard) = &mut def.guard {
        for pred in &mut guard.predicates {
            let bare = pred.field.strip_prefix('$').unwrap_or(&pred.field);
            if local.contains(bare) {
                pred.field = format!("${prefix}{bare}");
            }
        }
    }
}

fn prefix_compute(def: &mut ComputeDef, prefix: &str, local: &AHashSet<String>) {
    for operand in [&mut def.a, &mut def.b] {
        match operand {
            OperandDef::Ref(reference) => {
                let bare = reference.strip_prefix('$').unwrap_or(reference);
                if local.contains(bare) {
                    *reference = format!("${prefix}{bare}");
                }
            }
            OperandDef::Expr(inner) => prefix_compute(inner, prefix, local),
            OperandDef::Num(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(yaml: &str) -> Result<Schema, SchemaError> {
        let def: SchemaDef = serde_yaml::from_str(yaml).unwrap();
        Schema::build(def)
    }

    mod structure {
        use super::*;

        #[test]
        fn minimal_schema() {
            let schema = build("{name: minimal, version: 1, fields: []}").unwrap();
            assert_eq!(schema.name, "minimal");
            assert_eq!(schema.byte_order, ByteOrder::Big);
            assert!(!schema.strict);
        }

        #[test]
        fn version_must_be_positive() {
            assert!(matches!(
                build("{name: bad, version: 0, fields: []}"),
                Err(SchemaError::InvalidVersion)
            ));
        }

        #[test]
        fn fields_and_ports_are_exclusive() {
            let yaml = r#"
                name: both
                version: 1
                fields: []
                ports:
                  1: { fields: [] }
            "#;
            assert!(matches!(build(yaml), Err(SchemaError::FieldsOrPorts)));
            assert!(matches!(
                build("{name: neither, version: 1}"),
                Err(SchemaError::FieldsOrPorts)
            ));
        }

        #[test]
        fn little_endian_default_order() {
            let schema =
                build("{name: le, version: 1, byte_order: little, fields: []}").unwrap();
            assert_eq!(schema.byte_order, ByteOrder::Little);
        }

        #[test]
        fn duplicate_names_are_rejected() {
            let yaml = r#"
                name: dup
                version: 1
                fields:
                  - { name: x, type: u8 }
                  - { name: x, type: u16 }
            "#;
            assert!(matches!(
                build(yaml),
                Err(SchemaError::DuplicateField(name)) if name == "x"
            ));
        }

        #[test]
        fn nested_objects_start_a_new_scope() {
            let yaml = r#"
                name: scoped
                version: 1
                fields:
                  - { name: x, type: u8 }
                  - name: inner
                    type: object
                    fields:
                      - { name: x, type: u8 }
            "#;
            assert!(build(yaml).is_ok());
        }

        #[test]
        fn references_must_point_backwards() {
            let yaml = r#"
                name: fwd
                version: 1
                fields:
                  - { name: vwc, type: number, ref: $later }
                  - { name: later, type: u8 }
            "#;
            assert!(matches!(
                build(yaml),
                Err(SchemaError::UnresolvedReference(name)) if name == "later"
            ));
        }

        #[test]
        fn metadata_names_are_referenceable() {
            let yaml = r#"
                name: meta
                version: 1
                metadata: [rssi]
                fields:
                  - { name: margin, type: number, ref: $rssi }
            "#;
            assert!(build(yaml).is_ok());
        }
    }

    mod types {
        use super::*;

        #[test]
        fn rejects_unknown_types() {
            assert!(matches!(
                build("{name: t, version: 1, fields: [{name: x, type: q8}]}"),
                Err(SchemaError::UnknownType(t)) if t == "q8"
            ));
        }

        #[test]
        fn rejects_multi_byte_nibble_decimals() {
            assert!(matches!(
                build("{name: t, version: 1, fields: [{name: x, type: udec, length: 2}]}"),
                Err(SchemaError::MultiByteDecimal(_))
            ));
        }

        #[test]
        fn rejects_legacy_formula() {
            let yaml = r#"
                name: t
                version: 1
                fields:
                  - { name: x, type: number, formula: "a * 2" }
            "#;
            assert!(matches!(build(yaml), Err(SchemaError::UnsupportedFormula)));
        }

        #[test]
        fn bit_notations_are_field_types() {
            let yaml = r#"
                name: t
                version: 1
                fields:
                  - { name: low, type: "u8[0:3]" }
                  - { name: high, type: "u8[4:7]" }
                  - { name: seq, type: "u8:3" }
            "#;
            assert!(build(yaml).is_ok());
        }

        #[test]
        fn match_requires_a_default() {
            let yaml = r#"
                name: t
                version: 1
                fields:
                  - { name: kind, type: u8 }
                  - type: match
                    on: $kind
                    cases:
                      - { when: 1, fields: [{name: a, type: u8}] }
            "#;
            assert!(matches!(build(yaml), Err(SchemaError::InvalidField { .. })));
        }

        #[test]
        fn byte_group_size_is_inferred() {
            let yaml = r#"
                name: t
                version: 1
                fields:
                  - type: byte_group
                    fields:
                      - { name: a, type: "u8[0:3]" }
                      - { name: b, type: "u8[4:7]" }
            "#;
            let schema = build(yaml).unwrap();
            let SchemaBody::Fields(fields) = &schema.body else {
                panic!("expected fields")
            };
            assert!(
                matches!(fields[0].kind, FieldKind::ByteGroup { size: 1, .. }),
                "group size should be one byte"
            );
        }
    }

    mod definitions {
        use super::*;

        #[test]
        fn use_inlines_lexically() {
            let yaml = r#"
                name: t
                version: 1
                definitions:
                  header:
                    - { name: proto, type: u8 }
                    - { name: id, type: u16 }
                fields:
                  - { use: header }
                  - { name: body, type: u8 }
            "#;
            let schema = build(yaml).unwrap();
            let SchemaBody::Fields(fields) = &schema.body else {
                panic!("expected fields")
            };
            let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
            assert_eq!(names, ["proto", "id", "body"]);
        }

        #[test]
        fn prefix_renames_fields_and_references() {
            let yaml = r#"
                name: t
                version: 1
                definitions:
                  channel:
                    - { name: raw, type: u16 }
                    - { name: scaled, type: number, ref: $raw, div: 10 }
                fields:
                  - { use: channel, prefix: a_ }
                  - { use: channel, prefix: b_ }
            "#;
            let schema = build(yaml).unwrap();
            let SchemaBody::Fields(fields) = &schema.body else {
                panic!("expected fields")
            };
            let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
            assert_eq!(names, ["a_raw", "a_scaled", "b_raw", "b_scaled"]);
            match &fields[3].kind {
                FieldKind::Computed(computed) => {
                    assert_eq!(
                        computed.source,
                        ComputedSource::Ref("$b_raw".into())
                    );
                }
                other => panic!("expected a computed field, got {other:?}"),
            }
        }

        #[test]
        fn single_field_definitions_can_be_renamed() {
            let yaml = r#"
                name: t
                version: 1
                definitions:
                  channel:
                    - { name: raw, type: s16, div: 10 }
                fields:
                  - { use: channel, name: inlet }
                  - { use: channel, name: outlet }
            "#;
            let schema = build(yaml).unwrap();
            let SchemaBody::Fields(fields) = &schema.body else {
                panic!("expected fields")
            };
            let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
            assert_eq!(names, ["inlet", "outlet"]);
        }

        #[test]
        fn unknown_definition() {
            assert!(matches!(
                build("{name: t, version: 1, fields: [{use: ghost}]}"),
                Err(SchemaError::UnknownDefinition(name)) if name == "ghost"
            ));
        }
    }

    mod metadata_lookup {
        use super::*;

        #[test]
        fn dotted_paths_reach_nested_fields() {
            let yaml = r#"
                name: t
                version: 1
                fields:
                  - { name: temperature, type: s16, div: 10, unit: Cel, ipso: 3303 }
                  - name: env
                    type: object
                    fields:
                      - { name: humidity, type: u8, unit: "%RH" }
            "#;
            let schema = build(yaml).unwrap();
            let meta = schema.field_metadata("temperature").unwrap();
            assert_eq!(meta.unit.as_deref(), Some("Cel"));
            assert_eq!(meta.ipso, Some(3303));
            let nested = schema.field_metadata("env.humidity").unwrap();
            assert_eq!(nested.unit.as_deref(), Some("%RH"));
            assert!(schema.field_metadata("env.pressure").is_none());
        }

        #[test]
        fn merged_construct_fields_are_path_transparent() {
            let yaml = r#"
                name: t
                version: 1
                fields:
                  - { name: flags, type: u8 }
                  - type: flagged
                    on: $flags
                    groups:
                      - bit: 0
                        fields:
                          - { name: battery, type: u16, div: 1000, unit: V }
            "#;
            let schema = build(yaml).unwrap();
            assert_eq!(
                schema.field_metadata("battery").unwrap().unit.as_deref(),
                Some("V")
            );
        }
    }

    mod test_vectors {
        use super::*;

        #[test]
        fn payloads_parse_from_hex() {
            let yaml = r#"
                name: t
                version: 1
                fields:
                  - { name: x, type: u8 }
                test_vectors:
                  - description: simple
                    payload: "02 2A"
                    expect: { x: 2 }
            "#;
            let schema = build(yaml).unwrap();
            assert_eq!(schema.test_vectors.len(), 1);
            assert_eq!(schema.test_vectors[0].payload, vec![0x02, 0x2A]);
            assert_eq!(
                schema.test_vectors[0].expect.get("x"),
                Some(&Value::Int(2))
            );
        }
    }
}
