//! The modifier pipeline.
//!
//! Raw primitive values pass through a fixed, canonical stage order so that
//! every implementation reports identical results:
//!
//! 1. integer re-encoding (sign-magnitude / BCD / Gray)
//! 2. lookup (a match substitutes a value and ends the numeric pipeline)
//! 3. polynomial / guard
//! 4. `match_value` arm selection
//! 5. arithmetic `((v * mult) / div) + add`
//! 6. transform chain, left to right
//! 7. `valid_range` quality classification (observational; the value is
//!    never modified)
//!
//! Encoding reverses the bijective stages in the opposite order; the range
//! stage is skipped and non-bijective transforms act as identity.

use crate::compute::{horner, Guard};
use crate::errors::{DecodeError, EncodeError};
use crate::scope::Scope;
use crate::value::Value;
use serde::Serialize;
use std::fmt;

/// Quality tag emitted for fields declaring a `valid_range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    OutOfRange,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quality::Good => "good",
            Quality::OutOfRange => "out_of_range",
        })
    }
}

/// Alternative integer encodings applied before anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntEncoding {
    SignMagnitude,
    Bcd,
    Gray,
}

impl IntEncoding {
    pub fn parse(s: &str) -> Option<IntEncoding> {
        Some(match s {
            "sign_magnitude" => IntEncoding::SignMagnitude,
            "bcd" => IntEncoding::Bcd,
            "gray" => IntEncoding::Gray,
            _ => return None,
        })
    }

    /// Interprets `raw` (an unsigned read of `width_bits`) under this
    /// encoding.
    pub fn decode(self, raw: u64, width_bits: u32) -> i64 {
        match self {
            IntEncoding::SignMagnitude => {
                let magnitude = (raw & crate::bitfield::mask(width_bits - 1)) as i64;
                if raw >> (width_bits - 1) & 1 == 1 {
                    -magnitude
                } else {
                    magnitude
                }
            }
            IntEncoding::Bcd => {
                let mut v = 0i64;
                for i in (0..width_bits / 4).rev() {
                    v = v * 10 + ((raw >> (4 * i)) & 0xF) as i64;
                }
                v
            }
            IntEncoding::Gray => {
                let mut binary = raw;
                let mut shift = raw >> 1;
                while shift != 0 {
                    binary ^= shift;
                    shift >>= 1;
                }
                binary as i64
            }
        }
    }

    /// Exact inverse of [`IntEncoding::decode`].
    pub fn encode(self, value: i64, width_bits: u32) -> Result<u64, EncodeError> {
        let invalid = |reason: String| EncodeError::InvalidValue {
            field: String::new(),
            reason,
        };
        match self {
            IntEncoding::SignMagnitude => {
                let magnitude = value.unsigned_abs();
                if magnitude > crate::bitfield::mask(width_bits - 1) {
                    return Err(invalid(format!(
                        "magnitude {magnitude} does not fit in {} bit(s)",
                        width_bits - 1
                    )));
                }
                let sign = if value < 0 { 1u64 << (width_bits - 1) } else { 0 };
                Ok(sign | magnitude)
            }
            IntEncoding::Bcd => {
                if value < 0 {
                    return Err(invalid("BCD cannot carry a negative value".into()));
                }
                let digits = width_bits / 4;
                let mut rest = value as u64;
                let mut raw = 0u64;
                for i in 0..digits {
                    raw |= (rest % 10) << (4 * i);
                    rest /= 10;
                }
                if rest != 0 {
                    return Err(invalid(format!(
                        "{value} has more than {digits} decimal digit(s)"
                    )));
                }
                Ok(raw)
            }
            IntEncoding::Gray => {
                if value < 0 {
                    return Err(invalid("Gray code cannot carry a negative value".into()));
                }
                let b = value as u64;
                Ok(b ^ (b >> 1))
            }
        }
    }
}

/// Predicate of a `match_value` arm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Predicate {
    Lt(f64),
    Le(f64),
    Gt(f64),
    Ge(f64),
    Eq(f64),
    Between(f64, f64),
}

impl Predicate {
    /// Parses `<k`, `<=k`, `>=k`, `>k`, `=k` or `k..m`.
    pub fn parse(s: &str) -> Option<Predicate> {
        let s = s.trim();
        if let Some((lo, hi)) = s.split_once("..") {
            return Some(Predicate::Between(
                lo.trim().parse().ok()?,
                hi.trim().parse().ok()?,
            ));
        }
        let (op, rest) = if let Some(rest) = s.strip_prefix("<=") {
            (Predicate::Le as fn(f64) -> Predicate, rest)
        } else if let Some(rest) = s.strip_prefix(">=") {
            (Predicate::Ge as fn(f64) -> Predicate, rest)
        } else if let Some(rest) = s.strip_prefix('<') {
            (Predicate::Lt as fn(f64) -> Predicate, rest)
        } else if let Some(rest) = s.strip_prefix('>') {
            (Predicate::Gt as fn(f64) -> Predicate, rest)
        } else if let Some(rest) = s.strip_prefix('=') {
            (Predicate::Eq as fn(f64) -> Predicate, rest)
        } else {
            return None;
        };
        Some(op(rest.trim().parse().ok()?))
    }

    pub fn holds(&self, v: f64) -> bool {
        match *self {
            Predicate::Lt(k) => v < k,
            Predicate::Le(k) => v <= k,
            Predicate::Gt(k) => v > k,
            Predicate::Ge(k) => v >= k,
            Predicate::Eq(k) => v == k,
            Predicate::Between(lo, hi) => v >= lo && v <= hi,
        }
    }
}

/// One `match_value` entry: a predicate plus the modifiers it merges onto
/// the field for the current record.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchValueArm {
    pub when: Predicate,
    pub mult: Option<f64>,
    pub div: Option<f64>,
    pub add: Option<f64>,
}

/// A unary transform operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransformOp {
    Sqrt,
    Abs,
    Pow(f64),
    Log,
    Log10,
    Pow10,
    /// `max(v, k)`: a floor on the value.
    Floor(f64),
    /// `min(v, k)`: a ceiling on the value.
    Ceiling(f64),
    Clamp(f64, f64),
    Round(u32),
    Sub(f64),
    Add(f64),
    Mul(f64),
    Div(f64),
}

impl TransformOp {
    /// Parses `name` or `name:arg` forms, e.g. `sqrt`, `pow:2`,
    /// `clamp:[0,100]`, `round:1`.
    pub fn parse(s: &str) -> Option<TransformOp> {
        let s = s.trim();
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (s, None),
        };
        Some(match (name, arg) {
            ("sqrt", None) => TransformOp::Sqrt,
            ("abs", None) => TransformOp::Abs,
            ("log", None) => TransformOp::Log,
            ("log10", None) => TransformOp::Log10,
            ("pow10", None) => TransformOp::Pow10,
            ("pow", Some(k)) => TransformOp::Pow(k.parse().ok()?),
            ("floor", Some(k)) => TransformOp::Floor(k.parse().ok()?),
            ("ceiling", Some(k)) => TransformOp::Ceiling(k.parse().ok()?),
            ("round", Some(d)) => TransformOp::Round(d.parse().ok()?),
            ("sub", Some(k)) => TransformOp::Sub(k.parse().ok()?),
            ("add", Some(k)) => TransformOp::Add(k.parse().ok()?),
            ("mul", Some(k)) => TransformOp::Mul(k.parse().ok()?),
            ("div", Some(k)) => TransformOp::Div(k.parse().ok()?),
            ("clamp", Some(range)) => {
                let inner = range.strip_prefix('[')?.strip_suffix(']')?;
                let (lo, hi) = inner.split_once(',')?;
                TransformOp::Clamp(lo.trim().parse().ok()?, hi.trim().parse().ok()?)
            }
            _ => return None,
        })
    }

    pub fn apply(&self, v: f64) -> f64 {
        match *self {
            TransformOp::Sqrt => v.sqrt(),
            TransformOp::Abs => v.abs(),
            TransformOp::Pow(k) => v.powf(k),
            TransformOp::Log => v.ln(),
            TransformOp::Log10 => v.log10(),
            TransformOp::Pow10 => 10f64.powf(v),
            TransformOp::Floor(k) => v.max(k),
            TransformOp::Ceiling(k) => v.min(k),
            TransformOp::Clamp(lo, hi) => v.clamp(lo, hi),
            TransformOp::Round(decimals) => {
                let factor = 10f64.powi(decimals as i32);
                (v * factor).round() / factor
            }
            TransformOp::Sub(k) => v - k,
            TransformOp::Add(k) => v + k,
            TransformOp::Mul(k) => v * k,
            TransformOp::Div(k) => {
                if k == 0.0 {
                    f64::NAN
                } else {
                    v / k
                }
            }
        }
    }

    /// Inverse used by the encoder. Non-bijective operators (`abs`, `floor`,
    /// `ceiling`, `clamp`, `round`) pass the value through unchanged.
    pub fn invert(&self, v: f64) -> f64 {
        match *self {
            TransformOp::Sqrt => v * v,
            TransformOp::Pow(k) if k != 0.0 => v.powf(1.0 / k),
            TransformOp::Log => v.exp(),
            TransformOp::Log10 => 10f64.powf(v),
            TransformOp::Pow10 => v.log10(),
            TransformOp::Sub(k) => v + k,
            TransformOp::Add(k) => v - k,
            TransformOp::Mul(k) if k != 0.0 => v / k,
            TransformOp::Div(k) => v * k,
            _ => v,
        }
    }
}

/// The per-field modifier set, applied in pipeline order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Modifiers {
    pub encoding: Option<IntEncoding>,
    /// Ordered `raw -> reported` pairs. A match ends the numeric pipeline.
    pub lookup: Vec<(i64, Value)>,
    pub polynomial: Option<Vec<f64>>,
    pub guard: Option<Guard>,
    pub match_value: Vec<MatchValueArm>,
    pub mult: Option<f64>,
    pub div: Option<f64>,
    pub add: Option<f64>,
    pub transform: Vec<TransformOp>,
    pub valid_range: Option<(f64, f64)>,
}

impl Modifiers {
    /// True when no stage changes the numeric value (quality classification
    /// alone does not count: it never modifies).
    pub fn is_numeric_identity(&self) -> bool {
        self.lookup.is_empty()
            && self.polynomial.is_none()
            && self.guard.is_none()
            && self.match_value.is_empty()
            && self.mult.is_none()
            && self.div.is_none()
            && self.add.is_none()
            && self.transform.is_empty()
    }

    /// Runs the decode direction of the pipeline. `raw` already carries the
    /// integer-encoding stage (the caller knows the field's bit width).
    pub fn apply(
        &self,
        raw: Value,
        scope: &Scope,
    ) -> Result<(Value, Option<Quality>), DecodeError> {
        // Stage 2: lookup.
        if !self.lookup.is_empty() {
            if let Some(key) = raw.as_i64() {
                if let Some((_, reported)) = self.lookup.iter().find(|(k, _)| *k == key) {
                    return Ok((reported.clone(), None));
                }
            }
            // No match: continue numerically with the raw value.
        }

        let mut v = raw.as_f64().ok_or_else(|| DecodeError::InvalidValue {
            field: String::new(),
            reason: format!("cannot apply numeric modifiers to a {}", raw.kind()),
        })?;
        let mut promoted = false;

        // Stage 3: polynomial / guard.
        if let Some(coefficients) = &self.polynomial {
            v = horner(coefficients, v);
            promoted = true;
        }
        if let Some(guard) = &self.guard {
            if !guard.holds(scope)? {
                v = guard.else_value;
                promoted = true;
            }
        }

        // Stage 4: match_value arm selection, first predicate that holds.
        let mut mult = self.mult;
        let mut div = self.div;
        let mut add = self.add;
        if let Some(arm) = self.match_value.iter().find(|arm| arm.when.holds(v)) {
            mult = arm.mult.or(mult);
            div = arm.div.or(div);
            add = arm.add.or(add);
            promoted = true;
        }

        // Stage 5: ((v * mult) / div) + add, absent steps acting as identity.
        if mult.is_some() || div.is_some() || add.is_some() {
            promoted = true;
        }
        if let Some(m) = mult {
            v *= m;
        }
        if let Some(d) = div {
            v = if d == 0.0 { f64::NAN } else { v / d };
        }
        if let Some(a) = add {
            v += a;
        }

        // Stage 6: transform chain.
        for op in &self.transform {
            v = op.apply(v);
            promoted = true;
        }

        // Stage 7: quality classification; the value is left untouched.
        let quality = self
            .valid_range
            .map(|(lo, hi)| {
                if v >= lo && v <= hi {
                    Quality::Good
                } else {
                    Quality::OutOfRange
                }
            });

        let reported = if promoted { Value::Float(v) } else { raw };
        Ok((reported, quality))
    }

    /// Runs the encode direction: reported value back to the raw number the
    /// decoder would have seen before stage 3. Integer re-encoding is left
    /// to the caller (it needs the field's bit width).
    pub fn reverse(&self, value: &Value) -> Result<f64, EncodeError> {
        if !self.lookup.is_empty() {
            if let Some(s) = value.as_str() {
                let key = self
                    .lookup
                    .iter()
                    .find(|(_, reported)| reported.as_str() == Some(s))
                    .map(|(k, _)| *k)
                    .ok_or_else(|| EncodeError::InvalidValue {
                        field: String::new(),
                        reason: format!("`{s}` is not a lookup value"),
                    })?;
                return Ok(key as f64);
            }
            // Numeric input means the decode-side lookup missed; the value
            // is already the raw one as far as this stage is concerned.
        }

        let mut v = value.as_f64().ok_or_else(|| EncodeError::InvalidValue {
            field: String::new(),
            reason: format!("expected a number, got a {}", value.kind()),
        })?;

        for op in self.transform.iter().rev() {
            v = op.invert(v);
        }

        let raw = if self.match_value.is_empty() {
            invert_arithmetic(v, self.mult, self.div, self.add)?
        } else {
            // Pick the first arm whose inverse lands on a raw value the arm
            // itself would have selected; fall back to the bare field
            // modifiers.
            let mut chosen = None;
            for arm in &self.match_value {
                let candidate = invert_arithmetic(
                    v,
                    arm.mult.or(self.mult),
                    arm.div.or(self.div),
                    arm.add.or(self.add),
                )?;
                if arm.when.holds(candidate) {
                    chosen = Some(candidate);
                    break;
                }
            }
            match chosen {
                Some(raw) => raw,
                None => invert_arithmetic(v, self.mult, self.div, self.add)?,
            }
        };

        match &self.polynomial {
            None => Ok(raw),
            // Only a linear polynomial has a usable inverse.
            Some(coefficients) if coefficients.len() == 2 && coefficients[0] != 0.0 => {
                Ok((raw - coefficients[1]) / coefficients[0])
            }
            Some(_) => Err(EncodeError::Unsupported(
                "cannot invert a non-linear polynomial".into(),
            )),
        }
    }
}

/// `((v - add) * div) / mult`, the exact inverse of the arithmetic stage.
fn invert_arithmetic(
    mut v: f64,
    mult: Option<f64>,
    div: Option<f64>,
    add: Option<f64>,
) -> Result<f64, EncodeError> {
    if let Some(a) = add {
        v -= a;
    }
    if let Some(d) = div {
        v *= d;
    }
    if let Some(m) = mult {
        if m == 0.0 {
            return Err(EncodeError::InvalidValue {
                field: String::new(),
                reason: "cannot invert a zero `mult`".into(),
            });
        }
        v /= m;
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(modifiers: &Modifiers, raw: Value) -> Value {
        modifiers.apply(raw, &Scope::new()).unwrap().0
    }

    mod arithmetic {
        use super::*;

        #[test]
        fn fixed_point_scaling() {
            let m = Modifiers {
                div: Some(10.0),
                add: Some(-40.0),
                ..Default::default()
            };
            assert_eq!(apply(&m, Value::Int(231)), Value::Float(-16.9));
        }

        #[test]
        fn absent_modifiers_keep_the_integer() {
            let m = Modifiers::default();
            assert_eq!(apply(&m, Value::UInt(42)), Value::UInt(42));
        }

        #[test]
        fn any_arithmetic_modifier_promotes_to_real() {
            let m = Modifiers {
                div: Some(50.0),
                ..Default::default()
            };
            assert_eq!(apply(&m, Value::UInt(600)), Value::Float(12.0));
        }

        #[test]
        fn inverse_round_trips() {
            let m = Modifiers {
                mult: Some(3.0),
                div: Some(10.0),
                add: Some(-40.0),
                ..Default::default()
            };
            let (out, _) = m.apply(Value::Int(231), &Scope::new()).unwrap();
            let raw = m.reverse(&out).unwrap();
            assert!((raw - 231.0).abs() < 1e-9);
        }

        #[test]
        fn division_by_zero_is_nan() {
            let m = Modifiers {
                div: Some(0.0),
                ..Default::default()
            };
            match apply(&m, Value::Int(5)) {
                Value::Float(v) => assert!(v.is_nan()),
                other => panic!("expected a float, got {other:?}"),
            }
        }
    }

    mod lookup {
        use super::*;

        fn states() -> Modifiers {
            Modifiers {
                lookup: vec![(0, Value::from("off")), (1, Value::from("on"))],
                div: Some(10.0),
                ..Default::default()
            }
        }

        #[test]
        fn match_ends_the_numeric_pipeline() {
            assert_eq!(apply(&states(), Value::Int(1)), Value::from("on"));
        }

        #[test]
        fn miss_continues_numerically() {
            assert_eq!(apply(&states(), Value::Int(7)), Value::Float(0.7));
        }

        #[test]
        fn reverse_lookup_restores_the_key() {
            assert_eq!(states().reverse(&Value::from("off")).unwrap(), 0.0);
            assert!(states().reverse(&Value::from("boom")).is_err());
        }
    }

    mod match_value {
        use super::*;

        fn stepped() -> Modifiers {
            Modifiers {
                match_value: vec![
                    MatchValueArm {
                        when: Predicate::Lt(100.0),
                        mult: None,
                        div: Some(10.0),
                        add: None,
                    },
                    MatchValueArm {
                        when: Predicate::Ge(100.0),
                        mult: None,
                        div: Some(100.0),
                        add: None,
                    },
                ],
                ..Default::default()
            }
        }

        #[test]
        fn first_matching_arm_wins() {
            assert_eq!(apply(&stepped(), Value::Int(50)), Value::Float(5.0));
            assert_eq!(apply(&stepped(), Value::Int(200)), Value::Float(2.0));
        }

        #[test]
        fn reverse_finds_the_consistent_arm() {
            // 5.0 could come from raw 50 or raw 500; the first consistent
            // arm wins, matching decode's first-match rule.
            assert_eq!(stepped().reverse(&Value::Float(5.0)).unwrap(), 50.0);
            // 50.0 only reverses through the second arm: raw 500 fails its
            // own `< 100` predicate.
            assert_eq!(stepped().reverse(&Value::Float(50.0)).unwrap(), 5000.0);
        }
    }

    mod transforms {
        use super::*;

        #[test]
        fn chain_applies_left_to_right() {
            let m = Modifiers {
                transform: vec![TransformOp::Sqrt, TransformOp::Mul(2.0)],
                ..Default::default()
            };
            assert_eq!(apply(&m, Value::Int(16)), Value::Float(8.0));
        }

        #[test]
        fn parse_all_forms() {
            assert_eq!(TransformOp::parse("sqrt"), Some(TransformOp::Sqrt));
            assert_eq!(TransformOp::parse("pow:2"), Some(TransformOp::Pow(2.0)));
            assert_eq!(
                TransformOp::parse("clamp:[0,100]"),
                Some(TransformOp::Clamp(0.0, 100.0))
            );
            assert_eq!(TransformOp::parse("round:2"), Some(TransformOp::Round(2)));
            assert_eq!(TransformOp::parse("nope:1"), None);
        }

        #[test]
        fn floor_is_a_lower_bound() {
            assert_eq!(TransformOp::Floor(5.0).apply(3.0), 5.0);
            assert_eq!(TransformOp::Floor(5.0).apply(9.0), 9.0);
            assert_eq!(TransformOp::Ceiling(5.0).apply(9.0), 5.0);
        }

        #[test]
        fn bijective_ops_invert_exactly() {
            for op in [
                TransformOp::Sqrt,
                TransformOp::Pow(3.0),
                TransformOp::Log,
                TransformOp::Log10,
                TransformOp::Sub(7.0),
                TransformOp::Mul(4.0),
            ] {
                let v = 2.37;
                let round_tripped = op.invert(op.apply(v));
                assert!(
                    (round_tripped - v).abs() < 1e-9,
                    "{op:?} did not invert: {round_tripped}"
                );
            }
        }
    }

    mod encodings {
        use super::*;

        #[test]
        fn sign_magnitude() {
            assert_eq!(IntEncoding::SignMagnitude.decode(0x85, 8), -5);
            assert_eq!(IntEncoding::SignMagnitude.decode(0x05, 8), 5);
            assert_eq!(IntEncoding::SignMagnitude.encode(-5, 8).unwrap(), 0x85);
        }

        #[test]
        fn bcd() {
            assert_eq!(IntEncoding::Bcd.decode(0x1234, 16), 1234);
            assert_eq!(IntEncoding::Bcd.encode(1234, 16).unwrap(), 0x1234);
            assert!(IntEncoding::Bcd.encode(123456, 16).is_err());
        }

        #[test]
        fn gray() {
            for v in 0..64u64 {
                let gray = IntEncoding::Gray.encode(v as i64, 8).unwrap();
                assert_eq!(IntEncoding::Gray.decode(gray, 8), v as i64);
            }
        }
    }

    mod ranges {
        use super::*;

        #[test]
        fn quality_is_observational() {
            let m = Modifiers {
                div: Some(100.0),
                valid_range: Some((-40.0, 85.0)),
                ..Default::default()
            };
            let (value, quality) = m.apply(Value::Int(-99900), &Scope::new()).unwrap();
            assert_eq!(value, Value::Float(-999.0));
            assert_eq!(quality, Some(Quality::OutOfRange));

            let (value, quality) = m.apply(Value::Int(-1000), &Scope::new()).unwrap();
            assert_eq!(value, Value::Float(-10.0));
            assert_eq!(quality, Some(Quality::Good));
        }

        #[test]
        fn predicates_parse() {
            assert_eq!(Predicate::parse("<10"), Some(Predicate::Lt(10.0)));
            assert_eq!(Predicate::parse("<= 10"), Some(Predicate::Le(10.0)));
            assert_eq!(Predicate::parse("10..20"), Some(Predicate::Between(10.0, 20.0)));
            assert_eq!(Predicate::parse("= -3"), Some(Predicate::Eq(-3.0)));
            assert_eq!(Predicate::parse("around 10"), None);
        }
    }
}
