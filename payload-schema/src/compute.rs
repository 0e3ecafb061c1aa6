//! Computed (`number`) fields and guard clauses.
//!
//! A computed field consumes no bytes; its value derives from earlier fields
//! through one of three sources: a plain `$ref`, a polynomial over a `$ref`
//! (Horner evaluation), or a `compute` expression tree closed over
//! `{add, sub, mul, div, mod, idiv}`. A guard wraps any of them: when one of
//! its predicates fails, the computation is replaced by the `else` value.

use crate::errors::DecodeError;
use crate::scope::Scope;

/// Operand of a compute expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `$name` reference into the scope.
    Ref(String),
    Literal(f64),
    Expr(Box<ComputeExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Idiv,
}

impl ComputeOp {
    pub fn parse(s: &str) -> Option<ComputeOp> {
        Some(match s {
            "add" => ComputeOp::Add,
            "sub" => ComputeOp::Sub,
            "mul" => ComputeOp::Mul,
            "div" => ComputeOp::Div,
            "mod" => ComputeOp::Mod,
            "idiv" => ComputeOp::Idiv,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeExpr {
    pub op: ComputeOp,
    pub a: Operand,
    pub b: Operand,
}

impl ComputeExpr {
    pub fn eval(&self, scope: &Scope) -> Result<f64, DecodeError> {
        let a = eval_operand(&self.a, scope)?;
        let b = eval_operand(&self.b, scope)?;
        Ok(match self.op {
            ComputeOp::Add => a + b,
            ComputeOp::Sub => a - b,
            ComputeOp::Mul => a * b,
            // Division by zero propagates as NaN, not as an error.
            ComputeOp::Div => {
                if b == 0.0 {
                    f64::NAN
                } else {
                    a / b
                }
            }
            // mod and idiv coerce both operands to integers.
            ComputeOp::Mod => {
                let (a, b) = (a.trunc() as i64, b.trunc() as i64);
                if b == 0 {
                    f64::NAN
                } else {
                    (a % b) as f64
                }
            }
            ComputeOp::Idiv => {
                let (a, b) = (a.trunc() as i64, b.trunc() as i64);
                if b == 0 {
                    f64::NAN
                } else {
                    (a / b) as f64
                }
            }
        })
    }
}

fn eval_operand(operand: &Operand, scope: &Scope) -> Result<f64, DecodeError> {
    match operand {
        Operand::Ref(name) => scope
            .resolve_f64(name)
            .ok_or_else(|| DecodeError::UndefinedVariable(name.clone())),
        Operand::Literal(v) => Ok(*v),
        Operand::Expr(expr) => expr.eval(scope),
    }
}

/// Comparison operator of a guard predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
}

impl CmpOp {
    pub fn parse(s: &str) -> Option<CmpOp> {
        Some(match s {
            "gt" => CmpOp::Gt,
            "gte" => CmpOp::Gte,
            "lt" => CmpOp::Lt,
            "lte" => CmpOp::Lte,
            "eq" => CmpOp::Eq,
            "ne" => CmpOp::Ne,
            _ => return None,
        })
    }

    pub fn holds(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Gt => a > b,
            CmpOp::Gte => a >= b,
            CmpOp::Lt => a < b,
            CmpOp::Lte => a <= b,
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardPred {
    pub reference: String,
    pub op: CmpOp,
    pub value: f64,
}

/// Conjunction of predicates with an `else` fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    pub predicates: Vec<GuardPred>,
    pub else_value: f64,
}

impl Guard {
    /// True when every predicate holds.
    pub fn holds(&self, scope: &Scope) -> Result<bool, DecodeError> {
        for pred in &self.predicates {
            let actual = scope
                .resolve_f64(&pred.reference)
                .ok_or_else(|| DecodeError::UndefinedVariable(pred.reference.clone()))?;
            if !pred.op.holds(actual, pred.value) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Source of a computed field's value.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputedSource {
    Ref(String),
    Polynomial {
        reference: String,
        coefficients: Vec<f64>,
    },
    Expr(ComputeExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Computed {
    pub source: ComputedSource,
    pub guard: Option<Guard>,
}

impl Computed {
    pub fn eval(&self, scope: &Scope) -> Result<f64, DecodeError> {
        if let Some(guard) = &self.guard {
            if !guard.holds(scope)? {
                return Ok(guard.else_value);
            }
        }
        match &self.source {
            ComputedSource::Ref(name) => scope
                .resolve_f64(name)
                .ok_or_else(|| DecodeError::UndefinedVariable(name.clone())),
            ComputedSource::Polynomial {
                reference,
                coefficients,
            } => {
                let x = scope
                    .resolve_f64(reference)
                    .ok_or_else(|| DecodeError::UndefinedVariable(reference.clone()))?;
                Ok(horner(coefficients, x))
            }
            ComputedSource::Expr(expr) => expr.eval(scope),
        }
    }
}

/// Evaluates a polynomial given highest-degree-first coefficients.
pub fn horner(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().fold(0.0, |acc, c| acc * x + c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn scope_with(pairs: &[(&str, f64)]) -> Scope {
        let mut scope = Scope::new();
        for (name, v) in pairs {
            scope.bind(name, Value::Float(*v));
        }
        scope
    }

    #[test]
    fn horner_matches_direct_evaluation() {
        // 2x^2 - 3x + 1 at x = 4 -> 21
        assert_eq!(horner(&[2.0, -3.0, 1.0], 4.0), 21.0);
        assert_eq!(horner(&[], 4.0), 0.0);
    }

    #[test]
    fn nested_expression() {
        // (a + 2) * b
        let expr = ComputeExpr {
            op: ComputeOp::Mul,
            a: Operand::Expr(Box::new(ComputeExpr {
                op: ComputeOp::Add,
                a: Operand::Ref("a".into()),
                b: Operand::Literal(2.0),
            })),
            b: Operand::Ref("b".into()),
        };
        let scope = scope_with(&[("a", 3.0), ("b", 4.0)]);
        assert_eq!(expr.eval(&scope).unwrap(), 20.0);
    }

    #[test]
    fn division_by_zero_is_nan() {
        let expr = ComputeExpr {
            op: ComputeOp::Div,
            a: Operand::Literal(1.0),
            b: Operand::Literal(0.0),
        };
        assert!(expr.eval(&Scope::new()).unwrap().is_nan());
    }

    #[test]
    fn integer_ops_truncate() {
        let scope = scope_with(&[("x", 7.9)]);
        let idiv = ComputeExpr {
            op: ComputeOp::Idiv,
            a: Operand::Ref("x".into()),
            b: Operand::Literal(2.0),
        };
        assert_eq!(idiv.eval(&scope).unwrap(), 3.0);
        let modulo = ComputeExpr {
            op: ComputeOp::Mod,
            a: Operand::Ref("x".into()),
            b: Operand::Literal(4.0),
        };
        assert_eq!(modulo.eval(&scope).unwrap(), 3.0);
    }

    #[test]
    fn guard_replaces_value_when_a_predicate_fails() {
        let computed = Computed {
            source: ComputedSource::Ref("x".into()),
            guard: Some(Guard {
                predicates: vec![GuardPred {
                    reference: "x".into(),
                    op: CmpOp::Gt,
                    value: 0.0,
                }],
                else_value: -1.0,
            }),
        };
        assert_eq!(computed.eval(&scope_with(&[("x", 5.0)])).unwrap(), 5.0);
        assert_eq!(computed.eval(&scope_with(&[("x", -2.0)])).unwrap(), -1.0);
    }

    #[test]
    fn unresolved_reference_is_fatal() {
        let computed = Computed {
            source: ComputedSource::Ref("missing".into()),
            guard: None,
        };
        assert!(matches!(
            computed.eval(&Scope::new()),
            Err(DecodeError::UndefinedVariable(name)) if name == "missing"
        ));
    }
}
