//! Lexical variable scope for `$name` references.
//!
//! Every decoded field binds its reported value (or its `var` alias) into
//! the innermost frame. Nested objects and repeat iterations push a fresh
//! frame; resolution walks outward, so inner constructs see enclosing
//! bindings but never their siblings'.

use crate::value::Value;
use ahash::AHashMap;

#[derive(Debug, Default)]
pub struct Scope {
    frames: Vec<AHashMap<String, Value>>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            frames: vec![AHashMap::new()],
        }
    }

    pub fn push(&mut self) {
        self.frames.push(AHashMap::new());
    }

    pub fn pop(&mut self) {
        debug_assert!(self.frames.len() > 1, "root frame must stay");
        self.frames.pop();
    }

    pub fn bind(&mut self, name: &str, value: Value) {
        self.frames
            .last_mut()
            .expect("scope always has a frame")
            .insert(name.to_string(), value);
    }

    /// Resolves `name` (with or without the `$` sigil), innermost frame
    /// first.
    pub fn resolve(&self, name: &str) -> Option<&Value> {
        let name = name.strip_prefix('$').unwrap_or(name);
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    pub fn resolve_f64(&self, name: &str) -> Option<f64> {
        self.resolve(name).and_then(Value::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_frames_shadow_and_unwind() {
        let mut scope = Scope::new();
        scope.bind("x", Value::Int(1));
        scope.push();
        scope.bind("x", Value::Int(2));
        scope.bind("y", Value::Int(3));
        assert_eq!(scope.resolve("$x"), Some(&Value::Int(2)));
        assert_eq!(scope.resolve("y"), Some(&Value::Int(3)));
        scope.pop();
        assert_eq!(scope.resolve("x"), Some(&Value::Int(1)));
        assert_eq!(scope.resolve("y"), None);
    }
}
