//! Name bindings for one template execution.

use std::collections::HashMap;

use super::value::{from_json, Value};

/// Explicitly supplied locals, as read from a `--locals` JSON file.
pub type Locals = serde_json::Map<String, serde_json::Value>;

/// Bound names plus the log of names that fell through to a mock.
///
/// Instance variables are bound under their `@` name and constant paths under
/// their full `A::B` text.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    bindings: HashMap<String, Value>,
    accessed_mocks: Vec<String>,
    content: HashMap<String, String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_locals(locals: &Locals) -> Self {
        let mut ctx = Self::new();
        for (name, json) in locals {
            ctx.bind(name.clone(), from_json(name, json));
        }
        ctx
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// The bound value, or a fresh mock labelled `name` with the access
    /// logged.
    pub fn resolve(&mut self, name: &str) -> Value {
        match self.bindings.get(name) {
            Some(value) => value.clone(),
            None => self.missing(name),
        }
    }

    /// Record that `name` fell through and return its mock.
    pub fn missing(&mut self, name: &str) -> Value {
        if !self.accessed_mocks.iter().any(|n| n == name) {
            self.accessed_mocks.push(name.to_string());
        }
        Value::mock(name)
    }

    /// Names that resolved to a mock, first-access order, unique.
    pub fn accessed_mocks(&self) -> &[String] {
        &self.accessed_mocks
    }

    pub fn store_content(&mut self, name: String, content: String) {
        self.content.entry(name).or_default().push_str(&content);
    }

    pub fn content(&self, name: &str) -> Option<&str> {
        self.content.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_falls_back_to_logged_mock() {
        let mut ctx = ExecutionContext::new();
        ctx.bind("title", Value::str("Hi"));
        assert_eq!(ctx.resolve("title").to_s(), "Hi");
        assert_eq!(ctx.resolve("user").to_s(), "[mock:user]");
        ctx.resolve("user");
        ctx.resolve("@items");
        assert_eq!(ctx.accessed_mocks(), ["user", "@items"]);
    }

    #[test]
    fn test_with_locals() {
        let locals: Locals = serde_json::from_str(r#"{"count": 3, "user": {"name": "Ada"}}"#).unwrap();
        let mut ctx = ExecutionContext::with_locals(&locals);
        assert_eq!(ctx.resolve("count").to_s(), "3");
        assert!(matches!(ctx.lookup("user"), Some(Value::Object(_))));
        assert!(ctx.accessed_mocks().is_empty());
    }

    #[test]
    fn test_content_accumulates() {
        let mut ctx = ExecutionContext::new();
        ctx.store_content("title".into(), "a".into());
        ctx.store_content("title".into(), "b".into());
        assert_eq!(ctx.content("title"), Some("ab"));
        assert_eq!(ctx.content("other"), None);
    }
}
