//! # ExecutionContext (C1)
//!
//! Holds values extracted from earlier steps plus environment lookups, and
//! performs placeholder resolution for later steps. Placeholders use the
//! literal form `${NAME}` for extracted values and `${env.NAME}` for
//! environment variables.
//!
//! Resolution is a single left-to-right substitution pass — no recursive
//! expansion, so a value that itself contains `${...}` is not expanded
//! again. Unknown placeholders are left literal rather than erroring, so
//! that harmless `${...}` fragments embedded in JSON bodies survive
//! untouched.

use std::collections::HashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static INTERPOLATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_.:-]+)\}").expect("valid interpolation regex"));

/// Variable state threaded through one `Run`: extracted values plus
/// environment seed data. `env` is a distinct store from `variables` — it
/// holds the `Run`'s own `environment` map, not the OS process environment,
/// so `${env.NAME}` resolves deterministically regardless of what's set in
/// the runner's own process.
#[derive(Debug, Default, Clone)]
pub struct Context {
    pub variables: HashMap<String, Value>,
    pub env: HashMap<String, String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            variables: HashMap::new(),
            env: HashMap::new(),
        }
    }

    pub fn seeded(environment: &std::collections::BTreeMap<String, String>) -> Self {
        let mut ctx = Self::new();
        ctx.env = environment.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        ctx
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Merges a step's extracted values into the context, per §4.6 step 3d:
    /// later steps see earlier extractions.
    pub fn add_extracted(&mut self, values: impl IntoIterator<Item = (String, Value)>) {
        for (k, v) in values {
            self.variables.insert(k, v);
        }
    }

    /// Resolves every `${...}` placeholder in `template` against the
    /// current variables and environment. Never fails (P8): a template with
    /// no placeholders is returned unchanged, and an unresolvable token is
    /// left as its original literal text.
    pub fn resolve(&self, template: &str) -> String {
        let mut result = String::with_capacity(template.len());
        let mut last_index = 0;

        for capture in INTERPOLATION_RE.captures_iter(template) {
            let matched = capture.get(0).unwrap();
            result.push_str(&template[last_index..matched.start()]);
            let token = capture.get(1).unwrap().as_str();
            match self.resolve_token(token) {
                Some(value) => result.push_str(&value),
                None => result.push_str(matched.as_str()),
            }
            last_index = matched.end();
        }

        result.push_str(&template[last_index..]);
        result
    }

    /// Recursively resolves placeholders inside a JSON value (used for
    /// request bodies), leaving non-string leaves untouched.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => {
                let mut new_map = Map::with_capacity(map.len());
                for (k, v) in map {
                    new_map.insert(k.clone(), self.resolve_value(v));
                }
                Value::Object(new_map)
            }
            other => other.clone(),
        }
    }

    fn resolve_token(&self, token: &str) -> Option<String> {
        if let Some(name) = token.strip_prefix("env.") {
            return self.env.get(name).cloned();
        }
        self.variables.get(token).map(|value| match value {
            Value::String(s) => s.clone(),
            primitive => primitive.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_is_identity_for_templates_without_placeholders() {
        let ctx = Context::new();
        assert_eq!(ctx.resolve("plain text"), "plain text");
    }

    #[test]
    fn resolve_is_identity_on_empty_context() {
        let ctx = Context::new();
        assert_eq!(ctx.resolve("${unknown}"), "${unknown}");
    }

    #[test]
    fn resolve_substitutes_known_variables() {
        let mut ctx = Context::new();
        ctx.set("id", json!("42"));
        assert_eq!(ctx.resolve("/pets/${id}"), "/pets/42");
    }

    #[test]
    fn resolve_leaves_unknown_placeholders_literal() {
        let mut ctx = Context::new();
        ctx.set("id", json!("42"));
        assert_eq!(ctx.resolve("${id}-${missing}"), "42-${missing}");
    }

    #[test]
    fn resolve_does_not_recursively_expand() {
        let mut ctx = Context::new();
        ctx.set("a", json!("${b}"));
        ctx.set("b", json!("leaf"));
        assert_eq!(ctx.resolve("${a}"), "${b}");
    }

    #[test]
    fn resolve_env_prefix_reads_the_runs_own_environment_map() {
        let mut environment = std::collections::BTreeMap::new();
        environment.insert("API_KEY".to_string(), "secret".to_string());
        let ctx = Context::seeded(&environment);
        assert_eq!(ctx.resolve("${env.API_KEY}"), "secret");
    }

    #[test]
    fn resolve_env_prefix_ignores_the_process_environment() {
        std::env::set_var("QA_ORCH_TEST_VAR", "hello");
        let ctx = Context::new();
        assert_eq!(ctx.resolve("${env.QA_ORCH_TEST_VAR}"), "${env.QA_ORCH_TEST_VAR}");
        std::env::remove_var("QA_ORCH_TEST_VAR");
    }

    #[test]
    fn add_extracted_merges_values() {
        let mut ctx = Context::new();
        ctx.add_extracted(vec![("id".to_string(), json!("1"))]);
        assert_eq!(ctx.get("id"), Some(&json!("1")));
    }
}
