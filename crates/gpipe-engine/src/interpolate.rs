//! `${key}` parameter interpolation
//!
//! String values in task parameters may reference scope keys as `${key}`.
//! Substitution is a single pass: the replacement text is inserted verbatim
//! and never re-scanned, so a scope value containing `${...}` stays as-is.
//! A placeholder with no scope entry fails the task before it runs.

use regex::Regex;
use serde_json::Value;

use crate::config::ParamMap;
use crate::error::{EngineError, Result};

/// Layered key/value context for placeholder resolution.
///
/// Layers are merged at construction; a later layer overrides earlier
/// entries with the same key.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    values: ParamMap,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a layer on top of the current one; later wins
    pub fn with_layer(mut self, layer: &ParamMap) -> Self {
        for (key, value) in layer {
            self.values.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &ParamMap {
        &self.values
    }
}

/// Resolves `${key}` placeholders against a [`Scope`]
#[derive(Debug, Clone)]
pub struct Interpolator {
    pattern: Regex,
}

impl Interpolator {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| EngineError::configuration(format!("placeholder pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Substitute every placeholder in a string.
    ///
    /// Replacement text is always a string: string scope values are inserted
    /// as-is, anything else is rendered as compact JSON (so `5` becomes
    /// `"5"`, `true` becomes `"true"`).
    pub fn resolve_str(&self, input: &str, scope: &Scope) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in self.pattern.captures_iter(input) {
            let Some(whole) = caps.get(0) else { continue };
            let key = &caps[1];
            let value = scope
                .get(key)
                .ok_or_else(|| EngineError::Interpolation { key: key.to_string() })?;
            out.push_str(&input[last..whole.start()]);
            out.push_str(&render(value));
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    /// Substitute placeholders throughout a JSON value.
    ///
    /// Only string values are scanned; maps and arrays are walked
    /// recursively, and non-string leaves pass through untouched.
    pub fn resolve_value(&self, value: &Value, scope: &Scope) -> Result<Value> {
        match value {
            Value::String(s) => Ok(Value::String(self.resolve_str(s, scope)?)),
            Value::Array(items) => {
                let resolved: Result<Vec<Value>> =
                    items.iter().map(|v| self.resolve_value(v, scope)).collect();
                Ok(Value::Array(resolved?))
            },
            Value::Object(map) => {
                let mut resolved = ParamMap::new();
                for (key, v) in map {
                    resolved.insert(key.clone(), self.resolve_value(v, scope)?);
                }
                Ok(Value::Object(resolved))
            },
            other => Ok(other.clone()),
        }
    }

    /// Substitute placeholders in every value of a parameter map
    pub fn resolve_params(&self, params: &ParamMap, scope: &Scope) -> Result<ParamMap> {
        let mut resolved = ParamMap::new();
        for (key, value) in params {
            resolved.insert(key.clone(), self.resolve_value(value, scope)?);
        }
        Ok(resolved)
    }

    /// Best-effort [`resolve_str`](Self::resolve_str) for plan display:
    /// placeholders with no scope entry stay verbatim instead of failing.
    pub fn preview_str(&self, input: &str, scope: &Scope) -> String {
        self.pattern
            .replace_all(input, |caps: &regex::Captures<'_>| match scope.get(&caps[1]) {
                Some(value) => render(value),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    fn preview_value(&self, value: &Value, scope: &Scope) -> Value {
        match value {
            Value::String(s) => Value::String(self.preview_str(s, scope)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.preview_value(v, scope)).collect())
            },
            Value::Object(map) => {
                let mut out = ParamMap::new();
                for (key, v) in map {
                    out.insert(key.clone(), self.preview_value(v, scope));
                }
                Value::Object(out)
            },
            other => other.clone(),
        }
    }

    /// Best-effort [`resolve_params`](Self::resolve_params) for plan display
    pub fn preview_params(&self, params: &ParamMap, scope: &Scope) -> ParamMap {
        let mut out = ParamMap::new();
        for (key, value) in params {
            out.insert(key.clone(), self.preview_value(value, scope));
        }
        out
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(pairs: &[(&str, Value)]) -> Scope {
        let mut scope = Scope::new();
        for (key, value) in pairs {
            scope.set(*key, value.clone());
        }
        scope
    }

    #[test]
    fn test_simple_substitution() {
        let interp = Interpolator::new().unwrap();
        let scope = scope(&[("data_dir", json!("/data/gwas"))]);
        let out = interp.resolve_str("${data_dir}/input.jsonl", &scope).unwrap();
        assert_eq!(out, "/data/gwas/input.jsonl");
    }

    #[test]
    fn test_multiple_placeholders_in_one_string() {
        let interp = Interpolator::new().unwrap();
        let scope = scope(&[("a", json!("x")), ("b", json!("y"))]);
        let out = interp.resolve_str("${a}-${b}-${a}", &scope).unwrap();
        assert_eq!(out, "x-y-x");
    }

    #[test]
    fn test_non_string_values_stringified() {
        let interp = Interpolator::new().unwrap();
        let scope = scope(&[("n", json!(5000)), ("flag", json!(true))]);
        let out = interp.resolve_str("${n} rows, commit=${flag}", &scope).unwrap();
        assert_eq!(out, "5000 rows, commit=true");
    }

    #[test]
    fn test_missing_key_names_the_placeholder() {
        let interp = Interpolator::new().unwrap();
        let err = interp
            .resolve_str("from ${start} to ${end}", &scope(&[("start", json!(1))]))
            .unwrap_err();
        match err {
            EngineError::Interpolation { key } => assert_eq!(key, "end"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_params_resolved_recursively() {
        let interp = Interpolator::new().unwrap();
        let scope = scope(&[("table", json!("variants"))]);
        let params: ParamMap = json!({
            "target": "${table}",
            "options": {"comment": "loading ${table}"},
            "columns": ["${table}_id", "chrom"],
            "batch": 500
        })
        .as_object()
        .unwrap()
        .clone();

        let resolved = interp.resolve_params(&params, &scope).unwrap();
        assert_eq!(resolved["target"], json!("variants"));
        assert_eq!(resolved["options"]["comment"], json!("loading variants"));
        assert_eq!(resolved["columns"], json!(["variants_id", "chrom"]));
        // non-string leaves pass through with their type intact
        assert_eq!(resolved["batch"], json!(500));
    }

    #[test]
    fn test_no_recursive_expansion() {
        let interp = Interpolator::new().unwrap();
        let scope = scope(&[("a", json!("${b}")), ("b", json!("seen"))]);
        let out = interp.resolve_str("${a}", &scope).unwrap();
        assert_eq!(out, "${b}");
    }

    #[test]
    fn test_layering_later_wins() {
        let base: ParamMap = json!({"mode": "defaults", "keep": 1}).as_object().unwrap().clone();
        let over: ParamMap = json!({"mode": "override"}).as_object().unwrap().clone();
        let scope = Scope::new().with_layer(&base).with_layer(&over);
        assert_eq!(scope.get("mode"), Some(&json!("override")));
        assert_eq!(scope.get("keep"), Some(&json!(1)));
    }

    #[test]
    fn test_string_without_placeholders_unchanged() {
        let interp = Interpolator::new().unwrap();
        let out = interp.resolve_str("plain text $notbrace {x}", &Scope::new()).unwrap();
        assert_eq!(out, "plain text $notbrace {x}");
    }

    #[test]
    fn test_preview_keeps_unknown_placeholders() {
        let interp = Interpolator::new().unwrap();
        let scope = scope(&[("known", json!("v"))]);
        assert_eq!(interp.preview_str("${known} and ${unknown}", &scope), "v and ${unknown}");
    }

    #[test]
    fn test_preview_params_resolve_partially() {
        let interp = Interpolator::new().unwrap();
        let scope = scope(&[("dir", json!("/data"))]);
        let params: ParamMap = json!({"file": "${dir}/in.jsonl", "tag": "${run_id}"})
            .as_object()
            .unwrap()
            .clone();

        let out = interp.preview_params(&params, &scope);
        assert_eq!(out["file"], json!("/data/in.jsonl"));
        assert_eq!(out["tag"], json!("${run_id}"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn resolve_never_panics(input in ".{0,64}") {
                let interp = Interpolator::new().unwrap();
                let _ = interp.resolve_str(&input, &Scope::new());
            }

            #[test]
            fn dollar_free_strings_pass_through(input in "[^$]{0,64}") {
                let interp = Interpolator::new().unwrap();
                let out = interp.resolve_str(&input, &Scope::new()).unwrap();
                prop_assert_eq!(out, input);
            }

            #[test]
            fn known_keys_always_resolve(value in "[a-z0-9/_-]{0,24}") {
                let interp = Interpolator::new().unwrap();
                let mut scope = Scope::new();
                scope.set("key", Value::String(value.clone()));
                let out = interp.resolve_str("pre ${key} post", &scope).unwrap();
                prop_assert_eq!(out, format!("pre {value} post"));
            }
        }
    }
}
