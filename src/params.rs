//! Named build parameters.
//!
//! Parameters are plain strings. An unset parameter reads as the empty string,
//! and pipeline strings may reference parameters as `${NAME}`.

use std::collections::BTreeMap;

use crate::error::{AssemblyError, Result};

/// Parameter made available to installer commands: the tree being assembled.
pub const TARGET_ROOT_PARAM: &str = "TARGET_ROOT";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildParams {
    values: BTreeMap<String, String>,
}

impl BuildParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from pipeline-file defaults.
    pub fn from_defaults(defaults: BTreeMap<String, String>) -> Self {
        Self { values: defaults }
    }

    /// Set a value, replacing any default.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Parse and apply a `NAME=VALUE` override.
    pub fn apply_override(&mut self, raw: &str) -> Result<()> {
        let (name, value) = raw.split_once('=').ok_or_else(|| {
            AssemblyError::Config(format!(
                "invalid parameter '{raw}': expected NAME=VALUE"
            ))
        })?;
        let name = name.trim();
        if !is_param_name(name) {
            return Err(AssemblyError::Config(format!(
                "invalid parameter name '{name}'"
            )));
        }
        self.set(name, value);
        Ok(())
    }

    /// Value of `name`, or `""` when unset.
    pub fn get(&self, name: &str) -> &str {
        self.values.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Expand `${NAME}` references. Unknown names expand to `""`; an
    /// unterminated `${` is kept literally.
    pub fn expand(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) if is_param_name(&after[..end]) => {
                    out.push_str(self.get(&after[..end]));
                    rest = &after[end + 1..];
                }
                _ => {
                    out.push_str("${");
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }

    pub fn expand_all(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.expand(s)).collect()
    }
}

fn is_param_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}
