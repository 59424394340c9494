//! Variable resolution for cross-node data flow.
//!
//! Templates use `{{scope.path.to.value}}` placeholders resolved against a
//! three-scope context: `system.*` (execution metadata), `form.*` (caller
//! inputs), and `<nodeId>.*` (prior node outputs). Resolution is pure
//! substitution -- no arithmetic, no conditionals; branching belongs to
//! condition nodes.
//!
//! Unresolved references are left verbatim rather than erroring, so authors
//! can visually spot missing bindings in run output.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Matches one `{{ scope.path }}` placeholder anywhere in a string.
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}").unwrap());

/// Matches a string that is exactly one placeholder (whole-token form).
static WHOLE_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}$").unwrap()
});

/// Layered lookup context for template resolution.
///
/// Built fresh from the run's `FlowContext` before each node dispatch; holds
/// snapshots, so resolution never races concurrent branch writes.
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    /// `system.*` -- run id, definition id, user id, timestamps.
    pub system: Value,
    /// `form.*` -- caller-supplied inputs.
    pub form: Value,
    /// `<nodeId>.*` -- prior node outputs from the run's output cache.
    pub nodes: Map<String, Value>,
}

impl ResolutionContext {
    pub fn new(system: Value, form: Value, nodes: Map<String, Value>) -> Self {
        Self {
            system,
            form,
            nodes,
        }
    }

    /// Resolve a dotted path (`form.imageUrl`, `remove-background.url`)
    /// to its value. `None` when any segment is missing.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let scope = segments.next()?;
        let root = match scope {
            "system" => &self.system,
            "form" => &self.form,
            node_id => self.nodes.get(node_id)?,
        };
        walk_path(root, segments)
    }

    /// Resolve placeholders inside a single string.
    ///
    /// A string that is exactly one placeholder resolves to the raw JSON
    /// value, so non-string outputs flow through untouched. Embedded
    /// placeholders stringify: strings verbatim, scalars via display,
    /// objects/arrays as compact JSON. Unresolved tokens stay as-is.
    pub fn resolve_str(&self, input: &str) -> Value {
        if let Some(caps) = WHOLE_TOKEN_RE.captures(input) {
            return match self.lookup(&caps[1]) {
                Some(value) => value,
                None => Value::String(input.to_string()),
            };
        }

        let replaced = PLACEHOLDER_RE.replace_all(input, |caps: &regex::Captures<'_>| {
            match self.lookup(&caps[1]) {
                Some(value) => value_to_string(&value),
                // Leave the token verbatim so the gap is visible.
                None => caps[0].to_string(),
            }
        });
        Value::String(replaced.into_owned())
    }

    /// Deep-walk an arbitrary JSON tree, substituting only string leaves.
    pub fn resolve_all(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_str(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_all(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_all(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Walk remaining path segments through nested objects and arrays.
fn walk_path<'a, I>(root: &Value, segments: I) -> Option<Value>
where
    I: Iterator<Item = &'a str>,
{
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Convert a JSON value to its embedded-substitution string form.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects/arrays embed as compact JSON.
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
