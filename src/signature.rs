//! Human-readable call signatures and cache keys.
//!
//! A signature like `login("alice")` is what shows up in logs, in the
//! pending-call list and in hydration bookkeeping. Long strings and long
//! argument lists are truncated so a single call never floods a log line.

use serde_json::Value;

/// Strings longer than this are shortened inside signatures.
const MAX_STRING_CHARS: usize = 50;

/// Rendered argument lists longer than this are shortened.
const MAX_ARGS_CHARS: usize = 100;

const ELLIPSIS: &str = "...";

/// Keep the first `max` characters of `s`, appending `...` if anything was cut.
fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}{ELLIPSIS}", &s[..idx]),
        None => s.to_string(),
    }
}

/// Shorten long strings anywhere inside a JSON value.
pub fn format_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_chars(s, MAX_STRING_CHARS)),
        Value::Array(items) => Value::Array(items.iter().map(format_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), format_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render an argument list as `a, b, c`, bounded in length.
pub fn stringify_event_parameters(args: &[Value]) -> String {
    let rendered = args
        .iter()
        .map(|arg| format_value(arg).to_string())
        .collect::<Vec<_>>()
        .join(", ");
    truncate_chars(&rendered, MAX_ARGS_CHARS)
}

/// Signature of one call, computed once at call start.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSignature {
    namespace: String,
    short: String,
}

impl CallSignature {
    /// Build the signature for `event(args)` on `namespace`.
    pub fn new(namespace: &str, event: &str, args: &[Value]) -> Self {
        Self {
            namespace: namespace.to_string(),
            short: format!("{event}({})", stringify_event_parameters(args)),
        }
    }

    /// `event(args)` form, used for the pending-call list.
    pub fn short(&self) -> &str {
        &self.short
    }

    /// `namespace/event(args)` form, used for logs.
    pub fn full(&self) -> String {
        format!("{}/{}", self.namespace, self.short)
    }
}

impl std::fmt::Display for CallSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.short)
    }
}

/// Cache key for a call: `namespace/event ["arg", ...]`.
///
/// Uses the full, untruncated argument list so distinct calls never collide.
pub fn cache_key(namespace: &str, event: &str, args: &[Value]) -> String {
    format!("{namespace}/{event} {}", Value::from(args.to_vec()))
}

/// Untruncated `namespace/event(args)` form, used to match a cache-served
/// call with its live refresh. Distinct argument lists never collide.
pub fn untruncated_signature(namespace: &str, event: &str, args: &[Value]) -> String {
    let rendered = args
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!("{namespace}/{event}({rendered})")
}
