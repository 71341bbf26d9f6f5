//! Level-aware response redaction.
//!
//! The redactor is the last stage before a payload leaves the process. It
//! works on a deep copy of a generic JSON tree (never on the typed structs,
//! and never mutating anything reachable by other code paths), stamps
//! `role_applied`, drops memories above the caller's visibility level, caps
//! the trace summary, and scrubs sensitive substrings for level-0 callers.
//!
//! Redaction never fails: a structurally surprising payload gets the most
//! restrictive (level 0) treatment. Applying the redactor twice with the
//! same roles is a no-op.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::rbac;

/// Trace summary lines shown to level-0 callers.
const TRACE_CAP: usize = 4;

/// Upgrade hint shown in place of provenance for level-0 callers.
const PROVENANCE_HINT: &str = "Full provenance is available to pro accounts and above.";

/// Sensitive substrings scrubbed from level-0 responses.
// The patterns are static and compile.
#[allow(clippy::unwrap_used)]
fn sensitive_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?x)
            [0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}
            | id:[A-Za-z0-9_-]+
            | uuid:[A-Za-z0-9_-]+
            | db\.[A-Za-z0-9_-]+
            | internal:[A-Za-z0-9_-]+
            | __[A-Za-z0-9_-]+__
            | ref:[A-Za-z0-9_-]+
            ",
        )
        .unwrap()
    })
}

/// Metadata keys stripped from level-0 responses.
#[allow(clippy::unwrap_used)]
fn sensitive_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(internal_id|db_ref|vector_ref)$").unwrap())
}

#[allow(clippy::unwrap_used)]
fn overflow_marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\.\.\. \(\d+ more lines\)$").unwrap())
}

/// Redact `payload` for a caller holding `roles`.
///
/// Returns a deep copy; the input is never mutated.
#[must_use]
pub fn redact_response<S: AsRef<str>>(payload: &Value, roles: &[S]) -> Value {
    let level = rbac::max_level(roles);
    let role_applied = rbac::resolve_role(roles);
    let mut value = payload.clone();

    match value {
        Value::Object(_) => {
            redact_object(&mut value, level, role_applied);
            value
        }
        _ => {
            // Structural surprise: most restrictive treatment.
            scrub_strings(&mut value);
            value
        }
    }
}

fn redact_object(value: &mut Value, level: u8, role_applied: &str) {
    if let Some(obj) = value.as_object_mut() {
        obj.insert("role_applied".to_string(), Value::from(role_applied));

        if let Some(messages) = obj.get_mut("messages").and_then(Value::as_array_mut) {
            for message in messages.iter_mut() {
                if let Some(message) = message.as_object_mut() {
                    message.insert("role_applied".to_string(), Value::from(role_applied));
                }
            }
        }

        if let Some(context) = obj.get_mut("context").and_then(Value::as_array_mut) {
            context.retain(|item| visibility_level(item) <= level);
            if level == 0 {
                for item in context.iter_mut() {
                    redact_context_item(item);
                }
            }
        }

        if level == 0 {
            if let Some(trace) = obj
                .get_mut("process_trace_summary")
                .and_then(Value::as_array_mut)
            {
                cap_trace(trace);
            }
            if let Some(metadata) = obj.get_mut("metadata") {
                strip_sensitive_keys(metadata);
            }
        }
    }

    if level == 0 {
        scrub_strings(value);
    }
}

/// Visibility level stamped on a context item; absent means public.
fn visibility_level(item: &Value) -> u8 {
    item.get("role_view_level")
        .and_then(Value::as_u64)
        .map_or(0, |v| v.min(u64::from(u8::MAX)) as u8)
}

fn redact_context_item(item: &mut Value) {
    let Some(obj) = item.as_object_mut() else {
        return;
    };
    if obj.contains_key("provenance") {
        obj.insert(
            "provenance".to_string(),
            json!({ "redacted": true, "message": PROVENANCE_HINT }),
        );
    }
    if let Some(metadata) = obj.get_mut("metadata") {
        strip_sensitive_keys(metadata);
    }
}

fn strip_sensitive_keys(metadata: &mut Value) {
    if let Some(map) = metadata.as_object_mut() {
        let sensitive: Vec<String> = map
            .keys()
            .filter(|key| sensitive_key_pattern().is_match(key))
            .cloned()
            .collect();
        for key in sensitive {
            map.remove(&key);
        }
    }
}

/// Cap the trace summary at [`TRACE_CAP`] lines plus an overflow marker.
/// An already-capped summary is left unchanged.
fn cap_trace(trace: &mut Vec<Value>) {
    let already_capped = trace
        .last()
        .and_then(Value::as_str)
        .is_some_and(|s| overflow_marker_pattern().is_match(s));
    if already_capped || trace.len() <= TRACE_CAP {
        return;
    }
    let overflow = trace.len() - TRACE_CAP;
    trace.truncate(TRACE_CAP);
    trace.push(Value::from(format!("... ({overflow} more lines)")));
}

/// Replace sensitive substrings in every string of the tree.
fn scrub_strings(value: &mut Value) {
    match value {
        Value::String(s) => {
            if sensitive_pattern().is_match(s) {
                *s = sensitive_pattern().replace_all(s, "[REDACTED]").into_owned();
            }
        }
        Value::Array(items) => {
            for item in items {
                scrub_strings(item);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                scrub_strings(item);
            }
        }
        _ => {}
    }
}
