//! External-persist guard.
//!
//! Nothing fetched from outside the corpus may reach persistent storage.
//! Every entry point into the commit engine and every memory-upsert path
//! runs this structural scan; a single external marker fails the whole
//! write and produces an audit record.

use serde_json::Value;

use crate::audit::{self, AuditEvent};
use crate::error::{Error, Result};

/// One externally-marked item found by the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalItem {
    /// Position in the scanned slice.
    pub index: usize,
    /// Which marker tripped, e.g. `provenance.url`.
    pub marker: &'static str,
    /// The offending URL, when the marker carries one.
    pub url: Option<String>,
}

/// Outcome of a guard scan.
#[derive(Debug, Clone, Default)]
pub struct ExternalScanReport {
    pub scanned: usize,
    pub external: Vec<ExternalItem>,
}

impl ExternalScanReport {
    /// URLs of all flagged items.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.external.iter().filter_map(|e| e.url.clone()).collect()
    }
}

/// Markers checked in order; the first match classifies the item.
fn detect_external(item: &Value) -> Option<(&'static str, Option<String>)> {
    if let Some(url) = item.pointer("/provenance/url").and_then(Value::as_str) {
        return Some(("provenance.url", Some(url.to_string())));
    }
    if let Some(url) = item.get("source_url").and_then(Value::as_str) {
        return Some(("source_url", Some(url.to_string())));
    }
    if item.get("external").and_then(Value::as_bool) == Some(true) {
        return Some(("external", None));
    }
    if item.pointer("/metadata/external").and_then(Value::as_bool) == Some(true) {
        return Some(("metadata.external", None));
    }
    if let Some(url) = item.pointer("/metadata/url").and_then(Value::as_str) {
        return Some(("metadata.url", Some(url.to_string())));
    }
    None
}

/// Scan `items` for external markers.
///
/// With `raise_on_external` set, any flagged item fails the call with
/// [`Error::ExternalPersistence`] naming the count, item type, and offending
/// URLs; an audit record is produced either way whenever the count is
/// non-zero.
pub fn forbid_external_persistence(
    items: &[Value],
    item_type: &str,
    raise_on_external: bool,
) -> Result<ExternalScanReport> {
    let mut report = ExternalScanReport {
        scanned: items.len(),
        external: Vec::new(),
    };
    for (index, item) in items.iter().enumerate() {
        if let Some((marker, url)) = detect_external(item) {
            report.external.push(ExternalItem { index, marker, url });
        }
    }

    if !report.external.is_empty() {
        let urls = report.urls();
        audit::record(AuditEvent::external_persistence_blocked(item_type, &urls));
        if raise_on_external {
            return Err(Error::ExternalPersistence {
                count: report.external.len(),
                item_type: item_type.to_string(),
                urls,
            });
        }
    }
    Ok(report)
}

/// Split items into (internal, external) for display paths that may show
/// external content without persisting it.
#[must_use]
pub fn filter_external_items(items: Vec<Value>) -> (Vec<Value>, Vec<Value>) {
    items
        .into_iter()
        .partition(|item| detect_external(item).is_none())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clean_items_pass() {
        let items = vec![json!({"text": "internal", "provenance": {"origin": "upload"}})];
        let report = forbid_external_persistence(&items, "memory", true).unwrap();
        assert_eq!(report.scanned, 1);
        assert!(report.external.is_empty());
    }

    #[test]
    fn test_each_marker_is_detected() {
        let cases = vec![
            (json!({"provenance": {"url": "https://a"}}), "provenance.url"),
            (json!({"source_url": "https://b"}), "source_url"),
            (json!({"external": true}), "external"),
            (json!({"metadata": {"external": true}}), "metadata.external"),
            (json!({"metadata": {"url": "https://c"}}), "metadata.url"),
        ];
        for (item, marker) in cases {
            let report = forbid_external_persistence(&[item], "memory", false).unwrap();
            assert_eq!(report.external.len(), 1, "marker {marker}");
            assert_eq!(report.external[0].marker, marker);
        }
    }

    #[test]
    fn test_marker_precedence() {
        let item = json!({
            "provenance": {"url": "https://first"},
            "source_url": "https://second",
        });
        let report = forbid_external_persistence(&[item], "memory", false).unwrap();
        assert_eq!(report.external[0].marker, "provenance.url");
        assert_eq!(report.external[0].url.as_deref(), Some("https://first"));
    }

    #[test]
    fn test_raise_names_count_type_and_urls() {
        let items = vec![
            json!({"text": "fine"}),
            json!({"provenance": {"url": "https://example.com/x"}}),
        ];
        let err = forbid_external_persistence(&items, "memory", true).unwrap_err();
        match err {
            Error::ExternalPersistence { count, item_type, urls } => {
                assert_eq!(count, 1);
                assert_eq!(item_type, "memory");
                assert_eq!(urls, vec!["https://example.com/x".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_external_false_is_internal() {
        let items = vec![json!({"external": false, "metadata": {"external": false}})];
        let report = forbid_external_persistence(&items, "memory", true).unwrap();
        assert!(report.external.is_empty());
    }

    #[test]
    fn test_filter_splits() {
        let items = vec![
            json!({"id": "a"}),
            json!({"id": "b", "source_url": "https://x"}),
            json!({"id": "c"}),
        ];
        let (internal, external) = filter_external_items(items);
        assert_eq!(internal.len(), 2);
        assert_eq!(external.len(), 1);
        assert_eq!(external[0]["id"], "b");
    }

    #[test]
    fn test_non_object_items_are_internal() {
        let items = vec![json!("just a string"), json!(42)];
        let report = forbid_external_persistence(&items, "memory", true).unwrap();
        assert!(report.external.is_empty());
    }
}
