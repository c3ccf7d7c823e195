use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Label reserved to override the tenant ID of a single entry.
pub const RESERVED_LABEL_TENANT_ID: &str = "__tenant_id__";

/// Sorted label name/value pairs identifying a stream
pub type LabelSet = BTreeMap<String, String>;

/// A single log line with its labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub labels: LabelSet,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

impl Entry {
    pub fn new(labels: LabelSet, timestamp: DateTime<Utc>, line: impl Into<String>) -> Self {
        Self {
            labels,
            timestamp,
            line: line.into(),
        }
    }
}

/// Builds a label set from string pairs
pub fn label_set<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> LabelSet {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Renders labels as `{a="1", b="2"}`, leaving out `exclude`.
pub fn labels_to_string(labels: &LabelSet, exclude: Option<&str>) -> String {
    let mut out = String::from("{");
    let mut first = true;
    for (name, value) in labels {
        if Some(name.as_str()) == exclude {
            continue;
        }
        if !first {
            out.push_str(", ");
        }
        first = false;
        out.push_str(name);
        out.push_str("=\"");
        escape_value(&mut out, value);
        out.push('"');
    }
    out.push('}');
    out
}

fn escape_value(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{{{:04x}}}", c as u32);
            }
            c => out.push(c),
        }
    }
}

/// Merges `overrides` on top of `base`; values in `overrides` win.
pub fn merge_labels(base: &LabelSet, overrides: &LabelSet) -> LabelSet {
    let mut merged = base.clone();
    for (name, value) in overrides {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_to_string_sorted() {
        let labels = label_set([("job", "x"), ("app", "api")]);
        assert_eq!(labels_to_string(&labels, None), r#"{app="api", job="x"}"#);
    }

    #[test]
    fn test_labels_to_string_excludes_tenant() {
        let labels = label_set([("job", "x"), (RESERVED_LABEL_TENANT_ID, "team-a")]);
        assert_eq!(
            labels_to_string(&labels, Some(RESERVED_LABEL_TENANT_ID)),
            r#"{job="x"}"#
        );
    }

    #[test]
    fn test_labels_to_string_escapes_values() {
        let labels = label_set([("msg", "say \"hi\"\nnow")]);
        assert_eq!(
            labels_to_string(&labels, None),
            r#"{msg="say \"hi\"\nnow"}"#
        );
    }

    #[test]
    fn test_labels_to_string_empty() {
        assert_eq!(labels_to_string(&LabelSet::new(), None), "{}");
    }

    #[test]
    fn test_merge_labels_overrides_win() {
        let base = label_set([("env", "prod"), ("job", "base")]);
        let overrides = label_set([("job", "x")]);
        let merged = merge_labels(&base, &overrides);
        assert_eq!(merged, label_set([("env", "prod"), ("job", "x")]));
    }
}
