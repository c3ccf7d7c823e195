use crate::api::{merge_labels, Entry, LabelSet, RESERVED_LABEL_TENANT_ID};

/// Applies the client's external labels and decides which tenant an entry
/// belongs to.
#[derive(Debug, Clone, Default)]
pub struct EntryProcessor {
    external_labels: LabelSet,
    tenant_id: String,
}

impl EntryProcessor {
    pub fn new(external_labels: LabelSet, tenant_id: impl Into<String>) -> Self {
        Self {
            external_labels,
            tenant_id: tenant_id.into(),
        }
    }

    /// Merge external labels under the entry's own labels
    pub fn process(&self, mut entry: Entry) -> Entry {
        if !self.external_labels.is_empty() {
            entry.labels = merge_labels(&self.external_labels, &entry.labels);
        }
        entry
    }

    /// The reserved label wins over the configured tenant; no tenant at all is "".
    pub fn tenant_of(&self, entry: &Entry) -> String {
        entry
            .labels
            .get(RESERVED_LABEL_TENANT_ID)
            .cloned()
            .unwrap_or_else(|| self.tenant_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::label_set;
    use chrono::Utc;

    #[test]
    fn test_reserved_label_overrides_configured_tenant() {
        let processor = EntryProcessor::new(LabelSet::new(), "static");
        let routed = Entry::new(
            label_set([("job", "x"), (RESERVED_LABEL_TENANT_ID, "team-a")]),
            Utc::now(),
            "line",
        );
        let plain = Entry::new(label_set([("job", "x")]), Utc::now(), "line");

        assert_eq!(processor.tenant_of(&routed), "team-a");
        assert_eq!(processor.tenant_of(&plain), "static");
        assert_eq!(EntryProcessor::default().tenant_of(&plain), "");
    }

    #[test]
    fn test_entry_labels_win_over_external_labels() {
        let processor = EntryProcessor::new(
            label_set([("cluster", "eu-1"), ("job", "external")]),
            "",
        );
        let entry = processor.process(Entry::new(label_set([("job", "x")]), Utc::now(), "line"));
        assert_eq!(entry.labels, label_set([("cluster", "eu-1"), ("job", "x")]));
    }

    #[test]
    fn test_external_labels_can_carry_tenant() {
        let processor = EntryProcessor::new(label_set([(RESERVED_LABEL_TENANT_ID, "ext")]), "static");
        let entry = processor.process(Entry::new(label_set([("job", "x")]), Utc::now(), "line"));
        assert_eq!(processor.tenant_of(&entry), "ext");
    }
}
