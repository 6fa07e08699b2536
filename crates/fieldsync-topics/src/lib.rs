//! Canonical event topic constants shared by the sync workers and their observers.
//!
//! Keep this list alphabetized within sections and favor dot.case names.

// Asset uploads
pub const TOPIC_ASSET_ENQUEUED: &str = "sync.asset.enqueued";
pub const TOPIC_ASSET_FAILED: &str = "sync.asset.failed";
pub const TOPIC_ASSET_PURGED: &str = "sync.asset.purged";
pub const TOPIC_ASSET_SWEEP_COMPLETED: &str = "sync.asset.sweep.completed";
pub const TOPIC_ASSET_UPLOADED: &str = "sync.asset.uploaded";

// Mutation log
pub const TOPIC_MUTATIONS_DRAINED: &str = "sync.mutations.drained";
pub const TOPIC_MUTATIONS_FAILED: &str = "sync.mutations.failed";

// Optimistic checklists
pub const TOPIC_CHECKLIST_RECONCILED: &str = "checklist.reconciled";

// Progress rollup
pub const TOPIC_PROGRESS_UPDATED: &str = "progress.updated";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_topics_are_sorted() {
        let asset = [
            TOPIC_ASSET_ENQUEUED,
            TOPIC_ASSET_FAILED,
            TOPIC_ASSET_PURGED,
            TOPIC_ASSET_SWEEP_COMPLETED,
            TOPIC_ASSET_UPLOADED,
        ];
        assert!(asset.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn topics_are_dot_case() {
        for topic in [
            TOPIC_ASSET_ENQUEUED,
            TOPIC_ASSET_FAILED,
            TOPIC_ASSET_PURGED,
            TOPIC_ASSET_SWEEP_COMPLETED,
            TOPIC_ASSET_UPLOADED,
            TOPIC_MUTATIONS_DRAINED,
            TOPIC_MUTATIONS_FAILED,
            TOPIC_CHECKLIST_RECONCILED,
            TOPIC_PROGRESS_UPDATED,
        ] {
            assert!(topic.contains('.'), "{topic} should be dot.case");
            assert!(
                topic
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c == '.' || c == '_'),
                "{topic} should be lowercase"
            );
        }
    }
}
