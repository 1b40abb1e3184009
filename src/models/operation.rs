use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    CreateFolder,
    Move,
    TagUpdate,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateFolder => write!(f, "create_folder"),
            Self::Move => write!(f, "move"),
            Self::TagUpdate => write!(f, "tag_update"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationFailure {
    pub kind: OperationKind,
    pub target: String,
    pub error: String,
}

/// Outcome of a best-effort apply. Nothing here is rolled back; failures are
/// recorded and the remaining operations still run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub folders_created: usize,
    pub folders_reused: usize,
    pub bookmarks_moved: usize,
    pub moves_skipped: usize,
    pub tags_updated: usize,
    pub failures: Vec<OperationFailure>,
}

impl ApplyReport {
    pub fn record_failure(&mut self, kind: OperationKind, target: &str, error: impl ToString) {
        self.failures.push(OperationFailure {
            kind,
            target: target.to_string(),
            error: error.to_string(),
        });
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.folders_created += other.folders_created;
        self.folders_reused += other.folders_reused;
        self.bookmarks_moved += other.bookmarks_moved;
        self.moves_skipped += other.moves_skipped;
        self.tags_updated += other.tags_updated;
        self.failures.extend(other.failures);
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "created {} folders, moved {} bookmarks, updated tags on {}",
            self.folders_created, self.bookmarks_moved, self.tags_updated
        );
        if self.folders_reused > 0 {
            out.push_str(&format!(", reused {} existing folders", self.folders_reused));
        }
        if self.moves_skipped > 0 {
            out.push_str(&format!(", {} already in place", self.moves_skipped));
        }
        if !self.failures.is_empty() {
            out.push_str(&format!(", {} failed", self.failures.len()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_mentions_failures_only_when_present() {
        let mut report = ApplyReport {
            bookmarks_moved: 2,
            ..Default::default()
        };
        assert!(!report.summary().contains("failed"));

        report.record_failure(OperationKind::Move, "9", "no such node");
        assert!(report.summary().contains("1 failed"));
    }

    #[test]
    fn merge_accumulates_counts_and_failures() {
        let mut total = ApplyReport {
            folders_created: 1,
            ..Default::default()
        };
        let mut batch = ApplyReport {
            bookmarks_moved: 3,
            moves_skipped: 1,
            ..Default::default()
        };
        batch.record_failure(OperationKind::CreateFolder, "Reading", "refused");

        total.merge(batch);
        assert_eq!(total.folders_created, 1);
        assert_eq!(total.bookmarks_moved, 3);
        assert_eq!(total.failures[0].kind, OperationKind::CreateFolder);
        assert_eq!(
            total.summary(),
            "created 1 folders, moved 3 bookmarks, updated tags on 0, 1 already in place, 1 failed"
        );
    }
}
