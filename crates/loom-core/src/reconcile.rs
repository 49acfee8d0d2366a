use crate::snapshot::SnapshotStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// An external change waiting for the client to accept or reject it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingReview {
    pub path: String,
    pub old_content: String,
    pub new_content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReviewResolution {
    Accepted,
    Rejected,
    /// The review became moot: file removed, edit reverted, or overwritten by the client.
    Discarded,
}

impl ReviewResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewResolution::Accepted => "accepted",
            ReviewResolution::Rejected => "rejected",
            ReviewResolution::Discarded => "discarded",
        }
    }
}

impl fmt::Display for ReviewResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Content matched what is already known.
    Unchanged,
    /// No baseline existed; the observed content became the baseline.
    Cached,
    ReviewOpened(PendingReview),
    /// A newer external edit superseded the outstanding review's new content.
    ReviewReplaced(PendingReview),
    ReviewDiscarded { path: String },
    Removed { review_discarded: bool },
}

/// Disk write-back owed after a rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub path: String,
    pub absolute: PathBuf,
    pub content: String,
}

/// Accept/reject state machine over the baseline store.
///
/// Every mutation of baselines and pending reviews goes through here. Each
/// workspace root gets a new `generation`; callers that captured a generation
/// before an await point must check [`Reconciler::is_current`] before
/// applying what they observed.
#[derive(Debug)]
pub struct Reconciler {
    root: PathBuf,
    generation: u64,
    baseline: SnapshotStore,
    pending: BTreeMap<String, PendingReview>,
}

impl Reconciler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            generation: 1,
            baseline: SnapshotStore::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Rebinds to `root`: drops every pending review and clears the baseline
    /// store. Returns the number of reviews discarded.
    pub fn reset(&mut self, root: impl Into<PathBuf>) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        self.baseline.clear();
        self.root = root.into();
        self.generation += 1;
        discarded
    }

    pub fn baseline(&self, path: &str) -> Option<&str> {
        self.baseline.get(path)
    }

    pub fn baseline_len(&self) -> usize {
        self.baseline.len()
    }

    pub fn pending_for(&self, path: &str) -> Option<&PendingReview> {
        self.pending.get(path)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Outstanding reviews, oldest first.
    pub fn pending(&self) -> Vec<PendingReview> {
        let mut reviews: Vec<_> = self.pending.values().cloned().collect();
        reviews.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.path.cmp(&b.path))
        });
        reviews
    }

    /// Stores `content` as the baseline only when none is known yet.
    pub fn seed(&mut self, path: &str, content: impl Into<String>) -> bool {
        if self.baseline.contains(path) {
            return false;
        }
        self.baseline.set(path, content);
        true
    }

    pub fn observe_added(&mut self, path: &str, content: String) -> ReconcileOutcome {
        if self.baseline.contains(path) {
            return self.observe_changed(path, content);
        }
        self.baseline.set(path, content);
        ReconcileOutcome::Cached
    }

    pub fn observe_changed(&mut self, path: &str, content: String) -> ReconcileOutcome {
        let Some(base) = self.baseline.get(path) else {
            self.baseline.set(path, content);
            return ReconcileOutcome::Cached;
        };

        if base == content {
            return match self.pending.remove(path) {
                Some(_) => ReconcileOutcome::ReviewDiscarded {
                    path: path.to_string(),
                },
                None => ReconcileOutcome::Unchanged,
            };
        }

        if let Some(review) = self.pending.get_mut(path) {
            if review.new_content == content {
                return ReconcileOutcome::Unchanged;
            }
            review.new_content = content;
            return ReconcileOutcome::ReviewReplaced(review.clone());
        }

        let review = PendingReview {
            path: path.to_string(),
            old_content: base.to_string(),
            new_content: content,
            created_at: Utc::now(),
        };
        self.pending.insert(path.to_string(), review.clone());
        ReconcileOutcome::ReviewOpened(review)
    }

    pub fn observe_removed(&mut self, path: &str) -> ReconcileOutcome {
        self.baseline.delete(path);
        ReconcileOutcome::Removed {
            review_discarded: self.pending.remove(path).is_some(),
        }
    }

    /// The client wrote `content` itself; it becomes the baseline and any
    /// review for the path is moot. Returns whether a review was discarded.
    pub fn record_write(&mut self, path: &str, content: impl Into<String>) -> bool {
        self.baseline.set(path, content);
        self.pending.remove(path).is_some()
    }

    pub fn accept(&mut self, path: &str) -> Option<PendingReview> {
        let review = self.pending.remove(path)?;
        self.baseline.set(path, review.new_content.clone());
        Some(review)
    }

    pub fn reject(&mut self, path: &str) -> Option<Rejection> {
        let review = self.pending.remove(path)?;
        Some(self.rejection_for(review))
    }

    /// Accepts every review pending at call time.
    pub fn accept_all(&mut self) -> Vec<PendingReview> {
        let reviews = std::mem::take(&mut self.pending);
        reviews
            .into_values()
            .map(|review| {
                self.baseline
                    .set(review.path.clone(), review.new_content.clone());
                review
            })
            .collect()
    }

    /// Rejects every review pending at call time.
    pub fn reject_all(&mut self) -> Vec<Rejection> {
        let reviews = std::mem::take(&mut self.pending);
        reviews
            .into_values()
            .map(|review| self.rejection_for(review))
            .collect()
    }

    fn rejection_for(&mut self, review: PendingReview) -> Rejection {
        self.baseline
            .set(review.path.clone(), review.old_content.clone());
        Rejection {
            absolute: self.root.join(&review.path),
            path: review.path,
            content: review.old_content,
        }
    }
}
