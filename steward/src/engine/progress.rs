use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Maximum progress value.
pub const COMPLETE: u8 = 100;

/// A node of the progress tree.
///
/// Leaves hold the percent reported by a step. Weighted nodes derive their percent as
/// `Σ(child_i * weight_i) / Σ(weight_i)`. Leaves only move forward, so every derived percent is
/// monotonic as well.
#[derive(Debug, Clone)]
pub struct ProgressNode {
    inner: Arc<NodeKind>,
}

#[derive(Debug)]
enum NodeKind {
    Leaf(AtomicU8),
    Weighted(Vec<(u32, ProgressNode)>),
}

impl ProgressNode {
    /// Creates a leaf at 0%.
    pub fn leaf() -> Self {
        Self {
            inner: Arc::new(NodeKind::Leaf(AtomicU8::new(0))),
        }
    }

    /// Creates a node aggregating `children` by weight.
    pub fn weighted(children: impl IntoIterator<Item = (u32, ProgressNode)>) -> Self {
        Self {
            inner: Arc::new(NodeKind::Weighted(children.into_iter().collect())),
        }
    }

    /// Returns the current percent, between 0 and 100.
    pub fn percent(&self) -> u8 {
        match self.inner.as_ref() {
            NodeKind::Leaf(value) => value.load(Ordering::Acquire),
            NodeKind::Weighted(children) => {
                let total_weight: u64 = children.iter().map(|(weight, _)| *weight as u64).sum();
                if total_weight == 0 {
                    return 0;
                }

                let weighted_sum: u64 = children
                    .iter()
                    .map(|(weight, child)| *weight as u64 * child.percent() as u64)
                    .sum();

                (weighted_sum / total_weight) as u8
            }
        }
    }

    /// Moves a leaf forward to `percent`, clamped to 100.
    ///
    /// Lower values than the current one are ignored. Has no effect on weighted nodes, whose
    /// percent is derived from their children.
    pub fn advance(&self, percent: u8) {
        if let NodeKind::Leaf(value) = self.inner.as_ref() {
            value.fetch_max(percent.min(COMPLETE), Ordering::AcqRel);
        }
    }

    /// Marks this node and every leaf below it as complete.
    pub fn complete(&self) {
        match self.inner.as_ref() {
            NodeKind::Leaf(value) => {
                value.store(COMPLETE, Ordering::Release);
            }
            NodeKind::Weighted(children) => {
                for (_, child) in children {
                    child.complete();
                }
            }
        }
    }
}
