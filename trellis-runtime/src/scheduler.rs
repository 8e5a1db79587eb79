//! Per-suite concurrency scheduling
//!
//! Children of a suite are split into runs of consecutive siblings with the
//! same effective concurrency. Sequential runs execute one child at a time in
//! declaration order; concurrent runs start together, with tests drawing
//! permits from the suite's own [`SuiteLimiter`]. Limiters are never shared
//! between suites, so a saturated suite does not hold back its siblings.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use trellis_core::{NodeId, TaskTree};

/// Consecutive children scheduled the same way
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Sequential(Vec<NodeId>),
    Concurrent(Vec<NodeId>),
}

impl Segment {
    pub fn nodes(&self) -> &[NodeId] {
        match self {
            Segment::Sequential(nodes) | Segment::Concurrent(nodes) => nodes,
        }
    }

    pub fn is_concurrent(&self) -> bool {
        matches!(self, Segment::Concurrent(_))
    }
}

/// Split the children of `suite` into scheduling segments
pub fn partition_children(tree: &TaskTree, suite: NodeId, default_concurrent: bool) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    let children = match tree.get(suite) {
        Some(node) => node.children.clone(),
        None => return segments,
    };

    for child in children {
        let concurrent = tree.effective_concurrent(child, default_concurrent);
        let extended = match segments.last_mut() {
            Some(Segment::Concurrent(nodes)) if concurrent => {
                nodes.push(child);
                true
            }
            Some(Segment::Sequential(nodes)) if !concurrent => {
                nodes.push(child);
                true
            }
            _ => false,
        };
        if !extended {
            segments.push(if concurrent {
                Segment::Concurrent(vec![child])
            } else {
                Segment::Sequential(vec![child])
            });
        }
    }
    segments
}

/// Counting semaphore scoped to one suite
#[derive(Debug, Clone)]
pub struct SuiteLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// Held while a test of the suite is in flight
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SuiteLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn acquire(&self) -> Result<LimiterPermit, AcquireError> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(LimiterPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of permits held at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::time::Duration;
    use trellis_core::{SuiteOptions, TestOptions};

    #[test]
    fn test_partition_groups_consecutive_children() {
        let mut tree = TaskTree::new_file("mixed.yaml");
        let root = tree.root();
        let a = tree.add_test(root, "a", TestOptions::new().concurrent()).unwrap();
        let b = tree.add_test(root, "b", TestOptions::new().concurrent()).unwrap();
        let c = tree.add_test(root, "c", TestOptions::new()).unwrap();
        let s = tree.add_suite(root, "s", SuiteOptions::new()).unwrap();
        let d = tree.add_test(root, "d", TestOptions::new().concurrent()).unwrap();

        let segments = partition_children(&tree, root, false);
        assert_eq!(
            segments,
            vec![
                Segment::Concurrent(vec![a, b]),
                Segment::Sequential(vec![c, s]),
                Segment::Concurrent(vec![d]),
            ]
        );
    }

    #[test]
    fn test_default_concurrency_applies() {
        let mut tree = TaskTree::new_file("default.yaml");
        let root = tree.root();
        let a = tree.add_test(root, "a", TestOptions::new()).unwrap();
        let b = tree.add_test(root, "b", TestOptions::new().sequential()).unwrap();
        let segments = partition_children(&tree, root, true);
        assert_eq!(
            segments,
            vec![Segment::Concurrent(vec![a]), Segment::Sequential(vec![b])]
        );
    }

    #[tokio::test]
    async fn test_limiter_bounds_in_flight() {
        let limiter = SuiteLimiter::new(2);
        let tasks = (0..6).map(|_| {
            let limiter = limiter.clone();
            async move {
                let _permit = limiter.acquire().await.unwrap();
                assert!(limiter.in_flight() <= 2);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        join_all(tasks).await;

        assert_eq!(limiter.peak(), 2);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        assert_eq!(SuiteLimiter::new(0).limit(), 1);
    }
}
