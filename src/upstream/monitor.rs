//! Upstream health controller.
//!
//! Probes every upstream on a fixed interval and selects the first healthy
//! one in declared order as the primary. When no upstream is healthy the
//! previous primary is retained so miners keep the last known-good node.

use super::UpstreamApi;
use crate::metrics;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct UpstreamSet {
    nodes: Vec<Arc<dyn UpstreamApi>>,
    healthy: Vec<AtomicBool>,
    primary: AtomicUsize,
}

impl UpstreamSet {
    pub fn new(nodes: Vec<Arc<dyn UpstreamApi>>) -> Arc<Self> {
        assert!(!nodes.is_empty(), "upstream set cannot be empty");
        let healthy = nodes.iter().map(|_| AtomicBool::new(true)).collect();
        Arc::new(Self { nodes, healthy, primary: AtomicUsize::new(0) })
    }

    pub fn primary(&self) -> Arc<dyn UpstreamApi> {
        self.nodes[self.primary_index()].clone()
    }

    pub fn primary_index(&self) -> usize {
        self.primary.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self, index: usize) -> bool {
        self.healthy[index].load(Ordering::Relaxed)
    }

    /// One full probe cycle. Every upstream is checked; the first healthy
    /// one by declared order becomes primary. Ties are impossible by
    /// construction and a fully-dark cycle leaves the primary unchanged.
    pub async fn check_upstreams(&self) {
        let mut candidate = None;
        for (i, node) in self.nodes.iter().enumerate() {
            let ok = node.check().await;
            self.healthy[i].store(ok, Ordering::Relaxed);
            if ok && candidate.is_none() {
                candidate = Some(i);
            }
        }

        let Some(chosen) = candidate else {
            tracing::warn!("no healthy upstream, keeping {}", self.primary().name());
            return;
        };
        let previous = self.primary.swap(chosen, Ordering::AcqRel);
        if previous != chosen {
            tracing::info!(
                from = self.nodes[previous].name(),
                to = self.nodes[chosen].name(),
                "switching primary upstream"
            );
        }
        metrics::set_upstream_index(chosen);
    }

    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check_upstreams().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{GetWork, PendingBlock};
    use anyhow::Result;
    use async_trait::async_trait;

    struct StubNode {
        name: String,
        up: AtomicBool,
    }

    impl StubNode {
        fn new(name: &str, up: bool) -> Arc<Self> {
            Arc::new(Self { name: name.to_string(), up: AtomicBool::new(up) })
        }

        fn set_up(&self, up: bool) {
            self.up.store(up, Ordering::Relaxed);
        }
    }

    #[async_trait]
    impl UpstreamApi for StubNode {
        fn name(&self) -> &str {
            &self.name
        }

        async fn get_work(&self) -> Result<GetWork> {
            anyhow::bail!("not used")
        }

        async fn submit_work(&self, _params: &[String]) -> Result<bool> {
            anyhow::bail!("not used")
        }

        async fn get_pending_block(&self) -> Result<Option<PendingBlock>> {
            Ok(None)
        }

        async fn check(&self) -> bool {
            self.up.load(Ordering::Relaxed)
        }
    }

    fn set_of(nodes: &[Arc<StubNode>]) -> Arc<UpstreamSet> {
        UpstreamSet::new(nodes.iter().map(|n| n.clone() as Arc<dyn UpstreamApi>).collect())
    }

    #[tokio::test]
    async fn first_healthy_upstream_wins_by_declared_order() {
        // The selection is first-healthy, not last-healthy: with several
        // healthy candidates the earliest one in the list must be chosen.
        let nodes = [
            StubNode::new("a", false),
            StubNode::new("b", true),
            StubNode::new("c", true),
        ];
        let set = set_of(&nodes);
        set.check_upstreams().await;
        assert_eq!(set.primary_index(), 1);
        assert_eq!(set.primary().name(), "b");

        nodes[0].set_up(true);
        set.check_upstreams().await;
        assert_eq!(set.primary_index(), 0, "recovered head of list takes over");
    }

    #[tokio::test]
    async fn all_dark_keeps_previous_primary() {
        let nodes = [StubNode::new("a", false), StubNode::new("b", true)];
        let set = set_of(&nodes);
        set.check_upstreams().await;
        assert_eq!(set.primary_index(), 1);

        nodes[1].set_up(false);
        set.check_upstreams().await;
        assert_eq!(set.primary_index(), 1, "last known-good is retained");
        assert!(!set.is_healthy(0));
        assert!(!set.is_healthy(1));
    }

    #[tokio::test]
    async fn health_flags_track_probe_results() {
        let nodes = [StubNode::new("a", true), StubNode::new("b", false)];
        let set = set_of(&nodes);
        set.check_upstreams().await;
        assert!(set.is_healthy(0));
        assert!(!set.is_healthy(1));
        assert_eq!(set.primary_index(), 0);
    }
}
