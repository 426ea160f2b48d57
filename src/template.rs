//! Block template cache and refresh loop.
//!
//! A single writer (the refresher) publishes immutable templates through a
//! watch channel; readers get the current snapshot without blocking and the
//! broadcaster wakes exactly once per publication. The cache also keeps a
//! bounded window of recent template headers (late shares are judged
//! against it) and the sharded duplicate-share journal.

use crate::health::HealthState;
use crate::metrics;
use crate::upstream::UpstreamSet;
use ethereum_types::U256;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// Templates kept in the recent-header window.
const RECENT_HEADERS: usize = 8;

const JOURNAL_SHARDS: usize = 64;
const JOURNAL_SHARD_CAP: usize = 4096;

#[derive(Debug, Clone)]
pub struct BlockTemplate {
    /// 32-byte header hash, 0x-prefixed hex. Empty means not ready.
    pub header: String,
    pub seed: String,
    /// Network target boundary, 0x-prefixed 64-hex.
    pub target: String,
    pub height: u64,
    pub difficulty: U256,
    /// Cached `eth_getBlockByNumber("pending")` reply, passed through as-is.
    pub pending_block: Option<Value>,
}

impl BlockTemplate {
    pub fn is_ready(&self) -> bool {
        !self.header.is_empty()
    }

    pub fn network_target(&self) -> U256 {
        crate::pow::parse_target_hex(&self.target).unwrap_or_else(U256::zero)
    }
}

struct RecentHeaders {
    heights: HashMap<String, u64>,
    order: VecDeque<String>,
}

struct JournalShard {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

pub struct TemplateCache {
    tx: watch::Sender<Option<Arc<BlockTemplate>>>,
    recent: RwLock<RecentHeaders>,
    journal: Vec<Mutex<JournalShard>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        let journal = (0..JOURNAL_SHARDS)
            .map(|_| {
                Mutex::new(JournalShard { seen: HashSet::new(), order: VecDeque::new() })
            })
            .collect();
        Self {
            tx,
            recent: RwLock::new(RecentHeaders {
                heights: HashMap::new(),
                order: VecDeque::new(),
            }),
            journal,
        }
    }

    /// Latest published template; never blocks on the publish path.
    pub fn current(&self) -> Option<Arc<BlockTemplate>> {
        self.tx.borrow().clone()
    }

    /// Single-writer publish: records the header in the recent window and
    /// swaps the current snapshot, waking subscribers once.
    pub fn publish(&self, template: BlockTemplate) {
        if template.is_ready() {
            let mut recent = self.recent.write().unwrap();
            if !recent.heights.contains_key(&template.header) {
                recent.heights.insert(template.header.clone(), template.height);
                recent.order.push_back(template.header.clone());
                while recent.order.len() > RECENT_HEADERS {
                    if let Some(old) = recent.order.pop_front() {
                        recent.heights.remove(&old);
                    }
                }
            }
        }
        metrics::inc_template_updates();
        metrics::set_template_height(template.height);
        self.tx.send_replace(Some(Arc::new(template)));
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<BlockTemplate>>> {
        self.tx.subscribe()
    }

    /// Height of a recently served header, if it is still in the window.
    pub fn height_of(&self, header: &str) -> Option<u64> {
        self.recent.read().unwrap().heights.get(header).copied()
    }

    fn shard_for(&self, fingerprint: &str) -> &Mutex<JournalShard> {
        let mut hasher = DefaultHasher::new();
        fingerprint.hash(&mut hasher);
        &self.journal[hasher.finish() as usize % JOURNAL_SHARDS]
    }

    /// Duplicate detection: returns true when the fingerprint was already
    /// recorded, otherwise records it. Linearizable per fingerprint via the
    /// owning shard lock; eviction is FIFO per shard.
    pub fn seen_or_record(&self, height: u64, header: &str, nonce: &str) -> bool {
        let fingerprint = format!("{}:{}:{}", height, header, nonce);
        let mut shard = self.shard_for(&fingerprint).lock().unwrap();
        if shard.seen.contains(&fingerprint) {
            return true;
        }
        shard.seen.insert(fingerprint.clone());
        shard.order.push_back(fingerprint);
        while shard.order.len() > JOURNAL_SHARD_CAP {
            if let Some(old) = shard.order.pop_front() {
                shard.seen.remove(&old);
            }
        }
        false
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulls work from the primary upstream and publishes fresh templates.
pub struct TemplateRefresher {
    upstreams: Arc<UpstreamSet>,
    cache: Arc<TemplateCache>,
    health: Arc<HealthState>,
    interval: Duration,
}

impl TemplateRefresher {
    pub fn new(
        upstreams: Arc<UpstreamSet>,
        cache: Arc<TemplateCache>,
        health: Arc<HealthState>,
        interval: Duration,
    ) -> Self {
        Self { upstreams, cache, health, interval }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.refresh().await;
        }
    }

    pub async fn refresh(&self) {
        let node = self.upstreams.primary();
        let work = match node.get_work().await {
            Ok(work) => work,
            Err(e) => {
                tracing::error!("error while refreshing block template: {}", e);
                metrics::inc_rpc_errors();
                self.health.mark_sick();
                return;
            }
        };

        if let Some(current) = self.cache.current() {
            if current.header == work.header {
                return;
            }
        }

        // Best effort: a missing pending block leaves the cached reply empty.
        let pending = match node.get_pending_block().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!("failed to fetch pending block: {}", e);
                None
            }
        };

        let height = work
            .height
            .or_else(|| pending.as_ref().and_then(|p| p.number))
            .unwrap_or_default();
        let difficulty = pending
            .as_ref()
            .and_then(|p| p.difficulty)
            .unwrap_or_else(U256::zero);

        tracing::info!(height, upstream = node.name(), "📋 new block template");
        self.cache.publish(BlockTemplate {
            header: work.header,
            seed: work.seed,
            target: work.target,
            height,
            difficulty,
            pending_block: pending.map(|p| p.raw),
        });
    }
}
