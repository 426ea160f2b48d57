//! Admission and abuse policy.
//!
//! Tracks per-IP state (connect budget, malformed counter, share outcomes,
//! ban expiry) plus the global login blacklist. Entries are created lazily
//! and garbage-collected on the reset timer. Ban writes to the backend are
//! fire-and-forget.

use crate::config::PolicyConfig;
use crate::metrics;
use crate::shares::Backend;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

struct IpStats {
    valid_shares: u64,
    invalid_shares: u64,
    malformed: u32,
    conn_budget: i32,
    banned_until: Option<Instant>,
    over_limit_streak: u8,
    last_login: Option<String>,
    last_seen: Instant,
}

impl IpStats {
    fn new(conn_budget: i32) -> Self {
        Self {
            valid_shares: 0,
            invalid_shares: 0,
            malformed: 0,
            conn_budget,
            banned_until: None,
            over_limit_streak: 0,
            last_login: None,
            last_seen: Instant::now(),
        }
    }

    fn banned(&self) -> bool {
        self.banned_until.map(|t| Instant::now() < t).unwrap_or(false)
    }
}

pub struct PolicyEngine {
    config: PolicyConfig,
    stats: RwLock<HashMap<String, Arc<Mutex<IpStats>>>>,
    blacklist: RwLock<HashSet<String>>,
    backend: Option<Arc<dyn Backend>>,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig, backend: Option<Arc<dyn Backend>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            stats: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashSet::new()),
            backend,
        })
    }

    fn entry(&self, ip: &str) -> Arc<Mutex<IpStats>> {
        if let Some(e) = self.stats.read().unwrap().get(ip) {
            return e.clone();
        }
        let mut stats = self.stats.write().unwrap();
        stats
            .entry(ip.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(IpStats::new(self.config.limits.limit))))
            .clone()
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        match self.stats.read().unwrap().get(ip) {
            Some(e) => e.lock().unwrap().banned(),
            None => false,
        }
    }

    /// Leaky bucket for connect attempts; empty bucket rejects.
    pub fn apply_limit_policy(&self, ip: &str) -> bool {
        if !self.config.limits.enabled {
            return true;
        }
        let entry = self.entry(ip);
        let mut s = entry.lock().unwrap();
        s.last_seen = Instant::now();
        s.conn_budget -= 1;
        if s.conn_budget < 0 {
            tracing::debug!(ip, "connect rate limit exceeded");
            return false;
        }
        true
    }

    pub fn apply_login_policy(&self, login: &str, ip: &str) -> bool {
        if self.blacklist.read().unwrap().contains(login) {
            tracing::warn!(login, ip, "blacklisted login rejected");
            return false;
        }
        let entry = self.entry(ip);
        let mut s = entry.lock().unwrap();
        if s.banned() {
            return false;
        }
        s.last_seen = Instant::now();
        s.last_login = Some(login.to_string());
        true
    }

    pub fn apply_malformed_policy(&self, ip: &str) {
        metrics::inc_malformed();
        let entry = self.entry(ip);
        let mut s = entry.lock().unwrap();
        s.last_seen = Instant::now();
        s.malformed += 1;
        if self.config.banning.enabled && s.malformed >= self.config.banning.malformed_limit {
            self.ban_locked(ip, &mut s);
        }
    }

    /// Records a share outcome. Returns false when the window's invalid
    /// ratio or absolute invalid count is over the threshold; two
    /// consecutive refusals ban the IP.
    pub fn apply_share_policy(&self, ip: &str, valid: bool) -> bool {
        let entry = self.entry(ip);
        let mut s = entry.lock().unwrap();
        s.last_seen = Instant::now();
        if valid {
            s.valid_shares += 1;
        } else {
            s.invalid_shares += 1;
        }

        let total = s.valid_shares + s.invalid_shares;
        if total < self.config.banning.check_threshold {
            return true;
        }
        let ratio = s.invalid_shares as f64 * 100.0 / total as f64;
        let over = s.invalid_shares >= self.config.banning.check_threshold
            || ratio > self.config.banning.invalid_percent;
        if over {
            s.over_limit_streak += 1;
            if s.over_limit_streak >= 2 && self.config.banning.enabled {
                self.ban_locked(ip, &mut s);
            }
            false
        } else {
            s.over_limit_streak = 0;
            true
        }
    }

    pub fn ban_client(&self, ip: &str) {
        let entry = self.entry(ip);
        let mut s = entry.lock().unwrap();
        self.ban_locked(ip, &mut s);
    }

    fn ban_locked(&self, ip: &str, s: &mut IpStats) {
        if s.banned() {
            return;
        }
        tracing::warn!(
            ip,
            login = ?s.last_login,
            duration_secs = self.config.banning.duration_secs,
            "banning client"
        );
        s.banned_until = Some(Instant::now() + Duration::from_secs(self.config.banning.duration_secs));
        if let Some(backend) = &self.backend {
            let backend = backend.clone();
            let ip = ip.to_string();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = backend.write_banned_ip(&ip).await {
                        tracing::error!(ip, "failed to mirror ban to backend: {}", e);
                    }
                });
            }
        }
    }

    pub fn banned_count(&self) -> usize {
        self.stats
            .read()
            .unwrap()
            .values()
            .filter(|e| e.lock().unwrap().banned())
            .count()
    }

    /// Background maintenance: budget refills, blacklist refresh on the
    /// refresh interval; counter resets and entry GC on the reset interval.
    pub fn start(self: Arc<Self>) {
        let engine = self;
        tokio::spawn(async move {
            let mut refresh = tokio::time::interval(Duration::from_secs(
                engine.config.refresh_interval_secs.max(1),
            ));
            let mut reset = tokio::time::interval(Duration::from_secs(
                engine.config.reset_interval_secs.max(1),
            ));
            loop {
                tokio::select! {
                    _ = refresh.tick() => {
                        engine.refill_budgets();
                        engine.refresh_blacklist().await;
                        metrics::set_banned_ips(engine.banned_count());
                    }
                    _ = reset.tick() => {
                        engine.reset_window();
                    }
                }
            }
        });
    }

    fn refill_budgets(&self) {
        let stats = self.stats.read().unwrap();
        for entry in stats.values() {
            let mut s = entry.lock().unwrap();
            s.conn_budget = (s.conn_budget + self.config.limits.limit_jump)
                .min(self.config.limits.limit);
        }
    }

    fn reset_window(&self) {
        let mut stats = self.stats.write().unwrap();
        let idle_cutoff = Duration::from_secs(self.config.reset_interval_secs.max(1));
        stats.retain(|_, entry| {
            let mut s = entry.lock().unwrap();
            s.valid_shares = 0;
            s.invalid_shares = 0;
            s.malformed = 0;
            s.over_limit_streak = 0;
            s.banned() || s.last_seen.elapsed() < idle_cutoff
        });
    }

    async fn refresh_blacklist(&self) {
        let Some(backend) = &self.backend else { return };
        match backend.blacklisted_logins().await {
            Ok(logins) => {
                let mut blacklist = self.blacklist.write().unwrap();
                blacklist.clear();
                blacklist.extend(logins);
            }
            Err(e) => tracing::error!("failed to fetch login blacklist: {}", e),
        }
    }

    #[cfg(test)]
    pub fn blacklist_login(&self, login: &str) {
        self.blacklist.write().unwrap().insert(login.to_string());
    }
}
