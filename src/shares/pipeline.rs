//! Share submission pipeline.
//!
//! Validation short-circuits in a fixed order: subscription, param shape,
//! hex shapes, duplicate fingerprint, recent-header window, PoW. A share
//! that also meets the network target is forwarded upstream as a block
//! solution. Backend write failures are logged and never fail the miner's
//! reply.

use crate::metrics;
use crate::policy::PolicyEngine;
use crate::pow::{self, PowVerifier};
use crate::shares::Backend;
use crate::stratum::protocol::{ErrorReply, SubmitError};
use crate::template::TemplateCache;
use crate::upstream::UpstreamSet;
use crate::util;
use ethereum_types::U256;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOrigin {
    Stratum,
    /// HTTP callers have no stratum session; the subscription check is
    /// bypassed for them.
    Http,
}

pub struct Submission {
    pub origin: SubmitOrigin,
    pub subscribed: bool,
    pub login: String,
    pub worker: String,
    pub ip: String,
}

pub struct SharePipeline {
    cache: Arc<TemplateCache>,
    upstreams: Arc<UpstreamSet>,
    policy: Arc<PolicyEngine>,
    backend: Arc<dyn Backend>,
    verifier: Arc<dyn PowVerifier>,
    share_target: U256,
    pool_difficulty: u64,
}

impl SharePipeline {
    pub fn new(
        cache: Arc<TemplateCache>,
        upstreams: Arc<UpstreamSet>,
        policy: Arc<PolicyEngine>,
        backend: Arc<dyn Backend>,
        verifier: Arc<dyn PowVerifier>,
        pool_difficulty: u64,
    ) -> Self {
        Self {
            cache,
            upstreams,
            policy,
            backend,
            verifier,
            share_target: pow::target_from_difficulty(pool_difficulty),
            pool_difficulty,
        }
    }

    /// Handles `eth_submitWork` params `[nonce, powHash, mixDigest]`.
    /// Returns `(accepted, error)`; `accepted` with a non-nil error signals
    /// an accepted share from a misbehaving source.
    pub async fn submit_work(
        &self,
        submission: &Submission,
        params: &[String],
    ) -> (bool, Option<ErrorReply>) {
        if submission.origin == SubmitOrigin::Stratum && !submission.subscribed {
            return (false, Some(SubmitError::NotSubscribed.reply()));
        }

        if params.len() != 3 {
            self.policy.apply_malformed_policy(&submission.ip);
            return (false, Some(SubmitError::InvalidParams.reply()));
        }

        let (nonce_hex, header_hex, mix_hex) = (&params[0], &params[1], &params[2]);
        if !util::is_valid_nonce(nonce_hex)
            || !util::is_valid_hash(header_hex)
            || !util::is_valid_hash(mix_hex)
        {
            self.policy.apply_malformed_policy(&submission.ip);
            return (false, Some(SubmitError::MalformedPow.reply()));
        }

        let worker = util::sanitize_worker(&submission.worker);

        let Some(template) = self.cache.current().filter(|t| t.is_ready()) else {
            return (false, Some(ErrorReply::work_not_ready()));
        };

        // A header outside the recent window is a stale or fabricated
        // share; it never reaches PoW verification.
        let Some(height) = self.cache.height_of(header_hex) else {
            tracing::debug!(ip = %submission.ip, header = %header_hex, "stale share");
            return self.reject_invalid(&submission.ip);
        };

        if self.cache.seen_or_record(height, header_hex, nonce_hex) {
            metrics::inc_shares_duplicate();
            self.policy.apply_share_policy(&submission.ip, false);
            return (false, Some(SubmitError::DuplicateShare.reply()));
        }

        let (Some(nonce), Some(header), Some(mix), Some(seed)) = (
            pow::parse_nonce(nonce_hex),
            pow::parse_h256(header_hex),
            pow::parse_h256(mix_hex),
            pow::parse_h256(&template.seed),
        ) else {
            self.policy.apply_malformed_policy(&submission.ip);
            return (false, Some(SubmitError::MalformedPow.reply()));
        };

        let network_target = template.network_target();
        let verdict = self.verifier.verify(
            &header,
            &seed,
            nonce,
            &mix,
            &self.share_target,
            &network_target,
        );

        if !verdict.valid {
            return self.reject_invalid(&submission.ip);
        }

        let within_limit = self.policy.apply_share_policy(&submission.ip, true);
        metrics::inc_shares_accepted();
        let now = chrono::Utc::now().timestamp();

        if verdict.block_solution {
            metrics::inc_block_candidates();
            self.forward_block(&submission.login, header_hex, params).await;
            if let Err(e) = self
                .backend
                .write_block_candidate(
                    &submission.login,
                    &worker,
                    &submission.ip,
                    height,
                    nonce_hex,
                    header_hex,
                    self.pool_difficulty,
                    now,
                )
                .await
            {
                tracing::error!("failed to persist block candidate: {}", e);
            }
        } else if let Err(e) = self
            .backend
            .write_share(
                &submission.login,
                &worker,
                &submission.ip,
                self.pool_difficulty,
                height,
                now,
            )
            .await
        {
            tracing::error!("failed to persist share: {}", e);
        }

        if !within_limit {
            return (true, Some(SubmitError::HighInvalidRate.reply()));
        }
        (true, None)
    }

    fn reject_invalid(&self, ip: &str) -> (bool, Option<ErrorReply>) {
        metrics::inc_shares_rejected();
        if self.policy.apply_share_policy(ip, false) {
            (false, None)
        } else {
            (false, Some(SubmitError::InvalidShare.reply()))
        }
    }

    /// Best-effort forward of a block solution to the primary upstream.
    async fn forward_block(&self, login: &str, header: &str, params: &[String]) {
        let node = self.upstreams.primary();
        match node.submit_work(params).await {
            Ok(true) => {
                metrics::inc_blocks_accepted();
                tracing::info!(login, header, upstream = node.name(), "🎉 block solution accepted");
            }
            Ok(false) => {
                tracing::warn!(login, header, upstream = node.name(), "block solution rejected upstream");
            }
            Err(e) => {
                metrics::inc_rpc_errors();
                tracing::error!(login, header, "failed to submit block upstream: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::pow::Verdict;
    use crate::template::BlockTemplate;
    use crate::upstream::{GetWork, PendingBlock, UpstreamApi};
    use anyhow::Result;
    use async_trait::async_trait;
    use ethereum_types::H256;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub struct StubVerifier {
        pub valid: AtomicBool,
        pub block: AtomicBool,
        pub calls: AtomicUsize,
    }

    impl StubVerifier {
        pub fn accepting() -> Arc<Self> {
            Arc::new(Self {
                valid: AtomicBool::new(true),
                block: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl PowVerifier for StubVerifier {
        fn verify(
            &self,
            _header: &H256,
            _seed: &H256,
            _nonce: u64,
            _mix: &H256,
            _share_target: &U256,
            _network_target: &U256,
        ) -> Verdict {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let valid = self.valid.load(Ordering::Relaxed);
            Verdict { valid, block_solution: valid && self.block.load(Ordering::Relaxed) }
        }
    }

    #[derive(Default)]
    pub struct RecordingBackend {
        pub shares: Mutex<Vec<(String, String, u64)>>,
        pub blocks: Mutex<Vec<(String, u64, String)>>,
        pub states: Mutex<Vec<(String, u64)>>,
        pub bans: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn write_share(
            &self,
            login: &str,
            worker: &str,
            _ip: &str,
            _difficulty: u64,
            height: u64,
            _timestamp: i64,
        ) -> Result<()> {
            self.shares.lock().unwrap().push((login.to_string(), worker.to_string(), height));
            Ok(())
        }

        async fn write_block_candidate(
            &self,
            login: &str,
            _worker: &str,
            _ip: &str,
            height: u64,
            nonce: &str,
            _header: &str,
            _difficulty: u64,
            _timestamp: i64,
        ) -> Result<()> {
            self.blocks.lock().unwrap().push((login.to_string(), height, nonce.to_string()));
            Ok(())
        }

        async fn write_node_state(&self, name: &str, height: u64, _difficulty: &str) -> Result<()> {
            self.states.lock().unwrap().push((name.to_string(), height));
            Ok(())
        }

        async fn write_banned_ip(&self, ip: &str) -> Result<()> {
            self.bans.lock().unwrap().push(ip.to_string());
            Ok(())
        }

        async fn blacklisted_logins(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    pub struct StubUpstream {
        pub accepts: AtomicBool,
        pub submissions: Mutex<Vec<Vec<String>>>,
    }

    impl StubUpstream {
        pub fn new() -> Arc<Self> {
            Arc::new(Self { accepts: AtomicBool::new(true), submissions: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl UpstreamApi for StubUpstream {
        fn name(&self) -> &str {
            "stub"
        }

        async fn get_work(&self) -> Result<GetWork> {
            Ok(GetWork {
                header: format!("0x{}", "11".repeat(32)),
                seed: format!("0x{}", "00".repeat(32)),
                target: crate::pow::target_hex(1 << 32),
                height: Some(100),
            })
        }

        async fn submit_work(&self, params: &[String]) -> Result<bool> {
            self.submissions.lock().unwrap().push(params.to_vec());
            Ok(self.accepts.load(Ordering::Relaxed))
        }

        async fn get_pending_block(&self) -> Result<Option<PendingBlock>> {
            Ok(None)
        }

        async fn check(&self) -> bool {
            true
        }
    }

    pub const LOGIN: &str = "0xabc0000000000000000000000000000000000001";

    pub fn valid_params() -> Vec<String> {
        vec![
            "0x0000000000abcdef".to_string(),
            format!("0x{}", "aa".repeat(32)),
            format!("0x{}", "bb".repeat(32)),
        ]
    }

    pub fn ready_template(header: &str, height: u64) -> BlockTemplate {
        BlockTemplate {
            header: header.to_string(),
            seed: format!("0x{}", "00".repeat(32)),
            target: crate::pow::target_hex(1 << 40),
            height,
            difficulty: U256::from(1u64 << 40),
            pending_block: None,
        }
    }

    struct Harness {
        pipeline: SharePipeline,
        cache: Arc<TemplateCache>,
        verifier: Arc<StubVerifier>,
        backend: Arc<RecordingBackend>,
        upstream: Arc<StubUpstream>,
        policy: Arc<PolicyEngine>,
    }

    fn harness(policy_cfg: impl FnOnce(&mut PolicyConfig)) -> Harness {
        let cache = Arc::new(TemplateCache::new());
        let upstream = StubUpstream::new();
        let upstreams = UpstreamSet::new(vec![upstream.clone() as Arc<dyn UpstreamApi>]);
        let mut cfg = PolicyConfig::default();
        policy_cfg(&mut cfg);
        let policy = PolicyEngine::new(cfg, None);
        let backend = Arc::new(RecordingBackend::default());
        let verifier = StubVerifier::accepting();
        let pipeline = SharePipeline::new(
            cache.clone(),
            upstreams,
            policy.clone(),
            backend.clone(),
            verifier.clone(),
            2000,
        );
        Harness { pipeline, cache, verifier, backend, upstream, policy }
    }

    fn submission() -> Submission {
        Submission {
            origin: SubmitOrigin::Stratum,
            subscribed: true,
            login: LOGIN.to_string(),
            worker: "rig1".to_string(),
            ip: "10.1.1.1".to_string(),
        }
    }

    #[tokio::test]
    async fn unsubscribed_stratum_caller_gets_code_25() {
        let h = harness(|_| {});
        let sub = Submission { subscribed: false, ..submission() };
        let (accepted, err) = h.pipeline.submit_work(&sub, &valid_params()).await;
        assert!(!accepted);
        assert_eq!(err.unwrap().code, 25);
    }

    #[tokio::test]
    async fn http_origin_bypasses_subscription_check() {
        let h = harness(|_| {});
        h.cache.publish(ready_template(&valid_params()[1], 7));
        let sub = Submission { origin: SubmitOrigin::Http, subscribed: false, ..submission() };
        let (accepted, err) = h.pipeline.submit_work(&sub, &valid_params()).await;
        assert!(accepted, "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn wrong_param_count_is_invalid_params_plus_one_malformed_tick() {
        let h = harness(|c| c.banning.malformed_limit = 2);
        let (accepted, err) = h.pipeline.submit_work(&submission(), &["0x1".to_string()]).await;
        assert!(!accepted);
        let err = err.unwrap();
        assert_eq!(err.code, -1);
        assert_eq!(err.message, "Invalid params");
        assert!(!h.policy.is_banned("10.1.1.1"), "single tick must not ban yet");
        h.pipeline.submit_work(&submission(), &[]).await;
        assert!(h.policy.is_banned("10.1.1.1"), "second tick crosses the limit");
    }

    #[tokio::test]
    async fn malformed_pow_result_is_rejected_before_lookup() {
        let h = harness(|_| {});
        let params = vec![
            "0xDEADBEEF".to_string(),
            "0x00".to_string(),
            "0x00".to_string(),
        ];
        let (accepted, err) = h.pipeline.submit_work(&submission(), &params).await;
        assert!(!accepted);
        let err = err.unwrap();
        assert_eq!(err.code, -1);
        assert_eq!(err.message, "Malformed PoW result");
        assert_eq!(h.verifier.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn duplicate_share_returns_22_without_second_verification() {
        let h = harness(|_| {});
        let params = valid_params();
        h.cache.publish(ready_template(&params[1], 7));

        let (accepted, err) = h.pipeline.submit_work(&submission(), &params).await;
        assert!(accepted);
        assert!(err.is_none());
        assert_eq!(h.verifier.calls.load(Ordering::Relaxed), 1);

        let (accepted, err) = h.pipeline.submit_work(&submission(), &params).await;
        assert!(!accepted);
        assert_eq!(err.unwrap().code, 22);
        assert_eq!(h.verifier.calls.load(Ordering::Relaxed), 1, "duplicate never reaches PoW");
    }

    #[tokio::test]
    async fn stale_header_is_an_invalid_share_without_verification() {
        let h = harness(|_| {});
        h.cache.publish(ready_template(&format!("0x{}", "cc".repeat(32)), 7));
        let (accepted, err) = h.pipeline.submit_work(&submission(), &valid_params()).await;
        assert!(!accepted);
        assert!(err.is_none(), "below threshold the drop is silent");
        assert_eq!(h.verifier.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn invalid_share_turns_into_23_once_over_threshold() {
        let h = harness(|c| {
            c.banning.check_threshold = 3;
            c.banning.invalid_percent = 10.0;
        });
        let params = valid_params();
        h.cache.publish(ready_template(&params[1], 7));
        h.verifier.valid.store(false, Ordering::Relaxed);

        let with_nonce = |nonce: u64| {
            let mut p = params.clone();
            p[0] = format!("0x{:016x}", nonce);
            p
        };
        let (_, err) = h.pipeline.submit_work(&submission(), &with_nonce(1)).await;
        assert!(err.is_none());
        let (_, err) = h.pipeline.submit_work(&submission(), &with_nonce(2)).await;
        assert!(err.is_none());
        let (accepted, err) = h.pipeline.submit_work(&submission(), &with_nonce(3)).await;
        assert!(!accepted);
        assert_eq!(err.unwrap().code, 23);
    }

    #[tokio::test]
    async fn block_solution_is_forwarded_and_persisted() {
        let h = harness(|_| {});
        let params = valid_params();
        h.cache.publish(ready_template(&params[1], 42));
        h.verifier.block.store(true, Ordering::Relaxed);

        let (accepted, err) = h.pipeline.submit_work(&submission(), &params).await;
        assert!(accepted);
        assert!(err.is_none());

        let submissions = h.upstream.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0], params);
        let blocks = h.backend.blocks.lock().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0], (LOGIN.to_string(), 42, params[0].clone()));
        assert!(h.backend.shares.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn plain_share_is_written_with_sanitised_worker() {
        let h = harness(|_| {});
        let params = valid_params();
        h.cache.publish(ready_template(&params[1], 9));
        let sub = Submission { worker: "bad.worker.name".to_string(), ..submission() };
        let (accepted, _) = h.pipeline.submit_work(&sub, &params).await;
        assert!(accepted);
        let shares = h.backend.shares.lock().unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0], (LOGIN.to_string(), "0".to_string(), 9));
    }

    #[tokio::test]
    async fn accepted_share_from_misbehaving_source_is_flagged() {
        let h = harness(|c| {
            c.banning.check_threshold = 2;
            c.banning.invalid_percent = 10.0;
            c.banning.enabled = false;
        });
        let params = valid_params();
        h.cache.publish(ready_template(&params[1], 7));

        // Two invalid shares push the window over the ratio.
        h.verifier.valid.store(false, Ordering::Relaxed);
        for i in 0..2u64 {
            let mut p = params.clone();
            p[0] = format!("0x{:016x}", 100 + i);
            h.pipeline.submit_work(&submission(), &p).await;
        }

        h.verifier.valid.store(true, Ordering::Relaxed);
        let (accepted, err) = h.pipeline.submit_work(&submission(), &params).await;
        assert!(accepted);
        assert_eq!(err.unwrap().message, "High rate of invalid shares");
    }

    #[tokio::test]
    async fn no_template_means_work_not_ready() {
        let h = harness(|_| {});
        let (accepted, err) = h.pipeline.submit_work(&submission(), &valid_params()).await;
        assert!(!accepted);
        assert_eq!(err.unwrap().code, 0);
    }
}
