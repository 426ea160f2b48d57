use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use std::sync::OnceLock;

static SHARES_ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static SHARES_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static SHARES_DUPLICATE: OnceLock<IntCounter> = OnceLock::new();
static MALFORMED_REQUESTS: OnceLock<IntCounter> = OnceLock::new();

static BLOCK_CANDIDATES: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_ACCEPTED: OnceLock<IntCounter> = OnceLock::new();

static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();

static STRATUM_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();
static UPSTREAM_INDEX: OnceLock<IntGauge> = OnceLock::new();
static BANNED_IPS: OnceLock<IntGauge> = OnceLock::new();
static REDIS_UP: OnceLock<IntGauge> = OnceLock::new();

fn shares_accepted() -> &'static IntCounter {
    SHARES_ACCEPTED
        .get_or_init(|| IntCounter::new("shares_accepted_total", "Total accepted shares").unwrap())
}

fn shares_rejected() -> &'static IntCounter {
    SHARES_REJECTED
        .get_or_init(|| IntCounter::new("shares_rejected_total", "Total rejected shares").unwrap())
}

fn shares_duplicate() -> &'static IntCounter {
    SHARES_DUPLICATE.get_or_init(|| {
        IntCounter::new("shares_duplicate_total", "Total duplicate share submissions").unwrap()
    })
}

fn malformed_requests() -> &'static IntCounter {
    MALFORMED_REQUESTS.get_or_init(|| {
        IntCounter::new("malformed_requests_total", "Total malformed miner requests").unwrap()
    })
}

fn block_candidates() -> &'static IntCounter {
    BLOCK_CANDIDATES.get_or_init(|| {
        IntCounter::new("block_candidates_total", "Shares that met the network target").unwrap()
    })
}

fn blocks_accepted() -> &'static IntCounter {
    BLOCKS_ACCEPTED.get_or_init(|| {
        IntCounter::new("blocks_accepted_total", "Block solutions accepted upstream").unwrap()
    })
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS
        .get_or_init(|| IntCounter::new("upstream_rpc_errors_total", "Total upstream RPC errors").unwrap())
}

fn template_updates() -> &'static IntCounter {
    TEMPLATE_UPDATES.get_or_init(|| {
        IntCounter::new("block_template_updates_total", "Total published block templates").unwrap()
    })
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| {
        IntCounter::new("job_broadcasts_total", "Total stratum job broadcasts").unwrap()
    })
}

fn stratum_sessions() -> &'static IntGauge {
    STRATUM_SESSIONS.get_or_init(|| {
        IntGauge::new("stratum_sessions", "Currently registered stratum sessions").unwrap()
    })
}

fn template_height() -> &'static IntGauge {
    TEMPLATE_HEIGHT
        .get_or_init(|| IntGauge::new("block_template_height", "Current template height").unwrap())
}

fn upstream_index() -> &'static IntGauge {
    UPSTREAM_INDEX
        .get_or_init(|| IntGauge::new("upstream_primary_index", "Index of the primary upstream").unwrap())
}

fn banned_ips() -> &'static IntGauge {
    BANNED_IPS.get_or_init(|| IntGauge::new("banned_ips", "IPs currently banned").unwrap())
}

fn redis_up() -> &'static IntGauge {
    REDIS_UP.get_or_init(|| IntGauge::new("redis_up", "Redis reachable (1/0)").unwrap())
}

pub fn inc_shares_accepted() { shares_accepted().inc() }
pub fn inc_shares_rejected() { shares_rejected().inc() }
pub fn inc_shares_duplicate() { shares_duplicate().inc() }
pub fn inc_malformed() { malformed_requests().inc() }
pub fn inc_block_candidates() { block_candidates().inc() }
pub fn inc_blocks_accepted() { blocks_accepted().inc() }
pub fn inc_rpc_errors() { rpc_errors().inc() }
pub fn inc_template_updates() { template_updates().inc() }
pub fn inc_job_broadcasts() { job_broadcasts().inc() }
pub fn inc_sessions() { stratum_sessions().inc() }
pub fn dec_sessions() { stratum_sessions().dec() }
pub fn set_template_height(h: u64) { template_height().set(h as i64) }
pub fn set_upstream_index(i: usize) { upstream_index().set(i as i64) }
pub fn set_banned_ips(n: usize) { banned_ips().set(n as i64) }
pub fn set_redis_up(up: bool) { redis_up().set(up as i64) }

/// Text exposition for the `/metrics` endpoint.
pub fn render() -> String {
    let mut families = Vec::new();
    families.extend(shares_accepted().collect());
    families.extend(shares_rejected().collect());
    families.extend(shares_duplicate().collect());
    families.extend(malformed_requests().collect());
    families.extend(block_candidates().collect());
    families.extend(blocks_accepted().collect());
    families.extend(rpc_errors().collect());
    families.extend(template_updates().collect());
    families.extend(job_broadcasts().collect());
    families.extend(stratum_sessions().collect());
    families.extend(template_height().collect());
    families.extend(upstream_index().collect());
    families.extend(banned_ips().collect());
    families.extend(redis_up().collect());

    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
