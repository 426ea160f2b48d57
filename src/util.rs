//! Hot-path validators for the wire formats miners send us.
//!
//! The hex-shape patterns are compiled once and shared read-only across
//! tasks. Address validity is memoised: logins are short, repeated strings
//! bounded by the miner population, so the cache stays small.

use regex::Regex;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

static NONCE_PATTERN: OnceLock<Regex> = OnceLock::new();
static HASH_PATTERN: OnceLock<Regex> = OnceLock::new();
static WORKER_PATTERN: OnceLock<Regex> = OnceLock::new();
static ADDRESS_PATTERN: OnceLock<Regex> = OnceLock::new();

static ADDRESS_CACHE: OnceLock<RwLock<HashMap<String, bool>>> = OnceLock::new();

fn nonce_pattern() -> &'static Regex {
    NONCE_PATTERN.get_or_init(|| Regex::new(r"^0x[0-9a-f]{16}$").unwrap())
}

fn hash_pattern() -> &'static Regex {
    HASH_PATTERN.get_or_init(|| Regex::new(r"^0x[0-9a-f]{64}$").unwrap())
}

fn worker_pattern() -> &'static Regex {
    WORKER_PATTERN.get_or_init(|| Regex::new(r"^[0-9a-zA-Z_-]{1,8}$").unwrap())
}

fn address_pattern() -> &'static Regex {
    ADDRESS_PATTERN.get_or_init(|| Regex::new(r"^0x[0-9a-f]{40}$").unwrap())
}

pub fn is_valid_nonce(s: &str) -> bool {
    nonce_pattern().is_match(s)
}

pub fn is_valid_hash(s: &str) -> bool {
    hash_pattern().is_match(s)
}

/// Worker tags outside `[0-9a-zA-Z_-]{1,8}` collapse to `"0"`.
pub fn sanitize_worker(id: &str) -> String {
    if worker_pattern().is_match(id) {
        id.to_string()
    } else {
        "0".to_string()
    }
}

/// Well-formedness of a (lowercased) 40-hex login, memoised.
pub fn is_valid_login(login: &str) -> bool {
    let cache = ADDRESS_CACHE.get_or_init(|| RwLock::new(HashMap::new()));
    if let Some(valid) = cache.read().unwrap().get(login) {
        return *valid;
    }
    let valid = address_pattern().is_match(login);
    cache.write().unwrap().insert(login.to_string(), valid);
    valid
}
