//! Proof-of-work interface and the ethash light verifier.
//!
//! The share pipeline only sees the `PowVerifier` capability. The shipped
//! implementation recomputes hashimoto from the per-epoch light cache; the
//! full dataset is never materialised, matching how pool-side verification
//! works on Ethash-family chains.

use ethereum_types::{H256, U256};
use sha3::{Digest, Keccak256, Keccak512};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const EPOCH_LENGTH: u64 = 30_000;

const HASH_BYTES: usize = 64;
const MIX_BYTES: usize = 128;
const CACHE_BYTES_INIT: usize = 1 << 24;
const CACHE_BYTES_GROWTH: usize = 1 << 17;
const DATASET_BYTES_INIT: usize = 1 << 30;
const DATASET_BYTES_GROWTH: usize = 1 << 23;
const CACHE_ROUNDS: usize = 3;
const DATASET_PARENTS: u32 = 256;
const ACCESSES: usize = 64;
const FNV_PRIME: u32 = 0x0100_0193;

/// Seeds older than this many epochs are not recognised.
const MAX_EPOCH_SEARCH: usize = 4096;

/// How many epoch caches to keep resident.
const CACHE_RETENTION: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub valid: bool,
    pub block_solution: bool,
}

impl Verdict {
    pub fn invalid() -> Self {
        Self { valid: false, block_solution: false }
    }
}

/// The external PoW collaborator consumed by the share pipeline.
pub trait PowVerifier: Send + Sync {
    fn verify(
        &self,
        header: &H256,
        seed: &H256,
        nonce: u64,
        mix_digest: &H256,
        share_target: &U256,
        network_target: &U256,
    ) -> Verdict;
}

// ── target arithmetic ────────────────────────────────────────────────

/// Boundary for a pool difficulty: floor(2^256 / difficulty).
pub fn target_from_difficulty(difficulty: u64) -> U256 {
    if difficulty <= 1 {
        return U256::MAX;
    }
    let d = U256::from(difficulty);
    let q = U256::MAX / d;
    // 2^256 = U256::MAX + 1, so round the division against MAX up by one
    // exactly when difficulty divides 2^256.
    if U256::MAX % d == d - U256::one() {
        q + U256::one()
    } else {
        q
    }
}

/// 64-hex boundary string served to miners in `eth_getWork` replies.
pub fn target_hex(difficulty: u64) -> String {
    format!("0x{:064x}", target_from_difficulty(difficulty))
}

pub fn parse_target_hex(s: &str) -> Option<U256> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    if raw.is_empty() || raw.len() > 64 {
        return None;
    }
    let mut padded = String::with_capacity(64);
    for _ in raw.len()..64 {
        padded.push('0');
    }
    padded.push_str(raw);
    let bytes = hex::decode(&padded).ok()?;
    Some(U256::from_big_endian(&bytes))
}

pub fn parse_h256(s: &str) -> Option<H256> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(raw).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    Some(H256::from_slice(&bytes))
}

pub fn parse_nonce(s: &str) -> Option<u64> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(raw, 16).ok()
}

// ── ethash primitives ────────────────────────────────────────────────

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn keccak512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Keccak512::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn fnv(a: u32, b: u32) -> u32 {
    a.wrapping_mul(FNV_PRIME) ^ b
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut i = 3u64;
    while i.saturating_mul(i) <= n {
        if n % i == 0 {
            return false;
        }
        i += 2;
    }
    true
}

pub fn cache_size(epoch: u64) -> usize {
    let mut sz = CACHE_BYTES_INIT + CACHE_BYTES_GROWTH * epoch as usize - HASH_BYTES;
    while !is_prime((sz / HASH_BYTES) as u64) {
        sz -= 2 * HASH_BYTES;
    }
    sz
}

pub fn full_size(epoch: u64) -> usize {
    let mut sz = DATASET_BYTES_INIT + DATASET_BYTES_GROWTH * epoch as usize - MIX_BYTES;
    while !is_prime((sz / MIX_BYTES) as u64) {
        sz -= 2 * MIX_BYTES;
    }
    sz
}

pub fn seed_hash(epoch: u64) -> H256 {
    let mut seed = [0u8; 32];
    for _ in 0..epoch {
        seed = keccak256(&seed);
    }
    H256::from_slice(&seed)
}

/// Recover the epoch a DAG seed belongs to by walking the seed chain.
pub fn epoch_for_seed(seed: &H256) -> Option<u64> {
    let mut current = [0u8; 32];
    for epoch in 0..MAX_EPOCH_SEARCH {
        if seed.as_bytes() == current {
            return Some(epoch as u64);
        }
        current = keccak256(&current);
    }
    None
}

fn make_cache(size: usize, seed: &H256) -> Vec<u8> {
    let n = size / HASH_BYTES;
    let mut cache = vec![0u8; n * HASH_BYTES];

    let mut node = keccak512(seed.as_bytes());
    cache[..HASH_BYTES].copy_from_slice(&node);
    for i in 1..n {
        node = keccak512(&node);
        cache[i * HASH_BYTES..(i + 1) * HASH_BYTES].copy_from_slice(&node);
    }

    // Sergio Demian Lerner's RandMemoHash passes.
    let mut mixed = [0u8; HASH_BYTES];
    for _ in 0..CACHE_ROUNDS {
        for i in 0..n {
            let src = u32::from_le_bytes(
                cache[i * HASH_BYTES..i * HASH_BYTES + 4].try_into().unwrap(),
            ) as usize
                % n;
            let prev = (i + n - 1) % n;
            for b in 0..HASH_BYTES {
                mixed[b] = cache[prev * HASH_BYTES + b] ^ cache[src * HASH_BYTES + b];
            }
            let out = keccak512(&mixed);
            cache[i * HASH_BYTES..(i + 1) * HASH_BYTES].copy_from_slice(&out);
        }
    }
    cache
}

fn cache_node(cache: &[u8], index: usize) -> &[u8] {
    &cache[index * HASH_BYTES..(index + 1) * HASH_BYTES]
}

fn calc_dataset_item(cache: &[u8], index: usize) -> [u8; 64] {
    let n = cache.len() / HASH_BYTES;
    let r = HASH_BYTES / 4;

    let mut mix = [0u8; 64];
    mix.copy_from_slice(cache_node(cache, index % n));
    let head = u32::from_le_bytes(mix[..4].try_into().unwrap()) ^ index as u32;
    mix[..4].copy_from_slice(&head.to_le_bytes());
    let mut mix = keccak512(&mix);

    for j in 0..DATASET_PARENTS {
        let word = u32::from_le_bytes(
            mix[(j as usize % r) * 4..(j as usize % r) * 4 + 4].try_into().unwrap(),
        );
        let parent = fnv(index as u32 ^ j, word) as usize % n;
        let node = cache_node(cache, parent);
        for w in 0..r {
            let a = u32::from_le_bytes(mix[w * 4..w * 4 + 4].try_into().unwrap());
            let b = u32::from_le_bytes(node[w * 4..w * 4 + 4].try_into().unwrap());
            mix[w * 4..w * 4 + 4].copy_from_slice(&fnv(a, b).to_le_bytes());
        }
    }
    keccak512(&mix)
}

/// Light hashimoto: (mix digest, final hash) for a header/nonce pair.
pub fn hashimoto_light(header: &H256, nonce: u64, full_size: usize, cache: &[u8]) -> (H256, H256) {
    let rows = (full_size / MIX_BYTES) as u32;

    let mut seed_input = [0u8; 40];
    seed_input[..32].copy_from_slice(header.as_bytes());
    seed_input[32..].copy_from_slice(&nonce.to_le_bytes());
    let seed = keccak512(&seed_input);
    let seed_head = u32::from_le_bytes(seed[..4].try_into().unwrap());

    let mut mix = [0u32; MIX_BYTES / 4];
    for (i, word) in mix.iter_mut().enumerate() {
        let off = (i % 16) * 4;
        *word = u32::from_le_bytes(seed[off..off + 4].try_into().unwrap());
    }

    let mut temp = [0u32; MIX_BYTES / 4];
    for i in 0..ACCESSES {
        let parent = fnv(i as u32 ^ seed_head, mix[i % mix.len()]) % rows;
        for k in 0..2 {
            let item = calc_dataset_item(cache, 2 * parent as usize + k);
            for w in 0..16 {
                temp[k * 16 + w] = u32::from_le_bytes(item[w * 4..w * 4 + 4].try_into().unwrap());
            }
        }
        for w in 0..mix.len() {
            mix[w] = fnv(mix[w], temp[w]);
        }
    }

    let mut digest = [0u8; 32];
    for i in 0..8 {
        let c = fnv(fnv(fnv(mix[i * 4], mix[i * 4 + 1]), mix[i * 4 + 2]), mix[i * 4 + 3]);
        digest[i * 4..i * 4 + 4].copy_from_slice(&c.to_le_bytes());
    }

    let mut final_input = [0u8; 96];
    final_input[..64].copy_from_slice(&seed);
    final_input[64..].copy_from_slice(&digest);
    let result = keccak256(&final_input);

    (H256::from_slice(&digest), H256::from_slice(&result))
}

// ── light verifier ───────────────────────────────────────────────────

/// Ethash verifier backed by per-epoch light caches. Cache generation is
/// expensive (seconds) and happens at most once per epoch transition.
pub struct EthashLight {
    caches: Mutex<HashMap<u64, Arc<Vec<u8>>>>,
    epochs: Mutex<HashMap<H256, u64>>,
}

impl EthashLight {
    pub fn new() -> Self {
        Self { caches: Mutex::new(HashMap::new()), epochs: Mutex::new(HashMap::new()) }
    }

    fn epoch_of(&self, seed: &H256) -> Option<u64> {
        if let Some(epoch) = self.epochs.lock().unwrap().get(seed) {
            return Some(*epoch);
        }
        let epoch = epoch_for_seed(seed)?;
        self.epochs.lock().unwrap().insert(*seed, epoch);
        Some(epoch)
    }

    fn cache_for(&self, epoch: u64, seed: &H256) -> Arc<Vec<u8>> {
        if let Some(cache) = self.caches.lock().unwrap().get(&epoch) {
            return cache.clone();
        }
        tracing::info!(epoch, "generating ethash light cache");
        let built = Arc::new(make_cache(cache_size(epoch), seed));
        let mut caches = self.caches.lock().unwrap();
        caches.insert(epoch, built.clone());
        if caches.len() > CACHE_RETENTION {
            if let Some(oldest) = caches.keys().min().copied() {
                caches.remove(&oldest);
            }
        }
        built
    }
}

impl Default for EthashLight {
    fn default() -> Self {
        Self::new()
    }
}

impl PowVerifier for EthashLight {
    fn verify(
        &self,
        header: &H256,
        seed: &H256,
        nonce: u64,
        mix_digest: &H256,
        share_target: &U256,
        network_target: &U256,
    ) -> Verdict {
        let Some(epoch) = self.epoch_of(seed) else {
            return Verdict::invalid();
        };
        let cache = self.cache_for(epoch, seed);
        let (mix, result) = hashimoto_light(header, nonce, full_size(epoch), &cache);
        if mix != *mix_digest {
            return Verdict::invalid();
        }
        let value = U256::from_big_endian(result.as_bytes());
        let valid = value <= *share_target;
        Verdict { valid, block_solution: valid && value <= *network_target }
    }
}
