//! Adaptive content-addressed element IDs.
//!
//! Root IDs are `el-` plus a base36 SHA-256 prefix whose length grows with
//! the store (roughly a 1% birthday-collision budget). Hierarchical children
//! append `.N` ordinals, at most three levels beyond the root. Derivation is
//! deterministic for a fixed `(identifier, createdBy, timestampNs, nonce)`
//! tuple; collisions are resolved by walking the nonce, then widening.

use crate::core::error::{ElementalError, ErrorKind};
use regex::Regex;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

pub const ID_PREFIX: &str = "el";
pub const MIN_HASH_LEN: usize = 3;
pub const MAX_HASH_LEN: usize = 8;
/// Maximum hierarchical depth beyond the root segment.
pub const MAX_CHILD_DEPTH: usize = 3;
const MAX_NONCE: u32 = 9;

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^el-([0-9a-z]{3,8})((?:\.\d+)*)$").expect("id regex compiles")
    })
}

/// Inputs to root-ID derivation. `identifier` is the element's primary human
/// name, title, or content.
#[derive(Debug, Clone, Copy)]
pub struct IdSeed<'a> {
    pub identifier: &'a str,
    pub created_by: &'a str,
    pub timestamp_ns: i64,
}

/// Decomposed ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    pub prefix: String,
    pub hash: String,
    pub segments: Vec<u64>,
    pub depth: usize,
    pub is_root: bool,
}

/// Hash length for the current store size (~1% collision budget).
pub fn length_for_count(element_count: u64) -> usize {
    match element_count {
        0..=99 => 3,
        100..=499 => 4,
        500..=2_999 => 5,
        3_000..=19_999 => 6,
        20_000..=99_999 => 7,
        _ => 8,
    }
}

/// Deterministic derivation for one `(seed, nonce, length)` combination.
pub fn derive(seed: &IdSeed<'_>, nonce: u32, length: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.identifier.as_bytes());
    hasher.update(b"|");
    hasher.update(seed.created_by.as_bytes());
    hasher.update(b"|");
    hasher.update(seed.timestamp_ns.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(nonce.to_string().as_bytes());
    let digest = hasher.finalize();
    let encoded = base36_encode(&digest);
    format!("{}-{}", ID_PREFIX, &encoded[..length.clamp(MIN_HASH_LEN, MAX_HASH_LEN)])
}

/// Generate a fresh root ID, probing `is_taken` for collisions.
///
/// Walks nonces 0..=9 at the adaptive length, then widens by one character
/// per exhausted round up to eight. A store dense enough to exhaust every
/// candidate fails `ALREADY_EXISTS`.
pub fn generate<F>(
    seed: &IdSeed<'_>,
    element_count: u64,
    mut is_taken: F,
) -> Result<String, ElementalError>
where
    F: FnMut(&str) -> Result<bool, ElementalError>,
{
    let mut length = length_for_count(element_count);
    loop {
        for nonce in 0..=MAX_NONCE {
            let candidate = derive(seed, nonce, length);
            if !is_taken(&candidate)? {
                return Ok(candidate);
            }
        }
        if length >= MAX_HASH_LEN {
            return Err(ElementalError::new(
                ErrorKind::AlreadyExists,
                "exhausted id candidates at maximum length",
            )
            .with_detail("identifier", json!(seed.identifier)));
        }
        length += 1;
    }
}

/// Encode a digest as lowercase base36 (most significant digit first).
fn base36_encode(bytes: &[u8]) -> String {
    let mut quotient = bytes.to_vec();
    let mut digits = Vec::new();
    while quotient.iter().any(|&b| b != 0) {
        let mut remainder: u32 = 0;
        for byte in quotient.iter_mut() {
            let acc = (remainder << 8) | u32::from(*byte);
            *byte = (acc / 36) as u8;
            remainder = acc % 36;
        }
        digits.push(BASE36_ALPHABET[remainder as usize]);
    }
    if digits.is_empty() {
        digits.push(b'0');
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 output is ascii")
}

/// Parse an ID into its parts. Fails `INVALID_ID` on malformed input and
/// `MAX_DEPTH_EXCEEDED` when more than three child segments are present.
pub fn parse(id: &str) -> Result<ParsedId, ElementalError> {
    let captures = id_regex().captures(id).ok_or_else(|| {
        ElementalError::new(ErrorKind::InvalidId, format!("malformed element id: {id}"))
            .with_detail("id", json!(id))
    })?;
    let hash = captures[1].to_string();
    let mut segments = Vec::new();
    let tail = &captures[2];
    for raw in tail.split('.').filter(|s| !s.is_empty()) {
        let n: u64 = raw.parse().map_err(|_| {
            ElementalError::new(ErrorKind::InvalidId, format!("malformed child segment in {id}"))
                .with_detail("id", json!(id))
        })?;
        if n == 0 {
            return Err(ElementalError::new(
                ErrorKind::InvalidId,
                format!("child segments are positive integers: {id}"),
            )
            .with_detail("id", json!(id)));
        }
        segments.push(n);
    }
    if segments.len() > MAX_CHILD_DEPTH {
        return Err(ElementalError::new(
            ErrorKind::MaxDepthExceeded,
            format!("id exceeds maximum hierarchy depth of {MAX_CHILD_DEPTH}: {id}"),
        )
        .with_detail("id", json!(id))
        .with_detail("depth", json!(segments.len())));
    }
    let depth = segments.len();
    Ok(ParsedId {
        prefix: ID_PREFIX.to_string(),
        hash,
        segments,
        depth,
        is_root: depth == 0,
    })
}

pub fn is_valid(id: &str) -> bool {
    parse(id).is_ok()
}

/// Child ID `P.n` under `parent`. Fails when the result would exceed the
/// depth cap or `n` is not positive.
pub fn child_of(parent: &str, n: i64) -> Result<String, ElementalError> {
    let parsed = parse(parent)?;
    if n <= 0 {
        return Err(ElementalError::new(
            ErrorKind::InvalidId,
            format!("child ordinal must be positive, got {n}"),
        ));
    }
    if parsed.depth >= MAX_CHILD_DEPTH {
        return Err(ElementalError::new(
            ErrorKind::MaxDepthExceeded,
            format!("cannot nest below {parent}: maximum depth is {MAX_CHILD_DEPTH}"),
        )
        .with_detail("parentId", json!(parent)));
    }
    Ok(format!("{parent}.{n}"))
}

/// Strip one trailing segment; `None` for root IDs.
pub fn parent_of(id: &str) -> Option<String> {
    let (head, _tail) = id.rsplit_once('.')?;
    Some(head.to_string())
}

/// Strip all child segments.
pub fn root_of(id: &str) -> String {
    match id.split_once('.') {
        Some((root, _)) => root.to_string(),
        None => id.to_string(),
    }
}
