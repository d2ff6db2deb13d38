//! Post-processing of raw device output.
//!
//! All whitening lives here; the device layer only ever produces raw bytes.
//!
//! ```text
//! Device → Raw Bytes → Conditioning Layer (this module) → Client
//! ```
//!
//! # Methods
//!
//! - **Sha256**: counter-chained SHA-256 over 64-byte raw chunks.
//! - **Sha512**: the same construction with SHA-512 (64-byte output blocks).
//! - **Xorshift64**: lightweight mixing. Each raw 64-bit word is folded into an
//!   xorshift64* state seeded from the OS at startup. Much cheaper than the
//!   hash modes and keeps throughput close to the raw device rate.
//!
//! Raw noise-source samples never pass through this module.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

/// Post-processing method applied to entropy requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostProcessing {
    /// SHA-256 chained conditioning (default).
    #[default]
    Sha256,
    /// SHA-512 chained conditioning.
    Sha512,
    /// xorshift64* mixing.
    Xorshift64,
}

impl std::fmt::Display for PostProcessing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
            Self::Xorshift64 => write!(f, "xorshift64"),
        }
    }
}

impl std::str::FromStr for PostProcessing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" | "sha" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            "xorshift64" | "xorshift" => Ok(Self::Xorshift64),
            other => Err(format!("unknown post-processing method '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Conditioner
// ---------------------------------------------------------------------------

/// Stateful conditioner for one broker session.
pub struct Conditioner {
    method: PostProcessing,
    xorshift_state: Mutex<u64>,
}

impl Conditioner {
    /// Create a conditioner. The xorshift state is seeded from the OS.
    pub fn new(method: PostProcessing) -> Self {
        let mut seed = [0u8; 8];
        if getrandom::fill(&mut seed).is_err() {
            log::warn!("OS entropy unavailable, xorshift state starts from a fixed seed");
            seed = 0x9E37_79B9_7F4A_7C15u64.to_le_bytes();
        }
        Self::with_seed(method, u64::from_le_bytes(seed))
    }

    /// Create a conditioner with an explicit xorshift seed.
    pub fn with_seed(method: PostProcessing, seed: u64) -> Self {
        Self {
            method,
            // xorshift must never hold zero.
            xorshift_state: Mutex::new(seed.max(1)),
        }
    }

    pub fn method(&self) -> PostProcessing {
        self.method
    }

    /// Condition `raw` into exactly `n_output` bytes.
    pub fn condition(&self, raw: &[u8], n_output: usize) -> Vec<u8> {
        match self.method {
            PostProcessing::Sha256 => sha256_condition_bytes(raw, n_output),
            PostProcessing::Sha512 => sha512_condition_bytes(raw, n_output),
            PostProcessing::Xorshift64 => {
                let mut state = self
                    .xorshift_state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                xorshift_mix(&mut state, raw, n_output)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Hash conditioning
// ---------------------------------------------------------------------------

/// SHA-256 chained conditioning: stretches or compresses raw bytes to exactly
/// `n_output` bytes using counter-mode hashing.
///
/// Each 32-byte output block is: SHA-256(state || chunk || counter).
/// State is chained from the previous block's digest.
pub fn sha256_condition_bytes(raw: &[u8], n_output: usize) -> Vec<u8> {
    chained_condition::<Sha256>(raw, n_output)
}

/// SHA-512 variant of [`sha256_condition_bytes`] with 64-byte blocks.
pub fn sha512_condition_bytes(raw: &[u8], n_output: usize) -> Vec<u8> {
    chained_condition::<Sha512>(raw, n_output)
}

fn chained_condition<D: Digest>(raw: &[u8], n_output: usize) -> Vec<u8> {
    if raw.is_empty() {
        return vec![0u8; n_output];
    }
    let mut output = Vec::with_capacity(n_output);
    let mut state: Vec<u8> = vec![0u8; <D as Digest>::output_size()];
    let mut offset = 0;
    let mut counter: u64 = 0;
    while output.len() < n_output {
        let end = (offset + 64).min(raw.len());
        let mut h = D::new();
        h.update(&state);
        h.update(&raw[offset..end]);
        h.update(counter.to_le_bytes());
        state = h.finalize().to_vec();
        output.extend_from_slice(&state);
        offset += 64;
        counter += 1;
        if offset >= raw.len() {
            offset = 0;
        }
    }
    output.truncate(n_output);
    output
}

// ---------------------------------------------------------------------------
// xorshift64* mixing
// ---------------------------------------------------------------------------

fn xorshift64_star(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    *state = x;
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

/// Fold each raw 64-bit word into `state` and emit the stepped output.
fn xorshift_mix(state: &mut u64, raw: &[u8], n_output: usize) -> Vec<u8> {
    let mut output = Vec::with_capacity(n_output + 8);
    let mut words = raw.chunks(8).cycle();
    while output.len() < n_output {
        let mut word = [0u8; 8];
        if let Some(chunk) = words.next() {
            word[..chunk.len()].copy_from_slice(chunk);
        }
        *state ^= u64::from_le_bytes(word);
        if *state == 0 {
            *state = 1;
        }
        output.extend_from_slice(&xorshift64_star(state).to_le_bytes());
    }
    output.truncate(n_output);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_produces_exact_length() {
        let data = vec![42u8; 100];
        for n in [0, 1, 31, 32, 33, 1000] {
            assert_eq!(sha256_condition_bytes(&data, n).len(), n);
        }
    }

    #[test]
    fn test_sha512_produces_exact_length() {
        let data = vec![7u8; 300];
        for n in [1, 64, 65, 4096] {
            assert_eq!(sha512_condition_bytes(&data, n).len(), n);
        }
    }

    #[test]
    fn test_hash_modes_differ() {
        let data: Vec<u8> = (0..=255).collect();
        assert_ne!(
            sha256_condition_bytes(&data, 64),
            sha512_condition_bytes(&data, 64)
        );
        assert_ne!(sha256_condition_bytes(&data, 64), data[..64].to_vec());
    }

    #[test]
    fn test_hash_conditioning_is_deterministic() {
        let data: Vec<u8> = (0..200).map(|i| (i * 7) as u8).collect();
        assert_eq!(
            sha256_condition_bytes(&data, 100),
            sha256_condition_bytes(&data, 100)
        );
    }

    #[test]
    fn test_xorshift_state_advances() {
        let c = Conditioner::with_seed(PostProcessing::Xorshift64, 12345);
        let raw = vec![0u8; 64];
        let a = c.condition(&raw, 64);
        let b = c.condition(&raw, 64);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_xorshift_handles_odd_lengths() {
        let c = Conditioner::with_seed(PostProcessing::Xorshift64, 1);
        assert_eq!(c.condition(&[1, 2, 3], 13).len(), 13);
        assert_eq!(c.condition(&[], 5).len(), 5);
    }

    #[test]
    fn test_parse_methods() {
        assert_eq!("sha256".parse(), Ok(PostProcessing::Sha256));
        assert_eq!("sha512".parse(), Ok(PostProcessing::Sha512));
        assert_eq!("xorshift".parse(), Ok(PostProcessing::Xorshift64));
        assert!("SHA256".parse::<PostProcessing>().is_err());
    }

    #[test]
    fn test_method_serde_names() {
        let json = serde_json::to_string(&PostProcessing::Xorshift64).unwrap();
        assert_eq!(json, "\"xorshift64\"");
    }
}
