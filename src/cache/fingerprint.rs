//! Request fingerprints.
//!
//! A fingerprint is the SHA-256 of a canonical JSON rendering of
//! everything that can change the output: prompt, generation parameters,
//! the candidate backend set (sorted, de-duplicated), the stream flag and
//! the success threshold. Struct fields serialize in declaration order and
//! map-valued parameters are `BTreeMap`s, so the rendering is stable
//! across processes and the key is safe to use with a shared cache.

use std::fmt;
use std::fmt::Write;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::Result;
use crate::types::{BackendId, GenerationParams, OrchestrationRequest};

/// Key namespace shared with other users of the same cache store.
pub const KEY_PREFIX: &str = "llm_response";

#[derive(Serialize)]
struct FingerprintInput<'a> {
    prompt: &'a str,
    params: &'a GenerationParams,
    backends: &'a [BackendId],
    stream: bool,
    min_success: usize,
}

/// Deterministic digest identifying a cache-equivalence class of requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Fingerprint `request` as routed to `candidates` with `min_success`.
    pub fn compute(
        request: &OrchestrationRequest,
        candidates: &[BackendId],
        min_success: usize,
    ) -> Result<Self> {
        let mut backends = candidates.to_vec();
        backends.sort();
        backends.dedup();
        let canonical = serde_json::to_vec(&FingerprintInput {
            prompt: &request.prompt,
            params: &request.params,
            backends: &backends,
            stream: request.stream,
            min_success,
        })?;
        let digest = Sha256::digest(&canonical);
        let mut key = String::with_capacity(KEY_PREFIX.len() + 1 + digest.len() * 2);
        key.push_str(KEY_PREFIX);
        key.push(':');
        for byte in digest {
            let _ = write!(key, "{byte:02x}");
        }
        Ok(Self(key))
    }

    /// The full cache key, `llm_response:<sha256 hex>`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
