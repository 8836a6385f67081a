use crate::coverage::CoverageSample;
use std::collections::HashSet;

/// Separator between canonical tokens. Token format is `url|start:end:count`.
const TOKEN_SEPARATOR: &str = ";";

/// The deterministic fingerprint of one coverage snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Hex digest of `canonical`.
    pub hash: String,
    /// The sorted, joined token text the hash was computed over.
    pub canonical: String,
}

/// Canonicalizes a raw coverage sample into a deterministic signature.
///
/// Scripts whose URL fails `filter` are skipped entirely, so filtered-out code
/// can neither contribute to nor mask novelty. Tokens are sorted before
/// joining, making the result invariant to the order scripts, functions, and
/// ranges appear in the sample.
pub fn compute_signature(
    sample: &CoverageSample,
    filter: Option<&dyn Fn(&str) -> bool>,
) -> Signature {
    let mut tokens = Vec::new();
    for script in &sample.scripts {
        if let Some(predicate) = filter {
            if !predicate(&script.url) {
                continue;
            }
        }
        for func in &script.functions {
            for range in &func.ranges {
                tokens.push(format!(
                    "{}|{}:{}:{}",
                    script.url, range.start_offset, range.end_offset, range.count
                ));
            }
        }
    }
    tokens.sort();
    let canonical = tokens.join(TOKEN_SEPARATOR);
    let hash = format!("{:x}", md5::compute(canonical.as_bytes()));
    Signature { hash, canonical }
}

/// Tracks every coverage signature observed over the process lifetime.
///
/// This is the engine's sole novelty oracle: it cannot say *which* ranges are
/// new, only whether the `(url, range, count)` multiset as a whole has been
/// seen before. Hashes are never evicted.
#[derive(Debug, Default)]
pub struct SignatureManager {
    seen: HashSet<String>,
}

impl SignatureManager {
    pub fn new() -> Self {
        Self {
            seen: HashSet::new(),
        }
    }

    /// Returns true and records the signature if this sample's fingerprint is
    /// unseen, false otherwise.
    pub fn check_new_coverage(
        &mut self,
        sample: &CoverageSample,
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> bool {
        let signature = compute_signature(sample, filter);
        self.seen.insert(signature.hash)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}
