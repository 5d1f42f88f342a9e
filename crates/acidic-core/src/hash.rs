//! ContentHasher trait for digesting job arguments.
//!
//! Defined in acidic-core so key derivation can hash content without
//! coupling to a specific hashing algorithm. The `Sha256ContentHasher`
//! adapter lives in acidic-infra.

/// Abstraction over content hashing.
///
/// Implementations must be deterministic across processes: the same input
/// always yields the same hex string.
pub trait ContentHasher: Send + Sync {
    /// Compute a hex-encoded hash of the given content.
    fn compute_hash(&self, content: &str) -> String;
}
