//! FNV-1a hashing used for routing-key selection.
//!
//! Every node of the cluster must map a routing key to the same member index,
//! so the hash is a fixed, seedless function of the key's UTF-8 bytes. The
//! standard library hasher is randomly seeded per process and cannot be used
//! here.

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash over the UTF-8 bytes of `s`.
///
/// # Examples
///
/// ```
/// use apm_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash(""), 2_166_136_261); // FNV offset basis
/// assert_eq!(fnv1a_hash("a"), 0xe40c_292c);
/// ```
#[must_use]
pub fn fnv1a_hash(s: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in s.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps a routing key onto one of `buckets` slots.
///
/// Returns `None` when there are no buckets to choose from.
///
/// # Examples
///
/// ```
/// use apm_core::hash::bucket_for;
///
/// assert_eq!(bucket_for("svc-1", 0), None);
/// assert_eq!(bucket_for("svc-1", 1), Some(0));
/// ```
#[must_use]
pub fn bucket_for(key: &str, buckets: usize) -> Option<usize> {
    if buckets == 0 {
        return None;
    }
    // u32 -> usize is lossless on every supported target.
    Some(fnv1a_hash(key) as usize % buckets)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
