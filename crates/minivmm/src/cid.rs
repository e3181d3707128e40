//! Guest context IDs for vsock.
//!
//! CIDs 0 (hypervisor), 1 (loopback) and 2 (host) are reserved, and the
//! top few values are kept out of the domain as well, so every allocated
//! CID lies in `[MIN_GUEST_CID, MAX_GUEST_CID]`.
//!
//! Two VMs on one host must not share a CID, so the allocator is seeded
//! from OS entropy once per process.  Tests pass a fixed seed instead.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Smallest CID a guest may use.
pub const MIN_GUEST_CID: u32 = 3;

/// Largest CID a guest may use.
pub const MAX_GUEST_CID: u32 = u32::MAX - 3;

/// Draws guest CIDs from a ChaCha20 stream.
#[derive(Debug, Clone)]
pub struct CidAllocator {
    rng: ChaCha20Rng,
}

impl CidAllocator {
    /// An allocator seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha20Rng::from_entropy(),
        }
    }

    /// A reproducible allocator.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    /// The next CID, never one of the reserved values.
    pub fn allocate(&mut self) -> u32 {
        self.rng.gen_range(MIN_GUEST_CID..=MAX_GUEST_CID)
    }
}
