use rand::{RngExt as _, SeedableRng as _, rngs::SmallRng};

use super::{TxSource, splitmix64};

/// Generates opaque pseudo random payloads of a fixed size.
///
/// Payloads of 8 bytes or more start with the big endian index
/// so that two transactions of the same source never collide.
#[derive(Debug, Clone)]
pub struct RandomSource {
    seed: u64,
    size: usize,
}

impl RandomSource {
    pub fn new(seed: u64, size: usize) -> Self {
        Self {
            seed,
            size: size.max(1),
        }
    }
}

impl TxSource for RandomSource {
    fn next(&self, index: u64) -> Vec<u8> {
        let mut rng = SmallRng::seed_from_u64(splitmix64(self.seed ^ splitmix64(index)));
        let mut payload = vec![0u8; self.size];
        for chunk in payload.chunks_mut(8) {
            let bytes = rng.random::<u64>().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
        if self.size >= 8 {
            payload[..8].copy_from_slice(&index.to_be_bytes());
        }
        payload
    }
}
