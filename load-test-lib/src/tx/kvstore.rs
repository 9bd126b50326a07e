use rand::{RngExt as _, SeedableRng as _, rngs::SmallRng};

use super::{TxSource, splitmix64};

/// hex(source id) + hex(index) + `=` + at least a handful of value bytes.
pub(super) const MIN_TX_SIZE: usize = 40;

const KEY_LEN: usize = 32;

/// Generates `key=value` transactions for the kvstore ABCI application.
///
/// The key embeds the source seed and the transaction index,
/// which keeps every payload unique within a run.
/// The value is hex encoded pseudo random data derived from the same pair.
#[derive(Debug, Clone)]
pub struct KvStoreSource {
    seed: u64,
    size: usize,
}

impl KvStoreSource {
    pub fn new(seed: u64, size: usize) -> Self {
        Self {
            seed,
            size: size.max(MIN_TX_SIZE),
        }
    }
}

impl TxSource for KvStoreSource {
    fn next(&self, index: u64) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.size);
        payload.extend_from_slice(hex::encode(self.seed.to_be_bytes()).as_bytes());
        payload.extend_from_slice(hex::encode(index.to_be_bytes()).as_bytes());
        debug_assert_eq!(payload.len(), KEY_LEN);
        payload.push(b'=');

        let value_len = self.size - payload.len();
        let mut rng = SmallRng::seed_from_u64(splitmix64(self.seed ^ splitmix64(index)));
        let mut raw = vec![0u8; value_len.div_ceil(2)];
        for chunk in raw.chunks_mut(8) {
            let bytes = rng.random::<u64>().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }

        let value = hex::encode(raw);
        payload.extend_from_slice(&value.as_bytes()[..value_len]);
        payload
    }
}
