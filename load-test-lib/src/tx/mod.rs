//! Transaction payload generation.
//!
//! Every connection owns its own [`TxSource`], seeded from the run seed,
//! the worker namespace and the connection index, so that payloads are
//! reproducible and never collide between connections or workers.

use std::{fmt, sync::Arc};

use rama::error::BoxError;

mod kvstore;
mod random;

pub use self::{kvstore::KvStoreSource, random::RandomSource};

/// A single transaction handed to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Per-connection sequence index, strictly increasing without gaps.
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// Deterministic generator of transaction payloads.
pub trait TxSource: Send + Sync + 'static {
    /// Payload for the given per-connection index.
    ///
    /// Calling this twice with the same index yields the same payload.
    fn next(&self, index: u64) -> Vec<u8>;

    fn transaction(&self, seq: u64) -> Transaction {
        Transaction {
            seq,
            payload: self.next(seq),
        }
    }
}

/// Creates one [`TxSource`] per connection.
pub trait TxSourceFactory: Send + Sync + 'static {
    fn new_source(&self, seed: u64, size: usize) -> Arc<dyn TxSource>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientFactory {
    /// `key=value` payloads as accepted by the CometBFT kvstore example app.
    #[default]
    KvStore,
    /// Opaque random bytes.
    Random,
}

impl ClientFactory {
    pub fn from_name(name: &str) -> Result<Self, BoxError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "kvstore" | "kvstore-http" | "kvstore-websocket" => Ok(Self::KvStore),
            "random" => Ok(Self::Random),
            other => Err(BoxError::from(format!(
                "unknown client factory '{other}' (expected one of: kvstore, random)"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::KvStore => "kvstore",
            Self::Random => "random",
        }
    }

    /// Smallest payload size this factory can still make unique.
    pub fn min_tx_size(self) -> usize {
        match self {
            Self::KvStore => kvstore::MIN_TX_SIZE,
            Self::Random => 1,
        }
    }
}

impl fmt::Display for ClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TxSourceFactory for ClientFactory {
    fn new_source(&self, seed: u64, size: usize) -> Arc<dyn TxSource> {
        match self {
            Self::KvStore => Arc::new(KvStoreSource::new(seed, size)),
            Self::Random => Arc::new(RandomSource::new(seed, size)),
        }
    }
}

/// Derive the seed of a single connection's source.
pub fn source_seed(tx_seed: u64, namespace: u64, connection: usize) -> u64 {
    let mixed = splitmix64(tx_seed ^ splitmix64(namespace.wrapping_add(0x5EED)));
    splitmix64(mixed ^ connection as u64)
}

pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
