//! Activation ordering.
//!
//! Devices are re-attached round-robin across pools: device 0 of every pool,
//! then device 1 of every pool, and so on. Arrivals of different pools are
//! therefore interleaved, which is what exposes a daemon that counts devices
//! globally instead of per pool. The order depends only on the pool specs, so
//! a scenario always replays identically.

use serde::Serialize;

use super::PoolSpec;
use crate::domain::DeviceToken;

/// One entry of an activation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Activation {
    pub pool_index: usize,
    pub device_index: usize,
    pub token: DeviceToken,
}

/// Interleaved activation order over `pools`.
///
/// Pools with fewer devices simply drop out of later rounds.
pub fn activation_sequence(pools: &[PoolSpec]) -> Vec<Activation> {
    let rounds = pools.iter().map(PoolSpec::len).max().unwrap_or(0);
    let mut sequence = Vec::with_capacity(pools.iter().map(PoolSpec::len).sum());

    for device_index in 0..rounds {
        for (pool_index, pool) in pools.iter().enumerate() {
            if let Some(&token) = pool.tokens().get(device_index) {
                sequence.push(Activation {
                    pool_index,
                    device_index,
                    token,
                });
            }
        }
    }
    sequence
}

/// Split off the trailing `pool_count` activations.
///
/// With equally sized pools the tail holds exactly the last device of each
/// pool, so the head leaves every pool one device short.
pub fn split_final(sequence: &[Activation], pool_count: usize) -> (&[Activation], &[Activation]) {
    sequence.split_at(sequence.len().saturating_sub(pool_count))
}
