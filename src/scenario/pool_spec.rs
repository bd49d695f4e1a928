//! Pool expectations owned by a scenario.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::domain::DeviceToken;

const POOL_NAME_PREFIX: &str = "stratis_";
const POOL_NAME_SUFFIX_LEN: usize = 5;

/// The harness's belief about which devices make up one pool under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSpec {
    name: String,
    /// Member devices in creation order
    tokens: Vec<DeviceToken>,
    /// Members presented (hotplugged) since the last reset
    presented: BTreeSet<DeviceToken>,
}

impl PoolSpec {
    /// Expectation for pool `name`; duplicate tokens are collapsed.
    pub fn new(name: impl Into<String>, tokens: Vec<DeviceToken>) -> Self {
        let mut seen = BTreeSet::new();
        let tokens = tokens.into_iter().filter(|t| seen.insert(*t)).collect();
        Self {
            name: name.into(),
            tokens,
            presented: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tokens(&self) -> &[DeviceToken] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn contains(&self, token: DeviceToken) -> bool {
        self.tokens.contains(&token)
    }

    /// Record that `token` has been presented. Non-members are ignored.
    pub fn mark_presented(&mut self, token: DeviceToken) -> bool {
        self.contains(token) && self.presented.insert(token)
    }

    /// Forget every presentation, e.g. after all members were unplugged.
    pub fn reset_presented(&mut self) {
        self.presented.clear();
    }

    pub fn presented_count(&self) -> usize {
        self.presented.len()
    }

    /// Members not presented yet, in creation order.
    pub fn missing(&self) -> Vec<DeviceToken> {
        self.tokens
            .iter()
            .copied()
            .filter(|t| !self.presented.contains(t))
            .collect()
    }

    /// True once every member has been presented.
    pub fn is_fully_presented(&self) -> bool {
        !self.tokens.is_empty() && self.presented.len() == self.tokens.len()
    }
}

/// Random pool name: `stratis_` plus five uppercase letters.
///
/// Randomness only avoids collisions between runs; it never affects ordering.
pub fn random_pool_name() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let suffix: String = bytes
        .iter()
        .take(POOL_NAME_SUFFIX_LEN)
        .map(|b| char::from(b'A' + b % 26))
        .collect();
    format!("{}{}", POOL_NAME_PREFIX, suffix)
}
