//! Assembly Oracle
//!
//! Answers "which pools are visible right now?" and compares the answer with
//! an expectation. Nothing is cached between calls, and nothing is retried:
//! callers settle the event queue before they ask.

use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{ManagementInterface, PoolHandle};
use crate::error::{Error, Result};
use crate::scenario::PoolSpec;

/// How a pool expectation shows up in the management interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolVisibility {
    /// No pool by that name is visible
    Absent,
    /// Exactly one pool by that name is visible
    Assembled,
    /// More than one pool answers to the name
    Duplicated(usize),
}

impl PoolVisibility {
    fn from_count(count: usize) -> Self {
        match count {
            0 => PoolVisibility::Absent,
            1 => PoolVisibility::Assembled,
            n => PoolVisibility::Duplicated(n),
        }
    }
}

/// Stateless query front end over a management interface.
#[derive(Debug, Clone)]
pub struct AssemblyOracle<M> {
    mgmt: M,
}

impl<M: ManagementInterface> AssemblyOracle<M> {
    pub fn new(mgmt: M) -> Self {
        Self { mgmt }
    }

    /// Underlying management interface.
    pub fn management(&self) -> &M {
        &self.mgmt
    }

    /// Pools currently visible, optionally restricted to `name_filter`.
    pub async fn list_pools(&self, name_filter: Option<&str>) -> Result<Vec<PoolHandle>> {
        let mut pools = self.mgmt.list_pools(name_filter).await?;
        if let Some(name) = name_filter {
            pools.retain(|p| p.name == name);
        }
        debug!(filter = ?name_filter, count = pools.len(), "Listed pools");
        Ok(pools)
    }

    /// True when exactly `expected` pools match `name_filter`.
    pub async fn expect_count(&self, name_filter: Option<&str>, expected: usize) -> Result<bool> {
        Ok(self.list_pools(name_filter).await?.len() == expected)
    }

    /// Fail with `AssemblyAssertion` unless exactly `expected` pools match.
    pub async fn assert_count(
        &self,
        step: &str,
        name_filter: Option<&str>,
        expected: usize,
    ) -> Result<usize> {
        let observed = self.list_pools(name_filter).await?.len();
        if observed != expected {
            return Err(Error::AssemblyAssertion {
                step: step.to_string(),
                filter: name_filter.map(str::to_owned),
                expected,
                observed,
            });
        }
        info!(step, filter = ?name_filter, observed, "Checkpoint passed");
        Ok(observed)
    }

    /// Classify how `spec` currently appears.
    pub async fn classify(&self, spec: &PoolSpec) -> Result<PoolVisibility> {
        let count = self.list_pools(Some(spec.name())).await?.len();
        Ok(PoolVisibility::from_count(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CreatePoolRequest, DeviceToken};
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    /// Management interface with a fixed answer that ignores the filter.
    struct Fixed(Vec<&'static str>);

    #[async_trait]
    impl ManagementInterface for Fixed {
        async fn create_pool(&self, request: &CreatePoolRequest) -> Result<PoolHandle> {
            Ok(PoolHandle::new(&request.name))
        }

        async fn list_pools(&self, _name_filter: Option<&str>) -> Result<Vec<PoolHandle>> {
            Ok(self.0.iter().map(|n| PoolHandle::new(*n)).collect())
        }
    }

    #[test]
    fn test_filter_applied_even_if_backend_ignores_it() {
        let oracle = AssemblyOracle::new(Fixed(vec!["a", "b", "a"]));
        let all = tokio_test::block_on(oracle.list_pools(None)).unwrap();
        let only_a = tokio_test::block_on(oracle.list_pools(Some("a"))).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(only_a.len(), 2);
    }

    #[tokio::test]
    async fn test_expect_and_assert_count() {
        let oracle = AssemblyOracle::new(Fixed(vec!["a", "b"]));

        assert!(oracle.expect_count(None, 2).await.unwrap());
        assert!(!oracle.expect_count(Some("b"), 0).await.unwrap());
        assert_eq!(oracle.assert_count("all", None, 2).await.unwrap(), 2);

        let err = oracle.assert_count("only b", Some("b"), 0).await.unwrap_err();
        assert_matches!(
            err,
            Error::AssemblyAssertion { expected: 0, observed: 1, ref filter, .. }
                if filter.as_deref() == Some("b")
        );
    }

    #[tokio::test]
    async fn test_classify() {
        let oracle = AssemblyOracle::new(Fixed(vec!["a", "b", "b"]));
        let spec = |name: &str| PoolSpec::new(name, vec![DeviceToken::new(0)]);

        assert_eq!(oracle.classify(&spec("a")).await.unwrap(), PoolVisibility::Assembled);
        assert_eq!(oracle.classify(&spec("b")).await.unwrap(), PoolVisibility::Duplicated(2));
        assert_eq!(oracle.classify(&spec("c")).await.unwrap(), PoolVisibility::Absent);
    }
}
