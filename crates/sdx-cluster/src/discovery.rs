//! Finding peers to join.

use crate::error::Result;
use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// An address worth contacting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryCandidate {
    pub address: String,
    pub display_name: String,
}

pub trait DiscoveryStrategy: Send + Sync {
    /// A finite stream of candidates. May yield nothing.
    fn discover(&self) -> BoxStream<'_, DiscoveryCandidate>;
}

/// A fixed list of addresses.
#[derive(Clone, Debug, Default)]
pub struct StaticDiscovery {
    addresses: Vec<String>,
}

impl StaticDiscovery {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }
}

impl DiscoveryStrategy for StaticDiscovery {
    fn discover(&self) -> BoxStream<'_, DiscoveryCandidate> {
        Box::pin(futures::stream::iter(self.addresses.iter().map(|address| {
            DiscoveryCandidate {
                address: address.clone(),
                display_name: address.clone(),
            }
        })))
    }
}

/// A workload reported by an orchestrator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Workload {
    pub name: String,
    pub ip: Option<String>,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
}

/// Lists workloads, e.g. the pods of a deployment.
#[async_trait]
pub trait WorkloadLister: Send + Sync {
    async fn list(&self) -> Result<Vec<Workload>>;
}

type WorkloadFilter = Arc<dyn Fn(&Workload) -> bool + Send + Sync>;

/// Running workloads with an address that pass a caller predicate.
pub struct WorkloadDiscovery {
    lister: Arc<dyn WorkloadLister>,
    filter: WorkloadFilter,
    port: u16,
}

impl WorkloadDiscovery {
    pub fn new(lister: Arc<dyn WorkloadLister>, port: u16) -> Self {
        Self {
            lister,
            filter: Arc::new(|_| true),
            port,
        }
    }

    pub fn with_filter(mut self, filter: impl Fn(&Workload) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    /// Keep workloads whose label `key` equals `value`.
    pub fn with_label(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.with_filter(move |w| w.labels.get(&key) == Some(&value))
    }
}

impl DiscoveryStrategy for WorkloadDiscovery {
    fn discover(&self) -> BoxStream<'_, DiscoveryCandidate> {
        Box::pin(stream! {
            let workloads = match self.lister.list().await {
                Ok(workloads) => workloads,
                Err(e) => {
                    warn!(error = %e, "listing workloads failed");
                    Vec::new()
                }
            };
            for workload in workloads {
                let Some(ip) = workload.ip.as_deref().filter(|_| workload.running) else {
                    debug!(workload = %workload.name, "skipping workload without a running address");
                    continue;
                };
                if !(self.filter)(&workload) {
                    continue;
                }
                yield DiscoveryCandidate {
                    address: format!("{}:{}", ip, self.port),
                    display_name: workload.name.clone(),
                };
            }
        })
    }
}

impl std::fmt::Debug for WorkloadDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadDiscovery").field("port", &self.port).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;
    use futures::StreamExt;

    struct Fixed(Result<Vec<Workload>>);

    #[async_trait]
    impl WorkloadLister for Fixed {
        async fn list(&self) -> Result<Vec<Workload>> {
            self.0.clone()
        }
    }

    fn workload(name: &str, ip: Option<&str>, running: bool, role: &str) -> Workload {
        Workload {
            name: name.into(),
            ip: ip.map(Into::into),
            running,
            labels: [("role".to_string(), role.to_string())].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn test_static_discovery_yields_in_order() {
        let discovery = StaticDiscovery::new(["mem://a", "mem://b"]);
        let found: Vec<String> = discovery.discover().map(|c| c.address).collect().await;
        assert_eq!(found, vec!["mem://a", "mem://b"]);
        assert_eq!(StaticDiscovery::default().discover().count().await, 0);
    }

    #[tokio::test]
    async fn test_workload_discovery_filters() {
        let lister = Fixed(Ok(vec![
            workload("db-0", Some("10.0.0.1"), true, "db"),
            workload("db-1", Some("10.0.0.2"), false, "db"),
            workload("db-2", None, true, "db"),
            workload("web-0", Some("10.0.0.9"), true, "web"),
        ]));
        let discovery = WorkloadDiscovery::new(Arc::new(lister), 7000).with_label("role", "db");

        let found: Vec<DiscoveryCandidate> = discovery.discover().collect().await;
        assert_eq!(
            found,
            vec![DiscoveryCandidate {
                address: "10.0.0.1:7000".into(),
                display_name: "db-0".into(),
            }]
        );
    }

    #[test]
    fn test_lister_failure_yields_nothing() {
        let lister = Fixed(Err(ClusterError::Config("no orchestrator".into())));
        let discovery = WorkloadDiscovery::new(Arc::new(lister), 7000);
        assert_eq!(tokio_test::block_on(discovery.discover().count()), 0);
    }
}
