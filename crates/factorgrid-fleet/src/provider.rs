//! Instance provider — the seam to whatever starts, stops and reports
//! on worker machines.
//!
//! Cloud SDK integrations live outside this workspace; they implement
//! [`InstanceProvider`]. [`StaticProvider`] serves a fixed pool of
//! pre-running hosts, which is enough to run a fleet on-premises.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use factor_core::{InstanceId, InstanceState};

use crate::error::{FleetError, FleetResult};

/// Provider-side view of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub id: InstanceId,
    pub state: InstanceState,
    pub address: Option<String>,
}

/// Starts, terminates and describes worker instances.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Request a new instance. It may still be pending when this returns.
    async fn start_instance(&self) -> FleetResult<InstanceDescription>;

    /// Stop an instance. Terminating an already-terminated instance is not an error.
    async fn terminate_instance(&self, id: &str) -> FleetResult<()>;

    /// Current provider state and address of an instance.
    async fn describe_instance(&self, id: &str) -> FleetResult<InstanceDescription>;
}

struct StaticPool {
    free: VecDeque<String>,
    leased: HashMap<InstanceId, String>,
    released: HashSet<InstanceId>,
    counter: u64,
}

/// Serves instances from a fixed list of host addresses.
///
/// Starting an instance leases the next free host; terminating returns
/// the host to the pool. Leased hosts are reported `running`, released
/// ones `terminated`.
pub struct StaticProvider {
    pool: Mutex<StaticPool>,
}

impl StaticProvider {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            pool: Mutex::new(StaticPool {
                free: addresses.into(),
                leased: HashMap::new(),
                released: HashSet::new(),
                counter: 0,
            }),
        }
    }

    /// Hosts not currently leased.
    pub fn available(&self) -> usize {
        self.pool.lock().expect("static pool lock").free.len()
    }
}

#[async_trait]
impl InstanceProvider for StaticProvider {
    async fn start_instance(&self) -> FleetResult<InstanceDescription> {
        let mut pool = self.pool.lock().expect("static pool lock");
        let address = pool.free.pop_front().ok_or(FleetError::CapacityExhausted)?;
        pool.counter += 1;
        let id = format!("static-{}", pool.counter);
        pool.leased.insert(id.clone(), address.clone());
        info!(instance = %id, %address, "leased static worker host");

        Ok(InstanceDescription {
            id,
            state: InstanceState::Running,
            address: Some(address),
        })
    }

    async fn terminate_instance(&self, id: &str) -> FleetResult<()> {
        let mut pool = self.pool.lock().expect("static pool lock");
        match pool.leased.remove(id) {
            Some(address) => {
                debug!(instance = %id, %address, "returned static worker host");
                pool.free.push_back(address);
                pool.released.insert(id.to_string());
                Ok(())
            }
            None if pool.released.contains(id) => Ok(()),
            None => Err(FleetError::UnknownInstance(id.to_string())),
        }
    }

    async fn describe_instance(&self, id: &str) -> FleetResult<InstanceDescription> {
        let pool = self.pool.lock().expect("static pool lock");
        if let Some(address) = pool.leased.get(id) {
            return Ok(InstanceDescription {
                id: id.to_string(),
                state: InstanceState::Running,
                address: Some(address.clone()),
            });
        }
        if pool.released.contains(id) {
            return Ok(InstanceDescription {
                id: id.to_string(),
                state: InstanceState::Terminated,
                address: None,
            });
        }
        Err(FleetError::UnknownInstance(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> StaticProvider {
        StaticProvider::new(vec!["10.0.0.1".into(), "10.0.0.2".into()])
    }

    #[tokio::test]
    async fn start_leases_hosts_in_order() {
        let p = provider();
        let a = p.start_instance().await.unwrap();
        let b = p.start_instance().await.unwrap();

        assert_eq!(a.address.as_deref(), Some("10.0.0.1"));
        assert_eq!(b.address.as_deref(), Some("10.0.0.2"));
        assert_ne!(a.id, b.id);
        assert_eq!(a.state, InstanceState::Running);
        assert_eq!(p.available(), 0);
    }

    #[tokio::test]
    async fn start_fails_when_pool_empty() {
        let p = StaticProvider::new(vec![]);
        let result = p.start_instance().await;
        assert!(matches!(result, Err(FleetError::CapacityExhausted)));
    }

    #[tokio::test]
    async fn terminate_returns_host_and_reports_terminated() {
        let p = provider();
        let a = p.start_instance().await.unwrap();
        p.terminate_instance(&a.id).await.unwrap();

        assert_eq!(p.available(), 2);
        let d = p.describe_instance(&a.id).await.unwrap();
        assert_eq!(d.state, InstanceState::Terminated);

        // Idempotent.
        p.terminate_instance(&a.id).await.unwrap();
        assert_eq!(p.available(), 2);
    }

    #[tokio::test]
    async fn unknown_instance_is_an_error() {
        let p = provider();
        assert!(matches!(
            p.describe_instance("i-404").await,
            Err(FleetError::UnknownInstance(_))
        ));
        assert!(matches!(
            p.terminate_instance("i-404").await,
            Err(FleetError::UnknownInstance(_))
        ));
    }

    #[tokio::test]
    async fn released_host_is_reused_with_new_id() {
        let p = StaticProvider::new(vec!["10.0.0.1".into()]);
        let a = p.start_instance().await.unwrap();
        p.terminate_instance(&a.id).await.unwrap();
        let b = p.start_instance().await.unwrap();

        assert_eq!(b.address, a.address);
        assert_ne!(b.id, a.id);
        assert_eq!(
            p.describe_instance(&b.id).await.unwrap().state,
            InstanceState::Running
        );
    }
}
