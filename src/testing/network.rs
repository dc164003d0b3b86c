//! In-process network for migration tests.
//!
//! Routes migration operations straight to the destination's receiver and
//! can inject faults per destination.

use crate::error::{Error, Result};
use crate::migration::{MigrationOperation, MigrationReceiver, MigrationTransport, TransferOutcome};
use crate::types::NodeId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Fault injected on the way to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Answer `Timeout` without delivering.
    Timeout,
    /// Deliver, apply, then lose the response.
    DropResponse,
    /// Deliver the same operation twice.
    Duplicate,
    /// Refuse without delivering.
    Nack(String),
    /// Hard transport failure.
    Unreachable,
    /// Wait before delivering.
    Delay(Duration),
}

#[derive(Debug, Clone)]
struct FaultPlan {
    fault: Fault,
    /// Remaining operations affected; `None` means every operation.
    remaining: Option<u32>,
}

/// In-process message router between test nodes.
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    receivers: RwLock<HashMap<NodeId, Arc<MigrationReceiver>>>,
    faults: Mutex<HashMap<NodeId, FaultPlan>>,
    sent: Mutex<Vec<(NodeId, MigrationOperation)>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `node` reachable.
    pub fn register(&self, node: NodeId, receiver: Arc<MigrationReceiver>) {
        self.receivers.write().insert(node, receiver);
    }

    /// Transport used by `node` to reach the others.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            node_id: node,
            network: Arc::clone(self),
        })
    }

    /// Inject `fault` on every operation sent to `destination`.
    pub fn set_fault(&self, destination: NodeId, fault: Fault) {
        self.faults.lock().insert(
            destination,
            FaultPlan {
                fault,
                remaining: None,
            },
        );
    }

    /// Inject `fault` on the next `count` operations sent to `destination`.
    pub fn set_fault_times(&self, destination: NodeId, fault: Fault, count: u32) {
        self.faults.lock().insert(
            destination,
            FaultPlan {
                fault,
                remaining: Some(count),
            },
        );
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Operations sent to `destination`, in order.
    pub fn sent_to(&self, destination: NodeId) -> Vec<MigrationOperation> {
        self.sent
            .lock()
            .iter()
            .filter(|(d, _)| *d == destination)
            .map(|(_, op)| op.clone())
            .collect()
    }

    fn take_fault(&self, destination: NodeId) -> Option<Fault> {
        let mut faults = self.faults.lock();
        let plan = faults.get_mut(&destination)?;
        let fault = plan.fault.clone();
        match &mut plan.remaining {
            None => {}
            Some(0) => {
                faults.remove(&destination);
                return None;
            }
            Some(n) => {
                *n -= 1;
                if *n == 0 {
                    faults.remove(&destination);
                }
            }
        }
        Some(fault)
    }

    async fn deliver(&self, destination: NodeId, operation: MigrationOperation) -> Result<TransferOutcome> {
        let receiver = self
            .receivers
            .read()
            .get(&destination)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("node {} unreachable", destination)))?;
        Ok(receiver.handle(operation).await)
    }
}

/// [`MigrationTransport`] backed by a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackTransport {
    node_id: NodeId,
    network: Arc<LoopbackNetwork>,
}

impl LoopbackTransport {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

#[async_trait::async_trait]
impl MigrationTransport for LoopbackTransport {
    async fn send_migration_operation(
        &self,
        destination: NodeId,
        operation: MigrationOperation,
    ) -> Result<TransferOutcome> {
        self.network
            .sent
            .lock()
            .push((destination, operation.clone()));

        match self.network.take_fault(destination) {
            None => self.network.deliver(destination, operation).await,
            Some(Fault::Timeout) => Ok(TransferOutcome::Timeout),
            Some(Fault::Nack(reason)) => Ok(TransferOutcome::Nack(reason)),
            Some(Fault::Unreachable) => Err(Error::Transport(format!(
                "node {} unreachable",
                destination
            ))),
            Some(Fault::DropResponse) => {
                self.network.deliver(destination, operation).await?;
                Ok(TransferOutcome::Timeout)
            }
            Some(Fault::Duplicate) => {
                self.network
                    .deliver(destination, operation.clone())
                    .await?;
                self.network.deliver(destination, operation).await
            }
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                self.network.deliver(destination, operation).await
            }
        }
    }
}
