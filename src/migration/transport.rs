//! Transport contract for migration operations.
//!
//! The coordinator only sees [`MigrationTransport`]. [`ChannelTransport`]
//! adapts a plain frame pipe owned by the networking layer: outbound frames
//! go into an mpsc sender, inbound frames are handed to
//! [`ChannelTransport::handle_frame`], and responses are correlated with
//! their requests by id.

use crate::error::{Error, Result};
use crate::migration::operation::{MigrationOperation, TransferOutcome};
use crate::migration::receiver::MigrationReceiver;
use crate::types::NodeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Asynchronous request/response channel to remote members.
///
/// Delivery is at-least-once and may duplicate. `Err` means a hard failure
/// (peer unreachable, channel closed); a missing answer is
/// `Ok(TransferOutcome::Timeout)`.
#[async_trait::async_trait]
pub trait MigrationTransport: Send + Sync + std::fmt::Debug {
    /// Send a composite operation to `destination` and wait for its outcome.
    async fn send_migration_operation(
        &self,
        destination: NodeId,
        operation: MigrationOperation,
    ) -> Result<TransferOutcome>;
}

/// Message carried by a [`MigrationFrame`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationMessage {
    Request {
        request_id: u64,
        operation: MigrationOperation,
    },
    Response {
        request_id: u64,
        outcome: TransferOutcome,
    },
}

/// Addressed migration message exchanged with the networking layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationFrame {
    pub source: NodeId,
    pub destination: NodeId,
    pub message: MigrationMessage,
}

impl MigrationFrame {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Removes a pending request however the send ends, including when the
/// caller drops the future.
struct PendingRequest<'a> {
    pending: &'a RwLock<HashMap<u64, oneshot::Sender<TransferOutcome>>>,
    request_id: u64,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.pending.write().remove(&self.request_id);
    }
}

/// [`MigrationTransport`] over an external frame pipe.
#[derive(Debug)]
pub struct ChannelTransport {
    /// This node's ID.
    node_id: NodeId,
    /// Frames to be delivered by the networking layer.
    outbound: mpsc::UnboundedSender<MigrationFrame>,
    /// Requests awaiting a response.
    pending: RwLock<HashMap<u64, oneshot::Sender<TransferOutcome>>>,
    /// Request ID counter.
    next_request_id: AtomicU64,
    /// How long to wait for a response.
    request_timeout: Duration,
}

impl ChannelTransport {
    /// Create a transport writing frames to `outbound`.
    pub fn new(
        node_id: NodeId,
        outbound: mpsc::UnboundedSender<MigrationFrame>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            outbound,
            pending: RwLock::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            request_timeout,
        }
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.read().len()
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Handle a frame received from the network.
    ///
    /// Requests are applied through `receiver` and answered with a response
    /// frame, which the caller must send back. Responses complete the matching
    /// pending request.
    pub async fn handle_frame(
        &self,
        frame: MigrationFrame,
        receiver: &MigrationReceiver,
    ) -> Option<MigrationFrame> {
        if frame.destination != self.node_id {
            tracing::warn!(
                node_id = self.node_id,
                destination = frame.destination,
                "Dropping migration frame addressed to another node"
            );
            return None;
        }

        match frame.message {
            MigrationMessage::Request {
                request_id,
                operation,
            } => {
                let outcome = receiver.handle(operation).await;
                Some(MigrationFrame {
                    source: self.node_id,
                    destination: frame.source,
                    message: MigrationMessage::Response {
                        request_id,
                        outcome,
                    },
                })
            }
            MigrationMessage::Response {
                request_id,
                outcome,
            } => {
                match self.pending.write().remove(&request_id) {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => {
                        tracing::debug!(request_id, "Late or duplicate migration response");
                    }
                }
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl MigrationTransport for ChannelTransport {
    async fn send_migration_operation(
        &self,
        destination: NodeId,
        operation: MigrationOperation,
    ) -> Result<TransferOutcome> {
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();

        self.pending.write().insert(request_id, tx);
        let _pending = PendingRequest {
            pending: &self.pending,
            request_id,
        };

        let frame = MigrationFrame {
            source: self.node_id,
            destination,
            message: MigrationMessage::Request {
                request_id,
                operation,
            },
        };
        if self.outbound.send(frame).is_err() {
            return Err(Error::Transport("outbound channel closed".to_string()));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Error::Transport("response channel closed".to_string())),
            Err(_) => Ok(TransferOutcome::Timeout),
        }
    }
}
