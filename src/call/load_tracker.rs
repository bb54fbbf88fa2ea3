//! In-flight request accounting per `(service, node)`.
//!
//! The count table is owned by a single actor task; every read and write is a
//! message on one queue, so "pick the least-loaded node and bump it" can never
//! interleave with another caller's update. Callers hold a cheap, cloneable
//! [`LoadTracker`] handle.

use std::{collections::HashMap, sync::Arc};

use snafu::{OptionExt, Snafu};
use tokio::sync::{mpsc, oneshot};

use super::internal_event::InFlightGauge;
use crate::config::NodeDirectory;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TrackerError {
    #[snafu(display("no nodes available for service {}", service))]
    NoNodes { service: String },

    #[snafu(display("load tracker has shut down"))]
    Closed,
}

/// One replica of a service as seen at selection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub address: String,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    Increment,
    Decrement,
}

enum Command {
    Select {
        service: String,
        reply: oneshot::Sender<Result<Node, TrackerError>>,
    },
    Acquire {
        service: String,
        reply: oneshot::Sender<Result<Node, TrackerError>>,
    },
    Adjust {
        service: String,
        index: usize,
        delta: Delta,
    },
    Snapshot {
        service: String,
        reply: oneshot::Sender<Vec<usize>>,
    },
}

/// Handle to the load-tracking actor.
#[derive(Clone, Debug)]
pub struct LoadTracker {
    tx: mpsc::UnboundedSender<Command>,
}

impl LoadTracker {
    /// Spawns the actor on the current tokio runtime. It stops once every
    /// handle and lease has been dropped.
    pub fn spawn(directory: Arc<dyn NodeDirectory>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(TrackerActor::new(directory).run(rx));
        Self { tx }
    }

    /// Least-loaded node of `service`; ties go to the lowest index.
    pub async fn select(&self, service: &str) -> Result<Node, TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Select {
            service: service.to_owned(),
            reply,
        })?;
        rx.await.map_err(|_| TrackerError::Closed)?
    }

    /// Selects the least-loaded node and counts one call against it in the
    /// same step. The count is released when the lease drops.
    pub async fn acquire(&self, service: &str) -> Result<NodeLease, TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Acquire {
            service: service.to_owned(),
            reply,
        })?;
        let node = rx.await.map_err(|_| TrackerError::Closed)??;
        Ok(NodeLease {
            tracker: self.clone(),
            service: service.to_owned(),
            node,
        })
    }

    /// Counts one call against an already selected node until the lease drops.
    pub fn lease(&self, service: &str, node: Node) -> NodeLease {
        self.adjust(service, node.index, Delta::Increment);
        NodeLease {
            tracker: self.clone(),
            service: service.to_owned(),
            node,
        }
    }

    /// Fire-and-forget count update. Decrements never go below zero.
    pub fn adjust(&self, service: &str, index: usize, delta: Delta) {
        let sent = self.send(Command::Adjust {
            service: service.to_owned(),
            index,
            delta,
        });
        if sent.is_err() {
            debug!(service, index, ?delta, "Load tracker gone; dropping adjustment");
        }
    }

    /// Current in-flight counts of `service`, indexed by node.
    pub async fn snapshot(&self, service: &str) -> Result<Vec<usize>, TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot {
            service: service.to_owned(),
            reply,
        })?;
        rx.await.map_err(|_| TrackerError::Closed)
    }

    fn send(&self, command: Command) -> Result<(), TrackerError> {
        self.tx.send(command).ok().context(ClosedSnafu)
    }
}

/// One counted call on a node. Dropping it decrements the node's count, on
/// every exit path including unwinding and cancellation.
#[derive(Debug)]
pub struct NodeLease {
    tracker: LoadTracker,
    service: String,
    node: Node,
}

impl NodeLease {
    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.tracker
            .adjust(&self.service, self.node.index, Delta::Decrement);
    }
}

struct TrackerActor {
    directory: Arc<dyn NodeDirectory>,
    counts: HashMap<String, Vec<usize>>,
}

impl TrackerActor {
    fn new(directory: Arc<dyn NodeDirectory>) -> Self {
        Self {
            directory,
            counts: HashMap::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Select { service, reply } => {
                    let _ = reply.send(self.select(&service));
                }
                Command::Acquire { service, reply } => {
                    let picked = self.select(&service);
                    if let Ok(node) = &picked {
                        self.apply(&service, node.index, Delta::Increment);
                    }
                    let _ = reply.send(picked);
                }
                Command::Adjust {
                    service,
                    index,
                    delta,
                } => self.apply(&service, index, delta),
                Command::Snapshot { service, reply } => {
                    let _ = reply.send(self.counts.get(&service).cloned().unwrap_or_default());
                }
            }
        }
        debug!("Load tracker stopped");
    }

    fn select(&mut self, service: &str) -> Result<Node, TrackerError> {
        let addresses = self.directory.nodes(service);
        if addresses.is_empty() {
            return NoNodesSnafu { service }.fail();
        }

        let counts = self.counts.entry(service.to_owned()).or_default();
        if counts.len() < addresses.len() {
            counts.resize(addresses.len(), 0);
        }

        // `min_by_key` keeps the first minimum, i.e. the lowest index.
        let (index, _) = counts[..addresses.len()]
            .iter()
            .enumerate()
            .min_by_key(|(_, count)| **count)
            .context(NoNodesSnafu { service })?;

        Ok(Node {
            address: addresses[index].clone(),
            index,
        })
    }

    fn apply(&mut self, service: &str, index: usize, delta: Delta) {
        let counts = self.counts.entry(service.to_owned()).or_default();
        if counts.len() <= index {
            counts.resize(index + 1, 0);
        }
        let count = &mut counts[index];
        *count = match delta {
            Delta::Increment => count.saturating_add(1),
            Delta::Decrement => count.saturating_sub(1),
        };
        InFlightGauge { service, node: index }.emit(*count);
    }
}
