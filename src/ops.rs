//! Controller operations — request/response exchanges on flow 0.
//!
//! The controller terminal of every crane speaks a small JSON protocol:
//! tagged [`ControllerOp`] envelopes with an op id. Requests are answered by
//! the crane's controller task; responses complete a pending operation
//! registered under the id. Today the protocol carries one operation,
//! the gossip query used to bootstrap and refresh the navigator map.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::FlowError;
use crate::navigator::PinState;

/// A hub as announced over gossip. Enough to seed a pin; richer intel
/// arrives through other channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubAnnouncement {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub latitude_v4: Option<f64>,
    #[serde(default)]
    pub longitude_v4: Option<f64>,
    #[serde(default)]
    pub latitude_v6: Option<f64>,
    #[serde(default)]
    pub longitude_v6: Option<f64>,
    /// Pin state bits the announcer claims for this hub.
    #[serde(default)]
    pub states: u32,
    #[serde(default)]
    pub verified_owner: Option<String>,
}

impl HubAnnouncement {
    pub fn pin_state(&self) -> PinState {
        PinState::from_bits_truncate(self.states)
    }
}

/// The controller wire protocol. One JSON object per controller Data frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ControllerOp {
    /// Ask the peer for the hubs it knows.
    #[serde(rename = "gossip_query")]
    GossipQuery { id: u64 },

    /// Answer to a gossip query.
    #[serde(rename = "gossip_hubs")]
    GossipHubs {
        id: u64,
        hubs: Vec<HubAnnouncement>,
    },

    /// Failure answer to any request.
    #[serde(rename = "op_error")]
    OpError { id: u64, message: String },
}

impl ControllerOp {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Source of hub announcements for answering gossip queries. Hubs wire this
/// to their map; client cranes leave it unset and answer with nothing.
pub trait GossipSource: Send + Sync {
    fn announced_hubs(&self) -> Vec<HubAnnouncement>;
}

/// A pending gossip query on a crane controller.
pub struct GossipQueryOp {
    pub(crate) done: oneshot::Receiver<Result<Vec<HubAnnouncement>, FlowError>>,
}

impl GossipQueryOp {
    /// Wait for the peer's answer. A crane that goes away first resolves
    /// to `Stopping`.
    pub async fn wait(self) -> Result<Vec<HubAnnouncement>, FlowError> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(FlowError::stopping().wrap("crane ended before gossip reply")),
        }
    }
}
