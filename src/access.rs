//! Authorisation collaborator — the exchange shape, not the cryptography.
//!
//! The captain authenticates to a freshly connected home hub through an
//! [`Authorizer`]. Only the operation shape matters here: `authorize`
//! starts the exchange on the given terminal and hands back an
//! [`AuthOperation`] whose `ended` signal resolves with the final word.
//! An explicit ack means success; anything else is a failure.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::FlowError;
use crate::terminal::Terminal;

/// A running authorisation exchange.
pub struct AuthOperation {
    /// Resolves once the exchange is over. [`FlowError::is_ok`] on the
    /// value distinguishes acknowledged success from failure.
    pub ended: oneshot::Receiver<FlowError>,
}

impl AuthOperation {
    /// Pair an operation with the sender that completes it. Useful for
    /// implementations and test stubs.
    pub fn pending() -> (oneshot::Sender<FlowError>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { ended: rx })
    }
}

/// Starts authorisation exchanges over terminals.
pub trait Authorizer: Send + Sync {
    /// Begin authenticating over `terminal`. Fails early when the exchange
    /// cannot even start.
    fn authorize_to_terminal(&self, terminal: &Arc<Terminal>) -> Result<AuthOperation, FlowError>;
}
