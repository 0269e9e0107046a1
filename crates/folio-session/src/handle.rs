//! A cloneable handle identifying one in-flight turn.

use tokio_util::sync::CancellationToken;

/// A cloneable handle identifying one in-flight turn.
///
/// Updates and terminal triggers sent through a handle whose turn has been
/// superseded or already completed are ignored by the conversation's actor.
#[derive(Debug, Clone)]
pub struct TurnHandle {
    pub(crate) conversation_id: String,
    pub(crate) turn: u64,
    pub(crate) cancel: CancellationToken,
}

impl TurnHandle {
    pub(crate) fn new(conversation_id: impl Into<String>, turn: u64) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            turn,
            cancel: CancellationToken::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Turn number, increasing across every turn this process starts
    pub fn turn_id(&self) -> u64 {
        self.turn
    }

    /// Token the producer watches; fired on stop, error, or supersession.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the turn is cancelled or completed.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
