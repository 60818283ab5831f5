use std::fmt;

use crate::error::CoreError;

/// Lifecycle status of a payment channel as mirrored from the custody contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Funded and operating off-chain.
    Open,
    /// A dispute is running on-chain; a checkpoint may still defend the channel.
    Challenged,
    /// Settled on-chain. Final state.
    Closed,
}

impl ChannelStatus {
    /// Whether this is a final (terminal) state.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Challenged => write!(f, "challenged"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// On-chain lifecycle events that move a channel between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Challenged,
    /// A newer signed state was accepted on chain, ending any running dispute.
    Checkpointed,
    Resized,
    Closed,
}

/// Channel status transitions.
///
/// Valid transitions:
/// - Open → Challenged (Challenged)
/// - Challenged → Challenged (Challenged, a newer dispute replaces the old one)
/// - Challenged → Open (Checkpointed)
/// - Open → Open (Checkpointed)
/// - Open → Open (Resized)
/// - Challenged → Open (Resized, the contract only resizes an active channel)
/// - Open → Closed (Closed)
/// - Challenged → Closed (Closed)
pub struct ChannelStateMachine;

impl ChannelStateMachine {
    /// Returns the status reached by applying `event`, or an error for a
    /// transition the custody contract cannot produce.
    pub fn transition(current: ChannelStatus, event: ChannelEvent) -> Result<ChannelStatus, CoreError> {
        let next = match (current, event) {
            (ChannelStatus::Open, ChannelEvent::Challenged) => ChannelStatus::Challenged,
            (ChannelStatus::Challenged, ChannelEvent::Challenged) => ChannelStatus::Challenged,

            (ChannelStatus::Challenged, ChannelEvent::Checkpointed) => ChannelStatus::Open,
            (ChannelStatus::Open, ChannelEvent::Checkpointed) => ChannelStatus::Open,

            (ChannelStatus::Open, ChannelEvent::Resized) => ChannelStatus::Open,
            (ChannelStatus::Challenged, ChannelEvent::Resized) => ChannelStatus::Open,

            (ChannelStatus::Open, ChannelEvent::Closed) => ChannelStatus::Closed,
            (ChannelStatus::Challenged, ChannelEvent::Closed) => ChannelStatus::Closed,

            _ => {
                return Err(CoreError::InvalidStateTransition {
                    from: current,
                    event,
                })
            }
        };

        tracing::debug!(from = %current, to = %next, event = ?event, "channel status transition");
        Ok(next)
    }

    /// Check if a transition is valid without performing it.
    pub fn can_transition(current: ChannelStatus, event: ChannelEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
