use async_trait::async_trait;
use clearnode_core::{ChannelId, Signature, TxHash, UnsignedState};

use crate::error::ChainError;

/// Signs and broadcasts custody-contract transactions.
///
/// Fee policy (gas price, multipliers) belongs to the implementation.
#[async_trait]
pub trait ChainSubmitter: Send + Sync {
    /// Submit `state`, signed by both parties, to defend `channel_id` in a dispute.
    async fn checkpoint(
        &self,
        channel_id: ChannelId,
        state: &UnsignedState,
        user_signature: &Signature,
        server_signature: &Signature,
        proofs: &[UnsignedState],
    ) -> Result<TxHash, ChainError>;
}
