//! Channel registry: persisted channels, the open-channel index, and the
//! signer-to-wallet index.

use chrono::{DateTime, Utc};
use clearnode_core::types::amount_str;
use clearnode_core::{
    Address, Allocation, Channel, ChannelId, ChannelStatus, Intent, Signature, UnsignedState,
};
use serde::{Deserialize, Serialize};

use crate::backend::Table;
use crate::error::StoreError;
use crate::tx::StoreTx;

/// Schema version written with every stored state.
pub const STATE_SCHEMA_VERSION: u16 = 1;

/// Persisted form of [`UnsignedState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub schema_version: u16,
    pub intent: Intent,
    pub version: u64,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
    pub allocations: Vec<Allocation>,
}

impl StateRecord {
    pub fn from_state(state: &UnsignedState) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            intent: state.intent,
            version: state.version,
            data: state.data.clone(),
            allocations: state.allocations.clone(),
        }
    }

    pub fn into_state(self) -> Result<UnsignedState, StoreError> {
        if self.schema_version != STATE_SCHEMA_VERSION {
            return Err(StoreError::Schema {
                found: self.schema_version,
                expected: STATE_SCHEMA_VERSION,
            });
        }
        Ok(UnsignedState {
            intent: self.intent,
            version: self.version,
            data: self.data,
            allocations: self.allocations,
        })
    }
}

/// Persisted form of [`Channel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelRow {
    channel_id: ChannelId,
    wallet: Address,
    participants: [Address; 2],
    token: Address,
    chain_id: u64,
    nonce: u64,
    challenge_period: u64,
    adjudicator: Address,
    status: ChannelStatus,
    #[serde(with = "amount_str")]
    raw_amount: u128,
    version: u64,
    state: StateRecord,
    user_signature: Option<Signature>,
    server_signature: Option<Signature>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&Channel> for ChannelRow {
    fn from(c: &Channel) -> Self {
        Self {
            channel_id: c.channel_id,
            wallet: c.wallet,
            participants: c.participants,
            token: c.token,
            chain_id: c.chain_id,
            nonce: c.nonce,
            challenge_period: c.challenge_period,
            adjudicator: c.adjudicator,
            status: c.status,
            raw_amount: c.raw_amount,
            version: c.version,
            state: StateRecord::from_state(&c.state),
            user_signature: c.user_signature.clone(),
            server_signature: c.server_signature.clone(),
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

impl TryFrom<ChannelRow> for Channel {
    type Error = StoreError;

    fn try_from(row: ChannelRow) -> Result<Self, Self::Error> {
        Ok(Channel {
            channel_id: row.channel_id,
            wallet: row.wallet,
            participants: row.participants,
            token: row.token,
            chain_id: row.chain_id,
            nonce: row.nonce,
            challenge_period: row.challenge_period,
            adjudicator: row.adjudicator,
            status: row.status,
            raw_amount: row.raw_amount,
            version: row.version,
            state: row.state.into_state()?,
            user_signature: row.user_signature,
            server_signature: row.server_signature,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn channel_key(id: &ChannelId) -> String {
    hex::encode(id.as_bytes())
}

fn open_key(wallet: &Address, token: &Address, chain_id: u64) -> String {
    format!(
        "{}:{}:{}",
        hex::encode(wallet.as_bytes()),
        hex::encode(token.as_bytes()),
        chain_id
    )
}

fn wallet_prefix(wallet: &Address) -> String {
    format!("{}:", hex::encode(wallet.as_bytes()))
}

/// Channel table access within a transaction.
pub struct ChannelRegistry<'t, 'a> {
    tx: &'t mut StoreTx<'a>,
}

impl<'t, 'a> ChannelRegistry<'t, 'a> {
    pub(crate) fn new(tx: &'t mut StoreTx<'a>) -> Self {
        Self { tx }
    }

    pub fn get(&self, id: &ChannelId) -> Result<Option<Channel>, StoreError> {
        match self
            .tx
            .get_json::<ChannelRow>(Table::Channels, channel_key(id).as_bytes())?
        {
            Some(row) => Ok(Some(Channel::try_from(row)?)),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but absence is an error.
    pub fn require(&self, id: &ChannelId) -> Result<Channel, StoreError> {
        self.get(id)?
            .ok_or_else(|| StoreError::NotFound(format!("channel {id:?}")))
    }

    /// Insert a new channel and index it by wallet.
    pub fn insert(&mut self, channel: &Channel) -> Result<(), StoreError> {
        let key = channel_key(&channel.channel_id);
        self.tx
            .put_json(Table::Channels, key.as_bytes(), &ChannelRow::from(channel))?;
        let index = format!("{}{}", wallet_prefix(&channel.wallet), key);
        self.tx.put(Table::WalletChannels, index.as_bytes(), Vec::new());
        self.sync_open_index(channel);
        Ok(())
    }

    /// Overwrite a stored channel, keeping the open-channel index in step with its status.
    pub fn update(&mut self, channel: &Channel) -> Result<(), StoreError> {
        let key = channel_key(&channel.channel_id);
        if self.tx.get(Table::Channels, key.as_bytes())?.is_none() {
            return Err(StoreError::NotFound(format!("channel {:?}", channel.channel_id)));
        }
        self.tx
            .put_json(Table::Channels, key.as_bytes(), &ChannelRow::from(channel))?;
        self.sync_open_index(channel);
        Ok(())
    }

    fn sync_open_index(&mut self, channel: &Channel) {
        let key = open_key(&channel.wallet, &channel.token, channel.chain_id);
        if channel.status.is_final() {
            self.tx.delete(Table::OpenChannels, key.as_bytes());
        } else {
            self.tx.put(
                Table::OpenChannels,
                key.as_bytes(),
                channel_key(&channel.channel_id).into_bytes(),
            );
        }
    }

    /// The non-closed channel of `wallet` for `token` on `chain_id`, if any.
    pub fn find_open(
        &self,
        wallet: &Address,
        token: &Address,
        chain_id: u64,
    ) -> Result<Option<Channel>, StoreError> {
        let key = open_key(wallet, token, chain_id);
        let Some(id_hex) = self.tx.get(Table::OpenChannels, key.as_bytes())? else {
            return Ok(None);
        };
        match self.tx.get_json::<ChannelRow>(Table::Channels, &id_hex)? {
            Some(row) => Ok(Some(Channel::try_from(row)?)),
            None => Ok(None),
        }
    }

    /// All channels of a wallet, ordered by channel id.
    pub fn list_by_wallet(&self, wallet: &Address) -> Result<Vec<Channel>, StoreError> {
        let prefix = wallet_prefix(wallet);
        let mut channels = Vec::new();
        for (key, _) in self.tx.scan_prefix(Table::WalletChannels, prefix.as_bytes())? {
            let id_hex = &key[prefix.len()..];
            if let Some(row) = self.tx.get_json::<ChannelRow>(Table::Channels, id_hex)? {
                channels.push(Channel::try_from(row)?);
            }
        }
        Ok(channels)
    }

    /// Store a state signed by both sides.
    ///
    /// Refuses a state older than the stored version; the channel version
    /// never decreases.
    pub fn record_signed_state(
        &mut self,
        id: &ChannelId,
        state: UnsignedState,
        user_signature: Signature,
        server_signature: Signature,
    ) -> Result<Channel, StoreError> {
        let mut channel = self.require(id)?;
        if state.version < channel.version {
            return Err(StoreError::StaleVersion {
                stored: channel.version,
                offered: state.version,
            });
        }
        channel.version = state.version;
        channel.state = state;
        channel.user_signature = Some(user_signature);
        channel.server_signature = Some(server_signature);
        channel.updated_at = Utc::now();
        self.update(&channel)?;
        Ok(channel)
    }

    /// Remember which wallet a channel signer acts for.
    pub fn put_signer(&mut self, signer: &Address, wallet: &Address) -> Result<(), StoreError> {
        self.tx
            .put_json(Table::Signers, hex::encode(signer.as_bytes()).as_bytes(), wallet)
    }

    pub fn wallet_for_signer(&self, signer: &Address) -> Result<Option<Address>, StoreError> {
        self.tx
            .get_json(Table::Signers, hex::encode(signer.as_bytes()).as_bytes())
    }
}
