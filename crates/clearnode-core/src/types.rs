use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use primitive_types::{H160, H256, U256};

use crate::error::CoreError;
use crate::state_machine::ChannelStatus;

/// 20-byte chain account address.
pub type Address = H160;
/// 32-byte channel identifier assigned by the custody contract.
pub type ChannelId = H256;
/// 32-byte transaction hash.
pub type TxHash = H256;

/// Serde helpers that keep 128-bit integers lossless in JSON by writing them
/// as decimal strings.
pub mod amount_str {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }

    pub mod signed {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(value: &i128, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&value.to_string())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<i128, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        }
    }
}

/// Raw signature bytes over a channel state.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "hex::serde")] pub Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

/// Purpose of a channel state, as encoded by the custody contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Operate,
    Initialize,
    Resize,
    Finalize,
}

impl Intent {
    pub fn from_u8(value: u8) -> Result<Self, CoreError> {
        match value {
            0 => Ok(Self::Operate),
            1 => Ok(Self::Initialize),
            2 => Ok(Self::Resize),
            3 => Ok(Self::Finalize),
            other => Err(CoreError::InvalidIntent(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Operate => 0,
            Self::Initialize => 1,
            Self::Resize => 2,
            Self::Finalize => 3,
        }
    }
}

/// How part of the channel funds is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Participant receiving the funds on settlement.
    pub destination: Address,
    /// Token contract address.
    pub token: Address,
    /// Amount in raw token units.
    #[serde(with = "amount_str")]
    pub amount: u128,
}

/// A channel state without signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedState {
    pub intent: Intent,
    pub version: u64,
    /// Application data carried with the state.
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
    pub allocations: Vec<Allocation>,
}

impl UnsignedState {
    /// Sum of all allocation amounts.
    pub fn total(&self) -> u128 {
        self.allocations
            .iter()
            .fold(0u128, |acc, a| acc.saturating_add(a.amount))
    }
}

/// An on-chain payment channel between a user and the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: ChannelId,
    /// Wallet that owns the channel (the unified-balance holder).
    pub wallet: Address,
    /// `[user signer, broker]`, in contract order.
    pub participants: [Address; 2],
    pub token: Address,
    pub chain_id: u64,
    pub nonce: u64,
    /// Challenge period in seconds.
    pub challenge_period: u64,
    pub adjudicator: Address,
    pub status: ChannelStatus,
    /// Total escrowed amount in raw token units.
    #[serde(with = "amount_str")]
    pub raw_amount: u128,
    pub version: u64,
    pub state: UnsignedState,
    pub user_signature: Option<Signature>,
    pub server_signature: Option<Signature>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    /// The user-side participant (the signer of off-chain states).
    pub fn participant(&self) -> Address {
        self.participants[0]
    }

    /// Whether both sides have signed the stored state.
    pub fn has_signed_state(&self) -> bool {
        self.user_signature.is_some() && self.server_signature.is_some()
    }

    pub fn clear_signatures(&mut self) {
        self.user_signature = None;
        self.server_signature = None;
    }
}

/// A ledger account. Balances are scoped further by asset symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AccountId {
    /// A wallet's unified, channel-independent balance.
    Wallet(Address),
    /// Escrow sub-account of a channel.
    Channel(ChannelId),
    /// Sub-account of an application session.
    AppSession(H256),
    /// Funds held by the custody contract on a chain.
    Custody { chain_id: u64 },
}

impl AccountId {
    /// Stable textual key; also the prefix under which ledger entries are stored.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Wallet(addr) => format!("wallet:{}", hex::encode(addr.as_bytes())),
            Self::Channel(id) => format!("channel:{}", hex::encode(id.as_bytes())),
            Self::AppSession(id) => format!("app:{}", hex::encode(id.as_bytes())),
            Self::Custody { chain_id } => format!("custody:{chain_id}"),
        }
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// A token on a specific chain, known to the ledger by symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub chain_id: u64,
    pub token: Address,
    pub decimals: u8,
}

/// Convert an unsigned raw amount into a signed ledger delta.
pub fn to_signed(raw: u128) -> Result<i128, CoreError> {
    i128::try_from(raw).map_err(|_| CoreError::AmountOutOfRange(raw.to_string()))
}

/// Render raw token units as a decimal string, trimming trailing zeros.
///
/// `format_units(1_500_000, 6)` is `"1.5"`; `format_units(-2_000_000, 6)` is `"-2"`.
pub fn format_units(raw: i128, decimals: u8) -> String {
    let sign = if raw < 0 { "-" } else { "" };
    let digits = raw.unsigned_abs().to_string();
    let decimals = decimals as usize;

    if decimals == 0 {
        return format!("{sign}{digits}");
    }

    let padded = format!("{digits:0>width$}", width = decimals + 1);
    let (int_part, frac_part) = padded.split_at(padded.len() - decimals);
    let frac_part = frac_part.trim_end_matches('0');

    if frac_part.is_empty() {
        format!("{sign}{int_part}")
    } else {
        format!("{sign}{int_part}.{frac_part}")
    }
}
