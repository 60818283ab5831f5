//! Typed custody-contract events and the topic table that recognises them.

use clearnode_core::{
    Address, Allocation, ChannelId, Intent, Signature, TxHash, UnsignedState, H256, U256,
};
use serde::{Serialize, Serializer};
use std::fmt;

use crate::abi::{self, EventSignature, ParamType, Token};
use crate::error::AbiError;
use crate::source::RawLog;

pub const CREATED_SIGNATURE: &str = "Created(bytes32,address,(address[],address,uint64,uint64),(uint8,uint256,bytes,(address,address,uint256)[],bytes[]))";
pub const CHALLENGED_SIGNATURE: &str =
    "Challenged(bytes32,(uint8,uint256,bytes,(address,address,uint256)[],bytes[]),uint256)";
pub const RESIZED_SIGNATURE: &str = "Resized(bytes32,int256[])";
pub const CLOSED_SIGNATURE: &str =
    "Closed(bytes32,(uint8,uint256,bytes,(address,address,uint256)[],bytes[]))";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Challenged,
    Resized,
    Closed,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Created,
        EventKind::Challenged,
        EventKind::Resized,
        EventKind::Closed,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Challenged => "Challenged",
            Self::Resized => "Resized",
            Self::Closed => "Closed",
        }
    }

    /// Leading parameters carried in topics rather than data.
    fn indexed(&self) -> usize {
        match self {
            Self::Created => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Channel parameters fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelParams {
    pub participants: Vec<Address>,
    pub adjudicator: Address,
    /// Challenge period in seconds.
    pub challenge: u64,
    pub nonce: u64,
}

/// A channel state as it appears on chain, signatures included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainState {
    pub intent: Intent,
    pub version: u64,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
    pub allocations: Vec<Allocation>,
    pub sigs: Vec<Signature>,
}

impl ChainState {
    pub fn unsigned(&self) -> UnsignedState {
        UnsignedState {
            intent: self.intent,
            version: self.version,
            data: self.data.clone(),
            allocations: self.allocations.clone(),
        }
    }

    pub fn from_unsigned(state: &UnsignedState, sigs: Vec<Signature>) -> Self {
        Self {
            intent: state.intent,
            version: state.version,
            data: state.data.clone(),
            allocations: state.allocations.clone(),
            sigs,
        }
    }
}

/// A decoded custody-contract event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CustodyEvent {
    Created {
        channel_id: ChannelId,
        wallet: Address,
        channel: ChannelParams,
        initial: ChainState,
    },
    Challenged {
        channel_id: ChannelId,
        state: ChainState,
        expiration: u64,
    },
    Resized {
        channel_id: ChannelId,
        #[serde(serialize_with = "signed_strings")]
        deltas: Vec<i128>,
    },
    Closed {
        channel_id: ChannelId,
        final_state: ChainState,
    },
}

fn signed_strings<S: Serializer>(values: &[i128], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(values.iter().map(|v| v.to_string()))
}

impl CustodyEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Created { .. } => EventKind::Created,
            Self::Challenged { .. } => EventKind::Challenged,
            Self::Resized { .. } => EventKind::Resized,
            Self::Closed { .. } => EventKind::Closed,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        match self {
            Self::Created { channel_id, .. }
            | Self::Challenged { channel_id, .. }
            | Self::Resized { channel_id, .. }
            | Self::Closed { channel_id, .. } => *channel_id,
        }
    }

    /// JSON snapshot stored with the processed-event record.
    pub fn snapshot(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Clone)]
struct EventDef {
    kind: EventKind,
    topic: H256,
    /// Types of the non-indexed parameters, in order.
    data_params: Vec<ParamType>,
}

/// Topic table and codec for the custody contract's events.
///
/// Built once at startup; construction fails if a signature does not parse
/// or two signatures share a topic.
#[derive(Debug, Clone)]
pub struct CustodyAbi {
    defs: [EventDef; 4],
}

impl CustodyAbi {
    pub fn new() -> Result<Self, AbiError> {
        Self::from_signatures([
            CREATED_SIGNATURE,
            CHALLENGED_SIGNATURE,
            RESIZED_SIGNATURE,
            CLOSED_SIGNATURE,
        ])
    }

    /// Build from signatures given in [`EventKind::ALL`] order.
    pub fn from_signatures(signatures: [&str; 4]) -> Result<Self, AbiError> {
        let mut defs = Vec::with_capacity(4);
        for (kind, raw) in EventKind::ALL.into_iter().zip(signatures) {
            let sig = EventSignature::parse(raw)?;
            if sig.name != kind.name() {
                return Err(AbiError::Signature {
                    signature: raw.to_string(),
                    reason: format!("expected event {kind}"),
                });
            }
            if sig.params.len() <= kind.indexed() {
                return Err(AbiError::Signature {
                    signature: raw.to_string(),
                    reason: "too few parameters".into(),
                });
            }
            let topic = sig.topic();
            if let Some(prev) = defs.iter().find(|d: &&EventDef| d.topic == topic) {
                return Err(AbiError::TopicCollision(prev.kind.to_string(), kind.to_string()));
            }
            defs.push(EventDef {
                kind,
                topic,
                data_params: sig.params[kind.indexed()..].to_vec(),
            });
        }
        let defs: [EventDef; 4] = defs
            .try_into()
            .map_err(|_| AbiError::Malformed("expected four event definitions".into()))?;
        tracing::debug!(
            created = ?defs[0].topic,
            challenged = ?defs[1].topic,
            resized = ?defs[2].topic,
            closed = ?defs[3].topic,
            "custody event topics"
        );
        Ok(Self { defs })
    }

    fn def(&self, kind: EventKind) -> &EventDef {
        &self.defs[kind as usize]
    }

    pub fn topic(&self, kind: EventKind) -> H256 {
        self.def(kind).topic
    }

    pub fn kind_of(&self, topic: &H256) -> Option<EventKind> {
        self.defs.iter().find(|d| d.topic == *topic).map(|d| d.kind)
    }

    /// Decode a log. `Ok(None)` means the first topic is not a custody event.
    pub fn decode(&self, log: &RawLog) -> Result<Option<CustodyEvent>, AbiError> {
        let topic0 = log.topics.first().ok_or(AbiError::MissingTopic(0))?;
        let Some(kind) = self.kind_of(topic0) else {
            return Ok(None);
        };
        let topic = |i: usize| log.topics.get(i).copied().ok_or(AbiError::MissingTopic(i));
        let channel_id = topic(1)?;
        let mut tokens = abi::decode(&self.def(kind).data_params, &log.data)?.into_iter();
        let mut next = || {
            tokens
                .next()
                .ok_or_else(|| AbiError::Malformed(format!("{kind}: missing parameter")))
        };

        let event = match kind {
            EventKind::Created => {
                let wallet_word = topic(2)?;
                if wallet_word.as_bytes()[..12].iter().any(|b| *b != 0) {
                    return Err(AbiError::Malformed("dirty wallet topic".into()));
                }
                CustodyEvent::Created {
                    channel_id,
                    wallet: Address::from_slice(&wallet_word.as_bytes()[12..]),
                    channel: decode_channel(next()?)?,
                    initial: decode_state(next()?)?,
                }
            }
            EventKind::Challenged => CustodyEvent::Challenged {
                channel_id,
                state: decode_state(next()?)?,
                expiration: next()?.into_u64("expiration")?,
            },
            EventKind::Resized => CustodyEvent::Resized {
                channel_id,
                deltas: next()?
                    .into_array()?
                    .into_iter()
                    .map(|t| t.into_i128("delta"))
                    .collect::<Result<_, _>>()?,
            },
            EventKind::Closed => CustodyEvent::Closed {
                channel_id,
                final_state: decode_state(next()?)?,
            },
        };
        Ok(Some(event))
    }

    /// Topics and data for `event`, as the contract would emit them.
    pub fn encode(&self, event: &CustodyEvent) -> (Vec<H256>, Vec<u8>) {
        let mut topics = vec![self.topic(event.kind()), event.channel_id()];
        let tokens = match event {
            CustodyEvent::Created {
                wallet,
                channel,
                initial,
                ..
            } => {
                topics.push(H256::from(*wallet));
                vec![
                    Token::Tuple(vec![
                        Token::Array(channel.participants.iter().copied().map(Token::Address).collect()),
                        Token::Address(channel.adjudicator),
                        Token::Uint(U256::from(channel.challenge)),
                        Token::Uint(U256::from(channel.nonce)),
                    ]),
                    state_token(initial),
                ]
            }
            CustodyEvent::Challenged {
                state, expiration, ..
            } => vec![state_token(state), Token::Uint(U256::from(*expiration))],
            CustodyEvent::Resized { deltas, .. } => vec![Token::Array(
                deltas
                    .iter()
                    .map(|d| Token::Int(abi::int_from_i128(*d)))
                    .collect(),
            )],
            CustodyEvent::Closed { final_state, .. } => vec![state_token(final_state)],
        };
        (topics, abi::encode(&tokens))
    }

    /// A complete log carrying `event`.
    pub fn encode_log(
        &self,
        event: &CustodyEvent,
        address: Address,
        block_number: u64,
        log_index: u64,
        tx_hash: TxHash,
    ) -> RawLog {
        let (topics, data) = self.encode(event);
        RawLog {
            block_number,
            log_index,
            tx_hash,
            address,
            topics,
            data,
        }
    }
}

fn decode_channel(token: Token) -> Result<ChannelParams, AbiError> {
    let mut members = token.into_tuple(4)?.into_iter();
    let mut next = || {
        members
            .next()
            .ok_or_else(|| AbiError::Malformed("channel: missing member".into()))
    };
    Ok(ChannelParams {
        participants: next()?
            .into_array()?
            .into_iter()
            .map(Token::into_address)
            .collect::<Result<_, _>>()?,
        adjudicator: next()?.into_address()?,
        challenge: next()?.into_u64("challenge")?,
        nonce: next()?.into_u64("nonce")?,
    })
}

fn decode_state(token: Token) -> Result<ChainState, AbiError> {
    let mut members = token.into_tuple(5)?.into_iter();
    let mut next = || {
        members
            .next()
            .ok_or_else(|| AbiError::Malformed("state: missing member".into()))
    };
    let raw_intent = next()?.into_u64("intent")?;
    let intent = u8::try_from(raw_intent)
        .ok()
        .and_then(|v| Intent::from_u8(v).ok())
        .ok_or_else(|| AbiError::Malformed(format!("unknown intent {raw_intent}")))?;
    let version = next()?.into_u64("version")?;
    let data = next()?.into_bytes()?;
    let allocations = next()?
        .into_array()?
        .into_iter()
        .map(decode_allocation)
        .collect::<Result<_, _>>()?;
    let sigs = next()?
        .into_array()?
        .into_iter()
        .map(|t| t.into_bytes().map(Signature))
        .collect::<Result<_, _>>()?;
    Ok(ChainState {
        intent,
        version,
        data,
        allocations,
        sigs,
    })
}

fn decode_allocation(token: Token) -> Result<Allocation, AbiError> {
    let mut members = token.into_tuple(3)?.into_iter();
    let mut next = || {
        members
            .next()
            .ok_or_else(|| AbiError::Malformed("allocation: missing member".into()))
    };
    Ok(Allocation {
        destination: next()?.into_address()?,
        token: next()?.into_address()?,
        amount: next()?.into_u128("allocation amount")?,
    })
}

fn state_token(state: &ChainState) -> Token {
    Token::Tuple(vec![
        Token::Uint(U256::from(state.intent.as_u8())),
        Token::Uint(U256::from(state.version)),
        Token::Bytes(state.data.clone()),
        Token::Array(
            state
                .allocations
                .iter()
                .map(|a| {
                    Token::Tuple(vec![
                        Token::Address(a.destination),
                        Token::Address(a.token),
                        Token::Uint(U256::from(a.amount)),
                    ])
                })
                .collect(),
        ),
        Token::Array(
            state
                .sigs
                .iter()
                .map(|s| Token::Bytes(s.as_bytes().to_vec()))
                .collect(),
        ),
    ])
}
