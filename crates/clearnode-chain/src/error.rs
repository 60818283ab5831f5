//! Error types for the chain layer.

use clearnode_core::H256;

/// ABI parsing, decoding and encoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    /// An event or type signature could not be parsed.
    #[error("invalid signature `{signature}`: {reason}")]
    Signature { signature: String, reason: String },

    /// Two event signatures hash to the same topic.
    #[error("topic collision between {0} and {1}")]
    TopicCollision(String, String),

    /// The log carries no topic at the given position.
    #[error("missing topic {0}")]
    MissingTopic(usize),

    /// Read past the end of the data.
    #[error("data truncated: need {needed} bytes at offset {offset}, have {len}")]
    Truncated {
        offset: usize,
        needed: usize,
        len: usize,
    },

    /// A value does not fit the type it was declared as.
    #[error("value out of range for {0}")]
    OutOfRange(String),

    /// Structurally valid words with invalid content.
    #[error("malformed data: {0}")]
    Malformed(String),
}

/// Errors talking to a chain.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("abi error: {0}")]
    Abi(#[from] AbiError),

    /// JSON-RPC level error returned by the node.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// HTTP transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Response that does not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("no registry entry for chain {0}")]
    UnknownChain(u64),

    /// The submitter rejected or failed to land a transaction.
    #[error("submission failed: {0}")]
    Submission(String),

    #[error("unexpected topic {0:?}")]
    UnexpectedTopic(H256),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        ChainError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChainError::Rpc {
            code: -32000,
            message: "header not found".into(),
        };
        assert_eq!(err.to_string(), "rpc error -32000: header not found");

        let err = AbiError::Truncated {
            offset: 64,
            needed: 32,
            len: 80,
        };
        assert_eq!(
            err.to_string(),
            "data truncated: need 32 bytes at offset 64, have 80"
        );
    }

    #[test]
    fn test_abi_error_conversion() {
        let err: ChainError = AbiError::MissingTopic(0).into();
        assert!(matches!(err, ChainError::Abi(AbiError::MissingTopic(0))));
        assert_eq!(err.to_string(), "abi error: missing topic 0");
    }
}
