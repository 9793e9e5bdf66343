use thiserror::Error;

/// Categorizes errors for event reporting and recovery decisions.
///
/// This is a lightweight, cloneable representation of the error type
/// that can cross the worker boundary inside events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// WebSocket transport error
    WebSocket,
    /// Connect/hello/ready deadline elapsed
    Timeout,
    /// Malformed or unexpected frame
    Protocol,
    /// The gateway closed with a non-recoverable code
    Authentication,
    /// Send attempted before the shard reached Ready
    NotReady,
    /// The operation was cancelled by destroy()
    Destroyed,
    /// Worker thread or worker channel failure
    Worker,
    /// Reconnect retry budget exhausted
    ReconnectBudgetExhausted,
    /// Other error
    Other,
}

/// Errors that can occur in gateway-shard-manager
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A handshake phase did not complete in time
    #[error("Timed out waiting for {phase} after {waited_ms}ms")]
    Timeout { phase: &'static str, waited_ms: u64 },

    /// The gateway sent something we could not decode or did not expect
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The gateway closed with a code that forbids reconnecting
    #[error("Fatal gateway close code {code}")]
    Authentication { code: u16 },

    /// A non-allow-listed payload was sent before the shard was ready
    #[error("Shard {shard_id} is not ready to send opcode {op}")]
    NotReady { shard_id: u16, op: u8 },

    /// The shard was destroyed while the operation was in flight
    #[error("Shard {shard_id} was destroyed")]
    Destroyed { shard_id: u16 },

    /// A worker thread or its channel failed
    #[error("Worker failure: {0}")]
    Worker(String),

    /// Reconnection gave up after the configured number of attempts
    #[error("Shard {shard_id} exhausted its reconnect budget after {attempts} attempts")]
    ReconnectBudgetExhausted { shard_id: u16, attempts: u32 },

    /// Not enough identify sessions remaining to spawn the requested shards
    #[error("Not enough sessions remaining to spawn {required} shards; {remaining} left, resets in {reset_after_ms}ms")]
    SessionsExhausted {
        required: usize,
        remaining: u32,
        reset_after_ms: u64,
    },

    /// The metadata fetch callback failed
    #[error("Gateway metadata fetch failed: {0}")]
    MetadataFetch(String),

    /// An operation referenced a shard id this manager does not own
    #[error("Unknown shard id {0}")]
    UnknownShard(u16),

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// A shard failure reported across a task or worker boundary, carrying
    /// the kind of the originating error
    #[error("{message}")]
    Shard { kind: ErrorKind, message: String },
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Authentication { .. } => ErrorKind::Authentication,
            Error::NotReady { .. } => ErrorKind::NotReady,
            Error::Destroyed { .. } => ErrorKind::Destroyed,
            Error::Worker(_) => ErrorKind::Worker,
            Error::ReconnectBudgetExhausted { .. } => ErrorKind::ReconnectBudgetExhausted,
            Error::SessionsExhausted { .. }
            | Error::MetadataFetch(_)
            | Error::UnknownShard(_)
            | Error::ChannelSend(_) => ErrorKind::Other,
            Error::Shard { kind, .. } => *kind,
        }
    }

    /// Rebuild an error from the (kind, message) pair events carry across
    /// task and worker boundaries.
    pub(crate) fn from_reported(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error::Shard {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = Error::NotReady { shard_id: 3, op: 8 };
        assert_eq!(err.kind(), ErrorKind::NotReady);

        let err = Error::Authentication { code: 4004 };
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let err = Error::Timeout {
            phase: "hello",
            waited_ms: 500,
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_display_carries_context() {
        let err = Error::NotReady { shard_id: 7, op: 3 };
        let text = err.to_string();
        assert!(text.contains('7'));
        assert!(text.contains('3'));
    }
}
