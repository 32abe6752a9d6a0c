use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Failures of the WebSocket session. All of them end the session and hand
/// control back to the reconnect supervisor.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("websocket send failed: {0}")]
    Send(#[source] tungstenite::Error),

    #[error("websocket receive failed: {0}")]
    Receive(#[source] tungstenite::Error),

    #[error("subscription to {channel} was rejected")]
    SubscriptionRejected { channel: String },

    #[error("no answer to the {channel} subscription after {waited:?}")]
    SubscribeTimeout { channel: String, waited: Duration },

    #[error("server closed the connection{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Closed { reason: Option<String> },

    #[error("subscribe before listening")]
    NotSubscribed,
}

impl TransportError {
    /// True when the server refused the connection outright (nothing listening).
    pub fn is_refused(&self) -> bool {
        match self {
            TransportError::Connect(tungstenite::Error::Io(err)) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("cursor file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cursor file {path} is malformed: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Output failures. The first write error is stored and handed to every
/// later caller, hence the shared `io::Error`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmitError {
    #[error("output write failed: {0}")]
    WriteFailed(Arc<io::Error>),

    #[error("output queue is closed")]
    Closed,

    #[error("cancelled while waiting for space in the output queue")]
    Cancelled,

    #[error("could not encode output record: {0}")]
    Encode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FollowError {
    #[error(transparent)]
    Emit(#[from] EmitError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error("gave up reconnecting after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: String },
}
