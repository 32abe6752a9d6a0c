//! # helpdesk_stream
//!
//! Real-time follower for the helpdesk pub/sub feed.
//!
//! A [`Follower`] owns the whole pipeline on one task:
//!
//! ```text
//! WebSocket ──► EventRouter ──► DebounceAggregator ──► OutputEmitter ──► writer thread
//!   ▲              │ (MetaCache, dedup, filters)                │
//!   │              └─ snapshots via ConversationSource          └─► CursorWriter
//!   └── ReconnectSupervisor (2s → 30s backoff, reset after a stable session)
//! ```
//!
//! Cancellation flushes pending batches in conversation order, saves the
//! cursor and drains the output queue before returning.

pub mod cursor;
pub mod debounce;
mod emitter;
mod error;
mod follow;
pub mod meta;
pub mod record;
pub mod router;
pub mod snapshot;
mod source;
pub mod supervisor;
pub mod transport;

pub use cursor::{CursorWriter, FollowCursor};
pub use debounce::{Batch, DebounceAggregator};
pub use emitter::{OutputEmitter, OverflowMode, Work};
pub use error::{CursorError, EmitError, FollowError, TransportError};
pub use follow::{FollowConfig, FollowSummary, Follower};
pub use meta::{ConversationMeta, MetaCache};
pub use record::OutputRecord;
pub use router::{AssigneeFilter, EventRouter, FilterConfig, RoutedEvent};
pub use snapshot::{Snapshot, SnapshotLimits};
pub use source::ConversationSource;
pub use supervisor::{Backoff, BackoffPolicy, ReconnectSupervisor, Session, SessionEnd};
pub use transport::{ChannelDescriptor, Connection, PresenceHandle};
