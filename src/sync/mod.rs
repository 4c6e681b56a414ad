//! Realtime synchronization core.
//!
//! Leaf-first:
//!
//! - [`scheduler`]: every timer (reconnect backoff, health check, sweep)
//! - [`event`]: realtime frame → typed [`ChangeEvent`]
//! - [`cache`]: keyed query cache with in-flight fetch sharing
//! - [`connection`]: connection state machine with backoff
//! - [`live_query`]: cache entries bound to realtime channels
//! - [`chat`]: ordered message timelines with optimistic sends
//! - [`governor`]: periodic sweep and lifecycle signals
//! - [`context`]: wires the above into one [`SyncContext`]

pub mod cache;
pub mod chat;
pub mod connection;
pub mod context;
pub mod event;
pub mod governor;
pub mod live_query;
pub mod scheduler;

pub use cache::{CacheEntry, CacheKey, CacheStore, CacheValue};
pub use chat::{ChatSynchronizer, DeliveryState, Message};
pub use connection::{
    ConnectionManager, ConnectionObserver, ConnectionState, RetryPolicy, TransportObserver,
};
pub use context::SyncContext;
pub use event::{ChangeEvent, ChangeOperation, UnrecognizedFrame};
pub use governor::{LifecycleGovernor, LifecycleSignal};
pub use live_query::{ChangeListener, LiveQueryRegistry, SubscriptionHandle};
pub use scheduler::{Scheduler, TimerId};
