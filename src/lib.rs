#![forbid(unsafe_code)]

//! ZeroClaw chat sync
//!
//! Realtime synchronization layer for the ZeroClaw mobile chat client. It
//! keeps one resilient connection to the document backend's realtime
//! channel, a local read cache patched by server-pushed changes, and chat
//! timelines with optimistic sends that reconcile against the server copy.
//!
//! Everything hangs off a [`SyncContext`] built once at startup:
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use zeroclaw_chat_sync::{logging, SyncConfig, SyncContext};
//!
//! logging::init_tracing(logging::DEFAULT_FILTER)?;
//! let ctx = SyncContext::from_config(SyncConfig::load_or_default()?)?;
//! ctx.start().await;
//! ctx.chat().subscribe("chat-1").await;
//! ctx.chat().send_message("chat-1", "user-1", "hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod sync;

pub use backend::{Backend, ChannelPath, Document, Filter};
pub use config::SyncConfig;
pub use error::{BackendError, SyncError, SyncResult};
pub use sync::SyncContext;
