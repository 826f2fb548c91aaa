//! Client-side reconciliation core for a messaging app.
//!
//! Local optimistic mutations and server push events meet in a single
//! [`Reconciler`]; [`ChatSession`] drives it from an injected
//! [`ChatTransport`] and publishes [`StoreEvent`] change notifications.

pub mod config;
pub mod conversation_store;
pub mod error;
pub mod message_log;
pub mod mutation_tracker;
pub mod notice;
pub mod reconciler;
pub mod selection;
pub mod session;
pub mod transport;
pub mod unread;

pub use config::SessionConfig;
pub use error::ChatError;
pub use mutation_tracker::MutationHandle;
pub use reconciler::{BegunMutation, MessageState, Reconciled, Reconciler, StoreEvent};
pub use session::ChatSession;
pub use transport::{ChatTransport, MemoryTransport, RequestKind, Scripted};
