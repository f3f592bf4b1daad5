//! Tidestore Client: Cached Access to a Remote Storage
//!
//! A client process reaches a [`FileStorage`](tidestore_core::FileStorage)
//! through a connection and keeps recently read revisions in a fixed-size
//! circular cache file.
//!
//! # Architecture
//!
//! - **Cache**: a ring of revision entries in one file, written in place and
//!   evicted oldest-first; optionally persistent across restarts
//! - **Invalidations**: the server pushes the oids of every committed
//!   transaction to all other clients; the client applies them from its
//!   inbox on demand or from a background thread
//! - **Verification**: on connect a persistent cache is reconciled with the
//!   server, from the server's recent history when possible and revision by
//!   revision otherwise
//! - **Local server**: hosts a storage for clients living in the same
//!   process and fans invalidations out to them

pub mod cache;
pub mod cache_format;
pub mod client;
pub mod config;
pub mod error;
mod invalidator;
pub mod protocol;
pub mod remote;
pub mod server;

pub use cache::{CacheStats, ClientCache};
pub use client::{ClientStorage, Verification};
pub use config::{CacheConfig, ClientConfig, ServerConfig};
pub use error::{ClientError, ClientResult};
pub use invalidator::InvalidatorHandle;
pub use protocol::{Arg, FrameDecoder, Message, Notification};
pub use remote::{Inbox, RemoteStorage};
pub use server::{LocalConnection, LocalServer};
