//! socket-call - typed remote calls over namespaced event connections.
//!
//! A client calls named server handlers as if they were local async
//! functions; every call is an event with an acknowledgment, and the
//! acknowledged value is the result. Calls pass through a plugin pipeline,
//! one of whose plugins is a TTL response cache that keeps answering while
//! offline and supports a two-phase hydration run at startup.
//!
//! # Architecture
//!
//! - **Client** - `SocketClient` and per-namespace `Namespace` proxies
//! - **Plugins** - ordered `before_emit` / `after_emit` hook pipeline
//! - **Cache** - TTL cache plugin, backing stores, hydration state machine
//! - **Transport** - connection contract with WebSocket and in-process adapters
//! - **Server** - namespace dispatcher with middlewares and push services
//!
//! # Modules
//!
//! - [`client`] - Namespace proxy and connection management
//! - [`plugin`] - Hook pipeline and the cache plugin
//! - [`transport`] - Transport contract and adapters
//! - [`server`] - Server-side dispatcher
//! - [`config`] - Configuration loading/saving

pub mod client;
pub mod config;
pub mod demo;
pub mod error;
pub mod plugin;
pub mod server;
pub mod signature;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use client::{
    CallOptions, EventSchema, Namespace, NamespaceOptions, OngoingCalls, RemoteMethod,
    SessionProvider, SocketClient, StaticSession,
};
pub use config::Config;
pub use error::{CallError, ConnectionError, RemoteError, TransportError};
pub use plugin::cache::{
    CacheOptions, CachePlugin, FileStorage, HydrationMode, HydrationState, Hydrator,
    MemoryStorage, Ttl,
};
pub use plugin::{BeforeEmit, CallContext, Plugin};
pub use server::{Handlers, NamespaceServer, Server, Services};
pub use signature::CallSignature;
