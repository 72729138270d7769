//! # Wiretap Core
//!
//! Traffic inspection engine for the Wiretap application: an intercepting
//! HTTP/HTTPS proxy that captures request/response exchanges from client
//! devices, persists them to a queryable archive, and broadcasts live
//! lifecycle events to whatever shell embeds it.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                  Desktop shell / IPC bridge                │
//! ├───────────────────────────────────────────────────────────┤
//! │                      Wiretap Core (Rust)                   │
//! │  ┌───────────┐  ┌────────────┐  ┌─────────┐  ┌─────────┐  │
//! │  │   Proxy   │  │ CertMinter │  │ HTTP/1.1│  │ Traffic │  │
//! │  │  Engine   │──│ CertStore  │──│ Framing │──│  Store  │  │
//! │  └───────────┘  └────────────┘  └─────────┘  └─────────┘  │
//! │        │                                                  │
//! │        └── EventBus ──► subscribers (UI, exporters, …)    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The pieces are explicit owned components: construct a [`CertStore`],
//! load the root CA, hand it to a [`CertMinter`], open a [`TrafficStore`],
//! create an [`EventBus`], and wire all of them into a [`ProxyEngine`].
//! There is no process-wide state.

pub mod config;
pub mod events;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod storage;

pub use config::ProxyConfig;
pub use events::{ErrorKind, EventBus, EventSubscriber, ProxyEvent};
pub use models::{Exchange, ExchangeCompletion, ExchangeFilter, OpenExchange, StatusBucket};
pub use proxy::cert_minter::{CertMinter, LeafCert};
pub use proxy::cert_store::{CertStore, RootCa};
pub use proxy::engine::{ProxyEngine, StartInfo};
pub use storage::TrafficStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
