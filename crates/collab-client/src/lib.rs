//! collab-client: network collaborators and a terminal editing surface for collab-core.
//!
//! - `WsProvider`: WebSocket link to the sync server
//! - `HttpStore`: durable snapshot store over HTTP

pub mod http_store;
pub mod ws_provider;

pub use http_store::HttpStore;
pub use ws_provider::{WsLink, WsProvider};
