//! chainevent-client — ledger event client with auto-reconnect.
//!
//! # Features
//! - Peer selection through a pluggable [`LoadBalancePolicy`](chainevent_core::LoadBalancePolicy)
//! - Guarded connection state machine (disconnected → connecting → connected)
//! - Bounded connect retry and automatic reconnect after stream failures
//! - After-connect / before-reconnect hooks
//! - Connection state notifications
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use chainevent_client::{Client, ConnectionProvider};
//! # use chainevent_core::{Endpoint, StaticDiscovery};
//! # use chainevent_core::EventError;
//! # async fn run(provider: Arc<dyn ConnectionProvider>) -> Result<(), EventError> {
//! let discovery = Arc::new(StaticDiscovery::new(vec![Endpoint::new("grpcs://peer0.org1:7051")]));
//! let client = Client::builder("mychannel", discovery, provider).build()?;
//! client.connect().await?;
//!
//! let (reg, mut events) = client.register_chaincode_event("mycc", "^transfer").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{} in block {}", event.event_name, event.block_number);
//! }
//! client.unregister(reg).await;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod state;

pub use client::{Client, ClientBuilder, Hook};
pub use connection::{Connection, ConnectionProvider, StreamConnection};
pub use dispatcher::ClientDispatcher;
pub use state::{AtomicConnectionState, ConnectionState};
