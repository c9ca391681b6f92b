//! Client side of a session: connecting, keeping the session alive, and issuing interactions.
//!
//! # Example
//!
//! ```ignore
//! use rsocket_prototype::hello::{HelloRequest, HelloResponse};
//! use rsocket_prototype::rsocket_lite::client::{
//!     ConnectConfig, ConnectionManager, InteractionDispatcher,
//! };
//! use rsocket_prototype::rsocket_lite::CompletionTracker;
//!
//! let mut manager = ConnectionManager::new();
//! let connection = manager.connect(ConnectConfig::default()).await?;
//! let dispatcher = InteractionDispatcher::new(connection);
//!
//! let tracker = CompletionTracker::new(1);
//! dispatcher.request_response(&HelloRequest::new("1"), &tracker, |response: HelloResponse| {
//!     println!("{} => {}", response.id, response.value);
//! })?;
//! tracker.wait().await;
//! ```

mod config;
mod connection;
mod dispatcher;
mod manager;
mod supervisor;

pub use config::{ConnectConfig, RetryPolicy, SessionConfig};
pub use connection::{Connection, PendingResponse, ResponseStream};
pub use dispatcher::{ErrorPolicy, InteractionDispatcher, InteractionKind, InteractionRequest};
pub use manager::{ConnectionEvent, ConnectionManager};
