//! hydrogen: a device-control message broker.
//!
//! Drivers own devices and publish property definitions and updates;
//! clients subscribe to devices and send commands back. The broker sits in
//! between: it routes every message from its source to exactly the peers
//! that asked for it, serialises each message once per transport flavour
//! (inline base64 or shared-memory descriptors), keeps a per-peer queue with
//! byte budgets, and supervises local driver processes and remote proxies.
//!
//! Layout:
//!
//! - [`protocol`]: XML framing, [`protocol::Msg`], blobs and the shared
//!   serialization engine
//! - [`queue`]: per-peer ordered output with backpressure
//! - [`router`]: device ownership, subscriptions, definition replay
//! - [`driver`]: local and remote driver lifecycle
//! - [`broker`]: the single task that owns router and drivers
//! - [`listener`]: TCP, Unix socket and admin FIFO front ends
//! - [`server`]: startup wiring

pub mod admin;
pub mod broker;
pub mod config;
pub mod driver;
pub mod error;
pub mod listener;
pub mod peer;
pub mod protocol;
pub mod queue;
pub mod router;
pub mod server;
pub mod transport;

pub use admin::{AdminCommand, AdminEvent};
pub use broker::{Broker, BrokerEvent, BrokerHandle};
pub use config::ServerConfig;
pub use driver::{DriverSpec, DriverState};
pub use error::{Result, ServerError};
pub use server::Server;
