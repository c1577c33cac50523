//! # leasehold
//!
//! A DHCPv4 lease-management engine (RFC 2131 / RFC 2132).
//!
//! ## Features
//!
//! - Address pools per subnet with reservations and decline quarantine
//! - Lease state machine: OFFERED, BOUND, RENEWING, REBINDING, EXPIRED, RELEASED
//! - DISCOVER, REQUEST, RELEASE and DECLINE handling with NAK reasons
//! - Write-through persistence to an append-only JSON-lines journal
//! - Relay agent (`giaddr`) subnet selection
//! - Rate limiting per client
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use leasehold::{Config, DhcpServer};
//!
//! #[tokio::main]
//! async fn main() -> leasehold::Result<()> {
//!     let config = Config::load("config.json")?;
//!     let server = DhcpServer::new(config).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Subnets, ranges, reservations and timers
//! - [`AllocationEngine`] - Per-subnet pools and lease tables behind one lock each
//! - [`LeaseStore`] - Durable backing; [`JournalStore`] on disk, [`MemoryStore`] for tests
//! - [`ProtocolHandler`] - Datagram to decision to reply
//! - [`DhcpServer`] - UDP listener on port 67 plus the expiry sweeper
//! - [`DhcpPacket`] / [`DhcpOption`] - Wire codec

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod lease;
pub mod message;
pub mod options;
pub mod packet;
pub mod pool;
pub mod protocol;
pub mod reservation;
pub mod server;
pub mod state;
pub mod store;
pub mod table;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ReservationConfig, SubnetConfig};
pub use engine::{AllocationEngine, SweepReport};
pub use error::{Error, Result};
pub use lease::{ClientId, Lease};
pub use message::{ClientMessage, ClientMessageType, RequestKind, ServerMessage};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use pool::{AddressPool, AddressStatus, PoolSnapshot};
pub use protocol::{Decision, Outbound, ProtocolHandler};
pub use server::DhcpServer;
pub use state::{LeaseEvent, LeaseState};
pub use store::{JournalStore, LeaseStore, MemoryStore};
