//! # Web Firewall Bridge
//!
//! Runtime adapters around the rule lifecycle core: durable SQLite state,
//! a local enforcement engine, the match pump and the message server.

pub mod config;
pub mod enforcement_engine;
pub mod match_pump;
pub mod server;
pub mod sqlite_store;

pub use config::BridgeConfig;
pub use enforcement_engine::{LocalEngine, StaticManifest};
pub use match_pump::{MatchPump, PumpStats};
pub use server::{start_message_server, MessageServer, MAX_LINE_BYTES};
pub use sqlite_store::SqliteStore;
