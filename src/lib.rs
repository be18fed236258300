#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

pub mod bus;
pub mod cache;
pub mod cache_system;
pub mod config;
pub mod dram;
pub mod events;
pub mod fifo;
pub mod invariants;
pub mod llc;
pub mod packet;
pub mod system;

pub use bus::Bus;
pub use cache::CoherentCache;
pub use cache_system::CacheSystem;
pub use config::Config;
pub use packet::{BusOp, Packet};
pub use system::System;

/// A physical byte address.
#[allow(non_camel_case_types)]
pub type address = u64;
