//! Queue workers
//!
//! - [`client`] - the [`Worker`] handle and its put/get/consume/close operations
//! - [`delivery`] - fetched tasks and the [`PendingAck`] capability
//! - [`codec`] - JSON task encoding

pub mod client;
pub mod codec;
pub mod delivery;

pub use client::{ConsumeOptions, GetOptions, QueueClient, Worker};
pub use delivery::{Delivery, PendingAck};
