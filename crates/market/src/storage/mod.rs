//! Storage traits and implementations
//!
//! This module defines the storage abstraction for the sync control plane.
//! The trait-based design allows swapping between in-memory and persistent
//! storage implementations.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryMarketStore;
pub use sqlite::SqliteMarketStore;
pub use traits::{CursorAdvance, IssuedToken, MarketStore};
