//! In-memory authoritative cache.
//!
//! Values are immutable snapshots behind `Arc`. A change replaces the whole
//! entry, so a reader holding an old `Arc` never observes a partial update.

mod store;

pub use store::{CacheStats, CacheStore, Upserted};
