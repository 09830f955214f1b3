//! Pool implementation
//!
//! - [`header`] - byte layout of file, segment and block headers
//! - [`allocator`] - bitmaps, per-segment allocation and bucketed free lists
//! - [`view_cache`] - reference-counted segment mappings with LRU eviction
//! - [`rva`] - stable addresses
//! - [`pool`] - the [`FilePool`] façade
//! - [`validation`] - whole-pool consistency checks

pub mod allocator;
pub mod config;
pub mod error;
pub mod header;
pub mod io;
pub mod pool;
pub mod rva;
pub mod validation;
pub mod view_cache;

pub use pool::{Allocation, BlockPtr, FilePool, PoolStats};
