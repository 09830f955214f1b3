//! Block allocation for pool segments
//!
//! Allocation happens in two levels:
//! - [`free_list`] picks candidate segments by how much free space they have
//! - [`segment`] finds a contiguous run of blocks in one segment's [`bitmap`]

pub mod bitmap;
pub mod free_list;
pub mod segment;
