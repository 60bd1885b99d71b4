//! Utilities for testing code that transfers files, used by this crate's own tests and exported
//!  for application testing: an in-memory datagram link with loss injection.

pub mod memory_link;
