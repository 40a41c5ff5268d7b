//! Process and module tracking for the guest
//!
//! This module provides the handle registry that maps opaque handles to guest
//! descriptors, and the enumeration engine that walks live processes and
//! their loaded modules.

pub mod enumerator;
pub mod registry;

pub use enumerator::{Enumerator, Walk};
pub use registry::HandleRegistry;
