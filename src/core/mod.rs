//! Core module containing fundamental types for vmi-core
//!
//! This module provides the foundational building blocks used throughout
//! the introspection core: handles, descriptors, spans and error types.

pub mod types;

pub use types::{
    GuestAddress, MemorySpan, ModuleHandle, ProcessFlags, ProcessHandle, SubscriptionId,
    VmiError, VmiResult,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
