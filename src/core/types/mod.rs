//! Core type definitions for vmi-core
//!
//! Opaque handles, guest descriptors, address spans and the error type shared
//! by every layer of the introspection core.

mod address;
mod error;
mod handle;
mod process_info;

pub use address::{GuestAddress, MemorySpan};
pub use error::{GuestError, VmiError, VmiResult};
pub use handle::{
    BreakpointId, GuestModuleId, GuestProcessId, ModuleHandle, ProcessHandle, SubscriptionId,
};
pub use process_info::{ModuleDescriptor, ProcessDescriptor, ProcessFlags};
