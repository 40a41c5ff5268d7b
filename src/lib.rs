//! vmi-core: event-driven introspection of guest processes and modules
//!
//! A [`Core`] sits between a hypervisor backend and its clients. It hands out
//! opaque, never-recycled handles for guest processes and modules, enumerates
//! them, lets clients subscribe to process creation, process deletion and
//! module loads, and offers blocking waits built on those subscriptions.

pub mod config;
pub mod context;
pub mod core;
pub mod events;
pub mod guest;
pub mod process;

pub use crate::context::Core;

// Re-export main types from core module
pub use crate::core::types::{
    GuestAddress, GuestError, GuestModuleId, GuestProcessId, MemorySpan, ModuleDescriptor,
    ModuleHandle, ProcessDescriptor, ProcessFlags, ProcessHandle, SubscriptionId, VmiError,
    VmiResult,
};
pub use crate::core::{AUTHORS, VERSION};

pub use crate::events::{
    BreakpointState, CancelToken, DispatchReport, GuestEvent, ModuleScope, PendingWait,
    SubscriptionGuard, SubscriptionInfo, Trigger, WaitOptions,
};
pub use crate::guest::{GuestBackend, GuestTrace, RawEvent, ReplayGuest, Trap, TriggerClass};
pub use crate::process::Walk;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_constants() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
        assert_eq!(AUTHORS, env!("CARGO_PKG_AUTHORS"));
    }

    #[test]
    fn test_handle_reexports_roundtrip_text() {
        let handle: ProcessHandle = "0700000000000000".parse().unwrap();
        assert_eq!(handle.as_u64(), 7);
        assert_eq!(handle.to_string(), "0700000000000000");
    }

    #[test]
    fn test_error_reexport() {
        let error = VmiError::Timeout(std::time::Duration::from_millis(10));
        assert!(error.to_string().contains("10ms"));
    }

    #[test]
    fn test_core_over_empty_guest() {
        let core = Core::new(std::sync::Arc::new(ReplayGuest::new(GuestTrace::default())));
        let mut seen = 0;
        core.list_processes(|_| {
            seen += 1;
            Walk::Continue
        })
        .unwrap();
        assert_eq!(seen, 0);
        assert!(matches!(core.current_process(), Err(VmiError::Unavailable(_))));
    }
}
