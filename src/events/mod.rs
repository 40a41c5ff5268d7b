//! Event subscriptions, breakpoint dispatch and blocking waits
//!
//! Data flow: guest trap, then [`BreakpointDispatcher`], then a lookup in the
//! [`SubscriptionTable`], then each matching callback in registration order,
//! and finally the guest resumes. [`WaitCoordinator`] sits on top as a
//! temporary subscriber.

pub mod dispatcher;
pub mod subscription;
pub mod wait;

pub use dispatcher::{BreakpointDispatcher, DispatchReport};
pub use subscription::{BreakpointState, SubscriptionGuard, SubscriptionInfo, SubscriptionTable};
pub use wait::{CancelToken, PendingWait, WaitCoordinator, WaitOptions};

use crate::core::types::{ModuleHandle, ProcessHandle};
use crate::guest::TriggerClass;
use std::fmt;
use std::sync::Arc;

/// Which module loads a subscription listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleScope {
    Global,
    Process(ProcessHandle),
}

/// Class of guest event a subscription is armed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    ProcessCreate,
    ProcessDelete,
    ModuleLoad(ModuleScope),
}

impl Trigger {
    pub fn class(&self) -> TriggerClass {
        match self {
            Trigger::ProcessCreate => TriggerClass::ProcessCreate,
            Trigger::ProcessDelete => TriggerClass::ProcessDelete,
            Trigger::ModuleLoad(_) => TriggerClass::ModuleLoad,
        }
    }

    /// Checks if an event should be delivered to this trigger
    pub fn matches(&self, event: &GuestEvent) -> bool {
        match (self, event) {
            (Trigger::ProcessCreate, GuestEvent::ProcessCreated(_)) => true,
            (Trigger::ProcessDelete, GuestEvent::ProcessDeleted(_)) => true,
            (Trigger::ModuleLoad(ModuleScope::Global), GuestEvent::ModuleLoaded { .. }) => true,
            (
                Trigger::ModuleLoad(ModuleScope::Process(scope)),
                GuestEvent::ModuleLoaded { process, .. },
            ) => scope == process,
            _ => false,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::ModuleLoad(ModuleScope::Process(process)) => {
                write!(f, "module-load[{}]", process)
            }
            other => write!(f, "{}", other.class()),
        }
    }
}

/// A resolved guest event as seen by subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestEvent {
    ProcessCreated(ProcessHandle),
    ProcessDeleted(ProcessHandle),
    ModuleLoaded {
        process: ProcessHandle,
        module: ModuleHandle,
    },
}

impl GuestEvent {
    pub fn class(&self) -> TriggerClass {
        match self {
            GuestEvent::ProcessCreated(_) => TriggerClass::ProcessCreate,
            GuestEvent::ProcessDeleted(_) => TriggerClass::ProcessDelete,
            GuestEvent::ModuleLoaded { .. } => TriggerClass::ModuleLoad,
        }
    }

    /// The process the event happened in
    pub fn process(&self) -> ProcessHandle {
        match self {
            GuestEvent::ProcessCreated(process) | GuestEvent::ProcessDeleted(process) => *process,
            GuestEvent::ModuleLoaded { process, .. } => *process,
        }
    }

    pub fn module(&self) -> Option<ModuleHandle> {
        match self {
            GuestEvent::ModuleLoaded { module, .. } => Some(*module),
            _ => None,
        }
    }
}

impl fmt::Display for GuestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestEvent::ProcessCreated(process) => write!(f, "process {} created", process),
            GuestEvent::ProcessDeleted(process) => write!(f, "process {} deleted", process),
            GuestEvent::ModuleLoaded { process, module } => {
                write!(f, "module {} loaded in process {}", module, process)
            }
        }
    }
}

/// Subscriber callback. Errors and panics are isolated by the dispatcher.
pub type EventCallback = Arc<dyn Fn(&GuestEvent) -> anyhow::Result<()> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_matching() {
        let p1 = ProcessHandle::new(1);
        let p2 = ProcessHandle::new(2);
        let load = GuestEvent::ModuleLoaded {
            process: p1,
            module: ModuleHandle::new(p1, 0),
        };

        assert!(Trigger::ModuleLoad(ModuleScope::Global).matches(&load));
        assert!(Trigger::ModuleLoad(ModuleScope::Process(p1)).matches(&load));
        assert!(!Trigger::ModuleLoad(ModuleScope::Process(p2)).matches(&load));
        assert!(!Trigger::ProcessCreate.matches(&load));

        assert!(Trigger::ProcessCreate.matches(&GuestEvent::ProcessCreated(p1)));
        assert!(!Trigger::ProcessCreate.matches(&GuestEvent::ProcessDeleted(p1)));
        assert!(Trigger::ProcessDelete.matches(&GuestEvent::ProcessDeleted(p2)));
    }

    #[test]
    fn test_event_accessors() {
        let p = ProcessHandle::new(3);
        let m = ModuleHandle::new(p, 1);
        let event = GuestEvent::ModuleLoaded { process: p, module: m };
        assert_eq!(event.process(), p);
        assert_eq!(event.module(), Some(m));
        assert_eq!(event.class(), TriggerClass::ModuleLoad);
        assert_eq!(GuestEvent::ProcessCreated(p).module(), None);
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(Trigger::ProcessCreate.to_string(), "process-create");
        assert_eq!(
            Trigger::ModuleLoad(ModuleScope::Process(ProcessHandle::new(1))).to_string(),
            "module-load[0100000000000000]"
        );
    }
}
