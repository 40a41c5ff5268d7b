//! Boundary with the hypervisor layer
//!
//! The core never touches guest memory itself. Everything it knows about the
//! guest comes through [`GuestBackend`], and every asynchronous guest event
//! arrives as a [`Trap`] pushed into [`crate::Core::on_trap`] by whatever
//! thread services hypervisor events.

pub mod replay;

pub use replay::{GuestTrace, ReplayGuest, TraceEvent, TraceModule, TraceProcess};

use crate::core::types::{
    BreakpointId, GuestError, GuestModuleId, GuestProcessId, ModuleDescriptor, ProcessDescriptor,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Class of guest condition a breakpoint can be planted for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerClass {
    ProcessCreate,
    ProcessDelete,
    ModuleLoad,
}

impl TriggerClass {
    pub const ALL: [TriggerClass; 3] = [
        TriggerClass::ProcessCreate,
        TriggerClass::ProcessDelete,
        TriggerClass::ModuleLoad,
    ];
}

impl fmt::Display for TriggerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerClass::ProcessCreate => write!(f, "process-create"),
            TriggerClass::ProcessDelete => write!(f, "process-delete"),
            TriggerClass::ModuleLoad => write!(f, "module-load"),
        }
    }
}

/// Concrete guest event identified by the backend when a breakpoint is hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent {
    ProcessCreate(GuestProcessId),
    ProcessExit(GuestProcessId),
    ModuleLoad {
        process: GuestProcessId,
        module: GuestModuleId,
    },
}

impl RawEvent {
    pub fn class(&self) -> TriggerClass {
        match self {
            RawEvent::ProcessCreate(_) => TriggerClass::ProcessCreate,
            RawEvent::ProcessExit(_) => TriggerClass::ProcessDelete,
            RawEvent::ModuleLoad { .. } => TriggerClass::ModuleLoad,
        }
    }
}

/// A trap delivered while the guest is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    pub breakpoint: BreakpointId,
    pub event: RawEvent,
}

/// Services the core requires from the hypervisor layer
pub trait GuestBackend: Send + Sync {
    /// Walks the guest's live process list
    fn running_processes(&self) -> Result<Vec<GuestProcessId>, GuestError>;

    /// Reads the descriptor of a living process, `None` once it is gone
    fn describe_process(&self, process: GuestProcessId) -> Option<ProcessDescriptor>;

    /// Walks the module list of one process
    fn loaded_modules(&self, process: GuestProcessId) -> Result<Vec<GuestModuleId>, GuestError>;

    /// Reads the descriptor of a loaded module
    fn describe_module(
        &self,
        process: GuestProcessId,
        module: GuestModuleId,
    ) -> Option<ModuleDescriptor>;

    /// Process executing on the vCPU at this instant
    fn current_process(&self) -> Option<GuestProcessId>;

    /// Plants a breakpoint for a trigger class
    fn plant_breakpoint(&self, class: TriggerClass) -> Result<BreakpointId, GuestError>;

    /// Removes a previously planted breakpoint
    fn remove_breakpoint(&self, breakpoint: BreakpointId);
}
