//! Shared guest fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use vmi_core::guest::{TraceEvent, TraceModule, TraceProcess};
use vmi_core::{Core, GuestTrace, ProcessFlags, ReplayGuest};

/// A small guest: the kernel process plus an explorer with two modules
pub fn base_trace() -> GuestTrace {
    GuestTrace {
        processes: vec![
            TraceProcess::new(1, 4, "System", ProcessFlags::X64)
                .with_module(TraceModule::new(10, "ntoskrnl.exe", 0x8000_0000, 0x80_0000)),
            TraceProcess {
                parent: Some(1),
                ..TraceProcess::new(2, 1200, "explorer.exe", ProcessFlags::X64)
                    .with_module(TraceModule::new(20, "explorer.exe", 0x40_0000, 0x10_0000))
                    .with_module(TraceModule::new(21, "ntdll.dll", 0x7ff0_0000, 0x20_0000))
            },
        ],
        events: Vec::new(),
    }
}

pub fn create(id: u64, pid: u64, name: &str, flags: ProcessFlags) -> TraceEvent {
    TraceEvent::ProcessCreate {
        process: TraceProcess {
            parent: Some(2),
            ..TraceProcess::new(id, pid, name, flags)
        },
    }
}

pub fn exit(id: u64) -> TraceEvent {
    TraceEvent::ProcessExit { id }
}

pub fn load(process: u64, module: u64, name: &str, base: u64, size: u64) -> TraceEvent {
    TraceEvent::ModuleLoad {
        process,
        module: TraceModule::new(module, name, base, size),
    }
}

pub fn unload(process: u64, module: u64) -> TraceEvent {
    TraceEvent::ModuleUnload { process, module }
}

pub fn setup() -> (Arc<ReplayGuest>, Core) {
    setup_with(base_trace())
}

pub fn setup_with(trace: GuestTrace) -> (Arc<ReplayGuest>, Core) {
    let guest = Arc::new(ReplayGuest::new(trace));
    let core = Core::new(guest.clone());
    (guest, core)
}
