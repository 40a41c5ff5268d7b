//! Replay backend driving the core from a recorded guest trace
//!
//! The trace describes the processes running at attach time and a list of
//! lifecycle events. [`ReplayGuest::step`] applies one event to the in-memory
//! guest model and, when a breakpoint is planted for its class, delivers the
//! trap to a [`Core`] on the calling thread, exactly as a hypervisor event
//! thread would.

use super::{GuestBackend, RawEvent, Trap, TriggerClass};
use crate::context::Core;
use crate::core::types::{
    BreakpointId, GuestAddress, GuestError, GuestModuleId, GuestProcessId, MemorySpan,
    ModuleDescriptor, ProcessDescriptor, ProcessFlags, VmiResult,
};
use crate::events::DispatchReport;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use tracing::debug;

/// A module as recorded in a trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceModule {
    pub id: u64,
    pub name: String,
    pub base: u64,
    pub size: u64,
}

impl TraceModule {
    pub fn new(id: u64, name: impl Into<String>, base: u64, size: u64) -> Self {
        TraceModule {
            id,
            name: name.into(),
            base,
            size,
        }
    }

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new(
            self.name.clone(),
            MemorySpan::new(GuestAddress::new(self.base), self.size),
        )
    }
}

/// A process as recorded in a trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceProcess {
    pub id: u64,
    pub pid: u64,
    pub name: String,
    pub flags: ProcessFlags,
    #[serde(default)]
    pub parent: Option<u64>,
    #[serde(default)]
    pub modules: Vec<TraceModule>,
}

impl TraceProcess {
    pub fn new(id: u64, pid: u64, name: impl Into<String>, flags: ProcessFlags) -> Self {
        TraceProcess {
            id,
            pid,
            name: name.into(),
            flags,
            parent: None,
            modules: Vec::new(),
        }
    }

    pub fn with_module(mut self, module: TraceModule) -> Self {
        self.modules.push(module);
        self
    }

    fn descriptor(&self) -> ProcessDescriptor {
        ProcessDescriptor {
            pid: self.pid,
            name: self.name.clone(),
            flags: self.flags,
            parent: self.parent.map(GuestProcessId),
        }
    }
}

/// One recorded guest event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    ProcessCreate { process: TraceProcess },
    ProcessExit { id: u64 },
    ModuleLoad { process: u64, module: TraceModule },
    ModuleUnload { process: u64, module: u64 },
    Schedule { id: Option<u64> },
}

/// Processes present at attach time plus the events that follow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestTrace {
    #[serde(default)]
    pub processes: Vec<TraceProcess>,
    #[serde(default)]
    pub events: Vec<TraceEvent>,
}

impl GuestTrace {
    pub fn from_json(json: &str) -> VmiResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> VmiResult<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}

#[derive(Debug, Default)]
struct ReplayState {
    processes: BTreeMap<u64, TraceProcess>,
    current: Option<u64>,
    breakpoints: HashMap<BreakpointId, TriggerClass>,
    next_breakpoint: u64,
    pending: VecDeque<TraceEvent>,
    unreadable: bool,
}

impl ReplayState {
    fn breakpoint_for(&self, class: TriggerClass) -> Option<BreakpointId> {
        self.breakpoints
            .iter()
            .find(|(_, planted)| **planted == class)
            .map(|(id, _)| *id)
    }
}

/// In-memory guest replaying a [`GuestTrace`]
#[derive(Debug)]
pub struct ReplayGuest {
    state: Mutex<ReplayState>,
    max_breakpoints: usize,
}

impl ReplayGuest {
    pub fn new(trace: GuestTrace) -> Self {
        Self::with_breakpoint_limit(trace, usize::MAX)
    }

    pub fn with_breakpoint_limit(trace: GuestTrace, max_breakpoints: usize) -> Self {
        let state = ReplayState {
            current: trace.processes.first().map(|p| p.id),
            processes: trace.processes.into_iter().map(|p| (p.id, p)).collect(),
            pending: trace.events.into(),
            ..ReplayState::default()
        };
        ReplayGuest {
            state: Mutex::new(state),
            max_breakpoints,
        }
    }

    /// Queues an event after the recorded ones
    pub fn push_event(&self, event: TraceEvent) {
        self.state.lock().pending.push_back(event);
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn planted_breakpoints(&self) -> usize {
        self.state.lock().breakpoints.len()
    }

    /// Makes process and module walks fail, as with unreadable guest memory
    pub fn set_unreadable(&self, unreadable: bool) {
        self.state.lock().unreadable = unreadable;
    }

    /// Applies the next event; `None` once the trace is exhausted
    pub fn step(&self, core: &Core) -> Option<DispatchReport> {
        let event = self.state.lock().pending.pop_front()?;
        debug!("replaying {:?}", event);

        let report = match event {
            TraceEvent::ProcessCreate { process } => {
                let guest_id = GuestProcessId(process.id);
                self.state.lock().processes.insert(process.id, process);
                self.deliver(core, RawEvent::ProcessCreate(guest_id))
            }
            TraceEvent::ProcessExit { id } => {
                // The guest is still intact while the exit trap is serviced.
                let report = self.deliver(core, RawEvent::ProcessExit(GuestProcessId(id)));
                {
                    let mut state = self.state.lock();
                    state.processes.remove(&id);
                    if state.current == Some(id) {
                        state.current = None;
                    }
                }
                core.notify_process_exit(GuestProcessId(id));
                report
            }
            TraceEvent::ModuleLoad { process, module } => {
                let raw = RawEvent::ModuleLoad {
                    process: GuestProcessId(process),
                    module: GuestModuleId(module.id),
                };
                let known = match self.state.lock().processes.get_mut(&process) {
                    Some(entry) => {
                        entry.modules.retain(|m| m.id != module.id);
                        entry.modules.push(module);
                        true
                    }
                    None => false,
                };
                if known {
                    self.deliver(core, raw)
                } else {
                    DispatchReport::default()
                }
            }
            TraceEvent::ModuleUnload { process, module } => {
                if let Some(entry) = self.state.lock().processes.get_mut(&process) {
                    entry.modules.retain(|m| m.id != module);
                }
                DispatchReport::default()
            }
            TraceEvent::Schedule { id } => {
                self.state.lock().current = id;
                DispatchReport::default()
            }
        };
        Some(report)
    }

    /// Replays every remaining event and returns how many were applied
    pub fn run(&self, core: &Core) -> usize {
        let mut applied = 0;
        while self.step(core).is_some() {
            applied += 1;
        }
        applied
    }

    fn deliver(&self, core: &Core, event: RawEvent) -> DispatchReport {
        let breakpoint = self.state.lock().breakpoint_for(event.class());
        match breakpoint {
            Some(breakpoint) => core.on_trap(Trap { breakpoint, event }),
            None => DispatchReport::default(),
        }
    }
}

impl GuestBackend for ReplayGuest {
    fn running_processes(&self) -> Result<Vec<GuestProcessId>, GuestError> {
        let state = self.state.lock();
        if state.unreadable {
            return Err(GuestError::Unreadable("process list".to_string()));
        }
        Ok(state.processes.keys().map(|id| GuestProcessId(*id)).collect())
    }

    fn describe_process(&self, process: GuestProcessId) -> Option<ProcessDescriptor> {
        self.state
            .lock()
            .processes
            .get(&process.0)
            .map(TraceProcess::descriptor)
    }

    fn loaded_modules(&self, process: GuestProcessId) -> Result<Vec<GuestModuleId>, GuestError> {
        let state = self.state.lock();
        if state.unreadable {
            return Err(GuestError::Unreadable(format!("module list of {}", process)));
        }
        state
            .processes
            .get(&process.0)
            .map(|p| p.modules.iter().map(|m| GuestModuleId(m.id)).collect())
            .ok_or_else(|| GuestError::UnknownObject(process.to_string()))
    }

    fn describe_module(
        &self,
        process: GuestProcessId,
        module: GuestModuleId,
    ) -> Option<ModuleDescriptor> {
        self.state
            .lock()
            .processes
            .get(&process.0)
            .and_then(|p| p.modules.iter().find(|m| m.id == module.0))
            .map(TraceModule::descriptor)
    }

    fn current_process(&self) -> Option<GuestProcessId> {
        let state = self.state.lock();
        state
            .current
            .filter(|id| state.processes.contains_key(id))
            .map(GuestProcessId)
    }

    fn plant_breakpoint(&self, class: TriggerClass) -> Result<BreakpointId, GuestError> {
        let mut state = self.state.lock();
        if state.breakpoints.len() >= self.max_breakpoints {
            return Err(GuestError::BreakpointLimit(state.breakpoints.len()));
        }
        state.next_breakpoint += 1;
        let id = BreakpointId(state.next_breakpoint);
        state.breakpoints.insert(id, class);
        Ok(id)
    }

    fn remove_breakpoint(&self, breakpoint: BreakpointId) {
        self.state.lock().breakpoints.remove(&breakpoint);
    }
}
