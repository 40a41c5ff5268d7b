//! The introspection context
//!
//! [`Core`] ties the handle registry, the enumeration engine, the
//! subscription table, the breakpoint dispatcher and the wait coordinator to
//! one guest backend. Every method takes `&self`, so a `Core` can be shared
//! behind an `Arc` between the event thread and any number of callers.

use crate::config::Config;
use crate::core::types::{
    GuestAddress, GuestProcessId, MemorySpan, ModuleHandle, ProcessDescriptor, ProcessFlags,
    ProcessHandle, SubscriptionId, VmiError, VmiResult,
};
use crate::events::{
    BreakpointDispatcher, BreakpointState, DispatchReport, EventCallback, GuestEvent, ModuleScope,
    PendingWait, SubscriptionInfo, SubscriptionTable, Trigger, WaitCoordinator, WaitOptions,
};
use crate::guest::{GuestBackend, Trap, TriggerClass};
use crate::process::{Enumerator, HandleRegistry, Walk};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct Core {
    backend: Arc<dyn GuestBackend>,
    registry: Arc<RwLock<HandleRegistry>>,
    table: Arc<Mutex<SubscriptionTable>>,
    enumerator: Enumerator,
    dispatcher: BreakpointDispatcher,
    waits: WaitCoordinator,
}

impl Core {
    /// Creates a context with default settings
    pub fn new(backend: Arc<dyn GuestBackend>) -> Self {
        Self::with_config(backend, &Config::default())
    }

    pub fn with_config(backend: Arc<dyn GuestBackend>, config: &Config) -> Self {
        let registry = Arc::new(RwLock::new(HandleRegistry::new(
            config.registry.case_insensitive_names,
        )));
        let table = Arc::new(Mutex::new(SubscriptionTable::new(
            Arc::clone(&backend),
            config.dispatch.max_subscriptions,
        )));
        let enumerator = Enumerator::new(Arc::clone(&registry), Arc::clone(&backend));
        let dispatcher = BreakpointDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&table),
            Arc::clone(&backend),
            config.dispatch.catch_panics,
        );
        let waits = WaitCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&table),
            config.wait.default_timeout_ms.map(Duration::from_millis),
        );

        info!(
            "introspection context ready (max {} subscriptions)",
            config.dispatch.max_subscriptions
        );
        Core {
            backend,
            registry,
            table,
            enumerator,
            dispatcher,
            waits,
        }
    }

    // Process queries

    /// Resolves a handle to a copy of its descriptor
    pub fn resolve(&self, process: ProcessHandle) -> VmiResult<ProcessDescriptor> {
        self.registry.read().resolve(process).cloned()
    }

    pub fn is_valid(&self, process: ProcessHandle) -> bool {
        self.registry.read().contains(process)
    }

    pub fn process_name(&self, process: ProcessHandle) -> VmiResult<String> {
        Ok(self.registry.read().resolve(process)?.name.clone())
    }

    pub fn process_pid(&self, process: ProcessHandle) -> VmiResult<u64> {
        Ok(self.registry.read().resolve(process)?.pid)
    }

    /// Bitness flags; fails with `InvalidFlags` if the guest reported neither or both
    pub fn process_flags(&self, process: ProcessHandle) -> VmiResult<ProcessFlags> {
        let flags = self.registry.read().resolve(process)?.flags;
        flags.validate()
    }

    /// Handle of the parent process, when the parent is still alive
    pub fn process_parent(&self, process: ProcessHandle) -> VmiResult<ProcessHandle> {
        let parent = self.registry.read().resolve(process)?.parent;
        let parent =
            parent.ok_or_else(|| VmiError::NotFound(format!("parent of process {}", process)))?;
        self.track(parent)
            .map_err(|_| VmiError::NotFound(format!("parent of process {}", process)))
    }

    /// Process running on the vCPU at the moment of the call
    pub fn current_process(&self) -> VmiResult<ProcessHandle> {
        let guest_id = self
            .backend
            .current_process()
            .ok_or_else(|| VmiError::Unavailable("no process is scheduled".to_string()))?;
        self.track(guest_id)
            .map_err(|e| VmiError::Unavailable(format!("current process {}: {}", guest_id, e)))
    }

    fn track(&self, guest_id: GuestProcessId) -> VmiResult<ProcessHandle> {
        crate::process::registry::track_process(&self.registry, self.backend.as_ref(), guest_id)
    }

    // Enumeration

    pub fn list_processes<F>(&self, visitor: F) -> VmiResult<()>
    where
        F: FnMut(ProcessHandle) -> Walk,
    {
        self.enumerator.list_processes(visitor)
    }

    /// Every live process handle, in handle order
    pub fn processes(&self) -> VmiResult<Vec<ProcessHandle>> {
        self.enumerator.snapshot_processes()
    }

    pub fn list_modules<F>(&self, process: ProcessHandle, visitor: F) -> VmiResult<()>
    where
        F: FnMut(ModuleHandle) -> Walk,
    {
        self.enumerator.list_modules(process, visitor)
    }

    pub fn modules(&self, process: ProcessHandle) -> VmiResult<Vec<ModuleHandle>> {
        self.enumerator.snapshot_modules(process)
    }

    pub fn module_name(&self, process: ProcessHandle, module: ModuleHandle) -> VmiResult<String> {
        self.enumerator.module_name(process, module)
    }

    pub fn module_span(
        &self,
        process: ProcessHandle,
        module: ModuleHandle,
    ) -> VmiResult<MemorySpan> {
        self.enumerator.module_span(process, module)
    }

    pub fn find_module_by_address(
        &self,
        process: ProcessHandle,
        address: GuestAddress,
    ) -> VmiResult<ModuleHandle> {
        self.enumerator.find_module_by_address(process, address)
    }

    pub fn find_module_by_name(&self, process: ProcessHandle, name: &str) -> VmiResult<ModuleHandle> {
        self.enumerator.find_module_by_name(process, name)
    }

    /// First already-running process with this name and bitness
    pub fn find_process(&self, name: &str, flags: ProcessFlags) -> VmiResult<ProcessHandle> {
        let flags = flags.validate()?;
        self.enumerator.snapshot_processes()?;
        self.registry
            .read()
            .find_process(name, flags)
            .ok_or_else(|| VmiError::NotFound(format!("process {} ({})", name, flags)))
    }

    // Subscriptions

    pub fn subscribe<F>(&self, trigger: Trigger, callback: F) -> VmiResult<SubscriptionId>
    where
        F: Fn(&GuestEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        self.table.lock().subscribe(trigger, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> VmiResult<()> {
        self.table.lock().unsubscribe(id)
    }

    pub fn listen_process_create<F>(&self, callback: F) -> VmiResult<SubscriptionId>
    where
        F: Fn(ProcessHandle) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Trigger::ProcessCreate, move |event| callback(event.process()))
    }

    pub fn listen_process_delete<F>(&self, callback: F) -> VmiResult<SubscriptionId>
    where
        F: Fn(ProcessHandle) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Trigger::ProcessDelete, move |event| callback(event.process()))
    }

    pub fn listen_module_load<F>(&self, scope: ModuleScope, callback: F) -> VmiResult<SubscriptionId>
    where
        F: Fn(ProcessHandle, ModuleHandle) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Trigger::ModuleLoad(scope), move |event| match event {
            GuestEvent::ModuleLoaded { process, module } => callback(*process, *module),
            _ => Ok(()),
        })
    }

    /// Active subscriptions in registration order
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.table.lock().list()
    }

    pub fn breakpoint_state(&self, class: TriggerClass) -> BreakpointState {
        self.table.lock().state(class)
    }

    // Event delivery

    /// Entry point for the hypervisor event thread
    pub fn on_trap(&self, trap: Trap) -> DispatchReport {
        self.dispatcher.dispatch(trap)
    }

    /// Exit notification for a process whose delete breakpoint was not armed
    pub fn notify_process_exit(&self, guest_id: GuestProcessId) {
        if let Some(handle) = self.registry.write().process_exited(guest_id) {
            debug!("process {} exited", handle);
        }
    }

    // Waits

    pub fn arm_wait<P>(
        &self,
        trigger: Trigger,
        predicate: P,
        options: &WaitOptions,
    ) -> VmiResult<PendingWait>
    where
        P: Fn(&GuestEvent) -> bool + Send + Sync + 'static,
    {
        self.waits.arm(trigger, predicate, options)
    }

    /// Blocks until an event on `trigger` satisfies `predicate`
    pub fn wait_for<P>(
        &self,
        trigger: Trigger,
        predicate: P,
        options: &WaitOptions,
    ) -> VmiResult<GuestEvent>
    where
        P: Fn(&GuestEvent) -> bool + Send + Sync + 'static,
    {
        self.waits.wait_for(trigger, predicate, options)
    }

    pub fn arm_wait_for_process(
        &self,
        name: &str,
        flags: ProcessFlags,
        options: &WaitOptions,
    ) -> VmiResult<PendingWait> {
        self.waits.arm_process(name, flags, options)
    }

    /// Blocks until a process with this name and bitness is created
    pub fn wait_for_process(
        &self,
        name: &str,
        flags: ProcessFlags,
        options: &WaitOptions,
    ) -> VmiResult<ProcessHandle> {
        self.waits.wait_for_process(name, flags, options)
    }

    pub fn cancel_all_waits(&self) {
        self.waits.cancel_all();
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.waits.cancel_all();
        self.table.lock().clear();
        debug!("introspection context torn down");
    }
}
