//! Breakpoint dispatcher
//!
//! Runs on the hypervisor event thread while the guest is held. A trap is
//! resolved to handles, every matching subscription runs in registration
//! order with no lock held, and only then does the call return and the guest
//! resume. A failing or panicking callback is logged and recorded in the
//! report; it never stops the remaining callbacks.

use super::subscription::{BreakpointState, Subscription, SubscriptionTable};
use super::GuestEvent;
use crate::core::types::{VmiError, VmiResult};
use crate::guest::{GuestBackend, RawEvent, Trap};
use crate::process::registry::{reconcile_modules, track_process, HandleRegistry};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of dispatching one trap
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// The resolved event, if the trap could be resolved
    pub event: Option<GuestEvent>,
    /// Callbacks that returned successfully
    pub invoked: usize,
    /// Callback failures and resolution errors
    pub failures: Vec<VmiError>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct BreakpointDispatcher {
    registry: Arc<RwLock<HandleRegistry>>,
    table: Arc<Mutex<SubscriptionTable>>,
    backend: Arc<dyn GuestBackend>,
    catch_panics: bool,
}

impl BreakpointDispatcher {
    pub fn new(
        registry: Arc<RwLock<HandleRegistry>>,
        table: Arc<Mutex<SubscriptionTable>>,
        backend: Arc<dyn GuestBackend>,
        catch_panics: bool,
    ) -> Self {
        BreakpointDispatcher {
            registry,
            table,
            backend,
            catch_panics,
        }
    }

    /// Handles one trap; returns once every matching callback has run
    pub fn dispatch(&self, trap: Trap) -> DispatchReport {
        let class = trap.event.class();
        let mut report = DispatchReport::default();

        {
            let mut table = self.table.lock();
            match table.class_for_breakpoint(trap.breakpoint) {
                Some(owner) if owner == class => table.set_state(class, BreakpointState::Triggered),
                Some(owner) => warn!(
                    "{} belongs to {} but reported a {} event",
                    trap.breakpoint, owner, class
                ),
                None => debug!("trap on unknown or removed {}", trap.breakpoint),
            }
        }

        let event = match self.resolve(&trap.event) {
            Ok(event) => event,
            Err(err) => {
                warn!("cannot resolve {:?}: {}", trap.event, err);
                report.failures.push(err);
                self.table.lock().set_state(class, BreakpointState::Armed);
                return report;
            }
        };
        report.event = Some(event);

        let subscribers = {
            let mut table = self.table.lock();
            table.set_state(class, BreakpointState::Dispatching);
            table.matching(&event)
        };

        for subscription in subscribers {
            // Cancelled by an earlier callback of this same dispatch.
            if !subscription.is_active() {
                continue;
            }
            match self.invoke(&subscription, &event) {
                Ok(()) => report.invoked += 1,
                Err(err) => {
                    warn!("{}", err);
                    report.failures.push(err);
                }
            }
        }

        if let GuestEvent::ProcessDeleted(process) = event {
            self.registry.write().invalidate(process);
        }

        self.table.lock().set_state(class, BreakpointState::Armed);
        report
    }

    fn resolve(&self, raw: &RawEvent) -> VmiResult<GuestEvent> {
        match *raw {
            RawEvent::ProcessCreate(guest_id) => {
                let descriptor = self.backend.describe_process(guest_id).ok_or_else(|| {
                    VmiError::NotFound(format!("created guest process {}", guest_id))
                })?;
                let handle = self.registry.write().process_created(guest_id, descriptor);
                Ok(GuestEvent::ProcessCreated(handle))
            }
            RawEvent::ProcessExit(guest_id) => {
                // The handle stays valid until every delete callback has run.
                let handle = track_process(&self.registry, self.backend.as_ref(), guest_id)?;
                Ok(GuestEvent::ProcessDeleted(handle))
            }
            RawEvent::ModuleLoad { process, module } => {
                let handle = track_process(&self.registry, self.backend.as_ref(), process)?;
                let descriptor = self.backend.describe_module(process, module).ok_or_else(|| {
                    VmiError::NotFound(format!("loaded {} in {}", module, process))
                })?;
                let loaded = self
                    .registry
                    .write()
                    .module_loaded(handle, module, descriptor.clone());
                let tracked = match loaded {
                    // Unloads are only seen by module walks, so the overlap
                    // may be a module the guest already dropped.
                    Err(VmiError::OverlappingModule { .. }) => {
                        debug!("{} overlaps a tracked module of {}, re-syncing", module, handle);
                        if let Err(err) =
                            reconcile_modules(&self.registry, self.backend.as_ref(), handle)
                        {
                            debug!("module re-sync of {} failed: {}", handle, err);
                        }
                        self.registry
                            .write()
                            .module_loaded(handle, module, descriptor)?
                    }
                    other => other?,
                };
                Ok(GuestEvent::ModuleLoaded {
                    process: handle,
                    module: tracked,
                })
            }
        }
    }

    fn invoke(&self, subscription: &Subscription, event: &GuestEvent) -> VmiResult<()> {
        let outcome = if self.catch_panics {
            panic::catch_unwind(AssertUnwindSafe(|| subscription.invoke(event)))
                .map_err(|payload| panic_message(payload.as_ref()))
        } else {
            Ok(subscription.invoke(event))
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(VmiError::callback_failed(subscription.id(), format!("{:#}", err))),
            Err(message) => Err(VmiError::callback_failed(
                subscription.id(),
                format!("panicked: {}", message),
            )),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
