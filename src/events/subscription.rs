//! Event subscription table and breakpoint arming
//!
//! The table owns every subscription; callers only ever see ids. The first
//! subscription for a trigger class plants its breakpoint, the last one to go
//! removes it.

use super::{EventCallback, GuestEvent, Trigger};
use crate::core::types::{BreakpointId, SubscriptionId, VmiError, VmiResult};
use crate::guest::{GuestBackend, TriggerClass};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Lifecycle of the breakpoint backing one trigger class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointState {
    /// No subscription references the class; no breakpoint planted
    Disarmed,
    /// Breakpoint planted, guest running
    Armed,
    /// Guest trapped and held by the dispatcher
    Triggered,
    /// Matching callbacks are being invoked
    Dispatching,
}

/// Public view of one active subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub trigger: Trigger,
}

pub(crate) struct Subscription {
    id: SubscriptionId,
    trigger: Trigger,
    callback: EventCallback,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn invoke(&self, event: &GuestEvent) -> anyhow::Result<()> {
        (self.callback)(event)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("trigger", &self.trigger)
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Debug)]
struct BreakpointSlot {
    breakpoint: BreakpointId,
    refs: usize,
    state: BreakpointState,
}

/// Holds active subscriptions in registration order
pub struct SubscriptionTable {
    backend: Arc<dyn GuestBackend>,
    entries: Vec<Arc<Subscription>>,
    slots: HashMap<TriggerClass, BreakpointSlot>,
    next_id: u64,
    max_subscriptions: usize,
}

impl SubscriptionTable {
    pub fn new(backend: Arc<dyn GuestBackend>, max_subscriptions: usize) -> Self {
        SubscriptionTable {
            backend,
            entries: Vec::new(),
            slots: HashMap::new(),
            next_id: 1,
            max_subscriptions,
        }
    }

    /// Registers a callback for a trigger
    pub fn subscribe(&mut self, trigger: Trigger, callback: EventCallback) -> VmiResult<SubscriptionId> {
        if self.entries.len() >= self.max_subscriptions {
            return Err(VmiError::ResourceExhausted(format!(
                "subscription limit of {} reached",
                self.max_subscriptions
            )));
        }

        self.arm(trigger.class())?;

        let id = SubscriptionId::new(self.next_id);
        self.next_id += 1;
        self.entries.push(Arc::new(Subscription {
            id,
            trigger,
            callback,
            active: AtomicBool::new(true),
        }));
        debug!("{} registered for {}", id, trigger);
        Ok(id)
    }

    /// Removes a subscription; a second removal of the same id is `NotFound`
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> VmiResult<()> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or_else(|| VmiError::NotFound(format!("subscription {}", id)))?;

        let entry = self.entries.remove(position);
        entry.deactivate();
        debug!("{} removed from {}", id, entry.trigger);
        self.release(entry.trigger.class());
        Ok(())
    }

    fn arm(&mut self, class: TriggerClass) -> VmiResult<()> {
        if let Some(slot) = self.slots.get_mut(&class) {
            slot.refs += 1;
            return Ok(());
        }

        let breakpoint = self.backend.plant_breakpoint(class).map_err(|e| {
            VmiError::ResourceExhausted(format!("cannot plant {} breakpoint: {}", class, e))
        })?;
        info!("{} armed with {}", class, breakpoint);
        self.slots.insert(
            class,
            BreakpointSlot {
                breakpoint,
                refs: 1,
                state: BreakpointState::Armed,
            },
        );
        Ok(())
    }

    fn release(&mut self, class: TriggerClass) {
        let disarm = match self.slots.get_mut(&class) {
            Some(slot) => {
                slot.refs -= 1;
                slot.refs == 0
            }
            None => false,
        };

        if disarm {
            if let Some(slot) = self.slots.remove(&class) {
                self.backend.remove_breakpoint(slot.breakpoint);
                info!("{} disarmed, {} removed", class, slot.breakpoint);
            }
        }
    }

    /// Active subscriptions whose trigger matches, in registration order
    pub(crate) fn matching(&self, event: &GuestEvent) -> Vec<Arc<Subscription>> {
        self.entries
            .iter()
            .filter(|entry| entry.is_active() && entry.trigger.matches(event))
            .cloned()
            .collect()
    }

    /// Trigger class a planted breakpoint belongs to
    pub fn class_for_breakpoint(&self, breakpoint: BreakpointId) -> Option<TriggerClass> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.breakpoint == breakpoint)
            .map(|(class, _)| *class)
    }

    pub fn state(&self, class: TriggerClass) -> BreakpointState {
        self.slots
            .get(&class)
            .map(|slot| slot.state)
            .unwrap_or(BreakpointState::Disarmed)
    }

    /// Moves an armed class through the dispatch cycle; ignored once disarmed
    pub(crate) fn set_state(&mut self, class: TriggerClass, state: BreakpointState) {
        if let Some(slot) = self.slots.get_mut(&class) {
            slot.state = state;
        }
    }

    pub fn list(&self) -> Vec<SubscriptionInfo> {
        self.entries
            .iter()
            .map(|entry| SubscriptionInfo {
                id: entry.id,
                trigger: entry.trigger,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every subscription and removes every planted breakpoint
    pub fn clear(&mut self) {
        for entry in self.entries.drain(..) {
            entry.deactivate();
        }
        for (class, slot) in self.slots.drain() {
            self.backend.remove_breakpoint(slot.breakpoint);
            info!("{} disarmed on teardown", class);
        }
    }
}

/// RAII guard that cancels a subscription when dropped
pub struct SubscriptionGuard {
    table: Arc<Mutex<SubscriptionTable>>,
    id: Option<SubscriptionId>,
}

impl SubscriptionGuard {
    pub fn new(table: Arc<Mutex<SubscriptionTable>>, id: SubscriptionId) -> Self {
        SubscriptionGuard {
            table,
            id: Some(id),
        }
    }

    pub fn id(&self) -> Option<SubscriptionId> {
        self.id
    }

    /// Keeps the subscription alive past the guard
    pub fn into_id(mut self) -> Option<SubscriptionId> {
        self.id.take()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            // Already removed by the caller or by teardown.
            let _ = self.table.lock().unsubscribe(id);
        }
    }
}
