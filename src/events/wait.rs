//! Blocking waits built on temporary subscriptions
//!
//! A wait plants a subscription whose callback evaluates the caller's
//! predicate on the dispatch thread and parks the first match in a slot. The
//! waiting thread sleeps on the slot's condition variable until a match,
//! cancellation or its deadline. The subscription is owned by a
//! [`SubscriptionGuard`], so every exit path unsubscribes.

use super::subscription::{SubscriptionGuard, SubscriptionTable};
use super::{GuestEvent, Trigger};
use crate::core::types::{ProcessFlags, ProcessHandle, VmiError, VmiResult};
use crate::process::registry::HandleRegistry;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct WaitState {
    matched: Option<GuestEvent>,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct WaitSlot {
    state: Mutex<WaitState>,
    cvar: Condvar,
}

impl WaitSlot {
    fn is_settled(&self) -> bool {
        let state = self.state.lock();
        state.matched.is_some() || state.cancelled
    }

    fn offer(&self, event: &GuestEvent) {
        let mut state = self.state.lock();
        if state.matched.is_none() && !state.cancelled {
            state.matched = Some(*event);
            self.cvar.notify_all();
        }
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        self.cvar.notify_all();
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    waiters: Mutex<Vec<Weak<WaitSlot>>>,
}

/// Cloneable cancellation signal for blocking waits
///
/// Once cancelled it stays cancelled; waits started with it afterwards
/// return `Cancelled` immediately.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let waiters: Vec<Weak<WaitSlot>> = self.inner.waiters.lock().drain(..).collect();
        for slot in waiters.iter().filter_map(Weak::upgrade) {
            slot.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    fn register(&self, slot: &Arc<WaitSlot>) {
        {
            let mut waiters = self.inner.waiters.lock();
            waiters.retain(|w| w.strong_count() > 0);
            waiters.push(Arc::downgrade(slot));
        }
        // A cancel racing with registration may have drained before the push.
        if self.is_cancelled() {
            slot.cancel();
        }
    }
}

/// Timeout and cancellation for one wait
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// A wait whose subscription is already in place
///
/// Arming first and blocking later lets a caller start the guest only once
/// the subscription exists, so no event can slip between the two.
pub struct PendingWait {
    slot: Arc<WaitSlot>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    // Dropped after the slot lock in `wait`, removing the subscription.
    _guard: SubscriptionGuard,
}

impl PendingWait {
    /// Blocks until the predicate matches, the deadline passes or the wait is cancelled
    pub fn wait(self) -> VmiResult<GuestEvent> {
        let mut state = self.slot.state.lock();
        loop {
            if let Some(event) = state.matched.take() {
                return Ok(event);
            }
            if state.cancelled {
                return Err(VmiError::Cancelled);
            }
            match (self.deadline, self.timeout) {
                (Some(deadline), Some(timeout)) => {
                    if Instant::now() >= deadline {
                        return Err(VmiError::Timeout(timeout));
                    }
                    self.slot.cvar.wait_until(&mut state, deadline);
                }
                _ => self.slot.cvar.wait(&mut state),
            }
        }
    }

    /// Like [`PendingWait::wait`], for waits on process creation
    pub fn wait_process(self) -> VmiResult<ProcessHandle> {
        match self.wait()? {
            GuestEvent::ProcessCreated(process) => Ok(process),
            other => Err(VmiError::NotFound(format!(
                "expected a process creation, got {}",
                other
            ))),
        }
    }
}

/// Builds and tracks blocking waits for a core context
pub struct WaitCoordinator {
    registry: Arc<RwLock<HandleRegistry>>,
    table: Arc<Mutex<SubscriptionTable>>,
    inflight: Mutex<Vec<Weak<WaitSlot>>>,
    default_timeout: Option<Duration>,
}

impl WaitCoordinator {
    pub fn new(
        registry: Arc<RwLock<HandleRegistry>>,
        table: Arc<Mutex<SubscriptionTable>>,
        default_timeout: Option<Duration>,
    ) -> Self {
        WaitCoordinator {
            registry,
            table,
            inflight: Mutex::new(Vec::new()),
            default_timeout,
        }
    }

    /// Subscribes a temporary waiter without blocking
    pub fn arm<P>(&self, trigger: Trigger, predicate: P, options: &WaitOptions) -> VmiResult<PendingWait>
    where
        P: Fn(&GuestEvent) -> bool + Send + Sync + 'static,
    {
        let started = Instant::now();
        let timeout = options.timeout.or(self.default_timeout);
        let slot = Arc::new(WaitSlot::default());

        let waiter = Arc::clone(&slot);
        let id = self.table.lock().subscribe(
            trigger,
            Arc::new(move |event: &GuestEvent| -> anyhow::Result<()> {
                if !waiter.is_settled() && predicate(event) {
                    waiter.offer(event);
                }
                Ok(())
            }),
        )?;
        let guard = SubscriptionGuard::new(Arc::clone(&self.table), id);
        debug!("wait on {} armed as {}", trigger, id);

        {
            let mut inflight = self.inflight.lock();
            inflight.retain(|w| w.strong_count() > 0);
            inflight.push(Arc::downgrade(&slot));
        }
        if let Some(token) = &options.cancel {
            token.register(&slot);
        }

        Ok(PendingWait {
            slot,
            timeout,
            // A timeout past the end of the clock never expires.
            deadline: timeout.and_then(|t| started.checked_add(t)),
            _guard: guard,
        })
    }

    /// Blocks until an event on `trigger` satisfies `predicate`
    pub fn wait_for<P>(&self, trigger: Trigger, predicate: P, options: &WaitOptions) -> VmiResult<GuestEvent>
    where
        P: Fn(&GuestEvent) -> bool + Send + Sync + 'static,
    {
        self.arm(trigger, predicate, options)?.wait()
    }

    /// Arms a wait for a newly created process with this name and bitness
    pub fn arm_process(
        &self,
        name: &str,
        flags: ProcessFlags,
        options: &WaitOptions,
    ) -> VmiResult<PendingWait> {
        let flags = flags.validate()?;
        let registry = Arc::clone(&self.registry);
        let name = name.to_string();
        self.arm(
            Trigger::ProcessCreate,
            move |event| match event {
                GuestEvent::ProcessCreated(process) => {
                    registry.read().process_matches(*process, &name, flags)
                }
                _ => false,
            },
            options,
        )
    }

    pub fn wait_for_process(
        &self,
        name: &str,
        flags: ProcessFlags,
        options: &WaitOptions,
    ) -> VmiResult<ProcessHandle> {
        self.arm_process(name, flags, options)?.wait_process()
    }

    /// Cancels every wait currently blocked or armed
    pub fn cancel_all(&self) {
        let slots: Vec<Weak<WaitSlot>> = self.inflight.lock().drain(..).collect();
        for slot in slots.iter().filter_map(Weak::upgrade) {
            slot.cancel();
        }
    }
}
