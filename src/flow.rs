//! Read-side flow control.
//!
//! A [`ReadGate`] lets the protocol layer pause the receive pump when it
//! cannot keep up with incoming data. The pump checks the gate between
//! iterations: an in-flight receive always completes, but the next one is
//! not issued until the gate opens again.
//!
//! # Usage
//!
//! Sessions reach the gate through
//! [`ConnectionHandle::suspend_read`](crate::ConnectionHandle::suspend_read)
//! and [`resume_read`](crate::ConnectionHandle::resume_read). Code that pauses
//! for a bounded scope can hold a [`SuspendGuard`] instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct GateState {
    suspended: AtomicBool,
    notify: Notify,
}

/// Shared open/suspended flag for one connection's receive pump.
///
/// Cloning shares the state.
#[derive(Debug, Clone, Default)]
pub struct ReadGate {
    state: Arc<GateState>,
}

impl ReadGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop issuing new receives.
    ///
    /// Returns `true` if the gate was open.
    pub fn suspend(&self) -> bool {
        !self.state.suspended.swap(true, Ordering::AcqRel)
    }

    /// Allow receives again and wake the pump.
    ///
    /// Returns `true` if the gate was suspended.
    pub fn resume(&self) -> bool {
        let was = self.state.suspended.swap(false, Ordering::AcqRel);
        if was {
            self.state.notify.notify_waiters();
        }
        was
    }

    /// Check if the gate is currently suspended.
    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.state.suspended.load(Ordering::Acquire)
    }

    /// Wait until the gate is open. Returns immediately when it already is.
    pub async fn wait_open(&self) {
        loop {
            let notified = self.state.notify.notified();
            if !self.is_suspended() {
                return;
            }
            notified.await;
        }
    }

    /// Suspend the gate until the returned guard is dropped.
    pub fn suspend_scoped(&self) -> SuspendGuard {
        let armed = self.suspend();
        SuspendGuard {
            gate: self.clone(),
            armed,
        }
    }
}

/// Guard that resumes reads on drop.
///
/// A guard taken while the gate was already suspended does nothing, so the
/// outer suspension stays in effect.
pub struct SuspendGuard {
    gate: ReadGate,
    armed: bool,
}

impl SuspendGuard {
    /// Resume now instead of at drop.
    pub fn release(mut self) {
        if self.armed {
            self.gate.resume();
            self.armed = false;
        }
    }

    /// Disarm the guard (don't resume on drop).
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        if self.armed {
            self.gate.resume();
        }
    }
}
