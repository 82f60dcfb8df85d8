//! Config change event round trips to the master broker.
//!
//! A broker recording a config change sends CONFIG_CHANGE_EVENT to the
//! master broker and waits on an [`EventLogWaiter`] until the master's
//! CONFIG_CHANGE_EVENT_REPLY arrives. Removing the master broker from the
//! live broker list fails every outstanding waiter at once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

/// State of one config change event round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventLogStatus {
    Waiting,
    Success,
    Failure(String),
}

/// Waiter for the master broker's answer to one config change event.
#[derive(Debug)]
pub struct EventLogWaiter {
    status: Mutex<EventLogStatus>,
    notify: Notify,
}

impl EventLogWaiter {
    fn new() -> Self {
        Self {
            status: Mutex::new(EventLogStatus::Waiting),
            notify: Notify::new(),
        }
    }

    pub fn status(&self) -> EventLogStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Set the terminal status. Ignored once resolved.
    pub fn resolve(&self, status: EventLogStatus) {
        let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *current == EventLogStatus::Waiting {
            *current = status;
        }
        drop(current);
        self.notify.notify_waiters();
    }

    /// Wait for the master broker's answer. A waiter still waiting at the
    /// deadline is returned as `Waiting`.
    pub async fn wait(&self, timeout: Duration, max_interval: Duration) -> EventLogStatus {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let status = self.status();
            if status != EventLogStatus::Waiting {
                return status;
            }
            let now = Instant::now();
            if now >= deadline {
                return status;
            }
            let _ = tokio::time::timeout((deadline - now).min(max_interval), notified).await;
        }
    }
}

/// Outstanding event log waiters, keyed by xid.
#[derive(Debug, Default)]
pub struct EventLogWaiters {
    waiters: DashMap<u64, Arc<EventLogWaiter>>,
}

impl EventLogWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, xid: u64) -> Arc<EventLogWaiter> {
        let waiter = Arc::new(EventLogWaiter::new());
        self.waiters.insert(xid, waiter.clone());
        waiter
    }

    /// Register a waiter that is removed again when the returned guard is
    /// dropped, including when the waiting future is cancelled.
    pub fn register_scoped(&self, xid: u64) -> ScopedWaiter<'_> {
        ScopedWaiter {
            waiter: self.register(xid),
            waiters: self,
            xid,
        }
    }

    /// Resolve the waiter for `xid`. Returns false if none is registered.
    pub fn resolve(&self, xid: u64, status: EventLogStatus) -> bool {
        match self.waiters.get(&xid).map(|w| w.value().clone()) {
            Some(waiter) => {
                waiter.resolve(status);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding waiter.
    pub fn fail_all(&self, reason: &str) {
        let waiters: Vec<_> = self.waiters.iter().map(|e| e.value().clone()).collect();
        for waiter in waiters {
            waiter.resolve(EventLogStatus::Failure(reason.to_string()));
        }
    }

    pub fn remove(&self, xid: u64) {
        self.waiters.remove(&xid);
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// A registered [`EventLogWaiter`] owned by one caller.
pub struct ScopedWaiter<'a> {
    waiter: Arc<EventLogWaiter>,
    waiters: &'a EventLogWaiters,
    xid: u64,
}

impl std::ops::Deref for ScopedWaiter<'_> {
    type Target = EventLogWaiter;

    fn deref(&self) -> &EventLogWaiter {
        &self.waiter
    }
}

impl Drop for ScopedWaiter<'_> {
    fn drop(&mut self) {
        self.waiters.remove(self.xid);
    }
}
