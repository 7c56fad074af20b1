//! Named-action dispatcher shared by every coordinator.
//!
//! Coordinators never call each other. Each one registers handlers for the
//! actions it reacts to and fires its own completion actions, which is how
//! the `runtime_ready → install_finished → first_build_finished` chain is
//! sequenced.
//!
//! Handlers are synchronous callbacks: anything long-running is started with
//! `tokio::spawn` inside the handler, and the bus never awaits it.
//!
//! # Fault containment
//!
//! Every handler invocation runs inside an error boundary. An `Err` return is
//! logged at `warn`, a panic is caught and logged at `error`, and in both
//! cases the remaining handlers still run and `fire` returns normally.

use crate::config::{FolderRole, Settings};
use crate::error::Result;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

/// Action names fired inside pressdev.
pub mod actions {
    /// The private runtime and package manager are usable.
    pub const RUNTIME_READY: &str = "runtime_ready";
    /// `npm install` exited 0 in a folder. Payload: [`super::Payload::Folder`].
    pub const INSTALL_FINISHED: &str = "install_finished";
    /// The asset-build watcher reported idle for the first time.
    pub const FIRST_BUILD_FINISHED: &str = "first_build_finished";
    /// Preferences changed. Payload: [`super::Payload::Settings`].
    pub const SETTINGS_CHANGED: &str = "settings_changed";
    /// The process is exiting.
    pub const SHUTDOWN: &str = "shutdown";
}

/// Argument carried by a fired action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    Folder(FolderRole),
    Settings(Settings),
}

type Callback = Arc<dyn Fn(&Payload) -> Result<()> + Send + Sync>;

struct Registration {
    handler_id: String,
    priority: i32,
    seq: u64,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    handlers: HashMap<String, Vec<Registration>>,
    runs: HashMap<String, u64>,
    next_seq: u64,
}

/// Process-wide dispatcher, constructed once and passed to every coordinator.
#[derive(Default)]
pub struct ActionBus {
    inner: Mutex<Inner>,
}

impl ActionBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `callback` for `action`. Lower `priority` runs first; equal
    /// priorities run in registration order. Registering an id that already
    /// exists for `action` replaces the earlier registration.
    pub fn register<F>(&self, action: &str, handler_id: &str, priority: i32, callback: F)
    where
        F: Fn(&Payload) -> Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let list = inner.handlers.entry(action.to_string()).or_default();
        list.retain(|r| r.handler_id != handler_id);
        list.push(Registration {
            handler_id: handler_id.to_string(),
            priority,
            seq,
            callback: Arc::new(callback),
        });
        list.sort_by_key(|r| (r.priority, r.seq));
    }

    /// Remove a registration. Returns true if one existed.
    pub fn unregister(&self, action: &str, handler_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(list) = inner.handlers.get_mut(action) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.handler_id != handler_id);
        before != list.len()
    }

    /// Record that `action` fired, then run its handlers in priority order.
    ///
    /// The action counts as fired before the first handler runs, so a handler
    /// (or anything it spawns) sees `has_fired(action) == true`. Handlers may
    /// register or fire re-entrantly; the handler list is snapshotted first.
    pub fn fire(&self, action: &str, payload: Payload) {
        let callbacks: Vec<(String, Callback)> = {
            let mut inner = self.lock();
            *inner.runs.entry(action.to_string()).or_default() += 1;
            inner
                .handlers
                .get(action)
                .map(|list| {
                    list.iter()
                        .map(|r| (r.handler_id.clone(), Arc::clone(&r.callback)))
                        .collect()
                })
                .unwrap_or_default()
        };

        tracing::debug!("firing {action} ({} handlers)", callbacks.len());

        for (handler_id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("handler {handler_id} for {action} failed: {e}"),
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    tracing::error!("handler {handler_id} for {action} panicked: {msg}");
                }
            }
        }
    }

    /// Whether `action` has fired at least once. Lets late-starting
    /// coordinators run immediately instead of waiting for a missed action.
    pub fn has_fired(&self, action: &str) -> bool {
        self.fire_count(action) > 0
    }

    pub fn fire_count(&self, action: &str) -> u64 {
        self.lock().runs.get(action).copied().unwrap_or(0)
    }

    pub fn handler_count(&self, action: &str) -> usize {
        self.lock().handlers.get(action).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
