//! Service coordinators. Each one owns a single long-lived job and talks to
//! the others only through the [`ActionBus`].

pub mod compose;
pub mod dev_script;
pub mod installer;
pub mod runtime;
pub mod stack;
pub mod watcher;

use crate::bus::ActionBus;
use crate::config::PreferenceSource;
use crate::paths::Paths;
use crate::status::StatusSink;
use runtime::Toolchain;
use std::sync::Arc;

/// Handles every coordinator is built from.
#[derive(Clone)]
pub struct ServiceContext {
    pub bus: Arc<ActionBus>,
    pub prefs: Arc<dyn PreferenceSource>,
    pub status: Arc<dyn StatusSink>,
    pub paths: Paths,
    pub toolchain: Toolchain,
}
