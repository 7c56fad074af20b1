//! `grunt watch --dev` in the primary folder, with its output turned into
//! ready/rebuilding transitions.

use super::ServiceContext;
use crate::bus::{actions, ActionBus, Payload};
use crate::config::{FolderRole, Settings};
use crate::error::Result;
use crate::paths::build_config;
use crate::process::{command_in, ExitOutcome, ProcessSlot};
use crate::status::{Status, StatusSink, SERVICE_BUILD};
use crate::watch::{watch_file, FileWatch, DEBOUNCE};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// grunt prints this once a build pass is done and it is idle again.
pub const IDLE_MARKER: &str = "Waiting...";

const HANDLER_ID: &str = "build";
/// Runs ahead of the installer's settings handler.
const SETTINGS_PRIORITY: i32 = 9;
const PRIORITY: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Idle,
    Other,
}

pub fn classify(line: &str) -> LineKind {
    if line.trim().ends_with(IDLE_MARKER) {
        LineKind::Idle
    } else {
        LineKind::Other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Starting,
    Ready,
    Rebuilding,
}

/// Status change implied by one line of watcher output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    /// Idle again. `first` is set for the first idle line of the process.
    Ready { first: bool },
    Rebuilding,
}

/// Per-process output state machine: `Starting → Ready ⇄ Rebuilding`.
#[derive(Debug)]
pub struct BuildTracker {
    state: BuildState,
    seen_idle: bool,
}

impl Default for BuildTracker {
    fn default() -> Self {
        Self {
            state: BuildState::Starting,
            seen_idle: false,
        }
    }
}

impl BuildTracker {
    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn observe(&mut self, line: &str) -> Transition {
        match (classify(line), self.state) {
            (LineKind::Idle, _) => {
                let first = !self.seen_idle;
                self.seen_idle = true;
                self.state = BuildState::Ready;
                Transition::Ready { first }
            }
            (LineKind::Other, BuildState::Ready) => {
                self.state = BuildState::Rebuilding;
                Transition::Rebuilding
            }
            (LineKind::Other, _) => Transition::Unchanged,
        }
    }
}

pub struct AssetWatcher {
    ctx: ServiceContext,
    slot: ProcessSlot,
    primary: Mutex<Option<PathBuf>>,
    config_watch: Mutex<Option<FileWatch>>,
}

impl AssetWatcher {
    pub fn new(ctx: ServiceContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            slot: ProcessSlot::new("grunt watch"),
            primary: Mutex::new(None),
            config_watch: Mutex::new(None),
        })
    }

    pub fn slot(&self) -> &ProcessSlot {
        &self.slot
    }

    pub fn register(self: &Arc<Self>) {
        let folder = self
            .ctx
            .prefs
            .snapshot()
            .folder(FolderRole::Primary)
            .map(Path::to_path_buf);
        self.set_primary(folder);

        let bus = &self.ctx.bus;
        let weak = Arc::downgrade(self);
        bus.register(actions::INSTALL_FINISHED, HANDLER_ID, PRIORITY, move |p| {
            if *p == Payload::Folder(FolderRole::Primary) {
                if let Some(this) = weak.upgrade() {
                    this.spawn_start();
                }
            }
            Ok(())
        });

        let weak = Arc::downgrade(self);
        bus.register(
            actions::SETTINGS_CHANGED,
            HANDLER_ID,
            SETTINGS_PRIORITY,
            move |p| {
                if let (Payload::Settings(s), Some(this)) = (p, weak.upgrade()) {
                    this.settings_changed(s);
                }
                Ok(())
            },
        );

        let weak = Arc::downgrade(self);
        bus.register(actions::SHUTDOWN, HANDLER_ID, PRIORITY, move |_| {
            if let Some(this) = weak.upgrade() {
                tokio::spawn(async move { this.stop().await });
            }
            Ok(())
        });
    }

    fn spawn_start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.start().await {
                tracing::warn!("grunt watch could not start: {e}");
                let msg = e.to_string();
                this.ctx
                    .status
                    .report(SERVICE_BUILD, Status::Error, Some(msg.as_str()));
            }
        });
    }

    /// The primary folder moved: stop watching it. A restart waits for the
    /// next `install_finished(primary)`.
    fn settings_changed(self: &Arc<Self>, settings: &Settings) {
        let folder = settings.folder(FolderRole::Primary).map(Path::to_path_buf);
        if !self.set_primary(folder) {
            return;
        }
        tracing::info!("primary folder changed, stopping grunt watch");
        let this = Arc::clone(self);
        tokio::spawn(async move { this.stop().await });
    }

    /// (Re)start the watch process, replacing any running one.
    pub async fn start(&self) -> Result<()> {
        self.ctx
            .status
            .report(SERVICE_BUILD, Status::Building, Some("Starting grunt watch"));
        self.slot.clear().await;

        if !self.ctx.bus.has_fired(actions::INSTALL_FINISHED) {
            tracing::debug!("dependencies not installed yet, not starting grunt");
            return Ok(());
        }
        let Some(folder) = self
            .ctx
            .prefs
            .snapshot()
            .folder(FolderRole::Primary)
            .map(Path::to_path_buf)
        else {
            tracing::debug!("primary folder not set, not starting grunt");
            return Ok(());
        };

        let grunt = folder.join("node_modules/grunt/bin/grunt");
        let mut cmd = command_in(&self.ctx.toolchain.node, &folder);
        cmd.arg(&grunt).args(["watch", "--dev"]);

        let bus = Arc::clone(&self.ctx.bus);
        let status = Arc::clone(&self.ctx.status);
        let exit_status = Arc::clone(&self.ctx.status);
        let mut tracker = BuildTracker::default();

        self.slot
            .replace(
                cmd,
                move |line| {
                    tracing::debug!("[grunt] {line}");
                    apply(tracker.observe(line), &bus, status.as_ref());
                },
                move |outcome| match outcome {
                    ExitOutcome::Killed => tracing::debug!("grunt watch killed"),
                    ExitOutcome::Exited { code: Some(0), .. } => {
                        tracing::info!("grunt watch exited");
                        exit_status.report(SERVICE_BUILD, Status::Stopped, None);
                    }
                    ExitOutcome::Exited { code, stderr } => {
                        tracing::warn!("grunt watch exited {code:?}: {}", stderr.trim());
                        exit_status.report(SERVICE_BUILD, Status::Error, Some("grunt watch exited"));
                    }
                    ExitOutcome::Failed(e) => {
                        tracing::warn!("grunt watch failed: {e}");
                        exit_status.report(SERVICE_BUILD, Status::Error, Some(e.as_str()));
                    }
                },
            )
            .await
    }

    pub async fn stop(&self) {
        if self.slot.clear().await {
            self.ctx.status.report(SERVICE_BUILD, Status::Stopped, None);
        }
    }

    /// Record the primary folder and move the `Gruntfile.js` watch with it.
    /// Returns true if the folder changed.
    fn set_primary(self: &Arc<Self>, folder: Option<PathBuf>) -> bool {
        {
            let mut primary = self.primary.lock().unwrap_or_else(PoisonError::into_inner);
            if *primary == folder {
                return false;
            }
            *primary = folder.clone();
        }

        let mut watch = self
            .config_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *watch = None;
        if let Some(folder) = folder {
            let weak = Arc::downgrade(self);
            match watch_file(&build_config(&folder), DEBOUNCE, move || {
                if let Some(this) = weak.upgrade() {
                    tracing::info!("Gruntfile.js changed, restarting grunt watch");
                    this.spawn_start();
                }
            }) {
                Ok(w) => *watch = Some(w),
                Err(e) => tracing::warn!("cannot watch Gruntfile.js in {}: {e}", folder.display()),
            }
        }
        true
    }
}

fn apply(transition: Transition, bus: &ActionBus, status: &dyn StatusSink) {
    match transition {
        Transition::Unchanged => {}
        Transition::Rebuilding => status.report(SERVICE_BUILD, Status::Rebuilding, None),
        Transition::Ready { first } => {
            status.report(SERVICE_BUILD, Status::Ready, None);
            if first {
                bus.fire(actions::FIRST_BUILD_FINISHED, Payload::Empty);
            }
        }
    }
}
