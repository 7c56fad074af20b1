use super::ServiceContext;
use crate::bus::{actions, Payload};
use crate::config::{FolderRole, Settings};
use crate::error::Result;
use crate::io::ensure_dir;
use crate::paths::package_manifest;
use crate::process::{command_in, ExitOutcome, ProcessSlot};
use crate::status::{Status, SERVICE_DEPENDENCIES};
use crate::watch::{watch_file, FileWatch, DEBOUNCE};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

const HANDLER_ID: &str = "dependencies";
const PRIORITY: i32 = 10;

/// Runs `npm install` in every configured folder, one process per folder.
pub struct DependencyInstaller {
    ctx: ServiceContext,
    primary: ProcessSlot,
    secondary: ProcessSlot,
    folders: Mutex<HashMap<FolderRole, Option<PathBuf>>>,
    watches: Mutex<HashMap<FolderRole, FileWatch>>,
}

impl DependencyInstaller {
    pub fn new(ctx: ServiceContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            primary: ProcessSlot::new("npm install (primary)"),
            secondary: ProcessSlot::new("npm install (secondary)"),
            folders: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
        })
    }

    pub fn slot(&self, role: FolderRole) -> &ProcessSlot {
        match role {
            FolderRole::Primary => &self.primary,
            FolderRole::Secondary => &self.secondary,
        }
    }

    /// Hook into the bus and arm the manifest watches. If the runtime is
    /// already ready, installs start straight away.
    pub fn register(self: &Arc<Self>) {
        let settings = self.ctx.prefs.snapshot();
        for role in FolderRole::all() {
            let folder = settings.folder(role).map(Path::to_path_buf);
            self.remember(role, folder.clone());
            self.rewatch(role, folder.as_deref());
        }

        let bus = &self.ctx.bus;
        let weak = Arc::downgrade(self);
        bus.register(actions::RUNTIME_READY, HANDLER_ID, PRIORITY, move |_| {
            with(&weak, |this| this.spawn_all());
            Ok(())
        });

        let weak = Arc::downgrade(self);
        bus.register(actions::SETTINGS_CHANGED, HANDLER_ID, PRIORITY, move |p| {
            if let Payload::Settings(settings) = p {
                with(&weak, |this| this.settings_changed(settings));
            }
            Ok(())
        });

        let weak = Arc::downgrade(self);
        bus.register(actions::SHUTDOWN, HANDLER_ID, PRIORITY, move |_| {
            with(&weak, |this| {
                let this = Arc::clone(this);
                tokio::spawn(async move { this.stop_all().await });
            });
            Ok(())
        });

        if bus.has_fired(actions::RUNTIME_READY) {
            self.spawn_all();
        }
    }

    fn spawn_all(self: &Arc<Self>) {
        for role in FolderRole::all() {
            self.spawn_install(role);
        }
    }

    fn spawn_install(self: &Arc<Self>, role: FolderRole) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.install(role).await {
                tracing::warn!("npm install in {role} could not start: {e}");
            }
        });
    }

    /// Reinstall in every folder whose path changed.
    fn settings_changed(self: &Arc<Self>, settings: &Settings) {
        for role in FolderRole::all() {
            let folder = settings.folder(role).map(Path::to_path_buf);
            if !self.remember(role, folder.clone()) {
                continue;
            }
            tracing::info!("{role} changed, reinstalling dependencies");
            self.rewatch(role, folder.as_deref());
            self.spawn_install(role);
        }
    }

    /// A folder's `package.json` changed on disk.
    pub fn manifest_changed(self: &Arc<Self>, role: FolderRole) {
        tracing::info!("package.json changed in {role}, reinstalling");
        self.spawn_install(role);
    }

    /// Kill any running install for `role`, then start a fresh one.
    ///
    /// Does nothing (beyond the kill) until the runtime is ready and the
    /// folder is configured. Exit 0 fires `install_finished`.
    pub async fn install(&self, role: FolderRole) -> Result<()> {
        let slot = self.slot(role);
        slot.clear().await;

        if !self.ctx.bus.has_fired(actions::RUNTIME_READY) {
            tracing::debug!("runtime not ready, skipping npm install in {role}");
            return Ok(());
        }
        let Some(folder) = self.ctx.prefs.snapshot().folder(role).map(Path::to_path_buf) else {
            tracing::debug!("{role} not set, skipping npm install");
            return Ok(());
        };

        let cache = self.ctx.paths.npm_cache_dir();
        ensure_dir(&cache)?;

        let toolchain = &self.ctx.toolchain;
        let mut cmd = command_in(&toolchain.node, &folder);
        cmd.arg(&toolchain.npm_cli)
            .args(["install", "--scripts-prepend-node-path=true"])
            .env("npm_config_cache", &cache);

        let msg = format!("Installing dependencies in {}", folder.display());
        self.ctx
            .status
            .report(SERVICE_DEPENDENCIES, Status::Building, Some(msg.as_str()));

        let bus = Arc::clone(&self.ctx.bus);
        let status = Arc::clone(&self.ctx.status);
        let result = slot
            .replace(
                cmd,
                move |line| tracing::debug!("[npm {role}] {line}"),
                move |outcome| match outcome {
                    ExitOutcome::Exited { code: Some(0), .. } => {
                        tracing::info!("npm install finished in {role}");
                        status.report(SERVICE_DEPENDENCIES, Status::Ready, None);
                        bus.fire(actions::INSTALL_FINISHED, Payload::Folder(role));
                    }
                    ExitOutcome::Exited { code, stderr } => {
                        tracing::warn!("npm install in {role} exited {code:?}: {}", stderr.trim());
                        let msg = format!("npm install failed in {role}");
                        status.report(SERVICE_DEPENDENCIES, Status::Error, Some(msg.as_str()));
                    }
                    ExitOutcome::Killed => tracing::debug!("npm install in {role} killed"),
                    ExitOutcome::Failed(e) => {
                        tracing::warn!("npm install in {role} failed: {e}");
                        status.report(SERVICE_DEPENDENCIES, Status::Error, Some(e.as_str()));
                    }
                },
            )
            .await;

        if let Err(e) = &result {
            let msg = e.to_string();
            self.ctx
                .status
                .report(SERVICE_DEPENDENCIES, Status::Error, Some(msg.as_str()));
        }
        result
    }

    pub async fn stop_all(&self) {
        for role in FolderRole::all() {
            self.slot(role).clear().await;
        }
    }

    /// Record the folder for `role`. Returns true if it differs from the
    /// previously recorded one.
    fn remember(&self, role: FolderRole, folder: Option<PathBuf>) -> bool {
        let mut folders = self.folders.lock().unwrap_or_else(PoisonError::into_inner);
        folders.insert(role, folder.clone()).flatten() != folder
    }

    fn rewatch(self: &Arc<Self>, role: FolderRole, folder: Option<&Path>) {
        let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
        watches.remove(&role);
        let Some(folder) = folder else {
            return;
        };

        let weak = Arc::downgrade(self);
        match watch_file(&package_manifest(folder), DEBOUNCE, move || {
            with(&weak, |this| this.manifest_changed(role));
        }) {
            Ok(watch) => {
                watches.insert(role, watch);
            }
            Err(e) => tracing::warn!("cannot watch package.json in {}: {e}", folder.display()),
        }
    }
}

fn with<T>(weak: &Weak<T>, f: impl FnOnce(&Arc<T>)) {
    if let Some(this) = weak.upgrade() {
        f(&this);
    }
}
