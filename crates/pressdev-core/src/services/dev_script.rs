use super::ServiceContext;
use crate::bus::{actions, Payload};
use crate::config::FolderRole;
use crate::error::Result;
use crate::process::{command_in, ExitOutcome, ProcessSlot};
use crate::status::{Status, SERVICE_DEV};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

const HANDLER_ID: &str = "dev";
const PRIORITY: i32 = 10;

/// Keeps `npm run dev` going in the secondary folder once its dependencies
/// are installed.
pub struct DevScript {
    ctx: ServiceContext,
    slot: ProcessSlot,
    folder: Mutex<Option<PathBuf>>,
}

impl DevScript {
    pub fn new(ctx: ServiceContext) -> Arc<Self> {
        let folder = ctx
            .prefs
            .snapshot()
            .folder(FolderRole::Secondary)
            .map(Path::to_path_buf);
        Arc::new(Self {
            ctx,
            slot: ProcessSlot::new("npm run dev"),
            folder: Mutex::new(folder),
        })
    }

    pub fn slot(&self) -> &ProcessSlot {
        &self.slot
    }

    pub fn register(self: &Arc<Self>) {
        let bus = &self.ctx.bus;

        let weak = Arc::downgrade(self);
        bus.register(actions::INSTALL_FINISHED, HANDLER_ID, PRIORITY, move |p| {
            if *p != Payload::Folder(FolderRole::Secondary) {
                return Ok(());
            }
            if let Some(this) = weak.upgrade() {
                tokio::spawn(async move {
                    if let Err(e) = this.start().await {
                        tracing::warn!("npm run dev could not start: {e}");
                        let msg = e.to_string();
                        this.ctx.status.report(SERVICE_DEV, Status::Error, Some(msg.as_str()));
                    }
                });
            }
            Ok(())
        });

        let weak = Arc::downgrade(self);
        bus.register(actions::SETTINGS_CHANGED, HANDLER_ID, PRIORITY, move |p| {
            let (Payload::Settings(settings), Some(this)) = (p, weak.upgrade()) else {
                return Ok(());
            };
            let folder = settings.folder(FolderRole::Secondary).map(Path::to_path_buf);
            let changed = {
                let mut current = this.folder.lock().unwrap_or_else(PoisonError::into_inner);
                let changed = *current != folder;
                *current = folder;
                changed
            };
            if changed {
                tokio::spawn(async move { this.stop().await });
            }
            Ok(())
        });

        let weak = Arc::downgrade(self);
        bus.register(actions::SHUTDOWN, HANDLER_ID, PRIORITY, move |_| {
            if let Some(this) = weak.upgrade() {
                tokio::spawn(async move { this.stop().await });
            }
            Ok(())
        });
    }

    /// Kill the running dev script and start a new one.
    pub async fn start(&self) -> Result<()> {
        let Some(folder) = self
            .ctx
            .prefs
            .snapshot()
            .folder(FolderRole::Secondary)
            .map(Path::to_path_buf)
        else {
            self.slot.clear().await;
            tracing::debug!("secondary folder not set, not running npm run dev");
            return Ok(());
        };

        let toolchain = &self.ctx.toolchain;
        let mut cmd = command_in(&toolchain.node, &folder);
        cmd.arg(&toolchain.npm_cli).args(["run", "dev"]);

        let status = Arc::clone(&self.ctx.status);
        self.slot
            .replace(
                cmd,
                |line| tracing::debug!("[npm run dev] {line}"),
                move |outcome| match outcome {
                    ExitOutcome::Killed => {}
                    ExitOutcome::Exited { code: Some(0), .. } => {
                        status.report(SERVICE_DEV, Status::Stopped, None)
                    }
                    ExitOutcome::Exited { code, stderr } => {
                        tracing::warn!("npm run dev exited {code:?}: {}", stderr.trim());
                        status.report(SERVICE_DEV, Status::Error, Some("npm run dev exited"));
                    }
                    ExitOutcome::Failed(e) => {
                        status.report(SERVICE_DEV, Status::Error, Some(e.as_str()))
                    }
                },
            )
            .await?;

        let msg = format!("npm run dev in {}", folder.display());
        self.ctx
            .status
            .report(SERVICE_DEV, Status::Ready, Some(msg.as_str()));
        Ok(())
    }

    pub async fn stop(&self) {
        if self.slot.clear().await {
            self.ctx.status.report(SERVICE_DEV, Status::Stopped, None);
        }
    }
}
