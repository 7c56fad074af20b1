//! Builds the bus and every coordinator, starts them, and shuts them down.

use crate::bus::{actions, ActionBus, Payload};
use crate::config::Preferences;
use crate::error::{PressError, Result};
use crate::paths::Paths;
use crate::services::dev_script::DevScript;
use crate::services::installer::DependencyInstaller;
use crate::services::runtime::{Platform, RuntimeProvisioner, DEFAULT_DIST_URL};
use crate::services::stack::{ContainerEngine, HealthPolicy, StackManager};
use crate::services::watcher::AssetWatcher;
use crate::services::ServiceContext;
use crate::status::StatusBoard;
use crate::watch::{FileWatch, DEBOUNCE};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const HEALTH_ATTEMPTS_ENV: &str = "PRESSDEV_HEALTH_ATTEMPTS";
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub paths: Paths,
    pub dist_url: String,
    pub platform: Platform,
    pub health: HealthPolicy,
    /// Quiet period before an edit to `preferences.yaml` is applied.
    pub preference_debounce: Duration,
    pub shutdown_grace: Duration,
}

impl SupervisorConfig {
    /// Defaults for the host platform.
    pub fn new(paths: Paths) -> Result<Self> {
        let platform = Platform::current().ok_or_else(|| PressError::UnsupportedPlatform {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        })?;
        Ok(Self {
            paths,
            dist_url: DEFAULT_DIST_URL.to_string(),
            platform,
            health: HealthPolicy::default(),
            preference_debounce: DEBOUNCE,
            shutdown_grace: SHUTDOWN_GRACE,
        })
    }

    /// Apply `PRESSDEV_HEALTH_ATTEMPTS`, ignoring values that are not a
    /// positive integer.
    pub fn with_env_overrides(self) -> Self {
        let raw = std::env::var(HEALTH_ATTEMPTS_ENV).ok();
        self.with_health_attempts(raw.as_deref())
    }

    fn with_health_attempts(mut self, raw: Option<&str>) -> Self {
        if let Some(raw) = raw {
            match parse_attempts(raw) {
                Some(n) => self.health.max_attempts = n,
                None => tracing::warn!("ignoring {HEALTH_ATTEMPTS_ENV}={raw:?}"),
            }
        }
        self
    }
}

fn parse_attempts(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok().filter(|n| *n > 0)
}

pub struct Supervisor {
    config: SupervisorConfig,
    bus: Arc<ActionBus>,
    prefs: Arc<Preferences>,
    status: Arc<StatusBoard>,
    runtime: Arc<RuntimeProvisioner>,
    installer: Arc<DependencyInstaller>,
    watcher: Arc<AssetWatcher>,
    dev: Arc<DevScript>,
    stack: Arc<StackManager>,
    tasks: Vec<JoinHandle<()>>,
    prefs_watch: Option<FileWatch>,
}

impl Supervisor {
    /// Construct every coordinator. Nothing runs until [`Supervisor::start`].
    pub fn build(config: SupervisorConfig, engine: Arc<dyn ContainerEngine>) -> Result<Self> {
        config.paths.ensure()?;
        let bus = ActionBus::new();
        let prefs = Arc::new(Preferences::load(&config.paths.preferences_file())?);
        let status = Arc::new(StatusBoard::with_file(&config.paths.status_file()));

        let runtime = Arc::new(RuntimeProvisioner::new(
            config.paths.clone(),
            config.dist_url.clone(),
            config.platform.clone(),
            Arc::clone(&bus),
            status.clone(),
        ));

        let ctx = ServiceContext {
            bus: Arc::clone(&bus),
            prefs: prefs.clone(),
            status: status.clone(),
            paths: config.paths.clone(),
            toolchain: runtime.toolchain(),
        };

        Ok(Self {
            installer: DependencyInstaller::new(ctx.clone()),
            watcher: AssetWatcher::new(ctx.clone()),
            dev: DevScript::new(ctx.clone()),
            stack: StackManager::new(ctx, engine, config.health),
            config,
            bus,
            prefs,
            status,
            runtime,
            tasks: Vec::new(),
            prefs_watch: None,
        })
    }

    pub fn bus(&self) -> &Arc<ActionBus> {
        &self.bus
    }

    pub fn status(&self) -> &Arc<StatusBoard> {
        &self.status
    }

    /// Register the coordinators and start the background jobs: the
    /// preferences watch, the runtime schedule and the container stack.
    pub fn start(&mut self) -> Result<()> {
        self.watcher.register();
        self.installer.register();
        self.dev.register();
        self.stack.register();

        self.prefs_watch = Some(
            Arc::clone(&self.prefs).watch(Arc::clone(&self.bus), self.config.preference_debounce)?,
        );
        self.tasks.push(Arc::clone(&self.runtime).spawn_schedule());

        let stack = Arc::clone(&self.stack);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = stack.start().await {
                tracing::warn!("container stack did not start: {e}");
            }
        }));
        tracing::info!("pressdev started (data dir {})", self.config.paths.root().display());
        Ok(())
    }

    /// Fire `shutdown`, stop every subprocess and bring the stack down, all
    /// within the configured grace period.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        drop(self.prefs_watch);
        self.bus.fire(actions::SHUTDOWN, Payload::Empty);

        let stop = async {
            self.installer.stop_all().await;
            self.watcher.stop().await;
            self.dev.stop().await;
            if let Err(e) = self.stack.teardown().await {
                tracing::warn!("docker-compose down failed: {e}");
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, stop)
            .await
            .is_err()
        {
            tracing::warn!(
                "shutdown did not finish within {}s",
                self.config.shutdown_grace.as_secs()
            );
        }

        for task in self.tasks {
            task.abort();
        }
    }
}
