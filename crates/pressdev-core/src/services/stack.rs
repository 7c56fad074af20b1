//! The container stack: render the compose file, bring it up, wait for the
//! database, then configure and install the site with wp-cli.

use super::compose::{render, CLI_SERVICE, DB_NAME, DB_PASSWORD, DB_SERVICE, DB_USER};
use super::ServiceContext;
use crate::bus::{actions, Payload};
use crate::config::{FolderRole, Settings};
use crate::error::{PressError, Result};
use crate::process::{command_in, run_to_completion};
use crate::status::{Status, SERVICE_STACK};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const HANDLER_ID: &str = "stack";
const CONFIGURE_ID: &str = "stack.configure";
/// Settings changes reach the stack before the dependency installer.
const SETTINGS_PRIORITY: i32 = 9;
const PRIORITY: i32 = 10;

const HEALTHY: &str = "healthy";
const DEBUG_CONSTANTS: [&str; 3] = ["WP_DEBUG", "SCRIPT_DEBUG", "WP_DEBUG_DISPLAY"];

// ---------------------------------------------------------------------------
// ContainerEngine
// ---------------------------------------------------------------------------

/// Operations the stack manager needs from the container runtime.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create or update the stack in the background.
    async fn up(&self) -> Result<()>;

    async fn down(&self) -> Result<()>;

    /// Health status of `service`'s container, `None` while it has no
    /// container or no health check.
    async fn health(&self, service: &str) -> Result<Option<String>>;

    /// `run --rm cli <args>`. `Ok(false)` when wp-cli exits non-zero.
    async fn cli(&self, args: &[String]) -> Result<bool>;
}

/// [`ContainerEngine`] backed by the `docker-compose` (or `docker compose`)
/// command line, run from the directory holding the compose file.
pub struct DockerCompose {
    project_dir: PathBuf,
    program: String,
    prefix: Vec<String>,
}

impl DockerCompose {
    pub fn detect(project_dir: &Path) -> Self {
        let (program, prefix) = if which::which("docker-compose").is_ok() {
            ("docker-compose".to_string(), Vec::new())
        } else {
            ("docker".to_string(), vec!["compose".to_string()])
        };
        tracing::debug!("using '{program} {}'", prefix.join(" "));
        Self {
            project_dir: project_dir.to_path_buf(),
            program,
            prefix,
        }
    }

    async fn compose<I, S>(&self, args: I) -> Result<crate::process::CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = command_in(&self.program, &self.project_dir);
        cmd.args(&self.prefix).args(args);
        run_to_completion(cmd).await
    }
}

/// Parse `docker inspect --format '{{json .State.Health.Status}}'` output.
pub fn parse_health(stdout: &str) -> Option<String> {
    serde_json::from_str::<Option<String>>(stdout.trim())
        .ok()
        .flatten()
}

#[async_trait]
impl ContainerEngine for DockerCompose {
    async fn up(&self) -> Result<()> {
        self.compose(["up", "-d"]).await?.check("docker-compose up")?;
        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.compose(["down"]).await?.check("docker-compose down")?;
        Ok(())
    }

    async fn health(&self, service: &str) -> Result<Option<String>> {
        let ps = self.compose(["ps", "-q", service]).await?.check("docker-compose ps")?;
        let Some(id) = ps.stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return Ok(None);
        };
        let mut cmd = command_in("docker", &self.project_dir);
        cmd.args(["inspect", "--format", "{{json .State.Health.Status}}", id]);
        let out = run_to_completion(cmd).await?.check("docker inspect")?;
        Ok(parse_health(&out.stdout))
    }

    async fn cli(&self, args: &[String]) -> Result<bool> {
        let out = self
            .compose(
                ["run", "--rm", CLI_SERVICE]
                    .into_iter()
                    .map(String::from)
                    .chain(args.iter().cloned()),
            )
            .await?;
        if !out.success() {
            tracing::debug!("wp {}: {}", args.join(" "), out.stderr.trim());
        }
        Ok(out.success())
    }
}

// ---------------------------------------------------------------------------
// StackManager
// ---------------------------------------------------------------------------

/// How long to wait for the database container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Applied {
    folder: PathBuf,
    port: u16,
}

impl Applied {
    fn from_settings(settings: &Settings) -> Option<Self> {
        Some(Self {
            folder: settings.folder(FolderRole::Primary)?.to_path_buf(),
            port: settings.port?,
        })
    }

    fn base_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }
}

pub struct StackManager {
    ctx: ServiceContext,
    engine: Arc<dyn ContainerEngine>,
    policy: HealthPolicy,
    generation: AtomicU64,
    applied: Mutex<Option<Applied>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl StackManager {
    pub fn new(
        ctx: ServiceContext,
        engine: Arc<dyn ContainerEngine>,
        policy: HealthPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            engine,
            policy,
            generation: AtomicU64::new(0),
            applied: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    /// Configuration generation; bumped by every start, restart and teardown.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn register(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.ctx.bus.register(
            actions::SETTINGS_CHANGED,
            HANDLER_ID,
            SETTINGS_PRIORITY,
            move |p| {
                let (Payload::Settings(settings), Some(this)) = (p, weak.upgrade()) else {
                    return Ok(());
                };
                let wanted = Applied::from_settings(settings);
                if wanted == this.applied() {
                    return Ok(());
                }
                tracing::info!("site settings changed, restarting containers");
                tokio::spawn(async move {
                    if let Err(e) = this.restart().await {
                        tracing::warn!("stack restart failed: {e}");
                    }
                });
                Ok(())
            },
        );
    }

    fn applied(&self) -> Option<Applied> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_applied(&self, applied: Option<Applied>) {
        *self.applied.lock().unwrap_or_else(PoisonError::into_inner) = applied;
    }

    /// Render the compose file and bring the stack up. A no-op while the
    /// primary folder or the port is unset.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked().await
    }

    /// `down` (awaited), then start again with the current settings.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.applied().is_some() {
            if let Err(e) = self.engine.down().await {
                tracing::warn!("docker-compose down failed: {e}");
            }
        }
        self.start_locked().await
    }

    /// Stop the stack. Called directly by the supervisor on shutdown.
    pub async fn teardown(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.applied().is_none() {
            return Ok(());
        }
        tracing::info!("stopping containers");
        let result = self.engine.down().await;
        self.set_applied(None);
        self.ctx.status.report(SERVICE_STACK, Status::Stopped, None);
        result
    }

    async fn start_locked(self: &Arc<Self>) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(applied) = Applied::from_settings(&self.ctx.prefs.snapshot()) else {
            tracing::debug!("primary folder or port not set, not starting containers");
            self.set_applied(None);
            return Ok(());
        };

        render(&applied.folder, applied.port).write(&self.ctx.paths)?;
        self.set_applied(Some(applied));

        tracing::info!("starting containers");
        if let Err(e) = self.engine.up().await {
            let msg = e.to_string();
            self.ctx
                .status
                .report(SERVICE_STACK, Status::Error, Some(msg.as_str()));
            return Err(e);
        }
        self.ctx
            .status
            .report(SERVICE_STACK, Status::Building, Some("Building environment"));

        let bus = &self.ctx.bus;
        let weak = Arc::downgrade(self);
        bus.register(actions::FIRST_BUILD_FINISHED, CONFIGURE_ID, PRIORITY, move |_| {
            if let Some(this) = weak.upgrade() {
                this.spawn_configure(generation);
            }
            Ok(())
        });
        if bus.has_fired(actions::FIRST_BUILD_FINISHED) {
            self.spawn_configure(generation);
        }
        Ok(())
    }

    fn spawn_configure(self: &Arc<Self>, generation: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.configure(generation).await {
                Ok(()) => {}
                Err(PressError::Superseded) => {
                    tracing::debug!("configure for generation {generation} superseded")
                }
                Err(e) => {
                    tracing::warn!("site configuration failed: {e}");
                    let msg = e.to_string();
                    this.ctx
                        .status
                        .report(SERVICE_STACK, Status::Error, Some(msg.as_str()));
                }
            }
        });
    }

    /// Wait for the database, then make sure `wp-config.php` exists and the
    /// site is installed at the configured URL. Each wp-cli step first checks
    /// that `generation` is still current.
    pub async fn configure(&self, generation: u64) -> Result<()> {
        let Some(applied) = self.applied() else {
            return Ok(());
        };
        self.ctx
            .status
            .report(SERVICE_STACK, Status::Building, Some("Building environment"));

        self.wait_healthy().await?;

        if !self.wp(generation, &["config", "path"]).await? {
            tracing::info!("creating wp-config.php");
            let dbname = format!("--dbname={DB_NAME}");
            let dbuser = format!("--dbuser={DB_USER}");
            let dbpass = format!("--dbpass={DB_PASSWORD}");
            let dbhost = format!("--dbhost={DB_SERVICE}");
            let created = self
                .wp(
                    generation,
                    &[
                        "config",
                        "create",
                        &dbname,
                        &dbuser,
                        &dbpass,
                        &dbhost,
                        "--path=/var/www/html/build",
                    ],
                )
                .await?;
            if !created {
                tracing::warn!("wp config create failed");
            }

            let built = applied.folder.join("build/wp-config.php");
            if built.exists() {
                tracing::debug!("moving wp-config.php out of build/");
                tokio::fs::rename(&built, applied.folder.join("wp-config.php")).await?;
            }

            for constant in DEBUG_CONSTANTS {
                self.wp(
                    generation,
                    &["config", "set", constant, "true", "--raw", "--type=constant"],
                )
                .await?;
            }
        }

        let url = applied.base_url();
        if self.wp(generation, &["core", "is-installed"]).await? {
            for option in ["home", "siteurl"] {
                self.wp(generation, &["option", "update", option, &url])
                    .await?;
            }
        } else {
            tracing::info!("installing WordPress");
            let url_arg = format!("--url=localhost:{}", applied.port);
            let installed = self
                .wp(
                    generation,
                    &[
                        "core",
                        "install",
                        &url_arg,
                        "--title=WordPress Develop",
                        "--admin_user=admin",
                        "--admin_password=password",
                        "--admin_email=test@test.test",
                        "--skip-email",
                    ],
                )
                .await?;
            if !installed {
                return Err(PressError::CommandFailed {
                    program: "wp core install".to_string(),
                    status: "non-zero".to_string(),
                    stderr: String::new(),
                });
            }
        }

        self.ensure_current(generation)?;
        let ready = format!("{url}/");
        tracing::info!("site ready at {ready}");
        self.ctx
            .status
            .report(SERVICE_STACK, Status::Ready, Some(ready.as_str()));
        Ok(())
    }

    /// Poll the database container until it reports healthy.
    async fn wait_healthy(&self) -> Result<()> {
        for attempt in 1..=self.policy.max_attempts {
            match self.engine.health(DB_SERVICE).await {
                Ok(Some(status)) if status == HEALTHY => return Ok(()),
                Ok(status) => tracing::debug!("database not healthy yet ({status:?}), attempt {attempt}"),
                Err(e) => tracing::debug!("health check failed: {e}"),
            }
            tokio::time::sleep(self.policy.interval).await;
        }
        Err(PressError::HealthTimeout {
            attempts: self.policy.max_attempts,
        })
    }

    fn ensure_current(&self, generation: u64) -> Result<()> {
        if self.generation() == generation {
            Ok(())
        } else {
            Err(PressError::Superseded)
        }
    }

    async fn wp(&self, generation: u64, args: &[&str]) -> Result<bool> {
        self.ensure_current(generation)?;
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.engine.cli(&args).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_output_is_json() {
        assert_eq!(parse_health("\"healthy\"\n").as_deref(), Some("healthy"));
        assert_eq!(parse_health("\"starting\"").as_deref(), Some("starting"));
        assert_eq!(parse_health("null"), None);
        assert_eq!(parse_health(""), None);
    }

    #[test]
    fn default_policy_is_bounded() {
        let p = HealthPolicy::default();
        assert_eq!(p.interval, Duration::from_secs(1));
        assert_eq!(p.max_attempts, 120);
    }

    #[cfg(unix)]
    mod manager {
        use super::*;
        use crate::services::compose::ComposeFile;
        use crate::services::testing::{eventually, Harness};
        use std::sync::atomic::{AtomicBool, AtomicU32};

        /// Records every call and simulates wp-cli state.
        #[derive(Default)]
        struct FakeEngine {
            calls: Mutex<Vec<String>>,
            unhealthy_polls: AtomicU32,
            never_healthy: AtomicBool,
            config_exists: AtomicBool,
            installed: AtomicBool,
            install_fails: AtomicBool,
        }

        impl FakeEngine {
            fn calls(&self) -> Vec<String> {
                self.calls.lock().unwrap().clone()
            }

            fn count(&self, call: &str) -> usize {
                self.calls().iter().filter(|c| *c == call).count()
            }

            fn record(&self, call: String) {
                self.calls.lock().unwrap().push(call);
            }
        }

        #[async_trait]
        impl ContainerEngine for FakeEngine {
            async fn up(&self) -> Result<()> {
                self.record("up".into());
                Ok(())
            }

            async fn down(&self) -> Result<()> {
                self.record("down".into());
                Ok(())
            }

            async fn health(&self, service: &str) -> Result<Option<String>> {
                self.record(format!("health {service}"));
                if self.never_healthy.load(Ordering::SeqCst) {
                    return Ok(Some("starting".into()));
                }
                let left = self.unhealthy_polls.load(Ordering::SeqCst);
                if left > 0 {
                    self.unhealthy_polls.store(left - 1, Ordering::SeqCst);
                    return Ok(None);
                }
                Ok(Some(HEALTHY.into()))
            }

            async fn cli(&self, args: &[String]) -> Result<bool> {
                let line = args.join(" ");
                self.record(format!("wp {line}"));
                Ok(match (args[0].as_str(), args[1].as_str()) {
                    ("config", "path") => self.config_exists.load(Ordering::SeqCst),
                    ("config", "create") => {
                        self.config_exists.store(true, Ordering::SeqCst);
                        true
                    }
                    ("core", "is-installed") => self.installed.load(Ordering::SeqCst),
                    ("core", "install") if self.install_fails.load(Ordering::SeqCst) => false,
                    ("core", "install") => {
                        self.installed.store(true, Ordering::SeqCst);
                        true
                    }
                    _ => true,
                })
            }
        }

        fn fast() -> HealthPolicy {
            HealthPolicy {
                interval: Duration::from_millis(5),
                max_attempts: 5,
            }
        }

        fn setup() -> (Harness, Arc<FakeEngine>, Arc<StackManager>) {
            let h = Harness::new();
            let engine = Arc::new(FakeEngine::default());
            let manager = StackManager::new(h.ctx.clone(), engine.clone(), fast());
            manager.register();
            (h, engine, manager)
        }

        fn stack_status(h: &Harness) -> Option<(Status, Option<String>)> {
            h.status.last(SERVICE_STACK)
        }

        #[tokio::test]
        async fn incomplete_settings_do_nothing() {
            let (h, engine, manager) = setup();
            manager.start().await.unwrap();
            assert!(engine.calls().is_empty());
            assert!(!h.ctx.paths.compose_file().exists());
        }

        #[tokio::test]
        async fn start_is_idempotent() {
            let (h, engine, manager) = setup();
            h.configure_all();
            manager.start().await.unwrap();
            let first = std::fs::read_to_string(h.ctx.paths.compose_file()).unwrap();
            manager.start().await.unwrap();
            let second = std::fs::read_to_string(h.ctx.paths.compose_file()).unwrap();

            assert_eq!(first, second);
            assert_eq!(engine.count("up"), 2);
            assert_eq!(engine.count("down"), 0);
            assert_eq!(h.ctx.bus.handler_count(actions::FIRST_BUILD_FINISHED), 1);
            assert_eq!(
                stack_status(&h),
                Some((Status::Building, Some("Building environment".into())))
            );
        }

        #[tokio::test]
        async fn configure_waits_for_first_build_then_installs() {
            let (h, engine, manager) = setup();
            h.configure_all();
            let primary = h.folder(FolderRole::Primary);
            std::fs::create_dir_all(primary.join("build")).unwrap();
            std::fs::write(primary.join("build/wp-config.php"), "<?php").unwrap();
            engine.unhealthy_polls.store(2, Ordering::SeqCst);

            manager.start().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(engine.count("health mysql"), 0);

            h.ctx.bus.fire(actions::FIRST_BUILD_FINISHED, Payload::Empty);
            assert!(eventually(|| stack_status(&h).map(|s| s.0) == Some(Status::Ready)).await);

            assert_eq!(
                stack_status(&h).unwrap().1.as_deref(),
                Some("http://localhost:9999/")
            );
            assert_eq!(engine.count("health mysql"), 3);
            assert!(primary.join("wp-config.php").exists());
            assert!(!primary.join("build/wp-config.php").exists());

            let wp: Vec<String> = engine
                .calls()
                .into_iter()
                .filter(|c| c.starts_with("wp "))
                .collect();
            assert_eq!(wp[0], "wp config path");
            assert!(wp[1].starts_with("wp config create --dbname=wordpress_develop"));
            assert_eq!(wp[2], "wp config set WP_DEBUG true --raw --type=constant");
            assert_eq!(wp[5], "wp core is-installed");
            assert!(wp[6].starts_with("wp core install --url=localhost:9999"));
            assert_eq!(wp.len(), 7);
        }

        #[tokio::test]
        async fn failed_install_reports_error_not_ready() {
            let (h, engine, manager) = setup();
            h.configure_all();
            engine.install_fails.store(true, Ordering::SeqCst);
            h.ctx.bus.fire(actions::FIRST_BUILD_FINISHED, Payload::Empty);

            manager.start().await.unwrap();
            assert!(eventually(|| stack_status(&h).map(|s| s.0) == Some(Status::Error)).await);
            let (_, msg) = stack_status(&h).unwrap();
            assert!(msg.unwrap().contains("wp core install"));
            assert!(!h
                .status
                .statuses(SERVICE_STACK)
                .iter()
                .any(|s| *s == Status::Ready));
        }

        #[tokio::test]
        async fn late_start_configures_immediately() {
            let (h, engine, manager) = setup();
            h.configure_all();
            engine.config_exists.store(true, Ordering::SeqCst);
            engine.installed.store(true, Ordering::SeqCst);
            h.ctx.bus.fire(actions::FIRST_BUILD_FINISHED, Payload::Empty);

            manager.start().await.unwrap();
            assert!(eventually(|| stack_status(&h).map(|s| s.0) == Some(Status::Ready)).await);
            assert_eq!(
                engine.count("wp option update home http://localhost:9999"),
                1
            );
        }

        #[tokio::test]
        async fn port_change_restarts_and_updates_urls_without_reinstall() {
            let (h, engine, manager) = setup();
            h.configure_all();
            h.ctx.bus.fire(actions::FIRST_BUILD_FINISHED, Payload::Empty);
            manager.start().await.unwrap();
            assert!(eventually(|| engine.count("wp core install --url=localhost:9999 --title=WordPress Develop --admin_user=admin --admin_password=password --admin_email=test@test.test --skip-email") == 1).await);
            assert!(eventually(|| stack_status(&h).map(|s| s.0) == Some(Status::Ready)).await);

            let settings = h.set(|s| s.port = Some(8080));
            h.ctx
                .bus
                .fire(actions::SETTINGS_CHANGED, Payload::Settings(settings));

            assert!(eventually(|| engine.count("wp option update siteurl http://localhost:8080") == 1).await);
            assert!(
                eventually(|| stack_status(&h).and_then(|s| s.1) == Some("http://localhost:8080/".into()))
                    .await
            );

            let calls = engine.calls();
            let down = calls.iter().position(|c| c == "down").unwrap();
            let second_up = calls.iter().rposition(|c| c == "up").unwrap();
            assert!(down < second_up);
            assert_eq!(engine.count("up"), 2);
            assert_eq!(
                calls.iter().filter(|c| c.starts_with("wp core install")).count(),
                1
            );

            let compose = ComposeFile::parse(
                &std::fs::read_to_string(h.ctx.paths.compose_file()).unwrap(),
            )
            .unwrap();
            assert_eq!(compose.port_bindings(), vec!["8080:80"]);
        }

        #[tokio::test]
        async fn unrelated_settings_change_is_ignored() {
            let (h, engine, manager) = setup();
            h.configure_all();
            manager.start().await.unwrap();

            let other = h.dir.path().join("plugin");
            let settings = h.set(|s| s.secondary_folder = Some(other));
            h.ctx
                .bus
                .fire(actions::SETTINGS_CHANGED, Payload::Settings(settings));
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(engine.count("down"), 0);
            assert_eq!(engine.count("up"), 1);
        }

        #[tokio::test]
        async fn health_timeout_reports_error() {
            let (h, engine, manager) = setup();
            h.configure_all();
            engine.never_healthy.store(true, Ordering::SeqCst);
            h.ctx.bus.fire(actions::FIRST_BUILD_FINISHED, Payload::Empty);

            manager.start().await.unwrap();
            assert!(eventually(|| stack_status(&h).map(|s| s.0) == Some(Status::Error)).await);
            assert_eq!(engine.count("health mysql"), 5);
            assert!(!engine.calls().iter().any(|c| c.starts_with("wp ")));
        }

        #[tokio::test]
        async fn superseded_configure_stops_before_wp_cli() {
            let (h, engine, manager) = setup();
            h.configure_all();
            manager.start().await.unwrap();
            let stale = manager.generation();
            manager.restart().await.unwrap();

            let err = manager.configure(stale).await.unwrap_err();
            assert!(matches!(err, PressError::Superseded));
            assert!(!engine.calls().iter().any(|c| c.starts_with("wp ")));
        }

        #[tokio::test]
        async fn teardown_brings_stack_down() {
            let (h, engine, manager) = setup();
            h.configure_all();
            manager.start().await.unwrap();
            manager.teardown().await.unwrap();
            assert_eq!(engine.count("down"), 1);
            assert_eq!(stack_status(&h).unwrap().0, Status::Stopped);

            manager.teardown().await.unwrap();
            assert_eq!(engine.count("down"), 1);
        }
    }
}
