use crate::error::{PressError, Result};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const APP_DIR: &str = "pressdev";
pub const HOME_ENV: &str = "PRESSDEV_HOME";

pub const TOOLS_DIR: &str = "tools";
pub const ARCHIVES_DIR: &str = "tools/archives";
pub const RUNTIME_DIR: &str = "tools/node";
pub const NPM_CACHE_DIR: &str = "tools/npm-cache";

pub const COMPOSE_FILE: &str = "tools/docker-compose.yml";
pub const SITE_CONF_FILE: &str = "tools/site.conf";
pub const PREFERENCES_FILE: &str = "preferences.yaml";
pub const STATUS_FILE: &str = "status.yaml";
pub const LOG_FILE: &str = "debug.log";

pub const PACKAGE_MANIFEST: &str = "package.json";
pub const BUILD_CONFIG: &str = "Gruntfile.js";

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Every on-disk location pressdev reads or writes, rooted at one data dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the data dir.
    ///
    /// Priority:
    /// 1. `explicit` (`--home` flag / `PRESSDEV_HOME`)
    /// 2. `<platform data dir>/pressdev`
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Ok(Self::new(p));
        }
        let base = dirs::data_dir().ok_or(PressError::DataDirNotFound)?;
        Ok(Self::new(base.join(APP_DIR)))
    }

    /// Create the tools and archive directories.
    pub fn ensure(&self) -> Result<()> {
        crate::io::ensure_dir(&self.tools_dir())?;
        crate::io::ensure_dir(&self.archive_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join(TOOLS_DIR)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVES_DIR)
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join(RUNTIME_DIR)
    }

    pub fn npm_cache_dir(&self) -> PathBuf {
        self.root.join(NPM_CACHE_DIR)
    }

    pub fn compose_file(&self) -> PathBuf {
        self.root.join(COMPOSE_FILE)
    }

    pub fn site_conf(&self) -> PathBuf {
        self.root.join(SITE_CONF_FILE)
    }

    pub fn preferences_file(&self) -> PathBuf {
        self.root.join(PREFERENCES_FILE)
    }

    pub fn status_file(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }
}

pub fn package_manifest(folder: &Path) -> PathBuf {
    folder.join(PACKAGE_MANIFEST)
}

pub fn build_config(folder: &Path) -> PathBuf {
    folder.join(BUILD_CONFIG)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
