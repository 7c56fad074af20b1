use crate::bus::{actions, ActionBus, Payload};
use crate::error::{PressError, Result};
use crate::io::atomic_write;
use crate::watch::{watch_file, FileWatch};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

pub const SECTION_BASIC: &str = "basic";
pub const SECTION_SITE: &str = "site";
pub const KEY_PORT: &str = "port";
pub const DEFAULT_PORT: u16 = 9999;

// ---------------------------------------------------------------------------
// FolderRole
// ---------------------------------------------------------------------------

/// The two source folders pressdev tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderRole {
    /// The WordPress checkout: built with grunt and served by the stack.
    Primary,
    /// The optional plugin checkout: gets its own install and dev script.
    Secondary,
}

impl FolderRole {
    pub fn all() -> [FolderRole; 2] {
        [FolderRole::Primary, FolderRole::Secondary]
    }

    /// Logical name, also the preference key under `basic`.
    pub fn as_str(self) -> &'static str {
        match self {
            FolderRole::Primary => "primary-folder",
            FolderRole::Secondary => "secondary-folder",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::all().into_iter().find(|r| r.as_str() == key)
    }
}

impl std::fmt::Display for FolderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// A complete configuration snapshot. Change notifications always carry one of
/// these, never a diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub primary_folder: Option<PathBuf>,
    pub secondary_folder: Option<PathBuf>,
    pub port: Option<u16>,
}

impl Settings {
    pub fn folder(&self, role: FolderRole) -> Option<&Path> {
        match role {
            FolderRole::Primary => self.primary_folder.as_deref(),
            FolderRole::Secondary => self.secondary_folder.as_deref(),
        }
    }
}

/// Read-side contract every coordinator depends on.
pub trait PreferenceSource: Send + Sync {
    /// Raw value lookup by `section` and `key`.
    fn get_value(&self, section: &str, key: &str) -> Option<serde_yaml::Value>;

    /// The current configuration as a typed snapshot.
    fn snapshot(&self) -> Settings;
}

// ---------------------------------------------------------------------------
// On-disk document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PreferencesDoc {
    #[serde(default)]
    basic: BasicSection,
    #[serde(default)]
    site: SiteSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct BasicSection {
    #[serde(
        rename = "primary-folder",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    primary_folder: Option<PathBuf>,
    #[serde(
        rename = "secondary-folder",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    secondary_folder: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SiteSection {
    #[serde(default = "default_port")]
    port: Option<u16>,
}

fn default_port() -> Option<u16> {
    Some(DEFAULT_PORT)
}

impl Default for SiteSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn non_empty(path: &Option<PathBuf>) -> Option<PathBuf> {
    path.as_ref()
        .filter(|p| !p.as_os_str().is_empty())
        .cloned()
}

impl PreferencesDoc {
    fn settings(&self) -> Settings {
        Settings {
            primary_folder: non_empty(&self.basic.primary_folder),
            secondary_folder: non_empty(&self.basic.secondary_folder),
            port: self.site.port.filter(|p| *p != 0),
        }
    }
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

/// YAML-file-backed preference store.
///
/// The file is the source of truth: edits made by `pressdev config set` from
/// another process are picked up by [`Preferences::watch`], which re-reads the
/// file on every change notification and fires `settings_changed` with the new
/// snapshot.
pub struct Preferences {
    path: PathBuf,
    doc: RwLock<PreferencesDoc>,
}

impl Preferences {
    /// Load preferences from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let doc = read_doc(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            doc: RwLock::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file. Returns the new snapshot if it differs from the
    /// cached one.
    pub fn reload(&self) -> Result<Option<Settings>> {
        let fresh = read_doc(&self.path)?;
        let mut doc = self.doc.write().unwrap_or_else(PoisonError::into_inner);
        let before = doc.settings();
        *doc = fresh;
        let after = doc.settings();
        Ok((before != after).then_some(after))
    }

    /// Set `section.key` from its string form and persist the file.
    pub fn set_value(&self, section: &str, key: &str, value: &str) -> Result<()> {
        {
            let mut doc = self.doc.write().unwrap_or_else(PoisonError::into_inner);
            match (section, key) {
                (SECTION_BASIC, _) => {
                    let role = FolderRole::from_key(key).ok_or_else(|| unknown(section, key))?;
                    let folder = (!value.is_empty()).then(|| PathBuf::from(value));
                    match role {
                        FolderRole::Primary => doc.basic.primary_folder = folder,
                        FolderRole::Secondary => doc.basic.secondary_folder = folder,
                    }
                }
                (SECTION_SITE, KEY_PORT) => {
                    let port: u16 = value.parse().map_err(|_| PressError::InvalidPreference {
                        key: key.to_string(),
                        reason: format!("'{value}' is not a port number"),
                    })?;
                    if port == 0 {
                        return Err(PressError::InvalidPreference {
                            key: key.to_string(),
                            reason: "port must be between 1 and 65535".to_string(),
                        });
                    }
                    doc.site.port = Some(port);
                }
                _ => return Err(unknown(section, key)),
            }
        }
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        let yaml = {
            let doc = self.doc.read().unwrap_or_else(PoisonError::into_inner);
            serde_yaml::to_string(&*doc)?
        };
        atomic_write(&self.path, yaml.as_bytes())
    }

    /// Watch the file and fire `settings_changed` whenever an edit (from
    /// this process or `pressdev config set`) actually changes the snapshot.
    pub fn watch(self: Arc<Self>, bus: Arc<ActionBus>, debounce: Duration) -> Result<FileWatch> {
        let path = self.path.clone();
        watch_file(&path, debounce, move || match self.reload() {
            Ok(Some(settings)) => {
                tracing::info!("preferences changed: {settings:?}");
                bus.fire(actions::SETTINGS_CHANGED, Payload::Settings(settings));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("failed to reload {}: {e}", self.path.display()),
        })
    }
}

impl PreferenceSource for Preferences {
    fn get_value(&self, section: &str, key: &str) -> Option<serde_yaml::Value> {
        let doc = self.doc.read().unwrap_or_else(PoisonError::into_inner);
        let value = serde_yaml::to_value(&*doc).ok()?;
        let v = value.get(section)?.get(key)?.clone();
        (!v.is_null()).then_some(v)
    }

    fn snapshot(&self) -> Settings {
        self.doc
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .settings()
    }
}

fn unknown(section: &str, key: &str) -> PressError {
    PressError::UnknownPreference {
        section: section.to_string(),
        key: key.to_string(),
    }
}

fn read_doc(path: &Path) -> Result<PreferencesDoc> {
    match std::fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(PreferencesDoc::default()),
        Ok(text) => Ok(serde_yaml::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PreferencesDoc::default()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn prefs() -> (Preferences, TempDir) {
        let dir = TempDir::new().unwrap();
        let prefs = Preferences::load(&dir.path().join("preferences.yaml")).unwrap();
        (prefs, dir)
    }

    #[test]
    fn missing_file_yields_default_port() {
        let (prefs, _dir) = prefs();
        let s = prefs.snapshot();
        assert_eq!(s.port, Some(DEFAULT_PORT));
        assert_eq!(s.primary_folder, None);
        assert_eq!(s.secondary_folder, None);
    }

    #[test]
    fn empty_folder_is_unset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preferences.yaml");
        std::fs::write(&path, "basic:\n  primary-folder: ''\nsite:\n  port: 8080\n").unwrap();
        let prefs = Preferences::load(&path).unwrap();
        let s = prefs.snapshot();
        assert_eq!(s.primary_folder, None);
        assert_eq!(s.port, Some(8080));
    }

    #[test]
    fn set_value_persists_and_reloads() {
        let (prefs, _dir) = prefs();
        prefs
            .set_value(SECTION_BASIC, "primary-folder", "/src/wordpress-develop")
            .unwrap();
        prefs.set_value(SECTION_SITE, KEY_PORT, "8080").unwrap();

        let reread = Preferences::load(prefs.path()).unwrap();
        let s = reread.snapshot();
        assert_eq!(
            s.primary_folder,
            Some(PathBuf::from("/src/wordpress-develop"))
        );
        assert_eq!(s.port, Some(8080));
    }

    #[test]
    fn set_value_rejects_bad_port() {
        let (prefs, _dir) = prefs();
        assert!(matches!(
            prefs.set_value(SECTION_SITE, KEY_PORT, "http"),
            Err(PressError::InvalidPreference { .. })
        ));
        assert!(prefs.set_value(SECTION_SITE, KEY_PORT, "0").is_err());
    }

    #[test]
    fn set_value_rejects_unknown_key() {
        let (prefs, _dir) = prefs();
        assert!(matches!(
            prefs.set_value("basic", "theme-folder", "/x"),
            Err(PressError::UnknownPreference { .. })
        ));
    }

    #[test]
    fn get_value_reads_sections() {
        let (prefs, _dir) = prefs();
        prefs
            .set_value(SECTION_BASIC, "secondary-folder", "/src/gutenberg")
            .unwrap();
        assert_eq!(
            prefs
                .get_value(SECTION_SITE, KEY_PORT)
                .and_then(|v| v.as_u64()),
            Some(9999)
        );
        assert_eq!(
            prefs
                .get_value(SECTION_BASIC, "secondary-folder")
                .and_then(|v| v.as_str().map(str::to_owned)),
            Some("/src/gutenberg".to_string())
        );
        assert_eq!(prefs.get_value(SECTION_BASIC, "primary-folder"), None);
    }

    #[test]
    fn reload_reports_only_real_changes() {
        let (prefs, _dir) = prefs();
        prefs.save().unwrap();
        assert_eq!(prefs.reload().unwrap(), None);

        let other = Preferences::load(prefs.path()).unwrap();
        other.set_value(SECTION_SITE, KEY_PORT, "8080").unwrap();

        let changed = prefs.reload().unwrap().expect("port change detected");
        assert_eq!(changed.port, Some(8080));
        assert_eq!(prefs.reload().unwrap(), None);
    }

    #[tokio::test]
    async fn watch_fires_for_back_to_back_edits() {
        let (prefs, _dir) = prefs();
        prefs.save().unwrap();
        let prefs = Arc::new(prefs);
        let bus = ActionBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.register(actions::SETTINGS_CHANGED, "test", 0, move |p| {
            let _ = tx.send(p.clone());
            Ok(())
        });
        let _watch = Arc::clone(&prefs)
            .watch(Arc::clone(&bus), Duration::from_millis(50))
            .unwrap();

        // Two edits from another writer, well inside one mtime tick.
        let other = Preferences::load(prefs.path()).unwrap();
        other.set_value(SECTION_SITE, KEY_PORT, "8080").unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        other.set_value(SECTION_SITE, KEY_PORT, "8081").unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        let port = |p: Payload| match p {
            Payload::Settings(s) => s.port,
            other => panic!("unexpected payload {other:?}"),
        };
        assert_eq!(port(first), Some(8080));
        assert_eq!(port(second), Some(8081));
        assert_eq!(prefs.snapshot().port, Some(8081));
    }

    #[test]
    fn folder_role_keys_round_trip() {
        for role in FolderRole::all() {
            assert_eq!(FolderRole::from_key(role.as_str()), Some(role));
        }
        assert_eq!(FolderRole::from_key("port"), None);
    }
}
