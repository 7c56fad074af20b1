//! Private Node.js toolchain: discovery, download, verification, unpacking and
//! npm self-update.

use crate::bus::{actions, ActionBus, Payload};
use crate::error::{PressError, Result};
use crate::io::{ensure_dir, remove_if_exists};
use crate::paths::Paths;
use crate::process::{command, command_in, run_to_completion};
use crate::status::{Status, StatusSink, SERVICE_RUNTIME};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime};
use flate2::read::GzDecoder;
use regex::Regex;
use semver::Version;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

pub const DEFAULT_DIST_URL: &str = "https://nodejs.org/dist/latest-fermium/";
pub const CHECKSUM_MANIFEST: &str = "SHASUMS256.txt";
/// Local name of the cached checksum manifest inside the archive dir.
pub const CACHED_MANIFEST: &str = "node-SHASUMS256.txt";
/// Local hours at which the scheduled refresh runs.
pub const REFRESH_HOURS: [u32; 2] = [7, 19];

const WINDOWS_WRAPPERS: [&str; 4] = ["npm", "npm.cmd", "npx", "npx.cmd"];

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Zip => "zip",
        }
    }
}

/// Distribution platform tag (`linux-x64`, `win-x64`, ...) and the archive
/// format published for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub tag: String,
    pub format: ArchiveFormat,
}

impl Platform {
    pub fn from_tag(tag: &str) -> Self {
        let format = if tag.starts_with("win") {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::TarGz
        };
        Self {
            tag: tag.to_string(),
            format,
        }
    }

    /// The platform this binary runs on, if Node.js publishes builds for it.
    pub fn current() -> Option<Self> {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            "linux" => "linux",
            "windows" => "win",
            _ => return None,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "x64",
            "aarch64" => "arm64",
            _ => return None,
        };
        Some(Self::from_tag(&format!("{os}-{arch}")))
    }

    pub fn is_windows(&self) -> bool {
        self.format == ArchiveFormat::Zip
    }
}

/// Locations of the runtime binary and the bundled npm entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub node: PathBuf,
    pub npm_cli: PathBuf,
}

impl Toolchain {
    pub fn in_dir(runtime_dir: &Path, windows: bool) -> Self {
        if windows {
            Self {
                node: runtime_dir.join("node.exe"),
                npm_cli: runtime_dir.join("node_modules/npm/bin/npm-cli.js"),
            }
        } else {
            Self {
                node: runtime_dir.join("bin/node"),
                npm_cli: runtime_dir.join("lib/node_modules/npm/bin/npm-cli.js"),
            }
        }
    }

    /// Directory holding the bundled npm package.
    pub fn npm_dir(&self) -> Option<&Path> {
        self.npm_cli.parent().and_then(Path::parent)
    }
}

// ---------------------------------------------------------------------------
// Index and checksum parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: Version,
    pub filename: String,
}

/// Pick the highest-versioned archive for `platform` out of a distribution
/// directory listing.
pub fn parse_index(html: &str, platform: &Platform) -> Option<Release> {
    let pattern = format!(
        r#"href="(node-v([0-9.]+)-{}\.{})""#,
        regex::escape(&platform.tag),
        regex::escape(platform.format.extension())
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures_iter(html)
        .filter_map(|caps| {
            let version = Version::parse(&caps[2]).ok()?;
            Some(Release {
                version,
                filename: caps[1].to_string(),
            })
        })
        .max_by(|a, b| a.version.cmp(&b.version))
}

/// Digest listed for `filename` in a `SHASUMS256.txt` document.
pub fn expected_checksum(manifest: &str, filename: &str) -> Option<String> {
    manifest.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let digest = parts.next()?;
        let name = parts.next()?.trim_start_matches('*');
        (name == filename).then(|| digest.to_ascii_lowercase())
    })
}

/// Outcome of checking one archive against the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRecord {
    pub filename: String,
    pub expected: Option<String>,
    pub local: String,
}

impl ChecksumRecord {
    /// True iff the manifest names this file with exactly the local digest.
    pub fn passed(&self) -> bool {
        self.expected
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.local))
    }
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Drop the archive's top-level folder. Returns `None` for the folder entry
/// itself and for anything that would escape the destination.
pub fn strip_top_level(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut seen_top = false;
    for component in path.components() {
        match component {
            Component::Normal(_) if !seen_top => seen_top = true,
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

/// Unpack a `.tar.gz` into `dest`, stripping the single top-level folder.
pub fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    ensure_dir(dest)?;

    let mut unpacked = 0;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(relative) = strip_top_level(&path) else {
            if path.components().count() > 1 {
                tracing::warn!("skipping unsafe archive entry {}", path.display());
            }
            continue;
        };
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            ensure_dir(parent)?;
        }
        if entry.header().entry_type().is_symlink() {
            remove_if_exists(&target)?;
        }
        entry.unpack(&target)?;
        unpacked += 1;
    }
    Ok(unpacked)
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// The first refresh time strictly after `now`.
pub fn next_run_after(now: NaiveDateTime) -> NaiveDateTime {
    let today = now.date();
    REFRESH_HOURS
        .iter()
        .filter_map(|h| NaiveTime::from_hms_opt(*h, 0, 0))
        .map(|t| today.and_time(t))
        .find(|candidate| *candidate > now)
        .unwrap_or_else(|| {
            let first = NaiveTime::from_hms_opt(REFRESH_HOURS[0], 0, 0).unwrap_or_default();
            (today + ChronoDuration::days(1)).and_time(first)
        })
}

// ---------------------------------------------------------------------------
// RuntimeProvisioner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub version: Version,
    pub updated: bool,
}

pub struct RuntimeProvisioner {
    paths: Paths,
    dist_url: String,
    platform: Platform,
    client: reqwest::Client,
    bus: Arc<ActionBus>,
    status: Arc<dyn StatusSink>,
    run_lock: tokio::sync::Mutex<()>,
}

impl RuntimeProvisioner {
    pub fn new(
        paths: Paths,
        dist_url: impl Into<String>,
        platform: Platform,
        bus: Arc<ActionBus>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            paths,
            dist_url: dist_url.into(),
            platform,
            client: reqwest::Client::new(),
            bus,
            status,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain::in_dir(&self.paths.runtime_dir(), self.platform.is_windows())
    }

    fn dist_file_url(&self, name: &str) -> String {
        format!("{}/{}", self.dist_url.trim_end_matches('/'), name)
    }

    /// Version reported by the installed runtime. `None` when the binary is
    /// missing, fails, or reports `0.0.0`.
    pub async fn local_version(&self) -> Option<Version> {
        let node = self.toolchain().node;
        if !node.exists() {
            return None;
        }
        let mut cmd = command(&node);
        cmd.arg("-v");
        let out = run_to_completion(cmd).await.ok()?;
        if !out.success() {
            return None;
        }
        let version = Version::parse(out.stdout.trim().trim_start_matches('v')).ok()?;
        (version != Version::new(0, 0, 0)).then_some(version)
    }

    /// Newest release published for this platform.
    pub async fn remote_release(&self) -> Result<Release> {
        let html = self
            .client
            .get(&self.dist_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_index(&html, &self.platform).ok_or_else(|| PressError::ReleaseNotFound {
            platform: self.platform.tag.clone(),
        })
    }

    /// One provisioning run. Fires `runtime_ready` when a usable runtime
    /// exists at the end of it. A run requested while another is in progress
    /// returns `Ok(None)` without doing anything.
    pub async fn provision(&self) -> Result<Option<ProvisionOutcome>> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            tracing::debug!("runtime provisioning already in progress");
            return Ok(None);
        };

        self.status
            .report(SERVICE_RUNTIME, Status::Building, Some("Checking Node.js"));
        match self.provision_inner().await {
            Ok(outcome) => {
                let msg = format!("Node.js v{}", outcome.version);
                self.status
                    .report(SERVICE_RUNTIME, Status::Ready, Some(msg.as_str()));
                self.bus.fire(actions::RUNTIME_READY, Payload::Empty);
                Ok(Some(outcome))
            }
            Err(e) => {
                tracing::warn!("runtime provisioning failed: {e}");
                let msg = e.to_string();
                self.status
                    .report(SERVICE_RUNTIME, Status::Error, Some(msg.as_str()));
                Err(e)
            }
        }
    }

    async fn provision_inner(&self) -> Result<ProvisionOutcome> {
        self.paths.ensure()?;
        let local = self.local_version().await;
        tracing::info!(
            "local Node.js: {}",
            local.as_ref().map_or_else(|| "none".to_string(), |v| v.to_string())
        );

        let remote = match self.remote_release().await {
            Ok(release) => Some(release),
            Err(e) if local.is_some() => {
                tracing::warn!("could not check for Node.js updates: {e}");
                None
            }
            Err(e) => return Err(e),
        };

        let mut updated = false;
        if let Some(release) = remote {
            if local.as_ref().map_or(true, |l| release.version > *l) {
                tracing::info!("installing Node.js v{}", release.version);
                let archive = self.ensure_archive(&release).await?;
                self.install_archive(&archive).await?;
                updated = true;
            }
        }

        let version = self
            .local_version()
            .await
            .ok_or(PressError::RuntimeUnavailable)?;
        self.update_package_manager().await;
        Ok(ProvisionOutcome { version, updated })
    }

    /// Return a verified archive for `release`, reusing the cached copy when
    /// it still verifies.
    pub async fn ensure_archive(&self, release: &Release) -> Result<PathBuf> {
        let path = self.paths.archive_dir().join(&release.filename);
        if path.exists() {
            if self.verify(&path, &release.filename).await?.passed() {
                tracing::info!("reusing cached {}", release.filename);
                return Ok(path);
            }
            remove_if_exists(&path)?;
        }

        self.download(&self.dist_file_url(&release.filename), &path)
            .await?;
        let record = self.verify(&path, &release.filename).await?;
        if !record.passed() {
            remove_if_exists(&path)?;
            return Err(PressError::ChecksumMismatch {
                filename: record.filename,
                expected: record.expected.unwrap_or_else(|| "<not listed>".to_string()),
                actual: record.local,
            });
        }
        Ok(path)
    }

    /// Check `archive` against the checksum manifest, fetching the manifest
    /// again once if the cached copy does not list `filename`.
    pub async fn verify(&self, archive: &Path, filename: &str) -> Result<ChecksumRecord> {
        let path = archive.to_path_buf();
        let local = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| PressError::Io(std::io::Error::other(e)))??;

        let manifest = self.checksum_manifest(false).await?;
        let mut expected = expected_checksum(&manifest, filename);
        if expected.is_none() {
            let manifest = self.checksum_manifest(true).await?;
            expected = expected_checksum(&manifest, filename);
        }
        Ok(ChecksumRecord {
            filename: filename.to_string(),
            expected,
            local,
        })
    }

    async fn checksum_manifest(&self, refresh: bool) -> Result<String> {
        let cached = self.paths.archive_dir().join(CACHED_MANIFEST);
        if !refresh && cached.exists() {
            return Ok(tokio::fs::read_to_string(&cached).await?);
        }
        self.download(&self.dist_file_url(CHECKSUM_MANIFEST), &cached)
            .await?;
        Ok(tokio::fs::read_to_string(&cached).await?)
    }

    /// Stream `url` into `<dest>.part`, then rename into place.
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        tracing::info!("downloading {url}");
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        let mut part = OsString::from(dest.as_os_str());
        part.push(".part");
        let part = PathBuf::from(part);

        let mut response = self.client.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(&part).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await?;
        Ok(())
    }

    /// Replace the runtime dir with the contents of `archive`.
    async fn install_archive(&self, archive: &Path) -> Result<()> {
        let dest = self.paths.runtime_dir();
        if dest.exists() {
            tokio::fs::remove_dir_all(&dest).await?;
        }
        match self.platform.format {
            ArchiveFormat::TarGz => {
                let archive = archive.to_path_buf();
                let target = dest.clone();
                let count = tokio::task::spawn_blocking(move || extract_tar_gz(&archive, &target))
                    .await
                    .map_err(|e| PressError::Io(std::io::Error::other(e)))??;
                tracing::info!("unpacked {count} entries into {}", dest.display());
            }
            ArchiveFormat::Zip => {
                ensure_dir(&dest)?;
                let mut cmd = command("tar");
                cmd.arg("-xf")
                    .arg(archive)
                    .arg("-C")
                    .arg(&dest)
                    .arg("--strip-components=1");
                run_to_completion(cmd).await?.check("tar")?;
            }
        }
        Ok(())
    }

    /// `npm install -g npm` with the bundled npm. Failures are logged only.
    pub async fn update_package_manager(&self) {
        let toolchain = self.toolchain();
        if !toolchain.npm_cli.exists() {
            tracing::debug!("bundled npm not found, skipping npm update");
            return;
        }
        let runtime_dir = self.paths.runtime_dir();
        if self.platform.is_windows() {
            for name in WINDOWS_WRAPPERS {
                if let Err(e) = remove_if_exists(&runtime_dir.join(name)) {
                    tracing::warn!("could not remove {name}: {e}");
                }
            }
        }

        let mut cmd = command_in(&toolchain.node, &runtime_dir);
        cmd.arg(&toolchain.npm_cli).args(["install", "-g", "npm"]);
        match run_to_completion(cmd).await {
            Ok(out) if out.success() => tracing::info!("npm updated"),
            Ok(out) => tracing::warn!("npm update exited {:?}: {}", out.code, out.stderr.trim()),
            Err(e) => tracing::warn!("npm update failed: {e}"),
        }

        if self.platform.is_windows() {
            if let Some(npm_dir) = toolchain.npm_dir() {
                let mut cmd = command_in(&toolchain.node, npm_dir);
                cmd.arg(&toolchain.npm_cli).arg("dedupe");
                if let Err(e) = run_to_completion(cmd).await.and_then(|o| o.check("npm dedupe")) {
                    tracing::warn!("npm dedupe failed: {e}");
                }
            }
        }
    }

    /// Provision now, then again at every scheduled refresh hour.
    pub fn spawn_schedule(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let _ = self.provision().await;
                let now = Local::now().naive_local();
                let wait = (next_run_after(now) - now)
                    .to_std()
                    .unwrap_or(Duration::from_secs(60));
                tracing::debug!("next runtime check in {}s", wait.as_secs());
                tokio::time::sleep(wait).await;
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const INDEX: &str = r#"<html><body>
<a href="node-v14.1.0-linux-x64.tar.gz">node-v14.1.0-linux-x64.tar.gz</a>
<a href="node-v14.2.0-linux-x64.tar.gz">node-v14.2.0-linux-x64.tar.gz</a>
<a href="node-v14.2.0-linux-x64.tar.xz">node-v14.2.0-linux-x64.tar.xz</a>
<a href="node-v14.9.0-darwin-x64.tar.gz">node-v14.9.0-darwin-x64.tar.gz</a>
<a href="node-v14.10.0-win-x64.zip">node-v14.10.0-win-x64.zip</a>
</body></html>"#;

    #[test]
    fn index_picks_highest_for_platform() {
        let linux = parse_index(INDEX, &Platform::from_tag("linux-x64")).unwrap();
        assert_eq!(linux.version, Version::new(14, 2, 0));
        assert_eq!(linux.filename, "node-v14.2.0-linux-x64.tar.gz");

        let win = parse_index(INDEX, &Platform::from_tag("win-x64")).unwrap();
        assert_eq!(win.filename, "node-v14.10.0-win-x64.zip");

        assert!(parse_index(INDEX, &Platform::from_tag("linux-arm64")).is_none());
    }

    #[test]
    fn checksum_gate_requires_name_and_digest() {
        let manifest = "aaa111  node-v14.2.0-linux-x64.tar.gz\nbbb222  node-v14.2.0-darwin-x64.tar.gz\n";
        let name = "node-v14.2.0-linux-x64.tar.gz";
        let expected = expected_checksum(manifest, name);
        assert_eq!(expected.as_deref(), Some("aaa111"));

        let ok = ChecksumRecord {
            filename: name.into(),
            expected: expected.clone(),
            local: "AAA111".into(),
        };
        assert!(ok.passed());

        let wrong = ChecksumRecord {
            local: "bbb222".into(),
            ..ok.clone()
        };
        assert!(!wrong.passed());

        let unlisted = ChecksumRecord {
            expected: expected_checksum(manifest, "node-v14.3.0-linux-x64.tar.gz"),
            ..ok
        };
        assert!(!unlisted.passed());
    }

    #[test]
    fn strip_top_level_rejects_escapes() {
        assert_eq!(
            strip_top_level(Path::new("node-v14/bin/node")),
            Some(PathBuf::from("bin/node"))
        );
        assert_eq!(strip_top_level(Path::new("node-v14/")), None);
        assert_eq!(strip_top_level(Path::new("node-v14/../../etc/passwd")), None);
        assert_eq!(strip_top_level(Path::new("/abs/bin/node")), None);
    }

    #[test]
    fn sha256_of_known_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn schedule_runs_at_seven_and_nineteen() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let at = |h, m| day.and_hms_opt(h, m, 0).unwrap();

        assert_eq!(next_run_after(at(3, 0)), at(7, 0));
        assert_eq!(next_run_after(at(7, 0)), at(19, 0));
        assert_eq!(next_run_after(at(12, 30)), at(19, 0));
        assert_eq!(
            next_run_after(at(19, 0)),
            NaiveDate::from_ymd_opt(2024, 3, 11)
                .unwrap()
                .and_hms_opt(7, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn toolchain_layout_per_platform() {
        let unix = Toolchain::in_dir(Path::new("/t/node"), false);
        assert_eq!(unix.node, PathBuf::from("/t/node/bin/node"));
        assert_eq!(
            unix.npm_dir(),
            Some(Path::new("/t/node/lib/node_modules/npm"))
        );
        let win = Toolchain::in_dir(Path::new("/t/node"), true);
        assert_eq!(win.node, PathBuf::from("/t/node/node.exe"));
    }

    #[cfg(unix)]
    mod provisioning {
        use super::*;
        use crate::status::RecordingSink;
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// Records every invocation in `<runtime>/node-calls.log`.
        const NODE_STUB: &str = "#!/bin/sh\n\
            echo \"$*\" >> \"$(dirname \"$0\")/../node-calls.log\"\n\
            if [ \"$1\" = \"-v\" ]; then echo v14.2.0; fi\n\
            exit 0\n";

        /// `node.exe` sits in the runtime root on Windows. Also notes any npm
        /// wrapper still present when it runs.
        const WIN_NODE_STUB: &str = "#!/bin/sh\n\
            dir=\"$(dirname \"$0\")\"\n\
            for w in npm npm.cmd npx npx.cmd; do\n\
            [ -e \"$dir/$w\" ] && echo \"wrapper $w\" >> \"$dir/node-calls.log\"\n\
            done\n\
            echo \"$*\" >> \"$dir/node-calls.log\"\n\
            exit 0\n";
        const FILENAME: &str = "node-v14.2.0-linux-x64.tar.gz";

        fn append(builder: &mut tar::Builder<GzEncoder<Vec<u8>>>, path: &str, body: &[u8], mode: u32) {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(mode);
            header.set_cksum();
            builder.append_data(&mut header, path, body).unwrap();
        }

        fn node_archive() -> Vec<u8> {
            let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
            append(&mut builder, "node-v14.2.0-linux-x64/bin/node", NODE_STUB.as_bytes(), 0o755);
            append(
                &mut builder,
                "node-v14.2.0-linux-x64/lib/node_modules/npm/bin/npm-cli.js",
                b"// npm",
                0o644,
            );
            builder.into_inner().unwrap().finish().unwrap()
        }

        /// Every logged node invocation other than the `-v` probe.
        fn node_calls(paths: &Paths) -> Vec<String> {
            std::fs::read_to_string(paths.runtime_dir().join("node-calls.log"))
                .unwrap_or_default()
                .lines()
                .filter(|l| *l != "-v")
                .map(str::to_owned)
                .collect()
        }

        fn digest(bytes: &[u8]) -> String {
            format!("{:x}", Sha256::digest(bytes))
        }

        struct Fixture {
            _dir: TempDir,
            paths: Paths,
            bus: Arc<ActionBus>,
            status: Arc<RecordingSink>,
            provisioner: RuntimeProvisioner,
        }

        fn fixture(dist_url: String) -> Fixture {
            fixture_for(dist_url, "linux-x64")
        }

        fn fixture_for(dist_url: String, platform: &str) -> Fixture {
            let dir = TempDir::new().unwrap();
            let paths = Paths::new(dir.path());
            let bus = ActionBus::new();
            let status = Arc::new(RecordingSink::default());
            let provisioner = RuntimeProvisioner::new(
                paths.clone(),
                dist_url,
                Platform::from_tag(platform),
                Arc::clone(&bus),
                status.clone(),
            );
            Fixture {
                _dir: dir,
                paths,
                bus,
                status,
                provisioner,
            }
        }

        #[tokio::test]
        async fn fresh_install_downloads_verifies_and_fires_ready() {
            let archive = node_archive();
            let mut server = mockito::Server::new_async().await;
            server
                .mock("GET", "/")
                .with_body(INDEX)
                .create_async()
                .await;
            server
                .mock("GET", "/SHASUMS256.txt")
                .with_body(format!("{}  {FILENAME}\n", digest(&archive)))
                .create_async()
                .await;
            let download = server
                .mock("GET", format!("/{FILENAME}").as_str())
                .with_body(archive)
                .expect(1)
                .create_async()
                .await;

            let f = fixture(format!("{}/", server.url()));
            assert_eq!(f.provisioner.local_version().await, None);

            let outcome = f.provisioner.provision().await.unwrap().unwrap();
            assert_eq!(outcome.version, Version::new(14, 2, 0));
            assert!(outcome.updated);
            download.assert_async().await;

            assert!(f.bus.has_fired(actions::RUNTIME_READY));
            assert!(f.paths.archive_dir().join(FILENAME).exists());
            assert!(f.paths.archive_dir().join(CACHED_MANIFEST).exists());
            assert!(f.provisioner.toolchain().npm_cli.exists());
            assert_eq!(
                f.status.statuses(SERVICE_RUNTIME),
                vec![Status::Building, Status::Ready]
            );
            let npm_cli = f.provisioner.toolchain().npm_cli;
            assert_eq!(
                node_calls(&f.paths),
                vec![format!("{} install -g npm", npm_cli.display())]
            );
            assert_eq!(f.bus.fire_count(actions::RUNTIME_READY), 1);

            // Same version on the second run: nothing is downloaded again.
            let again = f.provisioner.provision().await.unwrap().unwrap();
            assert!(!again.updated);
            assert_eq!(f.bus.fire_count(actions::RUNTIME_READY), 2);
        }

        #[tokio::test]
        async fn windows_update_drops_wrappers_then_dedupes() {
            let f = fixture_for(String::new(), "win-x64");
            let toolchain = f.provisioner.toolchain();
            let runtime = f.paths.runtime_dir();
            std::fs::create_dir_all(toolchain.npm_cli.parent().unwrap()).unwrap();
            std::fs::write(&toolchain.npm_cli, b"// npm").unwrap();
            std::fs::write(&toolchain.node, WIN_NODE_STUB).unwrap();
            std::fs::set_permissions(&toolchain.node, std::fs::Permissions::from_mode(0o755))
                .unwrap();
            for name in WINDOWS_WRAPPERS {
                std::fs::write(runtime.join(name), b"wrapper").unwrap();
            }

            f.provisioner.update_package_manager().await;

            for name in WINDOWS_WRAPPERS {
                assert!(!runtime.join(name).exists(), "{name} left behind");
            }
            let cli = toolchain.npm_cli.display();
            assert_eq!(
                node_calls(&f.paths),
                vec![format!("{cli} install -g npm"), format!("{cli} dedupe")]
            );
        }

        #[tokio::test]
        async fn checksum_mismatch_discards_archive_and_does_not_fire() {
            let archive = node_archive();
            let mut server = mockito::Server::new_async().await;
            server.mock("GET", "/").with_body(INDEX).create_async().await;
            server
                .mock("GET", "/SHASUMS256.txt")
                .with_body(format!("{}  {FILENAME}\n", "0".repeat(64)))
                .create_async()
                .await;
            server
                .mock("GET", format!("/{FILENAME}").as_str())
                .with_body(archive)
                .create_async()
                .await;

            let f = fixture(server.url());
            let err = f.provisioner.provision().await.unwrap_err();
            assert!(matches!(err, PressError::ChecksumMismatch { .. }), "{err}");
            assert!(!f.paths.archive_dir().join(FILENAME).exists());
            assert!(!f.paths.runtime_dir().exists());
            assert!(!f.bus.has_fired(actions::RUNTIME_READY));
            assert_eq!(f.status.last(SERVICE_RUNTIME).unwrap().0, Status::Error);
        }

        #[tokio::test]
        async fn stale_manifest_is_refetched_once() {
            let archive = node_archive();
            let mut server = mockito::Server::new_async().await;
            let sums = server
                .mock("GET", "/SHASUMS256.txt")
                .with_body(format!("{}  {FILENAME}\n", digest(&archive)))
                .expect(1)
                .create_async()
                .await;

            let f = fixture(server.url());
            f.paths.ensure().unwrap();
            std::fs::write(
                f.paths.archive_dir().join(CACHED_MANIFEST),
                "deadbeef  node-v14.1.0-linux-x64.tar.gz\n",
            )
            .unwrap();
            let path = f.paths.archive_dir().join(FILENAME);
            std::fs::write(&path, &archive).unwrap();

            let record = f.provisioner.verify(&path, FILENAME).await.unwrap();
            assert!(record.passed());
            sums.assert_async().await;
        }

        #[tokio::test]
        async fn unreachable_index_keeps_existing_runtime() {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("GET", "/")
                .with_status(503)
                .create_async()
                .await;

            let f = fixture(server.url());
            let node = f.provisioner.toolchain().node;
            std::fs::create_dir_all(node.parent().unwrap()).unwrap();
            std::fs::write(&node, NODE_STUB).unwrap();
            std::fs::set_permissions(&node, std::fs::Permissions::from_mode(0o755)).unwrap();

            let outcome = f.provisioner.provision().await.unwrap().unwrap();
            assert!(!outcome.updated);
            assert!(f.bus.has_fired(actions::RUNTIME_READY));
        }

        #[tokio::test]
        async fn unreachable_index_without_runtime_aborts() {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("GET", "/")
                .with_status(503)
                .create_async()
                .await;

            let f = fixture(server.url());
            assert!(f.provisioner.provision().await.is_err());
            assert!(!f.bus.has_fired(actions::RUNTIME_READY));
        }

        #[test]
        fn extract_strips_top_level_folder() {
            let dir = TempDir::new().unwrap();
            let archive = dir.path().join(FILENAME);
            std::fs::write(&archive, node_archive()).unwrap();
            let dest = dir.path().join("node");

            assert_eq!(extract_tar_gz(&archive, &dest).unwrap(), 2);
            let node = dest.join("bin/node");
            assert!(node.is_file());
            let mode = std::fs::metadata(&node).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0, "runtime binary must stay executable");
        }
    }
}
