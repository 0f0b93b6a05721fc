/// Keeps the server binary (and optionally the Geyser plugin) current.
///
/// PaperMC and GeyserMC publish the same v2 download API:
///   `GET {api}/projects/{project}`                           -> `{ versions: [..] }`
///   `GET {api}/projects/{project}/versions/{v}/builds`       -> `{ builds: [{ build, downloads }] }`
///   `GET {api}/projects/{project}/versions/{v}/builds/{b}/downloads/{file}`
///
/// Installed versions are recorded in `versions.json` inside the working
/// directory so unchanged builds are never downloaded twice.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::paths;

pub const PAPER_API: &str = "https://api.papermc.io/v2";
pub const GEYSER_API: &str = "https://download.geysermc.org/v2";
const PAPER_PROJECT: &str = "paper";
const PAPER_DOWNLOAD: &str = "application";
const GEYSER_PROJECT: &str = "geyser";
const GEYSER_DOWNLOAD: &str = "spigot";
const GEYSER_JAR: &str = "Geyser-Spigot.jar";

/// Fetches a fresh server binary into a working directory. Only called while
/// the server is stopped.
#[async_trait]
pub trait Updater: Send + Sync {
    async fn refresh(&self, dir: &Path) -> Result<()>;
}

/// Installed version of one component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub build: u32,
}

/// Contents of `versions.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionsInfo {
    #[serde(default)]
    pub paper: VersionInfo,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: BTreeMap<String, VersionInfo>,
}

impl VersionsInfo {
    /// Reads the versions file. A missing or unreadable file means nothing is installed.
    pub async fn load(work_dir: &Path) -> Self {
        let path = paths::versions_file_path(work_dir);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(info) => info,
                Err(e) => {
                    warn!("[updater] Ignoring malformed {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                warn!("[updater] Failed to read versions info from {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub async fn save(&self, work_dir: &Path) -> Result<()> {
        let path = paths::versions_file_path(work_dir);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize versions info")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BuildsResponse {
    builds: Vec<Build>,
}

#[derive(Debug, Deserialize)]
struct Build {
    build: u32,
    downloads: BTreeMap<String, Download>,
}

#[derive(Debug, Deserialize)]
struct Download {
    name: String,
    sha256: String,
}

/// One downloadable file of a specific build.
#[derive(Debug)]
struct Artifact {
    version: String,
    build: u32,
    name: String,
    sha256: String,
    url: String,
}

/// Downloads PaperMC builds from the public API and links the active one
/// as `paper.jar`.
pub struct PaperUpdater {
    client: Client,
    paper_api: String,
    geyser_api: String,
    /// Stays on this version when set; follows the newest otherwise.
    paper_version: Option<String>,
    geyser: bool,
}

impl PaperUpdater {
    pub fn new(config: &Config) -> Self {
        Self::with_base_urls(config, PAPER_API, GEYSER_API)
    }

    /// Same as [`new`](Self::new) against other API hosts.
    pub fn with_base_urls(config: &Config, paper_api: &str, geyser_api: &str) -> Self {
        Self {
            client: Client::new(),
            paper_api: paper_api.trim_end_matches('/').to_string(),
            geyser_api: geyser_api.trim_end_matches('/').to_string(),
            paper_version: config.paper_version.clone(),
            geyser: config.geyser,
        }
    }

    async fn refresh_paper(&self, dir: &Path, info: &mut VersionsInfo) -> Result<()> {
        let artifact = self
            .latest(&self.paper_api, PAPER_PROJECT, self.paper_version.as_deref(), PAPER_DOWNLOAD)
            .await?;
        if info.paper.build > 0
            && info.paper.build == artifact.build
            && info.paper.version == artifact.version
        {
            info!(version = %artifact.version, build = artifact.build, "[updater] Already latest paper build");
            return Ok(());
        }

        self.fetch(&artifact, &dir.join(&artifact.name)).await?;
        link_server_jar(dir, &artifact.name).await?;
        info.paper = VersionInfo {
            version: artifact.version,
            build: artifact.build,
        };
        info.save(dir).await?;
        info!(file = %artifact.name, build = info.paper.build, "[updater] Installed paper");
        Ok(())
    }

    async fn refresh_geyser(&self, dir: &Path, info: &mut VersionsInfo) -> Result<()> {
        let artifact = self
            .latest(&self.geyser_api, GEYSER_PROJECT, None, GEYSER_DOWNLOAD)
            .await?;
        let installed = info.plugins.get(GEYSER_PROJECT);
        if installed.is_some_and(|v| v.build > 0 && v.build == artifact.build) {
            info!(build = artifact.build, "[updater] Geyser already latest build");
            return Ok(());
        }

        let target_dir = plugin_target_dir(dir, installed.is_some());
        tokio::fs::create_dir_all(&target_dir)
            .await
            .with_context(|| format!("Failed to create {}", target_dir.display()))?;
        self.fetch(&artifact, &target_dir.join(GEYSER_JAR)).await?;
        info.plugins.insert(
            GEYSER_PROJECT.to_string(),
            VersionInfo {
                version: artifact.version,
                build: artifact.build,
            },
        );
        info.save(dir).await?;
        info!(dir = %target_dir.display(), "[updater] Installed Geyser");
        Ok(())
    }

    /// Resolves the newest build of `project` (on `pin` when given).
    async fn latest(
        &self,
        api: &str,
        project: &str,
        pin: Option<&str>,
        download: &str,
    ) -> Result<Artifact> {
        let project_url = format!("{api}/projects/{project}");
        let versions: ProjectResponse = self.get_json(&project_url).await?;
        let version = pick_version(&versions.versions, pin)
            .with_context(|| format!("No usable {project} version published"))?;

        let builds_url = format!("{project_url}/versions/{version}/builds");
        let builds: BuildsResponse = self.get_json(&builds_url).await?;
        let build = builds
            .builds
            .into_iter()
            .last()
            .with_context(|| format!("No builds published for {project} {version}"))?;
        let file = build
            .downloads
            .get(download)
            .with_context(|| format!("Build {} of {project} has no '{download}' download", build.build))?;

        debug!(project, version = %version, build = build.build, "[updater] Latest build");
        Ok(Artifact {
            url: format!("{builds_url}/{}/downloads/{}", build.build, file.name),
            version,
            build: build.build,
            name: file.name.clone(),
            sha256: file.sha256.clone(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        resp.json().await.with_context(|| format!("Unexpected response from {url}"))
    }

    /// Downloads `artifact` to `dest` unless a file is already there. The
    /// checksum is verified before anything touches the disk.
    async fn fetch(&self, artifact: &Artifact, dest: &Path) -> Result<()> {
        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            info!(file = %dest.display(), "[updater] Reusing existing download");
            return Ok(());
        }
        info!(url = %artifact.url, "[updater] Downloading");
        let bytes = self
            .client
            .get(&artifact.url)
            .send()
            .await
            .with_context(|| format!("GET {}", artifact.url))?
            .error_for_status()
            .with_context(|| format!("GET {}", artifact.url))?
            .bytes()
            .await
            .with_context(|| format!("Failed to read {}", artifact.url))?;
        verify_sha256(&bytes, &artifact.sha256)
            .with_context(|| format!("Download of {} is corrupt", artifact.name))?;
        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))
    }
}

#[async_trait]
impl Updater for PaperUpdater {
    async fn refresh(&self, dir: &Path) -> Result<()> {
        let mut info = VersionsInfo::load(dir).await;
        self.refresh_paper(dir, &mut info).await?;
        if self.geyser {
            self.refresh_geyser(dir, &mut info).await?;
        }
        Ok(())
    }
}

/// Refresh run before the first launch. A failure is tolerated when a server
/// jar is already installed.
pub async fn refresh_at_startup(updater: &dyn Updater, work_dir: &Path) -> Result<()> {
    let Err(e) = updater.refresh(work_dir).await else {
        return Ok(());
    };
    let jar = paths::server_jar_path(work_dir);
    if !tokio::fs::try_exists(&jar).await.unwrap_or(false) {
        return Err(e).with_context(|| format!("No server jar at {}", jar.display()));
    }
    warn!("[updater] Refresh failed, starting installed jar: {e:#}");
    Ok(())
}

fn pick_version(published: &[String], pin: Option<&str>) -> Option<String> {
    match pin {
        Some(pin) => published.iter().find(|v| v.as_str() == pin).cloned(),
        None => published.last().cloned(),
    }
}

fn verify_sha256(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = hex::encode(Sha256::digest(bytes));
    if !actual.eq_ignore_ascii_case(expected) {
        bail!("SHA-256 mismatch: expected {expected}, got {actual}");
    }
    Ok(())
}

/// A first install goes straight into `plugins/`; the server itself swaps in
/// jars staged under `plugins/update/` on its next start.
fn plugin_target_dir(work_dir: &Path, installed: bool) -> PathBuf {
    let plugins = paths::plugins_dir(work_dir);
    if installed {
        plugins.join(paths::PLUGIN_UPDATE_DIR)
    } else {
        plugins
    }
}

/// Points `paper.jar` at `file_name`, replacing the previous link in one rename.
async fn link_server_jar(work_dir: &Path, file_name: &str) -> Result<()> {
    let link = paths::server_jar_path(work_dir);
    let staged = work_dir.join(format!("{}.new", paths::SERVER_JAR));
    let _ = tokio::fs::remove_file(&staged).await;

    #[cfg(unix)]
    tokio::fs::symlink(file_name, &staged)
        .await
        .with_context(|| format!("Failed to link {}", staged.display()))?;
    #[cfg(not(unix))]
    tokio::fs::copy(work_dir.join(file_name), &staged)
        .await
        .with_context(|| format!("Failed to copy {file_name}"))?;

    tokio::fs::rename(&staged, &link)
        .await
        .with_context(|| format!("Failed to replace {}", link.display()))
}
