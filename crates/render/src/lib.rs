//! Keelson render: materializes chart artifacts and renders them into a
//! multi-document bundle.

#![forbid(unsafe_code)]

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use keelson_core::{Error, Result, ValuePair};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::process::Command;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Exclusive hold on one chart cache directory.
pub type CacheLease = Arc<OwnedMutexGuard<()>>;

/// A chart materialized on local disk.
///
/// A handle from `HelmCli` keeps its cache directory locked until the last
/// clone is dropped, so no other pass clears or re-pulls it mid-render.
#[derive(Debug, Clone)]
pub struct ArtifactHandle {
    pub chart: String,
    pub version: String,
    pub path: PathBuf,
    lease: Option<CacheLease>,
}

impl ArtifactHandle {
    pub fn new(chart: impl Into<String>, version: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { chart: chart.into(), version: version.into(), path: path.into(), lease: None }
    }

    fn leased(mut self, lease: CacheLease) -> Self {
        self.lease = Some(lease);
        self
    }
}

impl PartialEq for ArtifactHandle {
    fn eq(&self, other: &Self) -> bool {
        self.chart == other.chart && self.version == other.version && self.path == other.path
    }
}

impl Eq for ArtifactHandle {}

/// Produces rendered resource text for a chart release.
#[async_trait::async_trait]
pub trait BundleSource: Send + Sync {
    /// Make the chart available locally.
    async fn fetch(&self, repo: &str, chart: &str, version: &str) -> Result<ArtifactHandle>;

    /// Render the chart with the given values into the target namespace.
    async fn render(&self, artifact: &ArtifactHandle, release: &str, values: &[ValuePair], namespace: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct HelmConfig {
    /// helm executable
    pub helm_bin: PathBuf,
    /// Directory charts are untarred into
    pub cache_dir: PathBuf,
    /// Run `helm repo update` before pulling an uncached chart
    pub repo_update: bool,
}

impl Default for HelmConfig {
    fn default() -> Self {
        Self {
            helm_bin: std::env::var_os("KEELSON_HELM_BIN").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("helm")),
            cache_dir: std::env::var_os("KEELSON_CHART_CACHE").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./charts")),
            repo_update: false,
        }
    }
}

/// `BundleSource` backed by the helm command line.
pub struct HelmCli {
    cfg: HelmConfig,
    leases: Mutex<FxHashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl HelmCli {
    pub fn new(cfg: HelmConfig) -> Self { Self { cfg, leases: Mutex::new(FxHashMap::default()) } }

    /// Wait for exclusive use of a cache directory.
    async fn lease(&self, dir: &Path) -> CacheLease {
        let lock = {
            let mut map = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(dir.to_path_buf()).or_default())
        };
        let t0 = Instant::now();
        let guard = lock.lock_owned().await;
        histogram!("helm_cache_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Arc::new(guard)
    }

    async fn run(&self, args: &[String]) -> std::result::Result<String, String> {
        debug!(bin = %self.cfg.helm_bin.display(), ?args, "running helm");
        let out = Command::new(&self.cfg.helm_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("spawning {}: {}", self.cfg.helm_bin.display(), e))?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Err(format!("{}: {}", out.status, stderr.trim()))
        }
    }
}

/// Accepts a value only if it names exactly one directory below its parent.
fn cache_segment<'a>(what: &str, value: &'a str) -> std::result::Result<&'a str, String> {
    let mut parts = Path::new(value).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) if !value.contains(|c: char| c == '/' || c == '\\') => Ok(value),
        _ => Err(format!("{} {:?} is not a plain path segment", what, value)),
    }
}

/// Directory a chart version is untarred into: `<root>/<repo>/<chart>/<version>`,
/// `latest` standing in for an unpinned version.
pub fn cache_dir_for(root: &Path, repo: &str, chart: &str, version: &str) -> Result<PathBuf> {
    let v = if version.is_empty() { "latest" } else { version };
    let repo = cache_segment("repo", repo).map_err(|m| Error::fetch(chart, m))?;
    let name = cache_segment("chart", chart).map_err(|m| Error::fetch(chart, m))?;
    let v = cache_segment("version", v).map_err(|m| Error::fetch(chart, m))?;
    Ok(root.join(repo).join(name).join(v))
}

pub fn pull_args(repo: &str, chart: &str, version: &str, untar_dir: &Path) -> Vec<String> {
    let mut args = vec!["pull".to_string(), format!("{}/{}", repo, chart)];
    if !version.is_empty() {
        args.push("--version".into());
        args.push(version.to_string());
    }
    args.push("--untar".into());
    args.push(format!("--untardir={}", untar_dir.display()));
    args
}

pub fn template_args(release: &str, chart_dir: &Path, values: &[ValuePair], namespace: &str) -> Vec<String> {
    let mut args = vec![
        "template".to_string(),
        release.to_string(),
        chart_dir.display().to_string(),
        format!("--namespace={}", namespace),
    ];
    for v in values {
        args.push("--set".into());
        args.push(format!("{}={}", v.name, v.value));
    }
    args
}

#[async_trait::async_trait]
impl BundleSource for HelmCli {
    async fn fetch(&self, repo: &str, chart: &str, version: &str) -> Result<ArtifactHandle> {
        let dir = cache_dir_for(&self.cfg.cache_dir, repo, chart, version)?;
        let path = dir.join(chart);
        if !path.starts_with(&self.cfg.cache_dir) {
            return Err(Error::fetch(chart, format!("{} escapes the chart cache", path.display())));
        }
        let lease = self.lease(&dir).await;
        // An unpinned version always re-pulls so "latest" moves.
        if !version.is_empty() && path.join("Chart.yaml").is_file() {
            counter!("helm_fetch_cached_total", 1u64);
            debug!(chart, version, path = %path.display(), "chart already cached");
            return Ok(ArtifactHandle::new(chart, version, path).leased(lease));
        }
        let t0 = Instant::now();
        if self.cfg.repo_update {
            self.run(&["repo".to_string(), "update".to_string()])
                .await
                .map_err(|m| Error::fetch(chart, format!("repo update: {}", m)))?;
        }
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await.map_err(|e| Error::fetch(chart, format!("clearing {}: {}", path.display(), e)))?;
        }
        tokio::fs::create_dir_all(&dir).await.map_err(|e| Error::fetch(chart, format!("creating {}: {}", dir.display(), e)))?;
        self.run(&pull_args(repo, chart, version, &dir)).await.map_err(|m| {
            counter!("helm_fetch_err", 1u64);
            Error::fetch(chart, m)
        })?;
        histogram!("helm_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(repo, chart, version, path = %path.display(), "pulled chart");
        Ok(ArtifactHandle::new(chart, version, path).leased(lease))
    }

    async fn render(&self, artifact: &ArtifactHandle, release: &str, values: &[ValuePair], namespace: &str) -> Result<String> {
        let t0 = Instant::now();
        let out = self.run(&template_args(release, &artifact.path, values, namespace)).await.map_err(|m| {
            counter!("helm_render_err", 1u64);
            Error::render(&artifact.chart, m)
        })?;
        histogram!("helm_render_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(chart = %artifact.chart, release, bytes = out.len(), "rendered bundle");
        Ok(out)
    }
}
