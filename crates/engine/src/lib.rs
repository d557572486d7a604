//! Keelson engine: converges a `Chart` release toward its rendered bundle and
//! tears it down behind a finalizer.
//!
//! Forward path: finalizer → fetch → render → parse → create-if-absent, one
//! descriptor at a time, persisting ownership after every create. Deletion
//! path: delete every tracked reference, then release the finalizer. Existing
//! resources are never patched.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use keelson_core::{
    owned_by, tracker, Chart, ClusterApi, Error, ObjectKey, Outcome, ReleasePhase, ResourceDescriptor, Result,
    CASCADE_FINALIZER, DEFAULT_REPO, FINALIZER,
};
use keelson_render::BundleSource;
use metrics::{counter, histogram};
use tracing::{debug, info, instrument, warn};

mod status;

pub use status::StatusReporter;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Marker gating deletion of a `Chart`
    pub finalizer: String,
    /// Repository alias used when a chart leaves `repo` empty
    pub default_repo: String,
}

impl Default for EngineConfig {
    fn default() -> Self { Self { finalizer: FINALIZER.to_string(), default_repo: DEFAULT_REPO.to_string() } }
}

pub struct Engine {
    cluster: Arc<dyn ClusterApi>,
    source: Arc<dyn BundleSource>,
    cfg: EngineConfig,
}

impl Engine {
    pub fn new(cluster: Arc<dyn ClusterApi>, source: Arc<dyn BundleSource>) -> Self {
        Self::with_config(cluster, source, EngineConfig::default())
    }

    pub fn with_config(cluster: Arc<dyn ClusterApi>, source: Arc<dyn BundleSource>, cfg: EngineConfig) -> Self {
        Self { cluster, source, cfg }
    }

    /// One convergence pass for `key`. A missing `Chart` is not an error.
    #[instrument(skip(self), fields(chart = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = match self.cluster.get_chart(key).await? {
            None => {
                debug!("chart gone; nothing to do");
                Ok(Outcome::done())
            }
            Some(chart) if chart.is_deleting() => self.finalize(chart).await,
            Some(chart) => self.converge(chart).await,
        };
        histogram!("reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            counter!("reconcile_err", 1u64, "kind" => e.kind());
        }
        res
    }

    async fn bundle(&self, chart: &Chart) -> Result<String> {
        let spec = &chart.spec;
        let repo = spec.repo_or(&self.cfg.default_repo);
        let artifact = self.source.fetch(repo, &spec.chart, &spec.version).await?;
        let release = chart.metadata.name.as_deref().unwrap_or(&spec.chart);
        self.source.render(&artifact, release, &spec.values, spec.namespace()).await
    }

    /// Render and parse without touching the cluster. Descriptors get the forced
    /// namespace, and the owner link when the chart has a uid.
    pub async fn preview(&self, chart: &Chart) -> Result<Vec<ResourceDescriptor>> {
        let raw = self.bundle(chart).await?;
        let owner = chart.owner_reference().ok();
        let ns = chart.spec.namespace();
        let mut out = Vec::new();
        for mut d in keelson_apply::parse(&raw) {
            match &owner {
                Some(o) => keelson_apply::prepare(&mut d, o, ns)?,
                None => d.set_namespace(ns),
            }
            out.push(d);
        }
        Ok(out)
    }

    async fn converge(&self, mut chart: Chart) -> Result<Outcome> {
        let status = StatusReporter::new(self.cluster.as_ref());
        if chart.add_finalizer(&self.cfg.finalizer) {
            chart = status.update(&chart).await?;
            info!(finalizer = %self.cfg.finalizer, "finalizer added");
        }

        let raw = self.bundle(&chart).await?;
        let owner = chart.owner_reference()?;
        let namespace = chart.spec.namespace().to_string();
        let mut created = 0usize;

        for mut d in keelson_apply::parse(&raw) {
            keelson_apply::prepare(&mut d, &owner, &namespace)?;
            let reference = match d.reference() {
                Ok(r) => r,
                Err(e) => {
                    counter!("engine_reference_err", 1u64);
                    warn!(kind = %d.kind, error = %e, "descriptor has no reference; not tracked");
                    continue;
                }
            };
            let live = self.cluster.get(&reference).await.map_err(|e| Error::apply(&reference, e))?;
            match live {
                Some(obj) => {
                    if owned_by(&obj, &owner.uid) && tracker::add(chart.status_mut(), reference.clone()) {
                        info!(reference = %reference, "adopted untracked resource");
                        chart = status.update_status(&chart).await?;
                    } else {
                        debug!(reference = %reference, "already present");
                    }
                }
                None => {
                    d.add_finalizer(CASCADE_FINALIZER);
                    if let Err(e) = self.cluster.create(&d).await {
                        counter!("engine_create_err", 1u64);
                        warn!(reference = %reference, error = %e, "create failed");
                        chart.status_mut().status = ReleasePhase::Failed;
                        status.update_status(&chart).await?;
                        return Err(Error::apply(&reference, e));
                    }
                    created += 1;
                    counter!("engine_created_total", 1u64);
                    info!(reference = %reference, "created");
                    if tracker::add(chart.status_mut(), reference) {
                        chart = status.update_status(&chart).await?;
                    }
                }
            }
        }

        if chart.phase() != ReleasePhase::Deployed {
            chart.status_mut().status = ReleasePhase::Deployed;
            chart = status.update_status(&chart).await?;
        }
        info!(created, owned = chart.owned().len(), "converged");
        Ok(Outcome::done())
    }

    async fn finalize(&self, mut chart: Chart) -> Result<Outcome> {
        if !chart.has_finalizer(&self.cfg.finalizer) {
            debug!("deleting without our finalizer; nothing to do");
            return Ok(Outcome::done());
        }
        let status = StatusReporter::new(self.cluster.as_ref());
        let tracked = chart.owned().to_vec();
        for reference in &tracked {
            let live = self.cluster.get(reference).await.map_err(|e| Error::apply(reference, e))?;
            if live.is_some() {
                self.cluster.delete(reference).await.map_err(|e| Error::apply(reference, e))?;
                counter!("engine_deleted_total", 1u64);
                info!(reference = %reference, "deleted");
            } else {
                debug!(reference = %reference, "already gone");
            }
            if tracker::remove(chart.status_mut(), reference) {
                chart = status.update_status(&chart).await?;
            }
        }
        chart.remove_finalizer(&self.cfg.finalizer);
        status.update(&chart).await?;
        info!(released = tracked.len(), "finalizer released");
        Ok(Outcome::done())
    }
}
