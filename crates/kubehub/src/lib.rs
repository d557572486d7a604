//! Keelson kubehub: kube-rs backed `ClusterApi` and the `Chart` watcher that
//! feeds the dispatch loop.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use futures::StreamExt;
use keelson_core::{Chart, ClusterApi, Error, ObjectKey, Reference, ResourceDescriptor, Result};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const FIELD_MANAGER: &str = "keelson";

pub async fn get_kube_client() -> Result<Client> {
    Ok(Client::try_default().await?)
}

fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{}/{}", version, kind)
    } else {
        format!("{}/{}/{}", group, version, kind)
    }
}

/// `ClusterApi` over dynamic objects. Kinds are resolved through discovery once
/// and cached; a miss re-runs discovery so CRDs installed later are found.
pub struct KubeCluster {
    client: Client,
    resources: Mutex<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(FxHashMap::default()) }
    }

    fn charts(&self) -> Api<Chart> {
        Api::all(self.client.clone())
    }

    fn cached(&self, key: &str) -> Option<(ApiResource, bool)> {
        self.resources.lock().ok().and_then(|m| m.get(key).cloned())
    }

    async fn find_api_resource(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let key = gvk_key(&gvk.group, &gvk.version, &gvk.kind);
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }
        let discovery = Discovery::new(self.client.clone()).run().await?;
        counter!("kube_discovery_runs_total", 1u64);
        let mut found = None;
        if let Ok(mut cache) = self.resources.lock() {
            for group in discovery.groups() {
                for (ar, caps) in group.recommended_resources() {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    let k = gvk_key(&ar.group, &ar.version, &ar.kind);
                    if k == key {
                        found = Some((ar.clone(), namespaced));
                    }
                    cache.insert(k, (ar, namespaced));
                }
            }
        }
        found.ok_or_else(|| Error::other(format!("GVK not found: {}", key)))
    }

    async fn dynamic_api(&self, api_version: &str, kind: &str, namespace: &str) -> Result<Api<DynamicObject>> {
        let (group, version) = keelson_core::split_api_version(api_version);
        let gvk = GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: kind.to_string() };
        let (ar, namespaced) = self.find_api_resource(&gvk).await?;
        Ok(if namespaced {
            if namespace.is_empty() {
                return Err(Error::other(format!("namespace required for namespaced kind {}", kind)));
            }
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn get_chart(&self, key: &ObjectKey) -> Result<Option<Chart>> {
        Ok(self.charts().get_opt(&key.name).await?)
    }

    async fn get(&self, reference: &Reference) -> Result<Option<Json>> {
        let api = self.dynamic_api(&reference.api_version, &reference.kind, &reference.namespace).await?;
        match api.get_opt(&reference.name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(&obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        let ns = descriptor.namespace.as_deref().unwrap_or_default();
        let api = self.dynamic_api(&descriptor.api_version, &descriptor.kind, ns).await?;
        let obj: DynamicObject = serde_json::from_value(descriptor.body.clone())?;
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        api.create(&pp, &obj).await?;
        debug!(kind = %descriptor.kind, name = %descriptor.name, ns, "created");
        Ok(())
    }

    async fn delete(&self, reference: &Reference) -> Result<()> {
        let api = self.dynamic_api(&reference.api_version, &reference.kind, &reference.namespace).await?;
        let dp = DeleteParams { propagation_policy: Some(PropagationPolicy::Foreground), ..Default::default() };
        match api.delete(&reference.name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, chart: &Chart) -> Result<Chart> {
        let name = chart.metadata.name.clone().unwrap_or_default();
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        Ok(self.charts().replace(&name, &pp, chart).await?)
    }

    async fn update_status(&self, chart: &Chart) -> Result<Chart> {
        let name = chart.metadata.name.clone().unwrap_or_default();
        // Merge patch replaces lists wholesale, so status.resource is written as a whole.
        let body = serde_json::json!({ "status": chart.status.clone().unwrap_or_default() });
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        Ok(self.charts().patch_status(&name, &pp, &Patch::Merge(&body)).await?)
    }
}

/// List+watch `Chart`s and send every touched key to the dispatch loop.
/// Runs until the receiver is dropped; watch errors are retried with backoff.
pub async fn watch_charts(client: Client, key_tx: mpsc::Sender<ObjectKey>) -> Result<()> {
    let api: Api<Chart> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!("chart watcher started");
    while let Some(ev) = stream.next().await {
        let keys: Vec<ObjectKey> = match ev {
            Ok(Event::Applied(c)) | Ok(Event::Deleted(c)) => vec![c.key()],
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "watch restart");
                list.iter().map(|c| c.key()).collect()
            }
            Err(e) => {
                counter!("chart_watch_errors_total", 1u64);
                warn!(error = %e, "chart watch error");
                continue;
            }
        };
        for key in keys {
            if key_tx.send(key).await.is_err() {
                info!("dispatch closed; stopping chart watcher");
                return Ok(());
            }
        }
    }
    warn!("chart watcher stream ended");
    Ok(())
}
