#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use keelson_core::prelude::*;
use keelson_core::Result;
use keelson_engine::Engine;
use keelson_render::{ArtifactHandle, BundleSource};
use serde_json::{json, Value as Json};

pub const UID: &str = "0b1c4a4e-5d8e-4a0d-9a4f-1c2d3e4f5a6b";

pub const DEPLOYMENT: &str = "---
# Source: nginx/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: nginx
  namespace: somewhere-else
spec:
  replicas: 2
";

pub const CONFIGMAP_AND_DEPLOYMENT: &str = "---
# Source: nginx/templates/configmap.yaml
apiVersion: v1
kind: ConfigMap
metadata:
  name: nginx-conf
data:
  a: b
---
# Source: nginx/templates/NOTES.txt
# nothing to render
---
# Source: nginx/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: nginx
";

pub fn nginx_chart() -> Chart {
    let mut chart = Chart::new(
        "nginx",
        ChartSpec {
            chart: "nginx".into(),
            repo: String::new(),
            version: "1.0.0".into(),
            namespace_selector: String::new(),
            values: vec![ValuePair::new("replicas", "2")],
        },
    );
    chart.metadata.uid = Some(UID.into());
    chart
}

pub fn deployment_ref() -> Reference {
    Reference::new("Deployment", "apps/v1", "default", "nginx")
}

pub fn configmap_ref() -> Reference {
    Reference::new("ConfigMap", "v1", "default", "nginx-conf")
}

#[derive(Default)]
pub struct State {
    pub charts: BTreeMap<String, Chart>,
    pub objects: HashMap<Reference, Json>,
    pub creates: Vec<Reference>,
    pub deletes: Vec<Reference>,
    pub chart_writes: usize,
    pub status_writes: usize,
    pub fail_get: HashSet<String>,
    pub fail_create: HashSet<String>,
    pub fail_delete: HashSet<String>,
    pub fail_status: bool,
}

/// In-memory API server holding charts and their rendered objects.
#[derive(Default, Clone)]
pub struct FakeCluster {
    pub state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn with_chart(chart: Chart) -> Self {
        let me = Self::default();
        me.put_chart(chart);
        me
    }

    pub fn put_chart(&self, chart: Chart) {
        let name = chart.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().charts.insert(name, chart);
    }

    pub fn chart(&self, name: &str) -> Option<Chart> {
        self.state.lock().unwrap().charts.get(name).cloned()
    }

    /// Flag the stored chart for deletion the way the API server would.
    pub fn mark_deleting(&self, name: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(c) = st.charts.get_mut(name) {
            c.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
    }

    pub fn put_object(&self, reference: Reference, body: Json) {
        self.state.lock().unwrap().objects.insert(reference, body);
    }

    pub fn object(&self, reference: &Reference) -> Option<Json> {
        self.state.lock().unwrap().objects.get(reference).cloned()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

fn injected(what: &str, name: &str) -> Error {
    Error::other(format!("injected {what} failure for {name}"))
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_chart(&self, key: &ObjectKey) -> Result<Option<Chart>> {
        Ok(self.chart(&key.name))
    }

    async fn get(&self, reference: &Reference) -> Result<Option<Json>> {
        let st = self.state.lock().unwrap();
        if st.fail_get.contains(&reference.name) {
            return Err(injected("get", &reference.name));
        }
        Ok(st.objects.get(reference).cloned())
    }

    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        let reference = descriptor.reference()?;
        let mut st = self.state.lock().unwrap();
        if st.fail_create.contains(&reference.name) {
            return Err(injected("create", &reference.name));
        }
        if st.objects.contains_key(&reference) {
            return Err(Error::other(format!("{reference} already exists")));
        }
        st.creates.push(reference.clone());
        st.objects.insert(reference, descriptor.body.clone());
        Ok(())
    }

    async fn delete(&self, reference: &Reference) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.fail_delete.contains(&reference.name) {
            return Err(injected("delete", &reference.name));
        }
        st.deletes.push(reference.clone());
        st.objects.remove(reference);
        Ok(())
    }

    async fn update(&self, chart: &Chart) -> Result<Chart> {
        let name = chart.metadata.name.clone().unwrap_or_default();
        let mut st = self.state.lock().unwrap();
        let Some(stored) = st.charts.get(&name).cloned() else {
            return Err(Error::other(format!("chart {name} not found")));
        };
        st.chart_writes += 1;
        let mut next = chart.clone();
        next.status = stored.status;
        let released = next.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty());
        if next.metadata.deletion_timestamp.is_some() && released {
            st.charts.remove(&name);
        } else {
            st.charts.insert(name, next.clone());
        }
        Ok(next)
    }

    async fn update_status(&self, chart: &Chart) -> Result<Chart> {
        let name = chart.metadata.name.clone().unwrap_or_default();
        let mut st = self.state.lock().unwrap();
        if st.fail_status {
            return Err(injected("status", &name));
        }
        st.status_writes += 1;
        let Some(stored) = st.charts.get_mut(&name) else {
            return Err(Error::other(format!("chart {name} not found")));
        };
        stored.status = chart.status.clone();
        Ok(stored.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Calls {
    pub fetches: Vec<(String, String, String)>,
    pub renders: Vec<(String, Vec<ValuePair>, String)>,
}

/// Bundle source returning a fixed manifest stream, or a fixed failure.
#[derive(Clone)]
pub struct ScriptedSource {
    pub bundle: Arc<Mutex<std::result::Result<String, String>>>,
    pub calls: Arc<Mutex<Calls>>,
}

impl ScriptedSource {
    pub fn new(bundle: &str) -> Self {
        Self { bundle: Arc::new(Mutex::new(Ok(bundle.to_string()))), calls: Arc::default() }
    }

    pub fn failing(message: &str) -> Self {
        let me = Self::new("");
        me.fail(message);
        me
    }

    pub fn fail(&self, message: &str) {
        *self.bundle.lock().unwrap() = Err(message.to_string());
    }

    pub fn set(&self, bundle: &str) {
        *self.bundle.lock().unwrap() = Ok(bundle.to_string());
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BundleSource for ScriptedSource {
    async fn fetch(&self, repo: &str, chart: &str, version: &str) -> Result<ArtifactHandle> {
        self.calls.lock().unwrap().fetches.push((repo.into(), chart.into(), version.into()));
        Ok(ArtifactHandle::new(chart, version, format!("/cache/{chart}")))
    }

    async fn render(&self, artifact: &ArtifactHandle, release: &str, values: &[ValuePair], namespace: &str) -> Result<String> {
        self.calls.lock().unwrap().renders.push((release.into(), values.to_vec(), namespace.into()));
        self.bundle.lock().unwrap().clone().map_err(|m| Error::render(&artifact.chart, m))
    }
}

pub fn engine(cluster: &FakeCluster, source: &ScriptedSource) -> Engine {
    Engine::new(Arc::new(cluster.clone()), Arc::new(source.clone()))
}

pub fn key() -> ObjectKey {
    ObjectKey::cluster("nginx")
}

/// Body of a live object owned by the test chart.
pub fn owned_body(name: &str) -> Json {
    json!({
        "metadata": {
            "name": name,
            "namespace": "default",
            "ownerReferences": [{ "apiVersion": "helm.helm.operator/v1", "kind": "Chart", "name": "nginx", "uid": UID }]
        }
    })
}
