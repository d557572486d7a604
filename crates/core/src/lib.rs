//! Keelson core types: the `Chart` resource, owned references, rendered
//! descriptors and the capability interface the engine is built against.

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod cluster;
mod error;
pub mod tracker;

pub use cluster::ClusterApi;
pub use error::{Error, Result};

/// Finalizer the engine places on every `Chart` it has started converging.
pub const FINALIZER: &str = "helm.helm.operator/finalizer";

/// Marker put on every created resource so the garbage collector removes its
/// dependents before the resource itself.
pub const CASCADE_FINALIZER: &str = "foregroundDeletion";

pub const DEFAULT_REPO: &str = "stable";
pub const DEFAULT_NAMESPACE: &str = "default";

/// A single `--set name=value` pair handed to the renderer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ValuePair {
    pub name: String,
    pub value: String,
}

impl ValuePair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Desired state of a chart release.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "helm.helm.operator",
    version = "v1",
    kind = "Chart",
    plural = "charts",
    status = "ChartStatus",
    printcolumn = r#"{"name":"Chart","type":"string","jsonPath":".spec.chart"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    /// Chart name inside the repository.
    pub chart: String,
    /// Repository alias; `stable` when empty.
    #[serde(default)]
    pub repo: String,
    /// Pinned chart version; latest when empty.
    #[serde(default)]
    pub version: String,
    /// Namespace every rendered resource is forced into.
    #[serde(default)]
    pub namespace_selector: String,
    #[serde(default)]
    pub values: Vec<ValuePair>,
}

/// Lifecycle marker persisted in `status.status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ReleasePhase {
    #[default]
    #[serde(rename = "")]
    Pending,
    Deployed,
    Failed,
}

impl fmt::Display for ReleasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleasePhase::Pending => f.write_str("Pending"),
            ReleasePhase::Deployed => f.write_str("Deployed"),
            ReleasePhase::Failed => f.write_str("Failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChartStatus {
    #[serde(default)]
    pub status: ReleasePhase,
    /// Resources created for this release, unique by reference tuple.
    #[serde(default)]
    pub resource: Vec<Reference>,
}

impl ChartSpec {
    /// Repository alias, or `default` when the chart leaves it empty.
    pub fn repo_or<'a>(&'a self, default: &'a str) -> &'a str {
        if self.repo.is_empty() { default } else { &self.repo }
    }

    pub fn namespace(&self) -> &str {
        if self.namespace_selector.is_empty() { DEFAULT_NAMESPACE } else { &self.namespace_selector }
    }
}

impl Chart {
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone().unwrap_or_default(),
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, marker: &str) -> bool {
        self.metadata.finalizers.as_ref().is_some_and(|f| f.iter().any(|m| m == marker))
    }

    /// Returns true when the marker was not present before.
    pub fn add_finalizer(&mut self, marker: &str) -> bool {
        if self.has_finalizer(marker) {
            return false;
        }
        self.metadata.finalizers.get_or_insert_with(Vec::new).push(marker.to_string());
        true
    }

    pub fn remove_finalizer(&mut self, marker: &str) -> bool {
        let Some(list) = self.metadata.finalizers.as_mut() else { return false };
        let before = list.len();
        list.retain(|m| m != marker);
        before != list.len()
    }

    pub fn phase(&self) -> ReleasePhase {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    pub fn owned(&self) -> &[Reference] {
        self.status.as_ref().map(|s| s.resource.as_slice()).unwrap_or(&[])
    }

    pub fn status_mut(&mut self) -> &mut ChartStatus {
        self.status.get_or_insert_with(ChartStatus::default)
    }

    /// Controller owner reference pointing back at this chart.
    pub fn owner_reference(&self) -> Result<OwnerReference> {
        self.controller_owner_ref(&())
            .ok_or_else(|| Error::invalid(format!("chart {} has no metadata.uid", self.key())))
    }
}

/// Identity of a `Chart` as delivered by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Identity of a resource owned by a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub kind: String,
    pub api_version: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl Reference {
    pub fn new(kind: &str, api_version: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            api_version: api_version.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {} {}", self.kind, self.api_version, self.name)
        } else {
            write!(f, "{} {} {}/{}", self.kind, self.api_version, self.namespace, self.name)
        }
    }
}

/// Splits `apiVersion` into `(group, version)`; the core group is empty.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// One rendered resource. The body is the full decoded document and is handed
/// to the cluster untouched apart from the metadata edits below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub kind: String,
    pub api_version: String,
    pub namespace: Option<String>,
    pub name: String,
    pub body: Json,
}

impl ResourceDescriptor {
    pub fn reference(&self) -> Result<Reference> {
        if self.kind.is_empty() || self.api_version.is_empty() || self.name.is_empty() {
            return Err(Error::reference(format!(
                "descriptor lacks identity (kind={:?} apiVersion={:?} name={:?})",
                self.kind, self.api_version, self.name
            )));
        }
        Ok(Reference {
            kind: self.kind.clone(),
            api_version: self.api_version.clone(),
            namespace: self.namespace.clone().unwrap_or_default(),
            name: self.name.clone(),
        })
    }

    fn metadata_mut(&mut self) -> Option<&mut serde_json::Map<String, Json>> {
        if !self.body.is_object() {
            self.body = Json::Object(serde_json::Map::new());
        }
        let meta = &mut self.body["metadata"];
        if !meta.is_object() {
            *meta = Json::Object(serde_json::Map::new());
        }
        meta.as_object_mut()
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.namespace = Some(namespace.to_string());
        if let Some(meta) = self.metadata_mut() {
            meta.insert("namespace".into(), Json::String(namespace.to_string()));
        }
    }

    /// Installs `owner` as the controller reference. A previous entry for the
    /// same uid is replaced; references to other owners are kept.
    pub fn set_owner(&mut self, owner: &OwnerReference) -> Result<()> {
        let owner_json = serde_json::to_value(owner)?;
        let Some(meta) = self.metadata_mut() else { return Ok(()) };
        let refs = meta.entry("ownerReferences").or_insert_with(|| Json::Array(Vec::new()));
        if !refs.is_array() {
            *refs = Json::Array(Vec::new());
        }
        if let Json::Array(list) = refs {
            list.retain(|r| r.get("uid").and_then(|u| u.as_str()) != Some(owner.uid.as_str()));
            list.push(owner_json);
        }
        Ok(())
    }

    pub fn add_finalizer(&mut self, marker: &str) {
        let Some(meta) = self.metadata_mut() else { return };
        let list = meta.entry("finalizers").or_insert_with(|| Json::Array(Vec::new()));
        if !list.is_array() {
            *list = Json::Array(Vec::new());
        }
        if let Json::Array(items) = list {
            if !items.iter().any(|v| v.as_str() == Some(marker)) {
                items.push(Json::String(marker.to_string()));
            }
        }
    }
}

/// True when a raw object's `metadata.ownerReferences` names `uid`.
pub fn owned_by(raw: &Json, uid: &str) -> bool {
    raw.get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(|r| r.as_array())
        .is_some_and(|refs| refs.iter().any(|r| r.get("uid").and_then(|u| u.as_str()) == Some(uid)))
}

/// Result of one convergence pass, consumed by the dispatch loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub requeue: bool,
}

impl Outcome {
    pub fn done() -> Self { Self { requeue: false } }
}

pub mod prelude {
    pub use super::{
        Chart, ChartSpec, ChartStatus, ClusterApi, Error, ObjectKey, Outcome, Reference, ReleasePhase,
        ResourceDescriptor, ValuePair,
    };
}
