use async_trait::async_trait;
use serde_json::Value as Json;

use crate::{Chart, ObjectKey, Reference, ResourceDescriptor, Result};

/// Cluster capabilities the convergence engine is built against.
///
/// "Not found" is not an error here: lookups return `None`.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch the `Chart` instance for a dispatched key.
    async fn get_chart(&self, key: &ObjectKey) -> Result<Option<Chart>>;

    /// Fetch the live object behind a reference.
    async fn get(&self, reference: &Reference) -> Result<Option<Json>>;

    /// Create a rendered resource.
    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<()>;

    /// Delete the object behind a reference; an object already gone is success.
    async fn delete(&self, reference: &Reference) -> Result<()>;

    /// Write the instance (metadata/spec), returning the stored copy.
    async fn update(&self, chart: &Chart) -> Result<Chart>;

    /// Write the instance status subresource, returning the stored copy.
    async fn update_status(&self, chart: &Chart) -> Result<Chart>;
}
