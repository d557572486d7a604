use keelson_core::{Chart, ClusterApi, Error, Result};
use metrics::counter;
use tracing::warn;

/// The only durable write path of a pass. Every returned `Chart` carries the
/// stored state and must replace the caller's copy.
pub struct StatusReporter<'a> {
    cluster: &'a dyn ClusterApi,
}

impl<'a> StatusReporter<'a> {
    pub fn new(cluster: &'a dyn ClusterApi) -> Self { Self { cluster } }

    pub async fn update_status(&self, chart: &Chart) -> Result<Chart> {
        counter!("status_writes_total", 1u64);
        self.cluster.update_status(chart).await.map_err(|e| {
            counter!("status_write_err", 1u64);
            warn!(chart = %chart.key(), error = %e, "status write failed");
            Error::persist("status", e)
        })
    }

    pub async fn update(&self, chart: &Chart) -> Result<Chart> {
        self.cluster.update(chart).await.map_err(|e| {
            counter!("chart_write_err", 1u64);
            warn!(chart = %chart.key(), error = %e, "chart write failed");
            Error::persist("chart", e)
        })
    }
}
