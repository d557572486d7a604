//! Error taxonomy for a convergence pass.
//!
//! Nothing here is fatal to the process: every variant ends the current pass and
//! the dispatch loop retries the key with backoff.

use crate::Reference;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Chart artifact could not be materialized
    #[error("fetch chart {chart}: {message}")]
    FetchArtifact { chart: String, message: String },

    /// Templating tool failed
    #[error("render chart {chart}: {message}")]
    Render { chart: String, message: String },

    /// get/create/delete of an owned resource failed
    #[error("apply {reference}: {source}")]
    Apply {
        reference: Reference,
        #[source]
        source: Box<Error>,
    },

    /// A canonical reference could not be computed for a descriptor
    #[error("reference error: {0}")]
    Reference(String),

    /// Status or instance write failed
    #[error("persist {what}: {source}")]
    Persist {
        what: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// A bundle document could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The instance lacks identity the engine relies on
    #[error("invalid chart: {0}")]
    Invalid(String),

    /// Free-form failure reported by a collaborator
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn fetch(chart: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FetchArtifact { chart: chart.into(), message: message.into() }
    }

    pub fn render(chart: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Render { chart: chart.into(), message: message.into() }
    }

    pub fn apply(reference: &Reference, source: Error) -> Self {
        Self::Apply { reference: reference.clone(), source: Box::new(source) }
    }

    pub fn persist(what: &'static str, source: Error) -> Self {
        Self::Persist { what, source: Box::new(source) }
    }

    pub fn reference(msg: impl Into<String>) -> Self {
        Self::Reference(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// True for an API 404, looking through `Apply`/`Persist` wrappers.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            Error::Apply { source, .. } | Error::Persist { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::FetchArtifact { .. } => "fetch",
            Error::Render { .. } => "render",
            Error::Apply { .. } => "apply",
            Error::Reference(_) => "reference",
            Error::Persist { .. } => "persist",
            Error::Decode(_) => "decode",
            Error::Serialization(_) => "serialization",
            Error::Invalid(_) => "invalid",
            Error::Other(_) => "other",
        }
    }
}
