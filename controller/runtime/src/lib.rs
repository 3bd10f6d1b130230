#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use tortoise_core as core;
pub use tortoise_k8s_api as k8s;

mod admission;
mod args;
mod controller;
mod conversion;
mod metrics;
mod retry;

pub use self::args::Args;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Core(#[from] core::Error),

    #[error("{kind} {namespace}/{name} not found")]
    MissingObject {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("Tortoise has no namespace")]
    MissingNamespace,

    #[error("failed to encode json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("finalizer failed: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl Error {
    /// Reason recorded on the `FailedToReconcile` condition.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Kube(_) => "KubernetesAPIError",
            Self::Core(e) => e.reason(),
            Self::MissingObject { .. } => "ObjectNotFound",
            Self::MissingNamespace => "MissingNamespace",
            Self::Json(_) => "EncodingFailed",
            Self::Finalizer(_) => "FinalizerFailed",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
