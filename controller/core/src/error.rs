use chrono::{DateTime, Utc};
use tortoise_k8s_api::{tortoise::conversion::ConversionError, ResourceName};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no {series} replica slot covers {at}")]
    NoSlot {
        series: &'static str,
        at: DateTime<Utc>,
    },

    #[error("no recommendation for {resource} of container {container}")]
    MissingRecommendation {
        container: String,
        resource: ResourceName,
    },

    #[error("invalid quantity {0:?}")]
    InvalidQuantity(String),

    #[error("unsupported scale target kind {0:?}")]
    UnsupportedTarget(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

impl Error {
    /// A short CamelCase reason suitable for conditions and events.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoSlot { .. } => "NoReplicaSlot",
            Self::MissingRecommendation { .. } => "MissingRecommendation",
            Self::InvalidQuantity(_) => "InvalidQuantity",
            Self::UnsupportedTarget(_) => "UnsupportedTarget",
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::Conversion(_) => "ConversionFailed",
        }
    }
}
