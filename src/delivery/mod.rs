pub mod direct;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::DeliveryRequest;

pub use direct::DirectDelivery;

/// Why a single delivery attempt failed. `Display` is the exact line the
/// client sees and the audit log records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("550 Bad email")]
    BadRecipient,

    #[error("550 Bad sender: {0}")]
    BadSender(String),

    #[error("550 Domain name failed: {0}")]
    Domain(String),

    #[error("550 {0}")]
    Lookup(String),

    #[error("{code} {detail}")]
    Rejected { code: String, detail: String },

    #[error("550 {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait DeliveryEngine: Send + Sync {
    /// One synchronous attempt, no retry.
    async fn send(&self, request: &DeliveryRequest) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

impl DeliveryOutcome {
    /// Text for the `result:` column of the audit log.
    pub fn describe(&self) -> &str {
        match self {
            DeliveryOutcome::Delivered => "Ok",
            DeliveryOutcome::Failed(reason) => reason,
        }
    }
}

pub async fn dispatch(engine: &dyn DeliveryEngine, request: &DeliveryRequest) -> DeliveryOutcome {
    match engine.send(request).await {
        Ok(()) => DeliveryOutcome::Delivered,
        Err(e) => DeliveryOutcome::Failed(e.to_string()),
    }
}
