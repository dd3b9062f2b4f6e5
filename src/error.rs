//! Error taxonomy at the library seam.

use thiserror::Error;

/// Errors surfaced by [`crate::reconcile::Reconciler::apply`].
///
/// A rejected or failed reconfigure task is deliberately *not* an error
/// variant: once a change-set has been submitted an attempt was made, and
/// the outcome reports `changed: true, failed: true` instead.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Bad input combination; raised before any remote call is made.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// The selected virtual machine does not exist.
    #[error("no virtual machine matched {0}")]
    NotFound(String),

    /// Transport or protocol failure talking to the management API.
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}
