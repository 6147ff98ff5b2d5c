//! Reconcile outcome classification.

/// Why a reconcile did not finish cleanly.
///
/// Handled failures are already surfaced on the object's status and wait for
/// a dependency change; unhandled ones go back on the queue with backoff.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{0}")]
    Handled(String),
    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

impl ReconcileError {
    pub fn handled(msg: impl std::fmt::Display) -> Self {
        ReconcileError::Handled(msg.to_string())
    }

    pub fn unhandled<E>(err: E, context: impl Into<String>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ReconcileError::Unhandled(anyhow::Error::new(err).context(context.into()))
    }

    pub fn is_unhandled(&self) -> bool {
        matches!(self, ReconcileError::Unhandled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carto_api::RepoError;

    #[test]
    fn unhandled_keeps_context_and_source() {
        let e = ReconcileError::unhandled(RepoError::Internal("boom".into()), "failed to get workload [ns/w]");
        assert!(e.is_unhandled());
        let ReconcileError::Unhandled(inner) = &e else { unreachable!() };
        assert_eq!(inner.to_string(), "failed to get workload [ns/w]");
        assert_eq!(format!("{inner:#}"), "failed to get workload [ns/w]: internal: boom");
        assert!(!ReconcileError::handled("x").is_unhandled());
    }
}
