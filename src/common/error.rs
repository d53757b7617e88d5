use std::fmt;

use thiserror::Error;

/// Errors surfaced by the box orchestrator.
#[derive(Error, Debug)]
pub enum BoxError {
    /// Building the component graph failed; `stage` names the step and
    /// the indexed/tagged component, e.g. `parse inbound[2]`.
    #[error("{stage}: {source:#}")]
    Construction {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    /// A lifecycle stage failed. The box has already been rolled back.
    #[error("{stage}: {source:#}")]
    Start {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("box already closed")]
    AlreadyClosed,

    #[error(transparent)]
    Close(#[from] CloseErrors),
}

impl BoxError {
    pub fn construction(stage: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        BoxError::Construction {
            stage: stage.into(),
            source: source.into(),
        }
    }

    pub fn start(stage: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        BoxError::Start {
            stage: stage.into(),
            source: source.into(),
        }
    }

    /// The stage label of a construction or start failure.
    pub fn stage(&self) -> Option<&str> {
        match self {
            BoxError::Construction { stage, .. } | BoxError::Start { stage, .. } => Some(stage),
            _ => None,
        }
    }

    pub fn is_already_closed(&self) -> bool {
        matches!(self, BoxError::AlreadyClosed)
    }
}

/// One subsystem that failed to close.
#[derive(Debug)]
pub struct CloseFailure {
    pub subsystem: String,
    pub source: anyhow::Error,
}

impl fmt::Display for CloseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.subsystem, self.source)
    }
}

/// Every close failure of a single teardown pass, in teardown order.
#[derive(Debug, Default)]
pub struct CloseErrors {
    failures: Vec<CloseFailure>,
}

impl CloseErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a close result into the aggregate, labelling failures with
    /// `subsystem`.
    pub fn append(&mut self, subsystem: impl FnOnce() -> String, result: anyhow::Result<()>) {
        if let Err(source) = result {
            self.failures.push(CloseFailure {
                subsystem: subsystem(),
                source,
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn failures(&self) -> &[CloseFailure] {
        &self.failures
    }

    pub fn subsystems(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.subsystem.as_str())
    }

    pub fn into_result(self) -> Result<(), CloseErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseErrors {}

/// Panic payload raised when closing a partially started box panics.
///
/// `origin` is the start error that triggered the rollback.
#[derive(Debug, Clone)]
pub struct RollbackFault {
    pub message: String,
    pub origin: String,
}

impl fmt::Display for RollbackFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic on early close: {} (origin error: {})", self.message, self.origin)
    }
}

impl RollbackFault {
    /// Extract a readable message from a caught panic payload.
    pub fn describe_payload(payload: &(dyn std::any::Any + Send)) -> String {
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else if let Some(fault) = payload.downcast_ref::<RollbackFault>() {
            fault.to_string()
        } else {
            "unknown panic".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_error_names_stage() {
        let err = BoxError::construction("parse inbound[3]", anyhow::anyhow!("bad listen"));
        assert_eq!(err.to_string(), "parse inbound[3]: bad listen");
        assert_eq!(err.stage(), Some("parse inbound[3]"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn close_errors_aggregate_in_order() {
        let mut errors = CloseErrors::new();
        errors.append(|| "close router".to_string(), Err(anyhow::anyhow!("r")));
        errors.append(|| "close inbound/direct[0]".to_string(), Ok(()));
        errors.append(|| "close log factory".to_string(), Err(anyhow::anyhow!("l")));
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors.subsystems().collect::<Vec<_>>(),
            vec!["close router", "close log factory"]
        );
        assert_eq!(errors.to_string(), "close router: r; close log factory: l");
        assert!(errors.into_result().is_err());
    }

    #[test]
    fn empty_close_errors_is_ok() {
        assert!(CloseErrors::new().into_result().is_ok());
    }

    #[test]
    fn describe_panic_payloads() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(RollbackFault::describe_payload(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(RollbackFault::describe_payload(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(RollbackFault::describe_payload(payload.as_ref()), "unknown panic");
    }
}
