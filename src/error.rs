//! Error types for the detection pipeline.
//!
//! All public APIs use the [`Result<T>`] alias which wraps [`PipelineError`].
//! Errors are categorized by the kind of contract that was violated rather
//! than by the stage that raised them:
//!
//! - **Configuration** ([`Config`]): invalid or incomplete configuration,
//!   including a missing proposal source and loss-key collisions. User
//!   error, fixable, never retried internally.
//! - **Capability** ([`Capability`]): an execution path was requested that
//!   the configured refinement stage does not support (bounding-box output,
//!   graph export). Detected by probing before dispatch, never by invoking.
//! - **Inference** ([`Inference`]): a stage failed while running.
//! - **I/O** ([`Io`], [`Json`]): statistics snapshot export failed. The
//!   pipeline propagates these without retrying or falling back.
//!
//! [`Config`]: PipelineError::Config
//! [`Capability`]: PipelineError::Capability
//! [`Inference`]: PipelineError::Inference
//! [`Io`]: PipelineError::Io
//! [`Json`]: PipelineError::Json

use thiserror::Error;

/// Errors that can occur while orchestrating the detection pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid or incomplete configuration.
    ///
    /// Raised at construction time (e.g. a proposal stage configured without
    /// its test-config slice) or at call time (e.g. `train_step` with
    /// neither a proposal stage nor external proposals, mismatched sequence
    /// lengths fed to the size-statistics aggregator, loss-key collisions
    /// during merge).
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of what is invalid.
        reason: String,
    },

    /// The configured stage lacks a required capability.
    ///
    /// Checked via capability probes (`supports_bbox`,
    /// `supports_graph_export`) before dispatching to the stage.
    #[error("{stage} does not support {reason}")]
    Capability {
        /// Name of the concrete stage variant that lacks the capability.
        stage: String,
        /// The missing capability (e.g. "bounding-box output").
        reason: String,
    },

    /// A stage failed while executing.
    #[error("inference failed in {stage}: {source}")]
    Inference {
        /// Name of the stage that failed.
        stage: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Filesystem error during statistics snapshot export.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error during statistics snapshot export.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Shorthand for a [`PipelineError::Config`].
    #[inline]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`PipelineError::Capability`].
    #[inline]
    pub fn capability(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Capability {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this is a configuration error (user-fixable).
    #[inline]
    #[must_use = "this method returns a boolean, not modifying the error"]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Returns true if this is a missing-capability error.
    #[inline]
    #[must_use = "this method returns a boolean, not modifying the error"]
    pub const fn is_capability_error(&self) -> bool {
        matches!(self, Self::Capability { .. })
    }

    /// Returns true if this error occurred inside a stage.
    #[inline]
    #[must_use = "this method returns a boolean, not modifying the error"]
    pub const fn is_inference_error(&self) -> bool {
        matches!(self, Self::Inference { .. })
    }

    /// Returns true if this is a filesystem error.
    #[inline]
    #[must_use = "this method returns a boolean, not modifying the error"]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Type alias for `Result` with [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_and_probe() {
        let err = PipelineError::config("no proposal source");
        assert!(err.is_config_error());
        assert!(!err.is_capability_error());
        assert_eq!(err.to_string(), "invalid configuration: no proposal source");
    }

    #[test]
    fn capability_error_names_stage() {
        let err = PipelineError::capability("ActivationRoiHead", "graph export");
        assert!(err.is_capability_error());
        assert_eq!(
            err.to_string(),
            "ActivationRoiHead does not support graph export"
        );
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: PipelineError = io.into();
        assert!(err.is_io_error());
    }
}
