//! Error types for cluster-forge
//!
//! Every orchestration stage wraps the error it receives with the stage name,
//! so the chain printed at the process boundary reads from the outermost
//! workflow step down to the failing tool invocation or API call.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for cluster-forge operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem or process I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Input that failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The infrastructure tool binary could not be located
    #[error("{tool} binary not found (searched: {searched})")]
    ToolNotFound {
        /// Binary name that was searched for
        tool: String,
        /// Locations that were searched, in order
        searched: String,
    },

    /// The infrastructure tool is present but its version is not supported
    #[error("unsupported tool version {found}: required {required}")]
    ToolVersion {
        /// Version reported by the tool
        found: String,
        /// Semantic-version requirement that was not met
        required: String,
    },

    /// One invocation of the infrastructure tool failed
    #[error("running '{args}' in {} failed: {message}{}", .dir.display(), log_hint(.log_path))]
    ToolFailed {
        /// Arguments the tool was invoked with
        args: String,
        /// Working directory of the invocation
        dir: PathBuf,
        /// Log file holding the full tool output, if one was written
        log_path: Option<PathBuf>,
        /// Description of what failed
        message: String,
    },

    /// Another invocation already holds the working directory
    #[error("another invocation is already running in {}", .dir.display())]
    DirectoryBusy {
        /// Contended working directory
        dir: PathBuf,
    },

    /// A bounded wait ran out of attempts
    #[error("{what} not ready after {attempts} attempts")]
    ReadinessTimeout {
        /// What was being waited for
        what: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// A release in the control-plane sequence failed
    #[error("release {release}: {message}")]
    Release {
        /// Release name
        release: String,
        /// Description of what failed
        message: String,
    },

    /// A workload in the rotation queue failed to restart or converge
    #[error("rotating {target}: {message}")]
    Rotation {
        /// Workload identifier (kind/namespace/name)
        target: String,
        /// Description of what failed
        message: String,
    },

    /// Operator interrupted the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Operator answered anything but "yes" to a question inside a step
    #[error("'{step}' was not confirmed")]
    Declined {
        /// Step that was waiting for the answer
        step: String,
    },

    /// Failure inside a named workflow stage
    #[error("{stage}: {source}")]
    Stage {
        /// Stage that failed
        stage: &'static str,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },
}

fn log_hint(log_path: &Option<PathBuf>) -> String {
    match log_path {
        Some(path) => format!(" (see {} for details)", path.display()),
        None => String::new(),
    }
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a release error for the named release
    pub fn release(release: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Release {
            release: release.into(),
            message: msg.into(),
        }
    }

    /// Attribute `source` to a release, unless it already names one or is an
    /// operator decision
    pub fn in_release(release: impl Into<String>, source: Error) -> Self {
        match source {
            Error::Release { .. } => source,
            e if e.is_cancelled() || e.is_declined() => e,
            e => Self::release(release, e.to_string()),
        }
    }

    /// Create a rotation error for the named workload
    pub fn rotation(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Rotation {
            target: target.into(),
            message: msg.into(),
        }
    }

    /// Create a declined-confirmation error for the named step
    pub fn declined(step: impl Into<String>) -> Self {
        Self::Declined { step: step.into() }
    }

    /// Wrap an error with the name of the stage it happened in
    pub fn stage(stage: &'static str, source: Error) -> Self {
        Self::Stage {
            stage,
            source: Box::new(source),
        }
    }

    /// True when the operator declined a confirmation, however deep it is wrapped
    pub fn is_declined(&self) -> bool {
        match self {
            Error::Declined { .. } => true,
            Error::Stage { source, .. } => source.is_declined(),
            _ => false,
        }
    }

    /// True when the error (or any error it wraps) is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Stage { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Extension trait attaching stage context to a `Result`.
pub trait StageContext<T> {
    /// Wrap the error, if any, with the given stage name.
    fn stage(self, stage: &'static str) -> crate::Result<T>;
}

impl<T> StageContext<T> for crate::Result<T> {
    fn stage(self, stage: &'static str) -> crate::Result<T> {
        self.map_err(|e| Error::stage(stage, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: what the operator sees when something breaks
    // ==========================================================================

    /// Story: a failed tool run points at the log file holding the details
    #[test]
    fn story_tool_failure_names_the_log_file() {
        let err = Error::ToolFailed {
            args: "apply -auto-approve".to_string(),
            dir: PathBuf::from("/work/assets"),
            log_path: Some(PathBuf::from("/work/assets/logs/4242.log")),
            message: "exit status: 1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("apply -auto-approve"));
        assert!(msg.contains("/work/assets"));
        assert!(msg.contains("see /work/assets/logs/4242.log"));
    }

    /// Story: a structured query failure has no log file to point at
    #[test]
    fn story_sync_failure_omits_log_hint() {
        let err = Error::ToolFailed {
            args: "output -json".to_string(),
            dir: PathBuf::from("/work"),
            log_path: None,
            message: "no state".to_string(),
        };
        assert!(!err.to_string().contains("see "));
    }

    /// Story: stage wrapping reads outermost first
    #[test]
    fn story_stage_context_wraps_from_the_outside_in() {
        let inner = Error::release("kube-apiserver", "upgrade failed: timed out");
        let err = Error::stage(
            "apply",
            Error::stage("upgrade control plane", inner),
        );
        assert_eq!(
            err.to_string(),
            "apply: upgrade control plane: release kube-apiserver: upgrade failed: timed out"
        );
    }

    /// Story: the stage extension trait keeps successes untouched
    #[test]
    fn story_stage_ext_only_touches_errors() {
        let ok: crate::Result<u8> = Ok(7);
        assert_eq!(ok.stage("verify").unwrap(), 7);

        let err: crate::Result<u8> = Err(Error::validation("bad"));
        let wrapped = err.stage("verify").unwrap_err();
        assert!(matches!(wrapped, Error::Stage { stage: "verify", .. }));
    }

    /// Story: cancellation is recognisable however deep it is wrapped
    #[test]
    fn story_cancellation_survives_wrapping() {
        let err = Error::stage("destroy", Error::stage("infrastructure", Error::Cancelled));
        assert!(err.is_cancelled());
        assert!(!Error::config("x").is_cancelled());
    }

    /// Story: a release failure is not attributed to its release twice
    #[test]
    fn story_release_errors_are_attributed_once() {
        let helm = Error::release("prometheus", "helm upgrade failed: timed out");
        assert_eq!(
            Error::in_release("prometheus", helm).to_string(),
            "release prometheus: helm upgrade failed: timed out"
        );

        let other = Error::config("chart is invalid");
        assert_eq!(
            Error::in_release("prometheus", other).to_string(),
            "release prometheus: configuration error: chart is invalid"
        );
        assert!(Error::in_release("prometheus", Error::Cancelled).is_cancelled());
    }

    /// Story: a declined step is neither a failure of the tool nor an interrupt
    #[test]
    fn story_declined_step_is_distinct_from_cancellation() {
        let err = Error::stage("apply infrastructure", Error::declined("create infrastructure"));
        assert!(err.is_declined());
        assert!(!err.is_cancelled());
        assert_eq!(
            err.to_string(),
            "apply infrastructure: 'create infrastructure' was not confirmed"
        );
        assert!(!Error::Cancelled.is_declined());
    }
}
