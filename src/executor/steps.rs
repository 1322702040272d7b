//! Ordered multi-step execution

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Runs before a step's tool invocation; an error aborts the sequence.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StepHook: Send + Sync {
    /// Called with the description of the step about to run
    async fn before(&self, step: &str) -> Result<()>;
}

/// One named step: tool arguments plus an optional pre-execution hook.
#[derive(Clone)]
pub struct ExecutionStep {
    /// Human-readable description, logged when the step starts
    pub description: String,
    /// Arguments passed to the tool
    pub args: Vec<String>,
    /// Runs before the tool is invoked
    pub pre_execution_hook: Option<Arc<dyn StepHook>>,
}

impl ExecutionStep {
    /// Create a step without a hook
    pub fn new<I, S>(description: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            description: description.into(),
            args: args.into_iter().map(Into::into).collect(),
            pre_execution_hook: None,
        }
    }

    /// Attach a pre-execution hook
    pub fn with_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        self.pre_execution_hook = Some(hook);
        self
    }
}

impl fmt::Debug for ExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStep")
            .field("description", &self.description)
            .field("args", &self.args)
            .field("pre_execution_hook", &self.pre_execution_hook.is_some())
            .finish()
    }
}
