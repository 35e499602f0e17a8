//! Progress notification interface
//!
//! The orchestrator never knows how results are displayed. Front ends
//! (the CLI menu, the TUI) implement [`Observer`] to receive output and to
//! answer the questions a run may need to ask.

use crate::types::{CommandStep, ExecutionResult, Intent, Outcome, OutputLine, RunState, TargetPrompt};
use async_trait::async_trait;

#[async_trait]
pub trait Observer: Send + Sync {
    /// A line of child output. Called from the output drain task; must not block.
    fn on_output(&self, line: &OutputLine);

    /// Free-form progress message
    fn on_status(&self, message: &str);

    fn on_step_started(&self, index: usize, step: &CommandStep);

    fn on_step_finished(&self, _result: &ExecutionResult) {}

    fn on_state(&self, _state: RunState) {}

    /// Target version for a version-targeted path; `None` skips the run
    async fn ask_target_version(&self, prompt: &TargetPrompt) -> Option<String>;

    async fn ask_yes_no(&self, question: &str) -> bool;

    fn on_outcome(&self, intent: Intent, outcome: &Outcome);
}
