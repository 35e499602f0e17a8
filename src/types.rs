//! Core data types for upkeep
//!
//! This module defines all shared data structures used throughout the application.

use std::fmt;

/// What the user asked the launcher to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    Update,
    Upgrade,
    Setup,
    Restart,
}

impl Intent {
    pub fn all() -> &'static [Intent] {
        &[Intent::Update, Intent::Upgrade, Intent::Setup, Intent::Restart]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Update => "Update",
            Intent::Upgrade => "Upgrade",
            Intent::Setup => "Setup",
            Intent::Restart => "Restart",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Intent::Update => "Refresh package lists and install updates",
            Intent::Upgrade => "Upgrade to newer distribution version",
            Intent::Setup => "Install the base package set",
            Intent::Restart => "Restart the system",
        }
    }

    /// Update and Upgrade are the only intents that may be followed by an automatic restart
    pub fn allows_auto_restart(&self) -> bool {
        matches!(self, Intent::Update | Intent::Upgrade)
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::all().get(idx).copied()
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the running distribution, detected fresh for every run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistroIdentity {
    /// Lower-cased `ID` from os-release, or "unknown"
    pub name: String,
    /// `ID_LIKE` entries, in order
    pub like: Vec<String>,
    pub pretty_name: Option<String>,
    pub variant: Option<String>,
    pub is_image_based: bool,
    pub kernel: Option<String>,
}

impl DistroIdentity {
    pub const UNKNOWN: &'static str = "unknown";

    pub fn unknown() -> Self {
        Self::named(Self::UNKNOWN)
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            like: Vec::new(),
            pretty_name: None,
            variant: None,
            is_image_based: false,
            kernel: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.name == Self::UNKNOWN
    }

    /// Title-cased name for display ("fedora" -> "Fedora")
    pub fn title(&self) -> String {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

/// One external process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    pub program: String,
    pub args: Vec<String>,
    pub requires_privilege: bool,
    pub allow_failure: bool,
}

impl CommandStep {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            requires_privilege: false,
            allow_failure: false,
        }
    }

    pub fn privileged(mut self) -> Self {
        self.requires_privilege = true;
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Command line without any elevation prefix
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// How a resolved plan should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanPolicy {
    /// Run the steps
    Execute,
    /// No logic exists for this distribution/intent
    Unimplemented,
    /// The path needs a target version that was not supplied
    MissingTarget,
}

/// Ordered, resolved sequence of steps for one intent on one distribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub intent: Intent,
    pub policy: PlanPolicy,
    pub steps: Vec<CommandStep>,
}

impl Plan {
    pub fn execute(intent: Intent, steps: Vec<CommandStep>) -> Self {
        Self {
            intent,
            policy: PlanPolicy::Execute,
            steps,
        }
    }

    pub fn unimplemented(intent: Intent) -> Self {
        Self {
            intent,
            policy: PlanPolicy::Unimplemented,
            steps: Vec::new(),
        }
    }

    pub fn missing_target(intent: Intent) -> Self {
        Self {
            intent,
            policy: PlanPolicy::MissingTarget,
            steps: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Which pipe of the child a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn tag(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "out",
            OutputStream::Stderr => "err",
        }
    }
}

/// A single line of child output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub step: usize,
    pub stream: OutputStream,
    pub text: String,
}

/// Result of one executed step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub step_index: usize,
    /// 0 on success, -1 if the child was terminated by a signal, 127 if it never started
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub cancelled: bool,
    /// Lines the observer missed because it fell behind
    pub dropped_lines: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.cancelled
    }
}

/// Terminal result of one orchestrator run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
    Cancelled,
    Unimplemented,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "Complete",
            Outcome::Failure(_) => "Failed",
            Outcome::Cancelled => "Cancelled",
            Outcome::Unimplemented => "Not implemented",
        }
    }
}

/// Per-run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Detecting,
    Resolving,
    AwaitingInput,
    Executing,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "Idle",
            RunState::Detecting => "Detecting",
            RunState::Resolving => "Resolving",
            RunState::AwaitingInput => "Awaiting input",
            RunState::Executing => "Executing",
            RunState::Finalizing => "Finalizing",
            RunState::Completed => "Completed",
            RunState::Failed => "Failed",
            RunState::Cancelled => "Cancelled",
        }
    }

    /// Terminal state reached after finalizing the given outcome
    pub fn after(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success | Outcome::Unimplemented => RunState::Completed,
            Outcome::Failure(_) => RunState::Failed,
            Outcome::Cancelled => RunState::Cancelled,
        }
    }
}

/// Kind of target a version-targeted path needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Release number substituted into the current deployment ref
    DeploymentVersion,
    /// Channel name (e.g. nixos-24.05)
    Channel,
}

/// Question put to the user when a plan needs a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPrompt {
    pub kind: TargetKind,
    pub message: String,
    pub example: String,
}
