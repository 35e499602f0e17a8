//! Maintenance run sequencing
//!
//! One run goes `Idle -> Detecting -> Resolving -> (AwaitingInput)? ->
//! Executing -> Finalizing -> {Completed, Failed, Cancelled}`. Only one run
//! may be in flight per orchestrator; a second request is rejected, never
//! queued. A successful Update/Upgrade may be followed by a separate Restart
//! run under the same guard.

use crate::action_log::{ActionLog, ActionStatus, FileActionLog};
use crate::config::Config;
use crate::observer::Observer;
use crate::system::ostree::{fallback_ref, next_ref};
use crate::system::{
    describe, CommandStrategy, DistroProbe, DistroTable, Executor, ExecutorOptions, RefResolver,
    RpmOstreeStatus, StdinMode,
};
use crate::types::{DistroIdentity, Intent, Outcome, Plan, PlanPolicy, RunState, TargetKind};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("another maintenance run is already in progress")]
    Busy,
}

/// Whether a successful Update/Upgrade is followed by a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    Never,
    Always,
    /// Ask the observer while resolving
    Ask,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub auto_restart: RestartPolicy,
    /// Pre-supplied answer for version-targeted paths
    pub target_version: Option<String>,
    /// Ask before an explicit Restart
    pub confirm_restart: bool,
}

pub struct Orchestrator {
    probe: DistroProbe,
    strategy: Arc<dyn CommandStrategy>,
    refs: RefResolver,
    executor: Executor,
    log: Arc<dyn ActionLog>,
    busy: AtomicBool,
    state: Mutex<RunState>,
}

/// Clears the busy flag however the run ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Orchestrator {
    pub fn new(
        probe: DistroProbe,
        strategy: Arc<dyn CommandStrategy>,
        refs: RefResolver,
        executor: Executor,
        log: Arc<dyn ActionLog>,
    ) -> Self {
        Self {
            probe,
            strategy,
            refs,
            executor,
            log,
            busy: AtomicBool::new(false),
            state: Mutex::new(RunState::Idle),
        }
    }

    /// Orchestrator wired to the live system
    pub fn from_config(config: &Config, stdin: StdinMode, dry_run: bool) -> Result<Self> {
        let log = FileActionLog::new(config.state_dir()?);
        Ok(Self::new(
            DistroProbe::default(),
            Arc::new(DistroTable::new(config.setup.packages.clone())),
            RefResolver::new(Arc::new(RpmOstreeStatus)),
            Executor::new(ExecutorOptions::from_config(&config.execution, stdin, dry_run)),
            Arc::new(log),
        ))
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Fresh detection for display; runs detect again on their own
    pub fn detect(&self) -> DistroIdentity {
        self.probe.detect()
    }

    pub fn action_log(&self) -> &Arc<dyn ActionLog> {
        &self.log
    }

    /// Run an intent to its outcome
    ///
    /// Domain failures come back as [`Outcome`] values; the only error is
    /// [`OrchestratorError::Busy`]. The returned outcome is the requested
    /// intent's; a follow-up restart reports through `on_outcome` only.
    pub async fn run(
        &self,
        intent: Intent,
        observer: &Arc<dyn Observer>,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<Outcome, OrchestratorError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(intent = %intent, "run rejected, another run is in progress");
            return Err(OrchestratorError::Busy);
        }
        let _guard = RunGuard(&self.busy);

        let (outcome, restart) = self.run_once(intent, observer, &options, cancel).await;

        if restart && outcome.is_success() && intent.allows_auto_restart() && !cancel.is_cancelled() {
            info!(intent = %intent, "following up with restart");
            observer.on_status("Restarting system");
            let restart_options = RunOptions {
                confirm_restart: false,
                ..RunOptions::default()
            };
            self.run_once(Intent::Restart, observer, &restart_options, cancel)
                .await;
        }

        Ok(outcome)
    }

    /// One full pass through the state machine; returns the outcome and
    /// whether a restart was requested
    async fn run_once(
        &self,
        intent: Intent,
        observer: &Arc<dyn Observer>,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> (Outcome, bool) {
        self.set_state(RunState::Detecting, observer);
        let identity = self.probe.detect();
        info!(
            intent = %intent,
            distro = %identity.name,
            image_based = identity.is_image_based,
            "starting run"
        );
        observer.on_status(&format!("Detected {}", describe(&identity)));

        self.set_state(RunState::Resolving, observer);
        self.record(intent, ActionStatus::Start, None);

        let (outcome, restart) = match self.resolve_plan(intent, &identity, observer, options).await {
            Ok((plan, restart)) => {
                self.set_state(RunState::Executing, observer);
                let report = self.executor.run(&plan, observer, cancel).await;
                debug!(steps = report.results.len(), "plan finished");
                (report.outcome, restart)
            }
            Err(outcome) => (outcome, false),
        };

        self.set_state(RunState::Finalizing, observer);
        match &outcome {
            Outcome::Success => self.record(intent, ActionStatus::Success, None),
            other => self.record(intent, ActionStatus::Error, Some(&failure_detail(other))),
        }

        info!(intent = %intent, outcome = outcome.label(), "run finished");
        self.set_state(RunState::after(&outcome), observer);
        observer.on_outcome(intent, &outcome);

        (outcome, restart)
    }

    /// Everything between detection and execution, including the prompts
    ///
    /// `Err` carries a terminal outcome reached without running anything.
    async fn resolve_plan(
        &self,
        intent: Intent,
        identity: &DistroIdentity,
        observer: &Arc<dyn Observer>,
        options: &RunOptions,
    ) -> Result<(Plan, bool), Outcome> {
        if intent == Intent::Restart
            && options.confirm_restart
            && !observer
                .ask_yes_no("Are you sure you want to restart the system?")
                .await
        {
            observer.on_status("Restart cancelled");
            return Err(Outcome::Cancelled);
        }

        let target = match self.strategy.target_prompt(identity, intent) {
            None => None,
            Some(prompt) => {
                let answer = match &options.target_version {
                    Some(version) => Some(version.clone()),
                    None => {
                        self.set_state(RunState::AwaitingInput, observer);
                        let answer = observer.ask_target_version(&prompt).await;
                        self.set_state(RunState::Resolving, observer);
                        answer
                    }
                };

                let version = match answer.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()) {
                    Some(version) => version,
                    None => {
                        observer.on_status("No target entered, nothing to do");
                        return Err(Outcome::Cancelled);
                    }
                };

                Some(match prompt.kind {
                    TargetKind::DeploymentVersion => self.rebase_ref(identity, &version, observer).await,
                    TargetKind::Channel => version,
                })
            }
        };

        let plan = self.strategy.resolve(identity, intent, target.as_deref());
        match plan.policy {
            PlanPolicy::Execute => {}
            PlanPolicy::Unimplemented => {
                observer.on_status(&format!(
                    "{} is not implemented for {}",
                    intent,
                    describe(identity)
                ));
                return Err(Outcome::Unimplemented);
            }
            PlanPolicy::MissingTarget => return Err(Outcome::Cancelled),
        }

        let restart = intent.allows_auto_restart()
            && match options.auto_restart {
                RestartPolicy::Never => false,
                RestartPolicy::Always => true,
                RestartPolicy::Ask => {
                    observer
                        .ask_yes_no(&format!(
                            "Restart the system after the {} completes?",
                            intent.as_str().to_lowercase()
                        ))
                        .await
                }
            };

        Ok((plan, restart))
    }

    /// Full ref for an rpm-ostree rebase to `version`
    async fn rebase_ref(&self, identity: &DistroIdentity, version: &str, observer: &Arc<dyn Observer>) -> String {
        match self.refs.current_ref().await {
            Ok(current) => {
                let reference = next_ref(&current, version);
                observer.on_status(&format!("Rebasing {} -> {}", current, reference));
                reference
            }
            Err(e) => {
                warn!(error = %e, "could not read current deployment, using template ref");
                let reference = fallback_ref(identity, version);
                observer.on_status(&format!(
                    "Could not read current deployment ({}), using {}",
                    e, reference
                ));
                reference
            }
        }
    }

    fn set_state(&self, state: RunState, observer: &Arc<dyn Observer>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        debug!(state = state.as_str(), "state changed");
        observer.on_state(state);
    }

    fn record(&self, intent: Intent, status: ActionStatus, detail: Option<&str>) {
        if let Err(e) = self.log.record(intent.as_str(), status, detail) {
            warn!(error = %e, "failed to write action log");
        }
    }
}

fn failure_detail(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Failure(detail) => detail.clone(),
        Outcome::Cancelled => "cancelled".to_string(),
        Outcome::Unimplemented => "not implemented for this distribution".to_string(),
        Outcome::Success => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_log::testing::MemoryActionLog;
    use crate::observer::testing::{Event, RecordingObserver};
    use crate::system::ostree::tests::{status_with_origin, FakeStatus};
    use crate::types::{CommandStep, TargetPrompt};
    use std::fs;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    /// Fixed steps for every intent; Restart gets its own harmless step
    struct ScriptedStrategy {
        steps: Vec<CommandStep>,
    }

    impl CommandStrategy for ScriptedStrategy {
        fn target_prompt(&self, _identity: &DistroIdentity, _intent: Intent) -> Option<TargetPrompt> {
            None
        }

        fn resolve(&self, _identity: &DistroIdentity, intent: Intent, _target: Option<&str>) -> Plan {
            match intent {
                Intent::Restart => Plan::execute(intent, vec![sh("echo rebooting")]),
                _ => Plan::execute(intent, self.steps.clone()),
            }
        }
    }

    fn sh(script: &str) -> CommandStep {
        CommandStep::new("sh", &["-c", script])
    }

    fn probe(dir: &TempDir, os_release: &str, image_based: bool) -> DistroProbe {
        let os_path = dir.path().join("os-release");
        let marker = dir.path().join("rpm-ostree");
        fs::write(&os_path, os_release).unwrap();
        if image_based {
            fs::write(&marker, "").unwrap();
        }
        DistroProbe::with_paths(
            vec![os_path],
            dir.path().join("lsb-release"),
            vec![marker],
            dir.path().join("osrelease"),
        )
    }

    struct Harness {
        orchestrator: Orchestrator,
        log: Arc<MemoryActionLog>,
    }

    fn harness(probe: DistroProbe, strategy: Arc<dyn CommandStrategy>, status: FakeStatus, dry_run: bool) -> Harness {
        let log = Arc::new(MemoryActionLog::default());
        let executor = Executor::new(ExecutorOptions {
            terminate_grace: Duration::from_secs(2),
            dry_run,
            ..ExecutorOptions::default()
        });
        let orchestrator = Orchestrator::new(
            probe,
            strategy,
            RefResolver::new(Arc::new(status)),
            executor,
            log.clone(),
        );
        Harness { orchestrator, log }
    }

    fn scripted(dir: &TempDir, steps: Vec<CommandStep>) -> Harness {
        harness(
            probe(dir, "ID=arch\n", false),
            Arc::new(ScriptedStrategy { steps }),
            FakeStatus(Err("unused".into())),
            false,
        )
    }

    async fn run(
        orchestrator: &Orchestrator,
        intent: Intent,
        observer: &Arc<RecordingObserver>,
        options: RunOptions,
    ) -> Outcome {
        let dyn_observer: Arc<dyn Observer> = observer.clone();
        orchestrator
            .run(intent, &dyn_observer, options, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_distro_is_unimplemented() {
        let dir = TempDir::new().unwrap();
        let h = harness(
            probe(&dir, "ID=gentoo\n", false),
            Arc::new(DistroTable::default()),
            FakeStatus(Err("unused".into())),
            false,
        );
        let observer = Arc::new(RecordingObserver::default());

        let outcome = run(&h.orchestrator, Intent::Update, &observer, RunOptions::default()).await;

        assert_eq!(outcome, Outcome::Unimplemented);
        assert_eq!(h.orchestrator.state(), RunState::Completed);
        assert_eq!(observer.started_steps(), 0);

        let entries = h.log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, ActionStatus::Start);
        assert_eq!(entries[1].1, ActionStatus::Error);
    }

    #[tokio::test]
    async fn test_state_sequence_and_log() {
        let dir = TempDir::new().unwrap();
        let h = scripted(&dir, vec![sh("echo hello")]);
        let observer = Arc::new(RecordingObserver::default());

        let outcome = run(&h.orchestrator, Intent::Setup, &observer, RunOptions::default()).await;
        assert_eq!(outcome, Outcome::Success);

        let states: Vec<RunState> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::State(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                RunState::Detecting,
                RunState::Resolving,
                RunState::Executing,
                RunState::Finalizing,
                RunState::Completed,
            ]
        );

        let statuses: Vec<ActionStatus> = h.log.entries().into_iter().map(|e| e.1).collect();
        assert_eq!(statuses, vec![ActionStatus::Start, ActionStatus::Success]);
        assert_eq!(h.log.last_action().as_deref(), Some("Setup"));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_with_detail() {
        let dir = TempDir::new().unwrap();
        let h = scripted(&dir, vec![sh("echo one"), sh("echo nope >&2; exit 2"), sh("echo three")]);
        let observer = Arc::new(RecordingObserver::default());

        let outcome = run(&h.orchestrator, Intent::Update, &observer, RunOptions::default()).await;

        assert!(matches!(outcome, Outcome::Failure(_)));
        assert_eq!(observer.started_steps(), 2);
        assert_eq!(h.orchestrator.state(), RunState::Failed);
        let last = h.log.entries().pop().unwrap();
        assert_eq!(last.1, ActionStatus::Error);
        assert!(last.2.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_auto_restart_follows_success() {
        let dir = TempDir::new().unwrap();
        let h = scripted(&dir, vec![sh("echo updating")]);
        let observer = Arc::new(RecordingObserver::default());

        let options = RunOptions {
            auto_restart: RestartPolicy::Always,
            confirm_restart: true,
            ..RunOptions::default()
        };
        let outcome = run(&h.orchestrator, Intent::Update, &observer, options).await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(
            observer.outcomes(),
            vec![
                (Intent::Update, Outcome::Success),
                (Intent::Restart, Outcome::Success),
            ]
        );
        // The restart run starts only after the update outcome was reported
        let events = observer.events();
        let update_done = events
            .iter()
            .position(|e| *e == Event::Outcome(Intent::Update, Outcome::Success))
            .unwrap();
        let restart_started = events
            .iter()
            .rposition(|e| *e == Event::StepStarted(0))
            .unwrap();
        assert!(update_done < restart_started);
        // No confirmation for the follow-up restart
        assert!(!events.iter().any(|e| matches!(e, Event::AskedYesNo(_))));

        let actions: Vec<String> = h.log.entries().into_iter().map(|e| e.0).collect();
        assert_eq!(actions, vec!["Update", "Update", "Restart", "Restart"]);
    }

    #[tokio::test]
    async fn test_no_restart_after_failure() {
        let dir = TempDir::new().unwrap();
        let h = scripted(&dir, vec![sh("exit 1")]);
        let observer = Arc::new(RecordingObserver::default());

        let options = RunOptions {
            auto_restart: RestartPolicy::Always,
            ..RunOptions::default()
        };
        run(&h.orchestrator, Intent::Upgrade, &observer, options).await;

        let outcomes = observer.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, Intent::Upgrade);
    }

    #[tokio::test]
    async fn test_no_restart_for_setup() {
        let dir = TempDir::new().unwrap();
        let h = scripted(&dir, vec![sh("true")]);
        let observer = Arc::new(RecordingObserver::default());

        let options = RunOptions {
            auto_restart: RestartPolicy::Always,
            ..RunOptions::default()
        };
        run(&h.orchestrator, Intent::Setup, &observer, options).await;

        assert_eq!(observer.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_question_declined() {
        let dir = TempDir::new().unwrap();
        let h = scripted(&dir, vec![sh("true")]);
        let observer = Arc::new(RecordingObserver {
            yes_no_answer: false,
            ..Default::default()
        });

        let options = RunOptions {
            auto_restart: RestartPolicy::Ask,
            ..RunOptions::default()
        };
        let outcome = run(&h.orchestrator, Intent::Update, &observer, options).await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(observer.outcomes().len(), 1);
        assert!(observer
            .events()
            .iter()
            .any(|e| matches!(e, Event::AskedYesNo(q) if q.contains("update"))));
    }

    #[tokio::test]
    async fn test_restart_confirmation_declined() {
        let dir = TempDir::new().unwrap();
        let h = scripted(&dir, vec![]);
        let observer = Arc::new(RecordingObserver::default());

        let options = RunOptions {
            confirm_restart: true,
            ..RunOptions::default()
        };
        let outcome = run(&h.orchestrator, Intent::Restart, &observer, options).await;

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(observer.started_steps(), 0);
        assert_eq!(h.orchestrator.state(), RunState::Cancelled);
    }

    #[tokio::test]
    async fn test_rebase_uses_current_deployment() {
        let dir = TempDir::new().unwrap();
        let h = harness(
            probe(&dir, "ID=fedora\nVARIANT_ID=silverblue\n", true),
            Arc::new(DistroTable::default()),
            FakeStatus(Ok(status_with_origin("fedora:fedora/40/x86_64/silverblue"))),
            true,
        );
        let observer = Arc::new(RecordingObserver {
            target_answer: Some(" 42 ".into()),
            ..Default::default()
        });

        let outcome = run(&h.orchestrator, Intent::Upgrade, &observer, RunOptions::default()).await;

        assert_eq!(outcome, Outcome::Success);
        let events = observer.events();
        assert!(events.contains(&Event::State(RunState::AwaitingInput)));
        assert!(events.contains(&Event::AskedTarget));
        assert!(observer
            .output()
            .contains(&"Dry run: would execute rpm-ostree rebase fedora:fedora/42/x86_64/silverblue".to_string()));
    }

    #[tokio::test]
    async fn test_rebase_falls_back_to_template_ref() {
        let dir = TempDir::new().unwrap();
        let h = harness(
            probe(&dir, "ID=fedora\nVARIANT_ID=kinoite\n", true),
            Arc::new(DistroTable::default()),
            FakeStatus(Err("daemon not running".into())),
            true,
        );
        let observer = Arc::new(RecordingObserver::default());

        let options = RunOptions {
            target_version: Some("42".into()),
            ..RunOptions::default()
        };
        let outcome = run(&h.orchestrator, Intent::Upgrade, &observer, options).await;

        assert_eq!(outcome, Outcome::Success);
        // Pre-supplied target: no prompt
        assert!(!observer.events().contains(&Event::AskedTarget));
        let expected = format!(
            "Dry run: would execute rpm-ostree rebase fedora:fedora/42/{}/kinoite",
            std::env::consts::ARCH
        );
        assert!(observer.output().contains(&expected));
    }

    #[tokio::test]
    async fn test_blank_target_cancels() {
        let dir = TempDir::new().unwrap();
        let h = harness(
            probe(&dir, "ID=nixos\n", false),
            Arc::new(DistroTable::default()),
            FakeStatus(Err("unused".into())),
            false,
        );
        let observer = Arc::new(RecordingObserver {
            target_answer: Some("   ".into()),
            ..Default::default()
        });

        let outcome = run(&h.orchestrator, Intent::Upgrade, &observer, RunOptions::default()).await;

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(observer.started_steps(), 0);
        assert_eq!(h.orchestrator.state(), RunState::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_run_rejected_while_executing() {
        let dir = TempDir::new().unwrap();
        let h = scripted(&dir, vec![CommandStep::new("sleep", &["30"])]);
        let orchestrator = Arc::new(h.orchestrator);
        let cancel = CancellationToken::new();

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            let cancel = cancel.clone();
            let observer: Arc<dyn Observer> = Arc::new(RecordingObserver::default());
            tokio::spawn(async move {
                orchestrator
                    .run(Intent::Update, &observer, RunOptions::default(), &cancel)
                    .await
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while orchestrator.state() != RunState::Executing {
            assert!(Instant::now() < deadline, "first run never started executing");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let second = Arc::new(RecordingObserver::default());
        let second_dyn: Arc<dyn Observer> = second.clone();
        let rejected = orchestrator
            .run(Intent::Setup, &second_dyn, RunOptions::default(), &CancellationToken::new())
            .await;
        assert!(matches!(rejected, Err(OrchestratorError::Busy)));
        assert!(second.events().is_empty());

        cancel.cancel();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(!orchestrator.is_busy());
    }

    /// Log whose storage is gone
    struct UnwritableLog;

    impl ActionLog for UnwritableLog {
        fn record(&self, _action: &str, _status: ActionStatus, _detail: Option<&str>) -> Result<()> {
            Err(anyhow::anyhow!("No space left on device"))
        }

        fn last_action(&self) -> Option<String> {
            None
        }

        fn recent(&self, _count: usize) -> Result<Vec<String>> {
            Err(anyhow::anyhow!("No space left on device"))
        }
    }

    #[tokio::test]
    async fn test_action_log_failures_do_not_fail_the_run() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(
            probe(&dir, "ID=arch\n", false),
            Arc::new(ScriptedStrategy {
                steps: vec![sh("echo hello")],
            }),
            RefResolver::new(Arc::new(FakeStatus(Err("unused".into())))),
            Executor::new(ExecutorOptions::default()),
            Arc::new(UnwritableLog),
        );
        let observer = Arc::new(RecordingObserver::default());

        let outcome = run(&orchestrator, Intent::Update, &observer, RunOptions::default()).await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(orchestrator.state(), RunState::Completed);
        assert_eq!(observer.outcomes(), vec![(Intent::Update, Outcome::Success)]);
        assert_eq!(observer.output(), vec!["hello"]);
    }
}
