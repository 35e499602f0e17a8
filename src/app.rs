//! Application state and event handling
//!
//! Runs execute on the tokio runtime. The UI thread never waits on them: it
//! reads the shared [`Session`] on every frame and answers the run's
//! questions through the oneshot channels parked there.

use crate::config::Config;
use crate::observer::Observer;
use crate::orchestrator::{Orchestrator, RestartPolicy, RunOptions};
use crate::system::describe;
use crate::types::{CommandStep, DistroIdentity, Intent, Outcome, OutputLine, RunState, TargetPrompt};
use crate::ui::Theme;
use anyhow::Result;
use async_trait::async_trait;
use crossterm::event::{KeyCode, KeyEvent};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Entries kept in the output panel
pub const MAX_OUTPUT_LINES: usize = 1000;

/// Audit log lines shown in the log view
pub const LOG_VIEW_LINES: usize = 100;

const FLASH_SECS: u64 = 3;

/// One entry in the output panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Output(OutputLine),
    Status(String),
    Step(usize, String),
}

/// Question a run is waiting on
pub enum Question {
    YesNo {
        question: String,
        reply: oneshot::Sender<bool>,
    },
    Target {
        prompt: TargetPrompt,
        input: String,
        reply: oneshot::Sender<Option<String>>,
    },
}

/// The current (or last) run as seen by the UI
#[derive(Default)]
pub struct SessionState {
    pub intent: Option<Intent>,
    pub state: RunState,
    pub status: Option<String>,
    pub step: Option<String>,
    pub output: VecDeque<Entry>,
    pub last_outcome: Option<(Intent, Outcome)>,
    pub question: Option<Question>,
    // Not yet shown to the user
    finished: Vec<(Intent, Outcome)>,
    notices: Vec<String>,
}

#[derive(Default)]
pub struct Session {
    inner: Mutex<SessionState>,
}

impl Session {
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, entry: Entry) {
        let mut state = self.lock();
        if state.output.len() == MAX_OUTPUT_LINES {
            state.output.pop_front();
        }
        state.output.push_back(entry);
    }
}

/// Observer feeding the session
pub struct TuiObserver {
    session: Arc<Session>,
}

impl TuiObserver {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Observer for TuiObserver {
    fn on_output(&self, line: &OutputLine) {
        self.session.push(Entry::Output(line.clone()));
    }

    fn on_status(&self, message: &str) {
        self.session.lock().status = Some(message.to_string());
        self.session.push(Entry::Status(message.to_string()));
    }

    fn on_step_started(&self, index: usize, step: &CommandStep) {
        self.session.lock().step = Some(step.display());
        self.session.push(Entry::Step(index, step.display()));
    }

    fn on_state(&self, state: RunState) {
        self.session.lock().state = state;
    }

    async fn ask_target_version(&self, prompt: &TargetPrompt) -> Option<String> {
        let (reply, answer) = oneshot::channel();
        self.session.lock().question = Some(Question::Target {
            prompt: prompt.clone(),
            input: String::new(),
            reply,
        });
        answer.await.unwrap_or(None)
    }

    async fn ask_yes_no(&self, question: &str) -> bool {
        let (reply, answer) = oneshot::channel();
        self.session.lock().question = Some(Question::YesNo {
            question: question.to_string(),
            reply,
        });
        answer.await.unwrap_or(false)
    }

    fn on_outcome(&self, intent: Intent, outcome: &Outcome) {
        let mut state = self.session.lock();
        state.last_outcome = Some((intent, outcome.clone()));
        state.finished.push((intent, outcome.clone()));
    }
}

/// Which main panel is shown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Actions,
    Logs,
}

/// Popup overlay state
#[derive(Debug, Clone)]
pub enum PopupState {
    None,
    Error { title: String, message: String },
}

/// Main application state
pub struct App {
    pub should_quit: bool,
    pub config: Config,
    pub theme: Theme,
    pub dry_run: bool,

    pub view: View,
    pub selected: usize,

    // System info panel
    pub identity: DistroIdentity,
    pub distro_label: String,
    pub last_action: Option<String>,

    // Log view
    pub log_lines: Vec<String>,
    pub log_scroll: usize,

    pub popup: PopupState,
    pub flash_message: Option<(String, bool, Instant)>, // (message, is_error, timestamp)

    pub session: Arc<Session>,
    orchestrator: Arc<Orchestrator>,
    runtime: Handle,
    cancel: Option<CancellationToken>,
    // Spawned but not yet seen holding the orchestrator
    starting: bool,
}

impl App {
    pub fn new(orchestrator: Arc<Orchestrator>, config: Config, dry_run: bool, runtime: Handle) -> Self {
        let theme = Theme::from_name(config.theme);
        let identity = orchestrator.detect();
        let distro_label = describe(&identity);
        let last_action = orchestrator.action_log().last_action();

        Self {
            should_quit: false,
            config,
            theme,
            dry_run,
            view: View::Actions,
            selected: 0,
            identity,
            distro_label,
            last_action,
            log_lines: Vec::new(),
            log_scroll: 0,
            popup: PopupState::None,
            flash_message: None,
            session: Arc::new(Session::default()),
            orchestrator,
            runtime,
            cancel: None,
            starting: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.starting || self.orchestrator.is_busy()
    }

    /// Handle a key event
    pub fn handle_key(&mut self, key: KeyEvent) -> Result<()> {
        self.expire_flash();

        // A waiting question takes all input
        if self.session.lock().question.is_some() {
            self.handle_question_key(key);
            return Ok(());
        }

        if let PopupState::Error { .. } = self.popup {
            if matches!(key.code, KeyCode::Char('o') | KeyCode::Enter | KeyCode::Esc) {
                self.popup = PopupState::None;
            }
            return Ok(());
        }

        match self.view {
            View::Actions => self.handle_actions_key(key),
            View::Logs => self.handle_logs_key(key),
        }
        Ok(())
    }

    fn handle_question_key(&mut self, key: KeyEvent) {
        let mut session = self.session.lock();
        let Some(question) = session.question.take() else {
            return;
        };

        match question {
            Question::YesNo { question, reply } => match key.code {
                KeyCode::Char('y') | KeyCode::Char('Y') => {
                    let _ = reply.send(true);
                }
                KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                    let _ = reply.send(false);
                }
                _ => session.question = Some(Question::YesNo { question, reply }),
            },
            Question::Target {
                prompt,
                mut input,
                reply,
            } => match key.code {
                KeyCode::Enter => {
                    let _ = reply.send(Some(input));
                }
                KeyCode::Esc => {
                    let _ = reply.send(None);
                }
                code => {
                    match code {
                        KeyCode::Backspace => {
                            input.pop();
                        }
                        KeyCode::Char(c) => input.push(c),
                        _ => {}
                    }
                    session.question = Some(Question::Target { prompt, input, reply });
                }
            },
        }
    }

    fn handle_actions_key(&mut self, key: KeyEvent) {
        let last = Intent::all().len() - 1;
        match key.code {
            KeyCode::Char('q') => {
                if self.is_running() {
                    self.show_flash("An action is running, press c to cancel it first", true);
                } else {
                    self.should_quit = true;
                }
            }
            KeyCode::Char('j') | KeyCode::Down => {
                self.selected = (self.selected + 1).min(last);
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.selected = self.selected.saturating_sub(1);
            }
            KeyCode::Enter => {
                if let Some(intent) = Intent::from_index(self.selected) {
                    self.start(intent);
                }
            }
            KeyCode::Char(c @ '1'..='4') => {
                let index = c as usize - '1' as usize;
                if let Some(intent) = Intent::from_index(index) {
                    self.selected = index;
                    self.start(intent);
                }
            }
            KeyCode::Char('a') => {
                self.config.auto_restart = !self.config.auto_restart;
                let state = if self.config.auto_restart { "on" } else { "off" };
                self.save_config(&format!("Restart after update/upgrade: {}", state));
            }
            KeyCode::Char('v') => {
                self.config.verbose = !self.config.verbose;
                let state = if self.config.verbose { "on" } else { "off" };
                self.save_config(&format!("Verbose output: {}", state));
            }
            KeyCode::Char('t') => {
                self.config.theme = self.config.theme.next();
                self.theme = Theme::from_name(self.config.theme);
                self.save_config(&format!("Theme: {}", self.config.theme.as_str()));
            }
            KeyCode::Char('r') => {
                self.refresh();
                self.show_flash("System information refreshed", false);
            }
            KeyCode::Char('l') => self.open_logs(),
            KeyCode::Char('c') | KeyCode::Esc => self.cancel_run(),
            _ => {}
        }
    }

    fn handle_logs_key(&mut self, key: KeyEvent) {
        let max_scroll = self.log_lines.len().saturating_sub(1);
        match key.code {
            KeyCode::Char('l') | KeyCode::Esc | KeyCode::Char('q') => self.view = View::Actions,
            KeyCode::Char('j') | KeyCode::Down => {
                self.log_scroll = (self.log_scroll + 1).min(max_scroll);
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.log_scroll = self.log_scroll.saturating_sub(1);
            }
            KeyCode::Char('g') => self.log_scroll = 0,
            KeyCode::Char('G') => self.log_scroll = max_scroll,
            KeyCode::Char('c') => self.cancel_run(),
            _ => {}
        }
    }

    /// Start a run in the background
    pub fn start(&mut self, intent: Intent) {
        if self.is_running() {
            self.show_flash("Another action is already running", true);
            return;
        }

        {
            let mut session = self.session.lock();
            session.intent = Some(intent);
            session.state = RunState::Idle;
            session.status = None;
            session.step = None;
            session.output.clear();
        }

        let options = RunOptions {
            auto_restart: if self.config.auto_restart {
                RestartPolicy::Always
            } else {
                RestartPolicy::Never
            },
            target_version: None,
            confirm_restart: self.config.confirm_restart,
        };

        info!(intent = %intent, "starting from tui");
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let orchestrator = Arc::clone(&self.orchestrator);
        let session = Arc::clone(&self.session);
        let observer: Arc<dyn Observer> = Arc::new(TuiObserver::new(Arc::clone(&self.session)));

        self.runtime.spawn(async move {
            if let Err(e) = orchestrator.run(intent, &observer, options, &token).await {
                warn!(error = %e, "run rejected");
                session.lock().notices.push(e.to_string());
            }
        });

        self.cancel = Some(cancel);
        self.starting = true;
        self.view = View::Actions;
    }

    fn cancel_run(&mut self) {
        match &self.cancel {
            Some(token) if self.is_running() => {
                token.cancel();
                self.show_flash("Cancelling...", false);
            }
            _ => {}
        }
    }

    /// Pick up finished runs and rejected requests; called once per frame
    pub fn tick(&mut self) {
        self.expire_flash();

        let (finished, notices) = {
            let mut session = self.session.lock();
            (
                std::mem::take(&mut session.finished),
                std::mem::take(&mut session.notices),
            )
        };

        if self.starting
            && (self.orchestrator.is_busy() || !finished.is_empty() || !notices.is_empty())
        {
            self.starting = false;
        }

        for notice in notices {
            self.show_error("Action rejected", &notice);
        }

        if finished.is_empty() {
            return;
        }

        for (intent, outcome) in finished {
            match outcome {
                Outcome::Success => self.show_flash(&format!("{} complete", intent), false),
                Outcome::Cancelled => self.show_flash(&format!("{} cancelled", intent), true),
                Outcome::Unimplemented => self.show_flash(
                    &format!("{} is not implemented for {}", intent, self.distro_label),
                    true,
                ),
                Outcome::Failure(detail) => self.show_error(&format!("{} failed", intent), &detail),
            }
        }

        self.last_action = self.orchestrator.action_log().last_action();
        if self.view == View::Logs {
            self.load_logs();
        }
    }

    /// Re-run detection and reload persisted state
    pub fn refresh(&mut self) {
        self.identity = self.orchestrator.detect();
        self.distro_label = describe(&self.identity);
        self.last_action = self.orchestrator.action_log().last_action();
        if self.view == View::Logs {
            self.load_logs();
        }
    }

    fn open_logs(&mut self) {
        self.load_logs();
        self.log_scroll = self.log_lines.len().saturating_sub(1);
        self.view = View::Logs;
    }

    fn load_logs(&mut self) {
        match self.orchestrator.action_log().recent(LOG_VIEW_LINES) {
            Ok(lines) => self.log_lines = lines,
            Err(e) => {
                self.log_lines.clear();
                self.show_flash(&format!("Failed to read log: {}", e), true);
            }
        }
    }

    fn save_config(&mut self, message: &str) {
        match self.config.save() {
            Ok(()) => self.show_flash(message, false),
            Err(e) => self.show_flash(&format!("Failed to save config: {:#}", e), true),
        }
    }

    fn expire_flash(&mut self) {
        if let Some((_, _, instant)) = &self.flash_message {
            if instant.elapsed().as_secs() >= FLASH_SECS {
                self.flash_message = None;
            }
        }
    }

    fn show_error(&mut self, title: &str, message: &str) {
        self.popup = PopupState::Error {
            title: title.into(),
            message: message.into(),
        };
    }

    fn show_flash(&mut self, message: &str, is_error: bool) {
        self.flash_message = Some((message.into(), is_error, Instant::now()));
    }
}
