//! Numbered text menu (`--cli`)
//!
//! Child processes share the terminal here, so sudo and package-manager
//! prompts work as usual. Ctrl-C cancels the running plan.

use crate::config::Config;
use crate::observer::Observer;
use crate::orchestrator::{Orchestrator, RestartPolicy, RunOptions};
use crate::system::describe;
use crate::types::{CommandStep, Intent, Outcome, OutputLine, OutputStream, TargetPrompt};
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MenuChoice {
    Run(Intent),
    Exit,
}

fn parse_choice(input: &str) -> Option<MenuChoice> {
    match input.trim() {
        "5" => Some(MenuChoice::Exit),
        other => other
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(Intent::from_index)
            .map(MenuChoice::Run),
    }
}

fn parse_yes_no(input: &str) -> Option<bool> {
    match input.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

fn run_options(config: &Config) -> RunOptions {
    RunOptions {
        auto_restart: if config.auto_restart {
            RestartPolicy::Always
        } else {
            RestartPolicy::Ask
        },
        target_version: None,
        confirm_restart: config.confirm_restart,
    }
}

fn outcome_message(intent: Intent, outcome: &Outcome) -> String {
    match outcome {
        Outcome::Success => format!("{} completed successfully.", intent),
        Outcome::Failure(detail) => format!("{} failed: {}", intent, detail),
        Outcome::Cancelled => format!("{} cancelled.", intent),
        Outcome::Unimplemented => format!("{} is not implemented for this distribution.", intent),
    }
}

/// Blocking source of input lines; `None` on EOF
type LineSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

fn read_stdin_line() -> Option<String> {
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

/// Line input that can be interrupted
///
/// A blocking read cannot be aborted, so a read left behind by an
/// interrupted prompt is handed to the next prompt instead of racing it for
/// the next line.
pub struct Console {
    source: LineSource,
    pending: Mutex<Option<JoinHandle<Option<String>>>>,
}

impl Console {
    pub fn stdin() -> Self {
        Self::with_source(Arc::new(read_stdin_line))
    }

    fn with_source(source: LineSource) -> Self {
        Self {
            source,
            pending: Mutex::new(None),
        }
    }

    /// Print `message` and read one trimmed line
    ///
    /// `None` on EOF or when `interrupt` completes first.
    pub async fn prompt(&self, message: &str, interrupt: impl Future<Output = ()>) -> Option<String> {
        print!("{}", message);
        let _ = io::stdout().flush();

        let mut read = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| {
                let source = Arc::clone(&self.source);
                tokio::task::spawn_blocking(move || source())
            });

        tokio::select! {
            line = &mut read => line.ok().flatten(),
            _ = interrupt => {
                println!();
                *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(read);
                None
            }
        }
    }
}

/// Prints everything to the terminal; questions give up when the run is
/// cancelled
pub struct ConsoleObserver {
    verbose: bool,
    console: Arc<Console>,
    cancel: CancellationToken,
}

impl ConsoleObserver {
    pub fn new(verbose: bool, console: Arc<Console>, cancel: CancellationToken) -> Self {
        Self {
            verbose,
            console,
            cancel,
        }
    }
}

#[async_trait]
impl Observer for ConsoleObserver {
    fn on_output(&self, line: &OutputLine) {
        let text = if self.verbose {
            format!("[{}:{}] {}", line.step + 1, line.stream.tag(), line.text)
        } else {
            line.text.clone()
        };
        match line.stream {
            OutputStream::Stdout => println!("{}", text),
            OutputStream::Stderr => eprintln!("{}", text),
        }
    }

    fn on_status(&self, message: &str) {
        println!("==> {}", message);
    }

    fn on_step_started(&self, index: usize, step: &CommandStep) {
        let marker = if step.requires_privilege { " (privileged)" } else { "" };
        println!("\n[{}] {}{}", index + 1, step.display(), marker);
    }

    async fn ask_target_version(&self, prompt: &TargetPrompt) -> Option<String> {
        let answer = self
            .console
            .prompt(
                &format!("{} (e.g. {}): ", prompt.message, prompt.example),
                self.cancel.cancelled(),
            )
            .await?;
        if answer.is_empty() {
            None
        } else {
            Some(answer)
        }
    }

    async fn ask_yes_no(&self, question: &str) -> bool {
        loop {
            let answer = self
                .console
                .prompt(&format!("{} (Y/N): ", question), self.cancel.cancelled())
                .await;
            let Some(answer) = answer else {
                return false;
            };
            match parse_yes_no(&answer) {
                Some(yes) => return yes,
                None => println!("Invalid input. Please enter Y or N."),
            }
        }
    }

    fn on_outcome(&self, intent: Intent, outcome: &Outcome) {
        println!("\n{}", outcome_message(intent, outcome));
    }
}

fn print_menu(orchestrator: &Orchestrator) {
    println!("\n=== Maintenance Menu ===");
    println!("System: {}", describe(&orchestrator.detect()));
    if let Some(last) = orchestrator.action_log().last_action() {
        println!("Last action: {}", last);
    }
    for (i, intent) in Intent::all().iter().enumerate() {
        println!("{}. {}", i + 1, intent);
    }
    println!("5. Exit");
}

/// Menu loop; returns when the user exits or the system is restarting
pub async fn run_menu(orchestrator: &Orchestrator, config: &Config) -> Result<()> {
    let console = Arc::new(Console::stdin());

    loop {
        print_menu(orchestrator);

        let interrupt = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        let input = console.prompt("Select an option (1-5): ", interrupt).await;
        let Some(input) = input else {
            println!();
            break;
        };

        let intent = match parse_choice(&input) {
            Some(MenuChoice::Run(intent)) => intent,
            Some(MenuChoice::Exit) => {
                println!("Exiting...");
                break;
            }
            None => {
                println!("Invalid choice. Please select a valid option.");
                continue;
            }
        };

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            }
        });

        let observer: Arc<dyn Observer> = Arc::new(ConsoleObserver::new(
            config.verbose,
            Arc::clone(&console),
            cancel.clone(),
        ));
        let result = orchestrator
            .run(intent, &observer, run_options(config), &cancel)
            .await;
        watcher.abort();

        match result {
            // The reboot command returned; the system is going down
            Ok(Outcome::Success) if intent == Intent::Restart => break,
            Ok(_) => {}
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    Ok(())
}
