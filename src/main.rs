//! Ralph loop - stop-hook continuation loop for Claude Code
//!
//! `ralph-loop setup` starts a loop, `ralph-loop hook stop` is registered as
//! the project's Stop hook and decides on every turn whether the agent may
//! stop.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use ralph_loop::config::ProjectConfig;
use ralph_loop::control::{CancelOutcome, LoopControl, LoopStatus};
use ralph_loop::setup::{missing_feature_list_help, SetupController, SetupOptions};
use ralph_loop::{RalphError, StopHook};

/// Prompt used when `setup` is given no task.
fn default_prompt(feature_list: &str) -> String {
    format!(
        "Read {feature_list}. Pick the highest-priority feature whose \"passes\" flag is false, \
         implement it, and verify it end to end. Only when it is verified, set its \"passes\" \
         flag to true and commit your work. Work on exactly one feature per iteration."
    )
}

#[derive(Parser)]
#[command(name = "ralph-loop")]
#[command(version)]
#[command(about = "Keep Claude Code iterating on one task until it is really done", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".", env = "CLAUDE_PROJECT_DIR")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new loop in the project
    Setup {
        /// Task prompt; words are joined with spaces. Omit to work through the feature list
        prompt: Vec<String>,

        /// Stop after this many iterations (0 = until every feature passes)
        #[arg(short, long, default_value = "0")]
        max_iterations: u32,

        /// Phrase the agent must output inside <promise> tags to finish
        #[arg(short, long, value_name = "TEXT")]
        completion_promise: Option<String>,

        /// Feature list consulted when the loop is unlimited
        #[arg(short, long, value_name = "PATH")]
        feature_list: Option<String>,
    },

    /// Hook entry points invoked by Claude Code
    Hook {
        #[command(subcommand)]
        action: HookAction,
    },

    /// Show the active loop
    Status,

    /// Stop the active loop
    Cancel,

    /// Lock maintenance
    Locks {
        #[command(subcommand)]
        action: LocksAction,
    },
}

#[derive(Subcommand)]
enum HookAction {
    /// Stop hook: reads the hook payload on stdin
    Stop,
}

#[derive(Subcommand)]
enum LocksAction {
    /// Remove locks whose holder is gone
    Clean {
        /// Directory to scan (defaults to the state file's directory)
        dir: Option<PathBuf>,
    },

    /// Remove the lock on a resource
    Release {
        /// Locked resource (not the .lock file itself)
        resource: PathBuf,

        /// Remove even if the holder is still running
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "ralph_loop=debug,info"
    } else {
        "ralph_loop=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // stdout belongs to the hook protocol
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());

    if let Commands::Hook {
        action: HookAction::Stop,
    } = cli.command
    {
        return run_stop_hook(&project_path).await;
    }

    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    let config = match ProjectConfig::load(&project_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(e.exit_code());
        }
    };

    let result = match cli.command {
        Commands::Setup {
            prompt,
            max_iterations,
            completion_promise,
            feature_list,
        } => {
            let list = feature_list
                .clone()
                .unwrap_or_else(|| config.ralph_loop.feature_list.clone());
            let opts = SetupOptions::from_words(prompt.as_slice())
                .with_max_iterations(max_iterations)
                .with_completion_promise(completion_promise)
                .with_feature_list_path(feature_list);
            run_setup(&project_path, &config, opts, &default_prompt(&list)).await
        }

        Commands::Status => {
            let control = LoopControl::new(&project_path, config);
            control.status().await.map(|status| print_status(&status))
        }

        Commands::Cancel => {
            let control = LoopControl::new(&project_path, config);
            control.cancel().await.map(|outcome| match outcome {
                CancelOutcome::NotActive => {
                    println!("{} No active loop", "Info:".blue());
                }
                CancelOutcome::Cancelled {
                    iteration: Some(iteration),
                } => {
                    println!("{} Cancelled loop at iteration {}", "OK".green().bold(), iteration);
                }
                CancelOutcome::Cancelled { iteration: None } => {
                    println!("{} Removed unreadable loop state", "OK".green().bold());
                }
            })
        }

        Commands::Locks { action } => {
            let control = LoopControl::new(&project_path, config);
            match action {
                LocksAction::Clean { dir } => {
                    control.clean_locks(dir.as_deref()).await.map(|removed| {
                        println!("{} Removed {} stale lock(s)", "OK".green().bold(), removed);
                    })
                }
                LocksAction::Release { resource, force } => control
                    .release_lock(&resource, force)
                    .await
                    .map(|released| {
                        if released {
                            println!("{} Lock on {} released", "OK".green().bold(), resource.display());
                        } else {
                            println!(
                                "{} Lock on {} could not be removed",
                                "Warning:".yellow().bold(),
                                resource.display()
                            );
                        }
                    }),
            }
        }

        Commands::Hook { .. } => unreachable!("handled above"),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let RalphError::MissingFeatureList { path } = &e {
            eprintln!("\n{}", missing_feature_list_help(path));
        }
        std::process::exit(e.exit_code());
    }

    Ok(())
}

/// Every handled outcome exits 0; only the hook's JSON goes to stdout.
async fn run_stop_hook(project_path: &Path) -> anyhow::Result<()> {
    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("Failed to read hook input from stdin")?;

    let config = ProjectConfig::load_or_default(project_path);
    let transition = StopHook::new(project_path, &config).run(&raw).await;

    if let Some(response) = transition.response() {
        println!("{}", serde_json::to_string(response)?);
    }
    Ok(())
}

async fn run_setup(
    project_path: &Path,
    config: &ProjectConfig,
    opts: SetupOptions,
    default_prompt: &str,
) -> ralph_loop::Result<()> {
    let report = SetupController::new(project_path, config)
        .run(opts, default_prompt)
        .await?;
    let state = &report.state;

    if report.replaced_existing {
        println!("{} Replaced the previous loop", "Warning:".yellow().bold());
    }
    println!(
        "{} Ralph loop started ({})",
        "OK".green().bold(),
        report.state_path.display()
    );
    if state.max_iterations > 0 {
        println!("   Max iterations: {}", state.max_iterations);
    } else {
        println!(
            "   Max iterations: unlimited (until every feature in {} passes)",
            state.feature_list_path
        );
    }
    match &state.completion_promise {
        Some(promise) => {
            println!("   Completion promise: {}", promise.cyan());
            println!(
                "\n{} Output <promise>{}</promise> only when that statement is completely true.",
                "Note:".cyan().bold(),
                promise
            );
        }
        None => println!("   Completion promise: none"),
    }
    if report.used_default_prompt {
        println!("   Prompt: default feature-list prompt");
    }
    if !config.has_stop_hook(ralph_loop::control::HOOK_COMMAND_NEEDLE) {
        println!(
            "\n{} No Stop hook running `ralph-loop hook stop` found in {}",
            "Warning:".yellow().bold(),
            ProjectConfig::settings_path(project_path).display()
        );
    }
    println!("\n{}", state.prompt);
    Ok(())
}

fn print_status(status: &LoopStatus) {
    println!("\n{} Ralph Loop", "Status:".cyan().bold());
    println!("{}", "─".repeat(40));

    match (&status.state, &status.corruption) {
        (Some(state), _) => {
            let max = if state.max_iterations > 0 {
                state.max_iterations.to_string()
            } else {
                "unlimited".to_string()
            };
            println!(
                "   Active: {}",
                if state.active { "yes".green() } else { "no".yellow() }
            );
            println!("   Iteration: {} / {}", state.iteration, max);
            println!(
                "   Completion promise: {}",
                state.completion_promise.as_deref().unwrap_or("none")
            );
            println!("   Started: {}", state.started_at);
            let features = status
                .features
                .map_or_else(|| "not found".to_string(), |p| p.to_string());
            println!("   Feature list: {} ({})", state.feature_list_path, features);
        }
        (None, Some(reason)) => {
            println!("   Active: {} ({})", "corrupted".red(), reason);
        }
        (None, None) => println!("   Active: {}", "no".dimmed()),
    }

    println!("   State file: {}", status.state_path.display());
    match &status.lock_holder {
        Some(holder) => println!("   Lock: held by pid {}", holder.pid),
        None => println!("   Lock: free"),
    }
    println!(
        "   Stop hook: {}",
        if status.hook_registered {
            "registered".green()
        } else {
            "not registered".yellow()
        }
    );
}
