//! Command-line session driver.
//!
//! Parses the driver flags by hand, builds an orchestrator through the
//! factory, decides between interactive and non-interactive mode, runs
//! the session, and prints the ticket/delegation summary. Ctrl-C prints
//! a notice, runs cleanup, and exits 0.

use std::path::PathBuf;

use anyhow::Context;

use crate::core::framework_loader::FrameworkLoader;
use crate::core::socketio_pool::stop_connection_pool;
use crate::orchestration::base::Orchestrator;
use crate::orchestration::factory::{OrchestratorConfig, OrchestratorFactory};

/// Driver commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliCommand {
    /// Run an orchestrated session (default).
    Run,
    /// Show framework and configuration info.
    Info,
    /// Print the version.
    Version,
}

/// Parsed driver arguments.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Selected command.
    pub command: CliCommand,
    /// `-i/--input` value: literal text or a file path.
    pub input: Option<String>,
    /// Force non-interactive mode (read stdin when no `--input`).
    pub non_interactive: bool,
    /// Use the subprocess strategy.
    pub subprocess: bool,
    /// Use the subprocess strategy in interactive mode.
    pub interactive_subprocess: bool,
    /// Enable TODO hijacking.
    pub todo_hijack: bool,
    /// Disable ticket creation.
    pub no_tickets: bool,
    /// Disable the hook service.
    pub no_hooks: bool,
    /// Model name.
    pub model: String,
    /// Explicit framework path.
    pub framework_path: Option<PathBuf>,
    /// Custom agents directory.
    pub agents_dir: Option<PathBuf>,
    /// Logging level: OFF, INFO, or DEBUG.
    pub log_level: String,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: CliCommand::Run,
            input: None,
            non_interactive: false,
            subprocess: false,
            interactive_subprocess: false,
            todo_hijack: false,
            no_tickets: false,
            no_hooks: false,
            model: "opus".to_string(),
            framework_path: None,
            agents_dir: None,
            log_level: "OFF".to_string(),
        }
    }
}

impl CliArgs {
    /// Parse argv (without the program name).
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut parsed = Self::default();
        let mut iter = args.iter();

        fn value_of<'a>(
            flag: &str,
            iter: &mut std::slice::Iter<'a, String>,
        ) -> Result<String, String> {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        }

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "run" => parsed.command = CliCommand::Run,
                "info" => parsed.command = CliCommand::Info,
                "--version" | "-V" => parsed.command = CliCommand::Version,
                "-i" | "--input" => parsed.input = Some(value_of(arg, &mut iter)?),
                "--non-interactive" => parsed.non_interactive = true,
                "--subprocess" => parsed.subprocess = true,
                "--interactive-subprocess" => parsed.interactive_subprocess = true,
                "--todo-hijack" => parsed.todo_hijack = true,
                "--no-tickets" => parsed.no_tickets = true,
                "--no-hooks" => parsed.no_hooks = true,
                "--model" => parsed.model = value_of(arg, &mut iter)?,
                "--framework-path" => {
                    parsed.framework_path = Some(PathBuf::from(value_of(arg, &mut iter)?));
                }
                "--agents-dir" => {
                    parsed.agents_dir = Some(PathBuf::from(value_of(arg, &mut iter)?));
                }
                "--logging" => {
                    let level = value_of(arg, &mut iter)?;
                    match level.as_str() {
                        "OFF" | "INFO" | "DEBUG" => parsed.log_level = level,
                        other => return Err(format!("invalid logging level: {other}")),
                    }
                }
                "-d" | "--debug" => parsed.log_level = "DEBUG".to_string(),
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        Ok(parsed)
    }

    /// Orchestrator configuration implied by the flags.
    pub fn to_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            framework_path: self.framework_path.clone(),
            agents_dir: self.agents_dir.clone(),
            model: self.model.clone(),
            subprocess: self.subprocess,
            interactive_subprocess: self.interactive_subprocess,
            enable_todo_hijacking: self.todo_hijack,
            no_tickets: self.no_tickets,
            enable_hooks: !self.no_hooks,
            ..OrchestratorConfig::default()
        }
    }
}

/// Main driver entry point. Returns the process exit code.
pub async fn main() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = match CliArgs::parse(&args) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("Error: {err}");
            return 1;
        }
    };

    init_logging(&args.log_level);

    let code = match args.command {
        CliCommand::Version => {
            println!("claude-mpm {}", crate::VERSION);
            0
        }
        CliCommand::Info => {
            show_info(&args);
            0
        }
        CliCommand::Run => run_session(&args).await,
    };

    stop_connection_pool();
    code
}

fn init_logging(level: &str) {
    let filter = match level {
        "DEBUG" => log::LevelFilter::Debug,
        "INFO" => log::LevelFilter::Info,
        _ => log::LevelFilter::Warn,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(filter)
        .try_init();
}

/// Run an orchestrated session and print the summary.
async fn run_session(args: &CliArgs) -> i32 {
    let config = args.to_config();
    let mut orchestrator = match OrchestratorFactory::create_orchestrator(config).await {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            eprintln!("Error: {err}");
            return 1;
        }
    };

    let non_interactive = args.non_interactive || args.input.is_some();
    let user_input = if non_interactive {
        match read_user_input(args) {
            Ok(input) => Some(input),
            Err(err) => {
                eprintln!("Error: {err:#}");
                return 1;
            }
        }
    } else {
        None
    };

    let interrupted = {
        let run = async {
            match &user_input {
                Some(input) => orchestrator.run_non_interactive(input).await,
                None => orchestrator.run_interactive().await,
            }
        };

        tokio::select! {
            result = run => match result {
                Ok(()) => None,
                Err(err) => {
                    log::error!("Error: {err}");
                    eprintln!("Error: {err}");
                    return 1;
                }
            },
            _ = tokio::signal::ctrl_c() => Some(()),
        }
    };

    if interrupted.is_some() {
        println!("\nSession interrupted by user");
        orchestrator.cleanup().await;
    }

    show_session_summary(orchestrator.as_ref());
    0
}

/// Resolve the user input: a file path when it exists, the literal text
/// otherwise, or stdin when no `--input` was given.
fn read_user_input(args: &CliArgs) -> anyhow::Result<String> {
    match &args.input {
        Some(input) => {
            let path = PathBuf::from(input);
            if path.exists() {
                log::info!("Reading input from file: {}", path.display());
                std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read input file {}", path.display()))
            } else {
                log::info!("Using command line input");
                Ok(input.clone())
            }
        }
        None => {
            log::info!("Reading input from stdin");
            let mut buffer = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut buffer)
                .context("failed to read stdin")?;
            Ok(buffer)
        }
    }
}

/// Print ticket and delegation counts for the session.
fn show_session_summary(orchestrator: &dyn Orchestrator) {
    let core = orchestrator.core();

    let tickets = core.ticket_extractor.all_tickets();
    if !tickets.is_empty() {
        println!("\n📋 Extracted {} tickets during session:", tickets.len());
        let mut summary: Vec<_> = core.ticket_summary().into_iter().collect();
        summary.sort();
        for (ticket_type, count) in summary {
            println!("  - {ticket_type}: {count}");
        }
    }

    let delegations = core.delegation_summary();
    if !delegations.is_empty() {
        println!("\n👥 Agent delegations during session:");
        let mut summary: Vec<_> = delegations.into_iter().collect();
        summary.sort();
        for (agent, count) in summary {
            println!("  - {agent}: {count} tasks");
        }
    }
}

/// `info` subcommand: framework and dependency status.
fn show_info(args: &CliArgs) {
    println!("Claude MPM - Multi-Agent Project Manager");
    println!("{}", "=".repeat(50));

    let loader = FrameworkLoader::new(args.framework_path.clone(), args.agents_dir.clone());
    if loader.is_loaded() {
        println!("Framework: claude-mpm");
        if let Some(version) = &loader.version {
            println!("Version: {version}");
        }
        if let Some(path) = loader.framework_path() {
            println!("Path: {}", path.display());
        }
        println!("Agents: {}", loader.agent_list().join(", "));

        println!("\nAgent Hierarchy:");
        let hierarchy = loader.agent_hierarchy();
        println!("  Project agents: {}", hierarchy["project"].len());
        println!("  User agents: {}", hierarchy["user"].len());
        println!("  System agents: {}", hierarchy["system"].len());
    } else {
        println!("Framework: Not found (using minimal instructions)");
    }

    println!("\nDependencies:");
    match crate::core::launcher::ClaudeLauncher::new(args.model.clone(), true) {
        Ok(launcher) => println!("  ✓ Claude CLI: {}", launcher.claude_path().display()),
        Err(_) => println!("  ✗ Claude CLI: Not found in PATH"),
    }
}
