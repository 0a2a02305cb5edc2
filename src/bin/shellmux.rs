// src/bin/shellmux.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use shellmux::core::{command::Command, session::Session, toolbox::Toolbox};
use shellmux::models::SessionConfig;
use std::time::Duration;

/// Run commands over one persistent shell session.
#[derive(Parser, Debug)]
#[command(name = "shellmux", version, about)]
struct Cli {
    /// Interpreter to spawn instead of the default `sh`.
    #[arg(long, global = true)]
    interpreter: Option<String>,

    /// Per-command timeout in milliseconds.
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Pipe commands through `su` instead of a plain shell.
    #[arg(long, global = true)]
    root: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Execute one or more commands in order and print their output.
    Run {
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Check whether a file exists.
    Exists { path: String },
    /// Check whether a process with the given name is running.
    Running { name: String },
    /// Kill every process matching the given name.
    Kill { name: String },
    /// Check whether the session has root privileges.
    RootCheck,
}

fn main() {
    env_logger::init();

    if let Err(e) = run_cli(Cli::parse()) {
        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    let mut config = SessionConfig::default();
    if let Some(ms) = cli.timeout {
        config = config.with_default_timeout(Duration::from_millis(ms));
    }

    let session = if cli.root {
        Session::start_root_shell(config, &[], None)
    } else {
        match &cli.interpreter {
            Some(interpreter) => Session::start_custom(interpreter, config, &[], None),
            None => Session::start_shell(config),
        }
    }
    .context("failed to start the shell session")?;

    let outcome = dispatch(&cli.action, &session);
    session.close_and_join();

    if !outcome? {
        // "no" answers and failed batches map to a nonzero exit code
        // without the error banner.
        std::process::exit(1);
    }
    Ok(())
}

fn dispatch(action: &Action, session: &Session) -> Result<bool> {
    let toolbox = Toolbox::new(session);
    match action {
        Action::Run { commands } => run_commands(session, commands),
        Action::Exists { path } => Ok(report(toolbox.file_exists(path)?)),
        Action::Running { name } => Ok(report(toolbox.is_process_running(name)?)),
        Action::Kill { name } => Ok(report(toolbox.kill_all(name)?)),
        Action::RootCheck => Ok(report(toolbox.is_root_access_given()?)),
    }
}

/// Enqueues every command up front, then waits for them in order, so the
/// whole batch flows through the session back to back.
fn run_commands(session: &Session, commands: &[String]) -> Result<bool> {
    let mut handles = Vec::with_capacity(commands.len());
    for text in commands {
        handles.push(session.enqueue(Command::simple([text.as_str()]))?);
    }

    let mut failures = 0usize;
    for (text, handle) in commands.iter().zip(handles) {
        println!("{} {}", "→".blue(), text.green());
        let exit_code = handle.wait_for()?;
        print!("{}", handle.output().unwrap_or_default());
        if exit_code != 0 {
            println!("{}", format!("exit code {}", exit_code).red());
            failures += 1;
        }
    }
    Ok(failures == 0)
}

fn report(success: bool) -> bool {
    if success {
        println!("{}", "yes".green());
    } else {
        println!("{}", "no".red());
    }
    success
}
