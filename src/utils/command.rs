//! Command execution utilities

use crate::utils::error::{DiskforgeError, Result};
use std::process::{Command, Output, Stdio};
use tracing::{debug, warn};

/// Something that can run an external tool once and hand back its stdout.
///
/// Every caller issues each invocation exactly once; implementations must
/// not retry on failure.
pub trait CommandExecutor {
    /// Run `program` with `args`, returning trimmed stdout.
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;

    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Execute a command and return the output
pub fn run_command(program: &str, args: &[&str]) -> Result<Output> {
    debug!("Running: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DiskforgeError::CommandNotFound(program.to_string())
            } else {
                DiskforgeError::Io(e)
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        warn!(
            "Command failed: {} {}\n  stderr: {}",
            program,
            args.join(" "),
            stderr.trim()
        );
        return Err(DiskforgeError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            stderr,
        });
    }

    Ok(output)
}

/// Execute a command and return stdout as string
pub fn run_command_output(program: &str, args: &[&str]) -> Result<String> {
    let output = run_command(program, args)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Log a command that would be run (for dry-run mode)
pub fn log_dry_run(program: &str, args: &[&str]) {
    println!("  [dry-run] {} {}", program, args.join(" "));
}

/// Wrapper for command execution that respects dry-run mode
pub struct CommandRunner {
    dry_run: bool,
}

impl CommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

impl CommandExecutor for CommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        if self.dry_run {
            log_dry_run(program, args);
            Ok(String::new())
        } else {
            run_command_output(program, args)
        }
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}
