// Shared utilities for Linux TC (traffic control) and IFB operations

use crate::error::BackendError;
use crate::rate::{Rate, UNCAPPED_BITS_PER_SEC};
use std::process::Command;

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL)
const MAX_INTERFACE_NAME: usize = 15;

/// HTB refuses a zero rate
const MIN_HTB_RATE_BITS: u64 = 8;

/// Captured result of one external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stderr: stderr.into(),
        }
    }
}

/// Runs `tc`/`ip` invocations
pub trait CommandRunner: Send {
    fn run(&mut self, program: &str, args: &[String]) -> Result<CommandOutput, BackendError>;
}

/// Executes commands for real
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, program: &str, args: &[String]) -> Result<CommandOutput, BackendError> {
        log::trace!("Running: {}", render_command(program, args));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| BackendError::Spawn {
                command: render_command(program, args),
                source,
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Logs commands instead of executing them
#[derive(Debug, Default)]
pub struct DryRunRunner;

impl CommandRunner for DryRunRunner {
    fn run(&mut self, program: &str, args: &[String]) -> Result<CommandOutput, BackendError> {
        log::info!("[dry-run] {}", render_command(program, args));
        Ok(CommandOutput::ok())
    }
}

pub fn render_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build an owned argument vector from string literals and values
#[macro_export]
macro_rules! cmd_args {
    ($($arg:expr),* $(,)?) => {
        vec![$($arg.to_string()),*]
    };
}

/// Run a command that must succeed
pub fn run_checked(
    runner: &mut dyn CommandRunner,
    program: &str,
    args: &[String],
) -> Result<(), BackendError> {
    let output = runner.run(program, args)?;
    if output.success {
        Ok(())
    } else {
        Err(BackendError::CommandFailed {
            command: render_command(program, args),
            stderr: output.stderr,
        })
    }
}

/// Result of a command whose target may legitimately be missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Done,
    Missing,
}

/// Run a deletion-style command, treating "does not exist" as `Missing`
pub fn run_tolerating_missing(
    runner: &mut dyn CommandRunner,
    program: &str,
    args: &[String],
) -> Result<Presence, BackendError> {
    let output = runner.run(program, args)?;
    if output.success {
        Ok(Presence::Done)
    } else if is_not_found(&output.stderr) {
        log::trace!("{}: already absent", render_command(program, args));
        Ok(Presence::Missing)
    } else {
        Err(BackendError::CommandFailed {
            command: render_command(program, args),
            stderr: output.stderr,
        })
    }
}

/// Whether `tc`/`ip` complained about a missing object
pub fn is_not_found(stderr: &str) -> bool {
    const MARKERS: [&str; 6] = [
        "No such file or directory",
        "Cannot find device",
        "Cannot find specified qdisc",
        "Cannot delete qdisc with handle of zero",
        "not found",
        "does not exist",
    ];
    MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// Whether `tc`/`ip` complained about an object that already exists
pub fn is_already_exists(stderr: &str) -> bool {
    stderr.contains("File exists")
}

/// Default IFB device name for `interface`, within the kernel name limit
pub fn ifb_device_name(interface: &str) -> String {
    let mut name = format!("ifb-{}", interface);
    if name.len() > MAX_INTERFACE_NAME {
        let mut end = MAX_INTERFACE_NAME;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// Render a rate for `tc`; an absent ceiling is the largest classic rate
pub fn format_rate(rate: Option<Rate>) -> String {
    let bits = rate
        .map(Rate::bits_per_sec)
        .unwrap_or(UNCAPPED_BITS_PER_SEC)
        .max(MIN_HTB_RATE_BITS);
    format!("{}bit", bits)
}

/// Check if TC (traffic control) is available
pub fn check_tc_available() -> bool {
    Command::new("tc").arg("qdisc").arg("show").output().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(is_not_found("RTNETLINK answers: No such file or directory"));
        assert!(is_not_found("Cannot find device \"ifb-eth0\""));
        assert!(is_not_found(
            "Error: Cannot delete qdisc with handle of zero."
        ));
        assert!(is_not_found(
            "Error: Cannot find specified qdisc on specified device."
        ));
        assert!(!is_not_found("RTNETLINK answers: Operation not permitted"));
        assert!(is_already_exists("RTNETLINK answers: File exists"));
    }

    #[test]
    fn test_ifb_device_name_respects_limit() {
        assert_eq!(ifb_device_name("eth0"), "ifb-eth0");
        let long = ifb_device_name("enx00e04c680001");
        assert_eq!(long, "ifb-enx00e04c68");
        assert_eq!(long.len(), 15);
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(Some(Rate::from_bits_per_sec(5_000_000))), "5000000bit");
        assert_eq!(format_rate(None), format!("{}bit", u32::MAX));
        assert_eq!(format_rate(Some(Rate::ZERO)), "8bit");
    }

    #[test]
    fn test_run_helpers() {
        struct Failing(&'static str);
        impl CommandRunner for Failing {
            fn run(&mut self, _: &str, _: &[String]) -> Result<CommandOutput, BackendError> {
                Ok(CommandOutput::failed(self.0))
            }
        }

        let args = cmd_args!["class", "del", "dev", "eth0", "classid", "1:10"];
        let mut missing = Failing("RTNETLINK answers: No such file or directory");
        assert_eq!(
            run_tolerating_missing(&mut missing, "tc", &args).unwrap(),
            Presence::Missing
        );

        let mut denied = Failing("RTNETLINK answers: Operation not permitted");
        let err = run_checked(&mut denied, "tc", &args).unwrap_err();
        assert!(err.to_string().contains("tc class del dev eth0 classid 1:10"));

        let mut dry = DryRunRunner;
        assert_eq!(
            run_tolerating_missing(&mut dry, "tc", &args).unwrap(),
            Presence::Done
        );
    }
}
