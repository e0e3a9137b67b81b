//! Subprocess execution with an optional wall-clock timeout.
//!
//! Used for short-lived plugin invocations (`--discover`, `--help`) that
//! need a bounded run time. The long-lived tap/target pair in
//! [`crate::pipeline`] manages its own child processes directly since it
//! streams stdout rather than collecting it.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    run(program, args, working_dir, &[], timeout)
}

/// Like [`run_with_timeout`], additionally setting `envs` on the child —
/// used for plugin invocations that need `PEX_MODULE`/`PEX_SCRIPT`/
/// `ALTO_PLUGIN` (see [`crate::pipeline::plugin_env`]).
pub fn run_with_env_and_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    envs: &[(String, String)],
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    run(program, args, working_dir, envs, timeout)
}

fn run(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    envs: &[(String, String)],
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args).current_dir(working_dir).envs(envs.iter().map(|(k, v)| (k, v)));

    let (exit_code, stdout, stderr, timed_out) = if let Some(timeout_dur) = timeout {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let deadline = Instant::now() + timeout_dur;
        loop {
            match child.try_wait().context("failed to poll command")? {
                Some(status) => {
                    let (out, err) = drain(&mut child);
                    break (status.code().unwrap_or(-1), out, err, false);
                }
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        let (out, mut err) = drain(&mut child);
                        err.push_str(&format!(
                            "\ncommand timed out after {}",
                            humantime::format_duration(timeout_dur)
                        ));
                        break (-1, out, err, true);
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    } else {
        let output = command
            .output()
            .with_context(|| format!("failed to execute {program}"))?;
        (
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            false,
        )
    };

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn drain(child: &mut std::process::Child) -> (String, String) {
    let mut out_bytes = Vec::new();
    let mut err_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut out_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut err_bytes);
    }
    (
        String::from_utf8_lossy(&out_bytes).to_string(),
        String::from_utf8_lossy(&err_bytes).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let out = run_with_timeout("echo", &["hi"], Path::new("."), None).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[test]
    fn nonzero_exit_is_not_success() {
        let out = run_with_timeout("false", &[], Path::new("."), None).unwrap();
        assert!(!out.success());
        assert_ne!(out.exit_code, 0);
    }

    #[test]
    fn timeout_kills_long_running_command() {
        let out = run_with_timeout(
            "sleep",
            &["5"],
            Path::new("."),
            Some(Duration::from_millis(100)),
        )
        .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
    }
}
