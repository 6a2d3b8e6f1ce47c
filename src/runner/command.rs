//! A step executor that shells out to an external program.
//!
//! Each step becomes one invocation of the configured program with the
//! step's arguments passed as long flags, e.g.
//! `<program> [base args] --output_path /tmp/a.png --scale 2`.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::jobs::{ArgValue, StepArgs};
use crate::runner::{StepContext, StepError, StepExecutor};

/// How much of the child's stderr is kept in a failed step's detail.
const STDERR_TAIL_BYTES: usize = 2048;

/// Runs one process per step and waits for it to exit.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    base_args: Vec<OsString>,
    cwd: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            cwd: None,
        }
    }

    /// Arguments placed before the per-step flags.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.base_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn command(&self, args: &StepArgs) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(step_flags(args))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

#[async_trait]
impl StepExecutor for CommandExecutor {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        tracing::debug!(
            job_id = %ctx.job_id,
            step = ctx.index,
            program = %self.program.display(),
            "Spawning step command"
        );

        let output = self.command(ctx.args).output().await.map_err(|e| {
            StepError::new(format!(
                "failed to spawn {}: {e}",
                self.program.display()
            ))
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = stderr_tail(stderr.trim_end());
        let status = match output.status.code() {
            Some(code) => format!("exited with code {code}"),
            None => "killed by signal".to_string(),
        };
        tracing::debug!(job_id = %ctx.job_id, step = ctx.index, %status, "Step command failed");

        if tail.is_empty() {
            Err(StepError::new(status))
        } else {
            Err(StepError::new(format!("{status}: {tail}")))
        }
    }
}

/// Render step arguments as `--name value` pairs.
///
/// `true` booleans become a bare `--name`; `false` ones are omitted.
fn step_flags(args: &StepArgs) -> Vec<OsString> {
    let mut flags = Vec::with_capacity(args.len() * 2);
    for (name, value) in args.iter() {
        let flag = OsString::from(format!("--{name}"));
        match value {
            ArgValue::Bool(true) => flags.push(flag),
            ArgValue::Bool(false) => {}
            ArgValue::Path(p) => {
                flags.push(flag);
                flags.push(p.as_os_str().to_owned());
            }
            other => {
                flags.push(flag);
                flags.push(OsString::from(other.to_string()));
            }
        }
    }
    flags
}

fn stderr_tail(stderr: &str) -> &str {
    if stderr.len() <= STDERR_TAIL_BYTES {
        return stderr;
    }
    let mut start = stderr.len() - STDERR_TAIL_BYTES;
    while !stderr.is_char_boundary(start) {
        start += 1;
    }
    &stderr[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ArtifactCache, SharedArtifacts};
    use crate::jobs::{RawArgs, StepKind};
    use crate::process::ProcessState;

    fn artifacts() -> SharedArtifacts {
        ArtifactCache::new(1).unwrap()
    }

    fn args(pairs: &[(&str, ArgValue)]) -> StepArgs {
        let raw: RawArgs = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        StepArgs::validate(raw).unwrap()
    }

    #[test]
    fn flags_follow_argument_types() {
        let args = args(&[
            ("output_path", ArgValue::from("/tmp/out.png")),
            ("scale", ArgValue::Number(2.0)),
            ("keep_fps", ArgValue::Bool(true)),
            ("skip_audio", ArgValue::Bool(false)),
            ("model", ArgValue::from("inswapper")),
        ]);
        let flags: Vec<String> = step_flags(&args)
            .into_iter()
            .map(|f| f.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            flags,
            vec![
                "--keep_fps",
                "--model",
                "inswapper",
                "--output_path",
                "/tmp/out.png",
                "--scale",
                "2",
            ]
        );
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = format!("{}END", "x".repeat(STDERR_TAIL_BYTES * 2));
        let tail = stderr_tail(&long);
        assert_eq!(tail.len(), STDERR_TAIL_BYTES);
        assert!(tail.ends_with("END"));
        assert_eq!(stderr_tail("short"), "short");
    }

    #[test]
    fn stderr_tail_respects_char_boundaries() {
        let long = "é".repeat(STDERR_TAIL_BYTES);
        let tail = stderr_tail(&long);
        assert!(tail.len() <= STDERR_TAIL_BYTES);
        assert!(tail.chars().all(|c| c == 'é'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn passes_flags_and_reports_success() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("argv.txt");
        let script = format!("printf '%s\\n' \"$@\" > {}", record.display());
        let exec = CommandExecutor::new("sh").with_args(["-c", script.as_str(), "stagehand"]);

        let step_args = args(&[
            ("output_path", ArgValue::from("/tmp/out.png")),
            ("scale", ArgValue::Number(1.5)),
        ]);
        let ctx = StepContext {
            job_id: "j1",
            index: 0,
            kind: StepKind::Image,
            args: &step_args,
            stop: ProcessState::new().stop_signal(),
            artifacts: &artifacts(),
        };
        exec.execute(&ctx).await.unwrap();

        let argv = std::fs::read_to_string(record).unwrap();
        assert_eq!(argv, "--output_path\n/tmp/out.png\n--scale\n1.5\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let exec =
            CommandExecutor::new("sh").with_args(["-c", "echo 'no face found' >&2; exit 3"]);
        let step_args = StepArgs::default();
        let ctx = StepContext {
            job_id: "j1",
            index: 0,
            kind: StepKind::Generic,
            args: &step_args,
            stop: ProcessState::new().stop_signal(),
            artifacts: &artifacts(),
        };
        let err = exec.execute(&ctx).await.unwrap_err();
        let detail = err.detail.unwrap();
        assert!(detail.contains("code 3"), "{detail}");
        assert!(detail.contains("no face found"), "{detail}");
    }

    #[tokio::test]
    async fn missing_program_is_a_step_error() {
        let exec = CommandExecutor::new("/definitely/not/a/real/program");
        let step_args = StepArgs::default();
        let ctx = StepContext {
            job_id: "j1",
            index: 0,
            kind: StepKind::Generic,
            args: &step_args,
            stop: ProcessState::new().stop_signal(),
            artifacts: &artifacts(),
        };
        let err = exec.execute(&ctx).await.unwrap_err();
        assert!(err.detail.unwrap().contains("failed to spawn"));
    }
}
