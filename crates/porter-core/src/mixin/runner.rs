//! # Mixin Subprocess Runner
//!
//! Spawns one mixin command, feeds it YAML on stdin and collects what it
//! writes. Each invocation moves through
//! `Spawned → Streaming → (Completed | Failed | Canceled)`; nothing is
//! persisted here.
//!
//! Cancellation sends the terminate signal and waits out the grace period
//! before killing the child. The child handle is dropped with
//! `kill_on_drop`, so no path leaves it running.

use super::outputs::{Censor, evaluate_step_outputs, parse_output_assignments};
use crate::manifest::Step;
use crate::primitives::{MIXIN_GRACE_PERIOD, MIXIN_STDERR_TAIL, is_builtin_action};
use crate::types::{PorterError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// COMMAND
// =============================================================================

/// One command line sent to a mixin.
#[derive(Debug, Clone, Default)]
pub struct MixinCommand {
    pub args: Vec<String>,
    /// Written to stdin, then stdin is closed.
    pub input: String,
    pub file: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl MixinCommand {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// The command for running `action`. Custom actions go through
    /// `invoke --action <name>`.
    pub fn for_action(action: &str) -> Self {
        if is_builtin_action(action) {
            Self::new([action])
        } else {
            Self::new(["invoke", "--action", action])
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The first argument, e.g. `install` or `invoke`.
    pub fn name(&self) -> &str {
        self.args.first().map_or("", String::as_str)
    }
}

// =============================================================================
// EXECUTION
// =============================================================================

/// Terminal state of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Completed,
    Failed { code: Option<i32> },
    Canceled,
}

/// What a mixin wrote and how it ended.
#[derive(Debug, Clone)]
pub struct MixinExecution {
    pub mixin: String,
    pub command: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub state: InvocationState,
}

impl MixinExecution {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// The last bytes of stderr, trimmed.
    pub fn stderr_tail(&self) -> String {
        let start = self.stderr.len().saturating_sub(MIXIN_STDERR_TAIL);
        String::from_utf8_lossy(&self.stderr[start..]).trim().to_string()
    }

    /// Map the terminal state onto the crate's error kinds.
    pub fn check(&self) -> Result<()> {
        match self.state {
            InvocationState::Completed => Ok(()),
            InvocationState::Canceled => Err(PorterError::Canceled),
            InvocationState::Failed { code } => {
                let mut stderr = self.stderr_tail();
                if stderr.is_empty() {
                    stderr = match code {
                        Some(c) => format!("exit status {c}"),
                        None => "terminated by signal".to_string(),
                    };
                }
                Err(PorterError::MixinFailure {
                    mixin: self.mixin.clone(),
                    command: self.command.clone(),
                    stderr,
                })
            }
        }
    }

    pub fn into_stdout(self) -> Result<Vec<u8>> {
        self.check()?;
        Ok(self.stdout)
    }
}

/// A step run plus the outputs it produced.
///
/// Outputs are collected even when the mixin fails so that whatever it
/// reported before exiting is not lost.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub execution: MixinExecution,
    pub outputs: BTreeMap<String, String>,
}

// =============================================================================
// RUNNER
// =============================================================================

/// Runs mixins installed under a mixins directory.
#[derive(Debug, Clone)]
pub struct MixinRunner {
    mixins_dir: PathBuf,
    debug: bool,
    grace_period: Duration,
}

impl MixinRunner {
    pub fn new(mixins_dir: impl Into<PathBuf>) -> Self {
        Self {
            mixins_dir: mixins_dir.into(),
            debug: false,
            grace_period: MIXIN_GRACE_PERIOD,
        }
    }

    /// Pass `--debug` to every command.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn mixins_dir(&self) -> &Path {
        &self.mixins_dir
    }

    /// `<mixins>/<name>/<name>`; the mixin must be installed.
    pub fn executable(&self, mixin: &str) -> Result<PathBuf> {
        if mixin.is_empty() || mixin.contains(['/', '\\']) || mixin == ".." {
            return Err(PorterError::Validation(format!("invalid mixin name {mixin:?}")));
        }
        let path = self
            .mixins_dir
            .join(mixin)
            .join(format!("{mixin}{}", std::env::consts::EXE_SUFFIX));
        if !path.is_file() {
            return Err(PorterError::not_found("mixin", format!("{mixin} ({})", path.display())));
        }
        Ok(path)
    }

    /// Spawn the command and wait for it to finish or be canceled.
    ///
    /// Only spawn and pipe failures are errors here; a nonzero exit is
    /// reported through the returned state.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        mixin: &str,
        command: &MixinCommand,
        censor: &Censor,
    ) -> Result<MixinExecution> {
        if cancel.is_cancelled() {
            return Err(PorterError::Canceled);
        }
        let exe = self.executable(mixin)?;

        let mut args = command.args.clone();
        if let Some(file) = &command.file {
            args.push("--file".into());
            args.push(file.display().to_string());
        }
        if self.debug {
            args.push("--debug".into());
        }
        let pretty = format!("{mixin} {}", args.join(" "));

        let mut cmd = Command::new(&exe);
        cmd.args(&args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group, so signals reach anything the mixin starts.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| PorterError::Io(format!("could not start mixin command {pretty}: {e}")))?;
        debug!(mixin, command = %pretty, "spawned mixin");

        let stdin = child.stdin.take();
        let input = command.input.clone();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // A mixin may exit without reading its input.
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "mixin closed stdin early");
                }
            }
        });

        let stdout = child.stdout.take();
        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stdout) = stdout {
                stdout.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        });

        let stderr = child.stderr.take();
        let log_censor = censor.clone();
        let log_mixin = mixin.to_string();
        let diagnostics = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(line) = lines.next_line().await? {
                    debug!(mixin = %log_mixin, "{}", log_censor.apply(&line));
                    buf.extend_from_slice(line.as_bytes());
                    buf.push(b'\n');
                }
            }
            Ok::<_, std::io::Error>(buf)
        });

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel.cancelled() => None,
        };
        let state = match waited {
            Some(status) => {
                let status = status.map_err(|e| {
                    PorterError::Io(format!("failed waiting on mixin command {pretty}: {e}"))
                })?;
                if status.success() {
                    InvocationState::Completed
                } else {
                    InvocationState::Failed {
                        code: status.code(),
                    }
                }
            }
            None => {
                info!(mixin, "canceling mixin");
                self.terminate(&mut child, mixin).await;
                InvocationState::Canceled
            }
        };

        let join_err = |e: tokio::task::JoinError| PorterError::Io(format!("mixin pipe task failed: {e}"));
        writer.await.map_err(join_err)?;
        let stdout = reader
            .await
            .map_err(join_err)?
            .map_err(|e| PorterError::Io(format!("failed reading mixin stdout: {e}")))?;
        let stderr = diagnostics
            .await
            .map_err(join_err)?
            .map_err(|e| PorterError::Io(format!("failed reading mixin stderr: {e}")))?;

        Ok(MixinExecution {
            mixin: mixin.to_string(),
            command: pretty,
            stdout,
            stderr,
            state,
        })
    }

    async fn terminate(&self, child: &mut Child, mixin: &str) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            // A negative pid addresses the whole group.
            let group = child
                .id()
                .and_then(|pid| i32::try_from(pid).ok())
                .map(|pid| Pid::from_raw(-pid));
            if let Some(group) = group
                && let Err(e) = kill(group, Signal::SIGTERM)
            {
                debug!(mixin, error = %e, "unable to signal mixin");
            }
            let exited = tokio::time::timeout(self.grace_period, child.wait())
                .await
                .is_ok();
            if !exited {
                warn!(mixin, grace_period = ?self.grace_period, "mixin ignored terminate, killing");
            }
            if let Some(group) = group
                && let Err(e) = kill(group, Signal::SIGKILL)
            {
                debug!(mixin, error = %e, "mixin process group already gone");
            }
            if exited {
                return;
            }
        }
        if let Err(e) = child.kill().await {
            warn!(mixin, error = %e, "unable to kill mixin");
        }
    }

    /// Run `step` for `action` and collect its outputs.
    ///
    /// The step goes to the mixin on stdin. Outputs are the `KEY=VALUE`
    /// lines it printed plus any declared step outputs that could be
    /// evaluated.
    pub async fn execute_step(
        &self,
        cancel: &CancellationToken,
        action: &str,
        step: &Step,
        working_dir: &Path,
        censor: &Censor,
    ) -> Result<StepExecution> {
        let mixin = step.mixin_name()?.to_string();
        let description = step.description()?.unwrap_or_default();
        info!(mixin, action, description, "executing step");

        let command = MixinCommand::for_action(action)
            .with_input(step.to_yaml()?)
            .in_dir(working_dir);
        let execution = self.run(cancel, &mixin, &command, censor).await?;

        let stdout = execution.stdout_string();
        let mut outputs = parse_output_assignments(&stdout)?;
        match evaluate_step_outputs(&step.outputs()?, &stdout, working_dir) {
            Ok(declared) => outputs.extend(declared),
            // A failed step is reported through its state; its declared outputs
            // are best effort.
            Err(e) if execution.state != InvocationState::Completed => {
                debug!(mixin, error = %e, "skipping declared outputs of failed step");
            }
            Err(e) => return Err(e.context(format!("step outputs for mixin {mixin}"))),
        }

        Ok(StepExecution { execution, outputs })
    }
}
