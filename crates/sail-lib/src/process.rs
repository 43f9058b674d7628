//! Child process management.
//!
//! The manager spawns the commands queued by the run, captures their output,
//! and can stop the whole fleet on cancellation. Children are spawned with
//! `kill_on_drop` so abandoning a wait tears the process down rather than
//! leaking it.

use std::{process::Stdio, sync::Arc};

use tokio::{process::Command, sync::watch};
use tracing::debug;

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone)]
pub struct ProcessManager {
    stopped: Arc<watch::Sender<bool>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            stopped: Arc::new(stopped),
        }
    }

    /// Signals every running and future command to stop. In-flight `run`
    /// calls return `None`; later calls return `None` immediately.
    pub fn stop(&self) {
        self.stopped.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Runs a shell command to completion in `cwd`, capturing output.
    /// Returns `Ok(None)` when the manager was stopped before or during the
    /// run; the child is killed in that case.
    pub async fn run(
        &self,
        command_line: &str,
        cwd: &sail_paths::AbsoluteSystemPath,
    ) -> Result<Option<CommandOutput>, std::io::Error> {
        if self.is_stopped() {
            return Ok(None);
        }

        let mut command = shell_command(command_line);
        command
            .current_dir(cwd.as_std_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn()?;
        let mut stopped = self.stopped.subscribe();

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output?;
                Ok(Some(CommandOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                }))
            }
            _ = stopped.wait_for(|stop| *stop) => {
                // Dropping the wait future drops the child handle, and
                // kill_on_drop reaps the process.
                debug!("command '{command_line}' interrupted by stop");
                Ok(None)
            }
        }
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}

#[cfg(test)]
mod test {
    use sail_paths::AbsoluteSystemPath;

    use super::*;

    #[tokio::test]
    #[cfg(unix)]
    async fn test_captures_output_and_exit_code() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cwd = AbsoluteSystemPath::from_std_path(dir.path())?;
        let manager = ProcessManager::new();

        let output = manager.run("echo hello && exit 3", cwd).await?.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "hello\n");
        Ok(())
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_stop_interrupts_running_command() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cwd = AbsoluteSystemPath::from_std_path(dir.path())?;
        let manager = ProcessManager::new();

        let runner = {
            let manager = manager.clone();
            let cwd = cwd.to_owned();
            tokio::spawn(async move { manager.run("sleep 30", &cwd).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        manager.stop();

        let result = runner.await??;
        assert_eq!(result, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_stopped_manager_refuses_new_commands() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cwd = AbsoluteSystemPath::from_std_path(dir.path())?;
        let manager = ProcessManager::new();
        manager.stop();

        assert_eq!(manager.run("echo hi", cwd).await?, None);
        Ok(())
    }
}
