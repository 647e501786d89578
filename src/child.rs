/// The child-process seam: spawning the server, signalling it and waiting
/// for it to exit.
///
/// The supervisor only talks to `Spawner` and `ChildProcess`, so its state
/// machine can be driven by a fake child in tests. `TokioSpawner` is the real
/// implementation on top of `tokio::process`.
use crate::command::ServerCommand;
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Exit code (None if killed by signal).
    pub code: Option<i32>,
    /// Terminating signal number, unix only.
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ChildExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// A running child owned by the supervisor.
pub trait ChildProcess: Send {
    /// OS process id, `None` once the child has been reaped.
    fn id(&self) -> Option<u32>;

    /// Ask the child to shut down (SIGTERM on unix).
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Kill the child without giving it a chance to clean up (SIGKILL on unix).
    fn kill(&mut self) -> std::io::Result<()>;

    /// Wait for the child to exit. Must be cancel-safe: the supervisor drops
    /// and re-creates this future on every loop turn.
    fn wait(&mut self) -> impl Future<Output = std::io::Result<ChildExit>> + Send + '_;
}

/// Starts child processes.
pub trait Spawner {
    type Child: ChildProcess;

    fn spawn(&self, command: &ServerCommand) -> std::io::Result<Self::Child>;
}

/// Spawns real OS processes that share the launcher's stdin/stdout/stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

/// A child spawned by `TokioSpawner`.
#[derive(Debug)]
pub struct OsChild {
    inner: tokio::process::Child,
}

impl Spawner for TokioSpawner {
    type Child = OsChild;

    fn spawn(&self, command: &ServerCommand) -> std::io::Result<OsChild> {
        tracing::debug!(
            program = %command.program,
            args = ?command.args,
            env = ?command.env,
            "spawning server"
        );

        let inner = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        tracing::info!(pid = inner.id().unwrap_or(0), "server process started");
        Ok(OsChild { inner })
    }
}

impl ChildProcess for OsChild {
    fn id(&self) -> Option<u32> {
        self.inner.id()
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // Already reaped: nothing to signal, and the pid may have been reused
        let Some(pid) = self.inner.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.inner.start_kill()
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.inner.start_kill()
    }

    fn wait(&mut self) -> impl Future<Output = std::io::Result<ChildExit>> + Send + '_ {
        async move {
            let status = self.inner.wait().await?;
            Ok(ChildExit::from(status))
        }
    }
}
