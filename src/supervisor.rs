/// Server lifecycle: spawn, relay shutdown signals with escalation, mirror
/// the child's exit as our own.
///
/// States move `Starting → Running → ShuttingDown → Terminated`; a failed
/// spawn goes straight from `Starting` to `Terminated`. Everything runs in
/// a single `select!` loop on the current task.
use crate::child::{ChildExit, ChildProcess, Spawner};
use crate::command::ServerCommand;
use crate::signals::ShutdownSignal;
use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Sleep;

/// Exit code for spawn failures and child wait errors.
pub const FAILURE_EXIT_CODE: i32 = 1;

/// Printed when the server command is not on PATH.
const UV_INSTALL_HINT: &str = "\
Please install uv first:

Windows:
  winget install astral-sh.uv

macOS:
  curl -LsSf https://astral.sh/uv/install.sh | sh

Linux:
  curl -LsSf https://astral.sh/uv/install.sh | sh

Then restart your terminal and try again.";

/// Timers that drive the lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Delay before the "server started" notice.
    pub startup_notice: Duration,
    /// How long the child gets between SIGTERM and SIGKILL.
    pub grace_period: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            startup_notice: Duration::from_secs(1),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Supervisor states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running { pid: Option<u32> },
    ShuttingDown { signal: ShutdownSignal },
    Terminated(TerminationReason),
}

/// Why the supervisor stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The child exited on its own or after our terminate request.
    ChildExited(ChildExit),
    /// The grace period ran out and the child was killed.
    ForceKilled,
    /// No child was ever started.
    SpawnFailed { kind: ErrorKind, message: String },
    /// Waiting on the child failed.
    ChildError { message: String },
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Running { pid: Some(pid) } => write!(f, "running (pid {pid})"),
            SupervisorState::Running { pid: None } => write!(f, "running"),
            SupervisorState::ShuttingDown { signal } => write!(f, "shutting down ({signal})"),
            SupervisorState::Terminated(reason) => write!(f, "terminated: {reason}"),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::ChildExited(ChildExit {
                signal: Some(signal),
                ..
            }) => write!(f, "server terminated by signal {signal}"),
            TerminationReason::ChildExited(exit) => {
                write!(f, "server exited with code {}", exit.code.unwrap_or(0))
            }
            TerminationReason::ForceKilled => write!(f, "server killed after grace period"),
            TerminationReason::SpawnFailed { kind, message } => {
                write!(f, "server failed to start ({kind:?}): {message}")
            }
            TerminationReason::ChildError { message } => {
                write!(f, "error waiting for server: {message}")
            }
        }
    }
}

/// Final outcome of a supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub exit_code: i32,
    pub reason: TerminationReason,
}

impl Termination {
    fn from_reason(reason: TerminationReason) -> Self {
        let exit_code = match &reason {
            TerminationReason::ChildExited(exit) => exit.code.unwrap_or(0),
            TerminationReason::ForceKilled => 0,
            TerminationReason::SpawnFailed { .. } | TerminationReason::ChildError { .. } => {
                FAILURE_EXIT_CODE
            }
        };
        Self { exit_code, reason }
    }
}

/// Help text for a spawn failure, if there is any useful advice.
pub fn spawn_failure_help(program: &str, kind: ErrorKind) -> Option<String> {
    (kind == ErrorKind::NotFound)
        .then(|| format!("Error: {program} command not found. {UV_INSTALL_HINT}"))
}

/// The SIGTERM → SIGKILL escalation deadline.
///
/// Armed once on the first shutdown signal and cancelled when the child
/// exits, so a kill is never aimed at a reaped process.
#[derive(Debug, Default)]
struct Escalation {
    deadline: Option<Pin<Box<Sleep>>>,
}

impl Escalation {
    /// Arm the timer. Returns false if it was already armed.
    fn arm(&mut self, after: Duration) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(Box::pin(tokio::time::sleep(after)));
        true
    }

    /// Disarm the timer. Returns true if it was armed.
    fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline passes; pending forever when unarmed.
    fn fired(&mut self) -> impl Future<Output = ()> + '_ {
        async move {
            match self.deadline.as_mut() {
                Some(deadline) => deadline.as_mut().await,
                None => std::future::pending().await,
            }
        }
    }
}

/// Owns the child process for its whole lifetime.
pub struct Supervisor<S: Spawner> {
    spawner: S,
    timings: Timings,
    state: SupervisorState,
}

impl<S: Spawner> Supervisor<S> {
    pub fn new(spawner: S, timings: Timings) -> Self {
        Self {
            spawner,
            timings,
            state: SupervisorState::Starting,
        }
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    fn transition(&mut self, next: SupervisorState) {
        tracing::debug!(from = %self.state, to = %next, "supervisor state change");
        self.state = next;
    }

    fn finish(&mut self, reason: TerminationReason) -> Termination {
        self.transition(SupervisorState::Terminated(reason.clone()));
        Termination::from_reason(reason)
    }

    /// Spawn `command` and supervise it until it is gone.
    ///
    /// `signals` delivers shutdown requests; a closed channel just means no
    /// more will arrive.
    pub async fn run(
        &mut self,
        command: &ServerCommand,
        mut signals: mpsc::Receiver<ShutdownSignal>,
    ) -> Termination {
        let mut child = match self.spawner.spawn(command) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    program = %command.program,
                    error = %e,
                    "failed to start SQLite MCP server"
                );
                if let Some(help) = spawn_failure_help(&command.program, e.kind()) {
                    eprintln!();
                    eprintln!("{help}");
                    eprintln!();
                }
                return self.finish(TerminationReason::SpawnFailed {
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        };
        self.transition(SupervisorState::Running { pid: child.id() });

        let startup_notice = tokio::time::sleep(self.timings.startup_notice);
        tokio::pin!(startup_notice);
        let mut notice_pending = true;
        let mut signals_open = true;
        let mut escalation = Escalation::default();

        loop {
            // Child exit is checked first so a deadline that lands in the same
            // poll never kills an already-exited child.
            tokio::select! {
                biased;

                result = child.wait() => {
                    if escalation.cancel() {
                        tracing::debug!("child exited before the grace period ran out");
                    }
                    let reason = match result {
                        Ok(exit) => {
                            match exit.signal {
                                Some(signal) => {
                                    tracing::warn!(signal, "server terminated by signal")
                                }
                                None => tracing::info!(exit_code = ?exit.code, "server exited"),
                            }
                            TerminationReason::ChildExited(exit)
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "lost track of SQLite MCP server");
                            TerminationReason::ChildError { message: e.to_string() }
                        }
                    };
                    return self.finish(reason);
                }

                received = signals.recv(), if signals_open => {
                    let Some(signal) = received else {
                        signals_open = false;
                        continue;
                    };
                    if let SupervisorState::ShuttingDown { .. } = self.state {
                        tracing::debug!(%signal, "already shutting down, ignoring signal");
                        continue;
                    }
                    tracing::info!(%signal, "received signal, shutting down server");
                    if let Err(e) = child.terminate() {
                        tracing::warn!(error = %e, "failed to send terminate to server");
                    }
                    escalation.arm(self.timings.grace_period);
                    self.transition(SupervisorState::ShuttingDown { signal });
                }

                () = escalation.fired(), if escalation.is_armed() => {
                    tracing::warn!(
                        grace_period_ms = self.timings.grace_period.as_millis() as u64,
                        "server did not exit in time, killing it"
                    );
                    if let Err(e) = child.kill() {
                        tracing::warn!(error = %e, "failed to kill server");
                    }
                    escalation.cancel();
                    return self.finish(TerminationReason::ForceKilled);
                }

                () = &mut startup_notice, if notice_pending => {
                    notice_pending = false;
                    if let SupervisorState::Running { .. } = self.state {
                        tracing::info!("SQLite MCP server started successfully");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Sent {
        Terminate,
        Kill,
    }

    type ExitSlot = Option<Result<ChildExit, ErrorKind>>;

    /// Test double: exits when the test says so, or on terminate if configured.
    struct FakeChild {
        sent: Arc<Mutex<Vec<Sent>>>,
        exit: Arc<watch::Sender<ExitSlot>>,
        exit_rx: watch::Receiver<ExitSlot>,
        exit_on_terminate: Option<ChildExit>,
    }

    impl ChildProcess for FakeChild {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        fn terminate(&mut self) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(Sent::Terminate);
            if let Some(exit) = self.exit_on_terminate {
                self.exit.send_replace(Some(Ok(exit)));
            }
            Ok(())
        }

        fn kill(&mut self) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(Sent::Kill);
            Ok(())
        }

        fn wait(&mut self) -> impl Future<Output = std::io::Result<ChildExit>> + Send + '_ {
            async move {
                let slot = {
                    let guard = self
                        .exit_rx
                        .wait_for(Option::is_some)
                        .await
                        .map_err(|_| std::io::Error::other("exit channel closed"))?;
                    (*guard).clone()
                };
                match slot {
                    Some(Ok(exit)) => Ok(exit),
                    Some(Err(kind)) => Err(std::io::Error::new(kind, "wait failed")),
                    None => unreachable!(),
                }
            }
        }
    }

    struct FakeSpawner {
        child: Mutex<Option<FakeChild>>,
        spawn_error: Option<ErrorKind>,
        spawns: AtomicUsize,
    }

    impl Spawner for FakeSpawner {
        type Child = FakeChild;

        fn spawn(&self, _command: &ServerCommand) -> std::io::Result<FakeChild> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            if let Some(kind) = self.spawn_error {
                return Err(std::io::Error::new(kind, "spawn failed"));
            }
            Ok(self.child.lock().unwrap().take().expect("spawned twice"))
        }
    }

    struct Harness {
        sent: Arc<Mutex<Vec<Sent>>>,
        exit: Arc<watch::Sender<ExitSlot>>,
        spawner: FakeSpawner,
    }

    fn harness(exit_on_terminate: Option<ChildExit>) -> Harness {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = watch::channel(None);
        let exit = Arc::new(tx);
        let child = FakeChild {
            sent: Arc::clone(&sent),
            exit: Arc::clone(&exit),
            exit_rx: rx,
            exit_on_terminate,
        };
        Harness {
            sent,
            exit,
            spawner: FakeSpawner {
                child: Mutex::new(Some(child)),
                spawn_error: None,
                spawns: AtomicUsize::new(0),
            },
        }
    }

    fn command() -> ServerCommand {
        ServerCommand {
            program: "uvx".to_string(),
            args: vec!["mcp-server-sqlite".to_string(), "/tmp/db".to_string()],
            env: vec![],
        }
    }

    fn fast() -> Timings {
        Timings {
            startup_notice: Duration::from_millis(10),
            grace_period: Duration::from_millis(50),
        }
    }

    fn exited(code: i32) -> ChildExit {
        ChildExit {
            code: Some(code),
            signal: None,
        }
    }

    fn by_signal(signal: i32) -> ChildExit {
        ChildExit {
            code: None,
            signal: Some(signal),
        }
    }

    #[tokio::test]
    async fn test_child_exit_code_is_mirrored_without_kill() {
        let h = harness(None);
        h.exit.send_replace(Some(Ok(exited(3))));
        let (_tx, rx) = mpsc::channel(1);

        let mut supervisor = Supervisor::new(h.spawner, fast());
        let termination = supervisor.run(&command(), rx).await;

        assert_eq!(termination.exit_code, 3);
        assert_eq!(
            termination.reason,
            TerminationReason::ChildExited(exited(3))
        );
        assert!(h.sent.lock().unwrap().is_empty());
        assert!(matches!(supervisor.state(), SupervisorState::Terminated(_)));
    }

    #[tokio::test]
    async fn test_clean_exit_is_zero() {
        let h = harness(None);
        h.exit.send_replace(Some(Ok(exited(0))));
        let (_tx, rx) = mpsc::channel(1);

        let termination = Supervisor::new(h.spawner, fast()).run(&command(), rx).await;
        assert_eq!(termination.exit_code, 0);
    }

    #[tokio::test]
    async fn test_signal_termination_exits_zero() {
        let h = harness(None);
        h.exit.send_replace(Some(Ok(by_signal(9))));
        let (_tx, rx) = mpsc::channel(1);

        let termination = Supervisor::new(h.spawner, fast()).run(&command(), rx).await;
        assert_eq!(termination.exit_code, 0);
        assert_eq!(
            termination.reason,
            TerminationReason::ChildExited(by_signal(9))
        );
    }

    #[tokio::test]
    async fn test_interrupt_escalates_to_kill_and_exits_zero() {
        let h = harness(None);
        let (tx, rx) = mpsc::channel(4);
        tx.send(ShutdownSignal::Interrupt).await.unwrap();

        let started = tokio::time::Instant::now();
        let termination = Supervisor::new(h.spawner, fast()).run(&command(), rx).await;

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(termination.exit_code, 0);
        assert_eq!(termination.reason, TerminationReason::ForceKilled);
        assert_eq!(*h.sent.lock().unwrap(), vec![Sent::Terminate, Sent::Kill]);
    }

    #[tokio::test]
    async fn test_graceful_exit_within_grace_period_cancels_kill() {
        let h = harness(Some(by_signal(15)));
        let (tx, rx) = mpsc::channel(4);
        tx.send(ShutdownSignal::Terminate).await.unwrap();

        let termination = Supervisor::new(h.spawner, fast()).run(&command(), rx).await;

        assert_eq!(termination.exit_code, 0);
        assert_eq!(
            termination.reason,
            TerminationReason::ChildExited(by_signal(15))
        );
        assert_eq!(*h.sent.lock().unwrap(), vec![Sent::Terminate]);
    }

    #[tokio::test]
    async fn test_child_code_after_terminate_is_relayed() {
        let h = harness(Some(exited(2)));
        let (tx, rx) = mpsc::channel(4);
        tx.send(ShutdownSignal::Interrupt).await.unwrap();

        let termination = Supervisor::new(h.spawner, fast()).run(&command(), rx).await;
        assert_eq!(termination.exit_code, 2);
    }

    #[tokio::test]
    async fn test_exit_ready_with_deadline_wins_over_kill() {
        for _ in 0..5 {
            let h = harness(None);
            let (tx, rx) = mpsc::channel(4);
            tx.send(ShutdownSignal::Interrupt).await.unwrap();
            let exit = Arc::clone(&h.exit);
            tokio::spawn(async move {
                // hold the runtime thread past the grace period so the exit
                // and the deadline are both ready on the next poll
                std::thread::sleep(Duration::from_millis(100));
                exit.send_replace(Some(Ok(exited(7))));
            });

            let termination = Supervisor::new(h.spawner, fast()).run(&command(), rx).await;

            assert_eq!(termination.exit_code, 7);
            assert_eq!(termination.reason, TerminationReason::ChildExited(exited(7)));
            assert_eq!(*h.sent.lock().unwrap(), vec![Sent::Terminate]);
        }
    }

    #[tokio::test]
    async fn test_repeated_signals_do_not_duplicate_escalation() {
        let h = harness(None);
        let (tx, rx) = mpsc::channel(4);
        tx.send(ShutdownSignal::Interrupt).await.unwrap();
        tx.send(ShutdownSignal::Interrupt).await.unwrap();
        tx.send(ShutdownSignal::Terminate).await.unwrap();

        let termination = Supervisor::new(h.spawner, fast()).run(&command(), rx).await;

        assert_eq!(termination.reason, TerminationReason::ForceKilled);
        assert_eq!(*h.sent.lock().unwrap(), vec![Sent::Terminate, Sent::Kill]);
    }

    #[tokio::test]
    async fn test_spawn_not_found_fails_with_help_and_single_attempt() {
        let mut h = harness(None);
        h.spawner.spawn_error = Some(ErrorKind::NotFound);
        let (_tx, rx) = mpsc::channel(1);

        let mut supervisor = Supervisor::new(h.spawner, fast());
        let termination = supervisor.run(&command(), rx).await;

        assert_eq!(termination.exit_code, 1);
        assert!(matches!(
            termination.reason,
            TerminationReason::SpawnFailed {
                kind: ErrorKind::NotFound,
                ..
            }
        ));
        assert_eq!(supervisor.spawner.spawns.load(Ordering::SeqCst), 1);
        assert!(h.sent.lock().unwrap().is_empty());

        let help = spawn_failure_help("uvx", ErrorKind::NotFound).unwrap();
        assert!(help.contains("uvx command not found"));
        assert!(help.contains("winget install astral-sh.uv"));
        assert!(help.contains("https://astral.sh/uv/install.sh"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(
            SupervisorState::Running { pid: Some(7) }.to_string(),
            "running (pid 7)"
        );
        assert_eq!(
            SupervisorState::ShuttingDown {
                signal: ShutdownSignal::Interrupt
            }
            .to_string(),
            "shutting down (SIGINT)"
        );
        assert_eq!(
            SupervisorState::Terminated(TerminationReason::ChildExited(exited(3))).to_string(),
            "terminated: server exited with code 3"
        );
        assert_eq!(
            TerminationReason::ChildExited(by_signal(15)).to_string(),
            "server terminated by signal 15"
        );
    }

    #[test]
    fn test_no_help_for_other_spawn_errors() {
        assert!(spawn_failure_help("uvx", ErrorKind::PermissionDenied).is_none());
    }

    #[tokio::test]
    async fn test_wait_error_exits_one() {
        let h = harness(None);
        h.exit.send_replace(Some(Err(ErrorKind::Other)));
        let (_tx, rx) = mpsc::channel(1);

        let termination = Supervisor::new(h.spawner, fast()).run(&command(), rx).await;
        assert_eq!(termination.exit_code, 1);
        assert!(matches!(
            termination.reason,
            TerminationReason::ChildError { .. }
        ));
    }

    #[tokio::test]
    async fn test_startup_notice_does_not_delay_exit() {
        let h = harness(None);
        h.exit.send_replace(Some(Ok(exited(0))));
        let (_tx, rx) = mpsc::channel(1);
        let timings = Timings {
            startup_notice: Duration::from_secs(30),
            grace_period: Duration::from_secs(30),
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Supervisor::new(h.spawner, timings).run(&command(), rx),
        )
        .await;
        assert_eq!(result.unwrap().exit_code, 0);
    }

    #[tokio::test]
    async fn test_runs_past_startup_notice_until_child_exits() {
        let h = harness(None);
        let (_tx, rx) = mpsc::channel(1);
        let exit = Arc::clone(&h.exit);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            exit.send_replace(Some(Ok(exited(5))));
        });

        let termination = Supervisor::new(h.spawner, fast()).run(&command(), rx).await;
        assert_eq!(termination.exit_code, 5);
    }

    #[tokio::test]
    async fn test_closed_signal_channel_is_not_a_shutdown() {
        let h = harness(None);
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let exit = Arc::clone(&h.exit);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            exit.send_replace(Some(Ok(exited(0))));
        });

        let termination = Supervisor::new(h.spawner, fast()).run(&command(), rx).await;
        assert_eq!(termination.reason, TerminationReason::ChildExited(exited(0)));
        assert!(h.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_escalation_arm_and_cancel() {
        let mut escalation = Escalation::default();
        assert!(!escalation.is_armed());
        assert!(escalation.arm(Duration::from_millis(5)));
        assert!(!escalation.arm(Duration::from_secs(60)));
        escalation.fired().await;
        assert!(escalation.cancel());
        assert!(!escalation.cancel());
    }

    #[cfg(unix)]
    mod os {
        use super::*;
        use crate::child::TokioSpawner;

        fn sh(script: &str) -> ServerCommand {
            ServerCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                env: vec![],
            }
        }

        #[tokio::test]
        async fn test_real_child_exit_code_is_mirrored() {
            let (_tx, rx) = mpsc::channel(1);
            let termination = Supervisor::new(TokioSpawner, fast())
                .run(&sh("exit 3"), rx)
                .await;
            assert_eq!(termination.exit_code, 3);
        }

        #[tokio::test]
        async fn test_real_child_ignoring_sigterm_is_killed() {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                // let the shell install its trap first
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tx.send(ShutdownSignal::Interrupt).await;
                tokio::time::sleep(Duration::from_secs(10)).await;
            });
            let timings = Timings {
                startup_notice: Duration::from_millis(10),
                grace_period: Duration::from_millis(200),
            };

            let termination = Supervisor::new(TokioSpawner, timings)
                .run(&sh("trap '' TERM; exec sleep 30"), rx)
                .await;
            assert_eq!(termination.reason, TerminationReason::ForceKilled);
            assert_eq!(termination.exit_code, 0);
        }

        #[tokio::test]
        async fn test_real_child_honours_sigterm() {
            let (tx, rx) = mpsc::channel(1);
            tx.send(ShutdownSignal::Terminate).await.unwrap();

            let termination = Supervisor::new(TokioSpawner, Timings::default())
                .run(&sh("exec sleep 30"), rx)
                .await;
            assert_eq!(termination.exit_code, 0);
            assert_eq!(
                termination.reason,
                TerminationReason::ChildExited(ChildExit {
                    code: None,
                    signal: Some(nix::sys::signal::Signal::SIGTERM as i32),
                })
            );
        }

        #[tokio::test]
        async fn test_real_missing_program() {
            let (_tx, rx) = mpsc::channel(1);
            let command = ServerCommand {
                program: "nonexistent-binary-xyz".to_string(),
                args: vec![],
                env: vec![],
            };
            let termination = Supervisor::new(TokioSpawner, fast()).run(&command, rx).await;
            assert_eq!(termination.exit_code, 1);
        }
    }
}
