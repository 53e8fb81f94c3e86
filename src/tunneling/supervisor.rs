use std::{
    future::Future,
    io,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::watch,
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use super::{command::LaunchCommand, tunnel::TunnelError};

/// How long a client gets to take its ssh session down after SIGTERM
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(30);

/// How a supervised process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExitOutcome {
    Code(i32),
    /// killed by a signal, no exit code available
    Signaled,
    WaitFailed(String),
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Code(0))
    }
}

/// Lifecycle of one process group
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GroupState {
    Pending,
    Running { pid: Option<u32> },
    Exited(ExitOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GroupOutcome {
    pub label: String,
    pub outcome: ExitOutcome,
    /// the process was asked to terminate during shutdown
    pub stop_requested: bool,
}

impl GroupOutcome {
    fn is_failure(&self) -> bool {
        !self.stop_requested && !self.outcome.is_success()
    }
}

/// Terminations in the order they were reaped
#[derive(Debug, Default)]
pub(crate) struct SupervisionReport {
    pub outcomes: Vec<GroupOutcome>,
    /// reaper tasks that died before reporting
    pub lost: usize,
}

impl SupervisionReport {
    pub fn is_success(&self) -> bool {
        self.lost == 0 && !self.outcomes.iter().any(GroupOutcome::is_failure)
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { 1 }
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Spawns every command, then reaps them as they terminate until none is left.
///
/// A failing child never stops the others from being waited on. When
/// `shutdown` completes, every child still running gets SIGTERM, and SIGKILL
/// once `stop_grace` has passed; all of them are reaped before returning.
pub(crate) async fn supervise<F>(
    commands: Vec<LaunchCommand>,
    shutdown: F,
    stop_grace: Duration,
) -> Result<SupervisionReport, TunnelError>
where
    F: Future<Output = ()>,
{
    let mut states = vec![GroupState::Pending; commands.len()];
    let mut children: Vec<Child> = Vec::with_capacity(commands.len());

    // everything is launched before anything is awaited
    for (idx, command) in commands.iter().enumerate() {
        let spawned = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                for child in &mut children {
                    if let Err(e) = terminate(child, stop_grace).await {
                        debug!("unable to reap child: {e}");
                    }
                }
                return Err(TunnelError::Spawn(e, command.program.display().to_string()));
            }
        };
        if let Some(stdout) = child.stdout.take() {
            forward_output(command.label.clone(), stdout, Stream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(command.label.clone(), stderr, Stream::Stderr);
        }
        states[idx] = GroupState::Running { pid: child.id() };
        info!(group = %command.label, pid = ?child.id(), "tunnel process started");
        debug!(group = %command.label, "{command}");
        children.push(child);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut reapers = JoinSet::new();
    for (idx, mut child) in children.into_iter().enumerate() {
        let mut stop_rx = stop_rx.clone();
        reapers.spawn(async move {
            tokio::select! {
                status = child.wait() => (idx, status, false),
                _ = stop_rx.changed() => (idx, terminate(&mut child, stop_grace).await, true),
            }
        });
    }

    let mut report = SupervisionReport::default();
    let mut stopping = false;
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown, if !stopping => {
                stopping = true;
                warn!("shutdown requested, stopping tunnel processes");
                let _ = stop_tx.send(true);
            }
            joined = reapers.join_next() => {
                let Some(joined) = joined else { break };
                let (idx, status, stop_requested) = match joined {
                    Ok(reaped) => reaped,
                    Err(e) => {
                        error!("tunnel reaper task failed: {e}");
                        report.lost += 1;
                        continue;
                    }
                };
                // a terminal ctrl-c reaches the children too, they may exit first
                let stop_requested = stop_requested || stopping;
                let label = commands[idx].label.clone();
                let outcome = match status {
                    Ok(status) => status
                        .code()
                        .map(ExitOutcome::Code)
                        .unwrap_or(ExitOutcome::Signaled),
                    Err(e) => ExitOutcome::WaitFailed(e.to_string()),
                };
                if outcome.is_success() || stop_requested {
                    info!(group = %label, ?outcome, "tunnel process exited");
                } else {
                    error!(group = %label, ?outcome, "tunnel process failed");
                }
                if let GroupState::Running { pid } = &states[idx] {
                    debug!(group = %label, ?pid, "reaped");
                }
                states[idx] = GroupState::Exited(outcome.clone());
                report.outcomes.push(GroupOutcome { label, outcome, stop_requested });
                let running = states
                    .iter()
                    .filter(|state| matches!(state, GroupState::Running { .. }))
                    .count();
                debug!(running, "waiting for remaining tunnel processes");
            }
        }
    }
    Ok(report)
}

/// Asks `child` to stop with SIGTERM so the client can take its own ssh
/// child down, then kills it if it is still around after `grace`.
async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if request_stop(child) {
        let waited = tokio::time::timeout(grace, child.wait()).await;
        match waited {
            Ok(status) => return status,
            Err(_) => warn!(pid = ?child.id(), "still running after {grace:?}, killing"),
        }
    }
    if let Err(e) = child.start_kill() {
        debug!("kill failed: {e}");
    }
    child.wait().await
}

#[cfg(unix)]
fn request_stop(child: &Child) -> bool {
    use nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    };

    let Some(pid) = child.id() else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, "unable to send SIGTERM: {e}");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_stop(_child: &Child) -> bool {
    false
}

fn forward_output<R>(label: String, reader: R, stream: Stream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match stream {
                Stream::Stdout => info!(group = %label, "{line}"),
                Stream::Stderr => warn!(group = %label, "{line}"),
            }
        }
    });
}
