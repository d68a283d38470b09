//! One long-lived worker process.
//!
//! A [`ProcessHost`] owns a single child executable and keeps it alive:
//! it spawns the child with a controlled environment, relays messages
//! over the child's stdin/stdout, and re-spawns the child on the next
//! scheduler turn whenever it exits unexpectedly, up to a configured cap.
//!
//! All observations of the child surface as [`ProcessEvent`]s on the
//! channel supplied at start; they are never delivered on the caller's
//! stack. Sending while the child is down is a silent no-op.

use std::{collections::BTreeMap, path::PathBuf, process::Stdio};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::protocol::Message;

/// Identifies a host among its siblings in event tuples.
pub type HostId = usize;

/// Launch description of one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Absolute path of the executable.
    pub executable_path: PathBuf,
    /// Command-line arguments.
    pub arguments: Vec<String>,
    /// Working directory; inherited when `None`.
    pub working_directory: Option<PathBuf>,
    /// Variables added to the inherited environment.
    pub env_additions: BTreeMap<String, String>,
    /// Variables removed from the inherited environment.
    pub env_hides: Vec<String>,
    /// Re-spawn cap after unexpected exits; 0 restarts forever.
    pub max_restarts: u32,
    /// Silences the child's stderr instead of inheriting it.
    pub suppress_stdio: bool,
}

/// What a host reports about its child.
#[derive(Debug)]
pub enum ProcessEvent {
    /// First successful spawn.
    Started,
    /// Any successful re-spawn after an unexpected exit.
    Restarted,
    /// A parsed IPC message from the child.
    Message(Message),
    /// Spawning the executable failed; a terminal [`ProcessEvent::Exited`]
    /// follows.
    SpawnFailed {
        /// The spawn error, rendered.
        error: String,
    },
    /// A kill was requested via [`ProcessHost::stop`].
    Stopping,
    /// The child is gone and will not be restarted.
    Exited,
}

enum Control {
    Send(Message),
    Stop { allow_restart: bool },
}

/// Handle to a supervised worker process.
///
/// Dropping the handle kills the child and ends the supervision task.
#[derive(Debug)]
pub struct ProcessHost {
    control: mpsc::UnboundedSender<Control>,
}

impl ProcessHost {
    /// Spawns the supervision task for `config`. Events arrive on
    /// `events`, tagged with `id`.
    pub fn start(
        config: ProcessConfig,
        id: HostId,
        events: mpsc::UnboundedSender<(HostId, ProcessEvent)>,
    ) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(config, id, events, control_rx));
        Self { control }
    }

    /// Queues an outgoing message; a no-op when the child is not
    /// currently connected.
    pub fn send(&self, message: Message) {
        let _ = self.control.send(Control::Send(message));
    }

    /// Requests child termination. With `allow_restart` the exit is
    /// treated like a crash and the restart loop applies; without it the
    /// following exit is terminal.
    pub fn stop(&self, allow_restart: bool) {
        let _ = self.control.send(Control::Stop { allow_restart });
    }
}

async fn run(
    config: ProcessConfig,
    id: HostId,
    events: mpsc::UnboundedSender<(HostId, ProcessEvent)>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let emit = |event: ProcessEvent| {
        let _ = events.send((id, event));
    };

    let mut restarts = 0u32;
    let mut respawn = false;

    loop {
        let mut command = Command::new(&config.executable_path);
        command
            .args(&config.arguments)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if config.suppress_stdio {
                Stdio::null()
            } else {
                Stdio::inherit()
            })
            .kill_on_drop(true);
        if let Some(dir) = &config.working_directory {
            command.current_dir(dir);
        }
        for name in &config.env_hides {
            command.env_remove(name);
        }
        command.envs(&config.env_additions);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    "failed to spawn worker '{}': {}",
                    config.executable_path.display(),
                    e
                );
                emit(ProcessEvent::SpawnFailed {
                    error: e.to_string(),
                });
                emit(ProcessEvent::Exited);
                return;
            }
        };

        debug!(
            "worker '{}' up (pid {:?})",
            config.executable_path.display(),
            child.id()
        );
        emit(if respawn {
            ProcessEvent::Restarted
        } else {
            ProcessEvent::Started
        });

        // stdin/stdout are piped above, so both handles exist.
        let mut stdin = child.stdin.take();
        let mut lines = child.stdout.take().map(|out| BufReader::new(out).lines());

        let mut stop_requested = false;
        let mut restart_after_stop = false;
        let mut control_open = true;

        // relay until the child's stdout closes, which is how we learn
        // the child is gone without losing messages written before exit.
        loop {
            tokio::select! {
                maybe_control = control.recv(), if control_open => match maybe_control {
                    Some(Control::Send(message)) => {
                        if let Some(stdin) = stdin.as_mut() {
                            let mut line = message.to_line();
                            line.push('\n');
                            // a broken pipe means the child is going away;
                            // the message is dropped per the contract.
                            let _ = stdin.write_all(line.as_bytes()).await;
                        }
                    }
                    Some(Control::Stop { allow_restart }) => {
                        stop_requested = true;
                        restart_after_stop = allow_restart;
                        emit(ProcessEvent::Stopping);
                        let _ = child.start_kill();
                    }
                    None => {
                        // handle dropped: tear down silently.
                        control_open = false;
                        stop_requested = true;
                        restart_after_stop = false;
                        let _ = child.start_kill();
                    }
                },
                line = read_line(&mut lines) => match line {
                    Some(text) => match Message::from_line(&text) {
                        Ok(message) => emit(ProcessEvent::Message(message)),
                        Err(e) => warn!(
                            "worker '{}' wrote an unparseable line: {} ({})",
                            config.executable_path.display(),
                            text,
                            e
                        ),
                    },
                    None => break,
                },
            }
        }

        let status = child.wait().await;
        debug!(
            "worker '{}' exited with {:?}",
            config.executable_path.display(),
            status
        );

        if stop_requested && !restart_after_stop {
            emit(ProcessEvent::Exited);
            return;
        }
        if config.max_restarts > 0 && restarts >= config.max_restarts {
            warn!(
                "worker '{}' exceeded its restart cap of {}",
                config.executable_path.display(),
                config.max_restarts
            );
            emit(ProcessEvent::Exited);
            return;
        }
        restarts += 1;
        respawn = true;
        info!(
            "restarting worker '{}' ({}/{})",
            config.executable_path.display(),
            restarts,
            config.max_restarts
        );

        // sends are a no-op while no child is connected: anything queued
        // since the exit is dropped rather than delivered to the next
        // child, which would duplicate a request the pool re-sends.
        loop {
            match control.try_recv() {
                Ok(Control::Send(_)) => {
                    debug!("dropping message sent while the worker is down")
                }
                Ok(Control::Stop { allow_restart }) => {
                    emit(ProcessEvent::Stopping);
                    if !allow_restart {
                        emit(ProcessEvent::Exited);
                        return;
                    }
                }
                Err(_) => break,
            }
        }

        // re-spawn on the next scheduler turn, not in this one.
        tokio::task::yield_now().await;
    }
}

async fn read_line(
    lines: &mut Option<tokio::io::Lines<BufReader<tokio::process::ChildStdout>>>,
) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}
