//! External stage execution on a worker thread.
//!
//! A stage is an opaque program (the encoder or the recognizer). The worker
//! never touches UI state: it reports back over a channel and the owner
//! applies the result on its own thread.

use serde::{Deserialize, Serialize};
use std::process::{Command, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Callback used to wake the UI thread after an event is queued.
pub type Notifier = Arc<dyn Fn() + Send + Sync>;

/// One configured external stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stable identifier used by the CLI (`facecap stage encode`).
    pub name: String,
    /// Button text.
    pub label: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Close the application once this stage finishes.
    #[serde(default)]
    pub close_after: bool,
}

/// Look up a stage by name.
pub fn find_stage<'a>(stages: &'a [StageSpec], name: &str) -> Option<&'a StageSpec> {
    stages.iter().find(|s| s.name == name)
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("unknown stage: {0}")]
    Unknown(String),
    #[error("stage {0} has an empty command")]
    EmptyCommand(String),
    #[error("failed to spawn worker thread: {0}")]
    Thread(std::io::Error),
}

/// How an external stage ended. None of these affect control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageExit {
    Success,
    /// Non-zero exit; `None` when killed by a signal.
    Failed(Option<i32>),
    /// The program could not be started at all.
    SpawnFailed(String),
}

impl std::fmt::Display for StageExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageExit::Success => write!(f, "finished"),
            StageExit::Failed(Some(code)) => write!(f, "exited with status {code}"),
            StageExit::Failed(None) => write!(f, "terminated by signal"),
            StageExit::SpawnFailed(msg) => write!(f, "could not start: {msg}"),
        }
    }
}

/// Messages sent from the stage worker to the owning thread.
#[derive(Debug, Clone)]
pub enum StageEvent {
    Started { name: String, pid: u32 },
    Finished { name: String, exit: StageExit },
}

/// Spawn `spec` on a dedicated OS thread and return immediately.
///
/// The worker blocks until the process exits; there is no timeout.
pub fn spawn_stage(
    spec: &StageSpec,
    tx: UnboundedSender<StageEvent>,
    notify: Option<Notifier>,
) -> Result<(), StageError> {
    let Some((program, args)) = spec.command.split_first() else {
        return Err(StageError::EmptyCommand(spec.name.clone()));
    };

    let name = spec.name.clone();
    let program = program.clone();
    let args = args.to_vec();

    std::thread::Builder::new()
        .name(format!("facecap-stage-{name}"))
        .spawn(move || {
            let send = |event: StageEvent| {
                // Receiver gone means the controller was dropped; nothing to report to.
                let _ = tx.send(event);
                if let Some(notify) = &notify {
                    notify();
                }
            };

            tracing::info!(stage = %name, program = %program, ?args, "stage starting");

            let child = Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .spawn();

            let exit = match child {
                Ok(mut child) => {
                    send(StageEvent::Started {
                        name: name.clone(),
                        pid: child.id(),
                    });
                    match child.wait() {
                        Ok(status) if status.success() => StageExit::Success,
                        Ok(status) => StageExit::Failed(status.code()),
                        Err(e) => StageExit::SpawnFailed(format!("wait failed: {e}")),
                    }
                }
                Err(e) => StageExit::SpawnFailed(format!("{program}: {e}")),
            };

            match &exit {
                StageExit::Success => tracing::info!(stage = %name, "stage finished"),
                other => tracing::warn!(stage = %name, outcome = %other, "stage did not succeed"),
            }

            send(StageEvent::Finished { name, exit });
        })
        .map_err(StageError::Thread)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn spec(name: &str, command: &[&str]) -> StageSpec {
        StageSpec {
            name: name.into(),
            label: name.into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            close_after: false,
        }
    }

    fn finished(rx: &mut mpsc::UnboundedReceiver<StageEvent>) -> (String, StageExit) {
        loop {
            match rx.blocking_recv() {
                Some(StageEvent::Finished { name, exit }) => return (name, exit),
                Some(StageEvent::Started { .. }) => continue,
                None => panic!("worker dropped the channel without finishing"),
            }
        }
    }

    #[test]
    fn test_empty_command_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = spawn_stage(&spec("encode", &[]), tx, None);
        assert!(matches!(result, Err(StageError::EmptyCommand(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_success_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_stage(&spec("encode", &["sh", "-c", "exit 0"]), tx, None).unwrap();
        assert_eq!(finished(&mut rx), ("encode".to_string(), StageExit::Success));
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_stage(&spec("recognize", &["sh", "-c", "exit 3"]), tx, None).unwrap();
        assert_eq!(finished(&mut rx).1, StageExit::Failed(Some(3)));
    }

    #[test]
    fn test_missing_program_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_stage(&spec("encode", &["/nonexistent/facecap-stage"]), tx, None).unwrap();
        assert!(matches!(finished(&mut rx).1, StageExit::SpawnFailed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_notifier_called_per_event() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let notify: Notifier = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_stage(&spec("encode", &["sh", "-c", "exit 0"]), tx, Some(notify)).unwrap();
        finished(&mut rx);

        // Started + Finished; the last notify lands just after the send.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_find_stage() {
        let stages = vec![spec("encode", &["true"]), spec("recognize", &["true"])];
        assert_eq!(find_stage(&stages, "recognize").unwrap().name, "recognize");
        assert!(find_stage(&stages, "train").is_none());
    }

    #[test]
    fn test_exit_display() {
        assert_eq!(StageExit::Failed(Some(2)).to_string(), "exited with status 2");
        assert_eq!(StageExit::Success.to_string(), "finished");
    }
}
