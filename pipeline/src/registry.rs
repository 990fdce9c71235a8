//! In-process pipeline run registry (SPEC_FULL.md §10.5, REDESIGN FLAGS:
//! replaces a global mutable registry with a single owned actor).
//!
//! A `start` command spawns one [`PipelineRegistry`] task per process that
//! owns a `HashMap<pipeline_id, PipelineStatus>`, mutated only by messages
//! sent over an `mpsc` channel. `status`/`stop` CLI invocations talk to the
//! already-running process's relational store directly (the registry is
//! in-process only; cross-process `status`/`stop` reads `pipeline_runs`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    CompletedWithFailures,
    Failed,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCounters {
    pub files_discovered: u64,
    pub files_analyzed: u64,
    pub directories_resolved: u64,
    pub relationships_validated: u64,
    pub relationships_accepted: u64,
    pub dead_letter_count: u64,
}

impl Default for PhaseCounters {
    fn default() -> Self {
        Self {
            files_discovered: 0,
            files_analyzed: 0,
            directories_resolved: 0,
            relationships_validated: 0,
            relationships_accepted: 0,
            dead_letter_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub pipeline_id: String,
    pub target_directory: String,
    pub state: RunState,
    pub counters: PhaseCounters,
    pub last_error: Option<String>,
}

enum Command {
    Register {
        pipeline_id: String,
        target_directory: String,
        reply: oneshot::Sender<()>,
    },
    Increment {
        pipeline_id: String,
        field: CounterField,
        by: u64,
    },
    SetState {
        pipeline_id: String,
        state: RunState,
        last_error: Option<String>,
    },
    Get {
        pipeline_id: String,
        reply: oneshot::Sender<Option<PipelineStatus>>,
    },
    Stop {
        pipeline_id: String,
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum CounterField {
    FilesDiscovered,
    FilesAnalyzed,
    DirectoriesResolved,
    RelationshipsValidated,
    RelationshipsAccepted,
    DeadLetter,
}

/// Handle to the registry actor. Cheap to clone; every clone shares the same
/// underlying task via the `mpsc` sender.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    pub async fn register(&self, pipeline_id: String, target_directory: String) {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Register {
                pipeline_id,
                target_directory,
                reply,
            })
            .await;
        let _ = rx.await;
    }

    pub async fn increment(&self, pipeline_id: &str, field: CounterField, by: u64) {
        let _ = self
            .tx
            .send(Command::Increment {
                pipeline_id: pipeline_id.to_string(),
                field,
                by,
            })
            .await;
    }

    pub async fn set_state(&self, pipeline_id: &str, state: RunState, last_error: Option<String>) {
        let _ = self
            .tx
            .send(Command::SetState {
                pipeline_id: pipeline_id.to_string(),
                state,
                last_error,
            })
            .await;
    }

    pub async fn status(&self, pipeline_id: &str) -> Option<PipelineStatus> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Get {
                pipeline_id: pipeline_id.to_string(),
                reply,
            })
            .await;
        rx.await.ok().flatten()
    }

    /// Requests a cooperative stop. Returns `true` if the pipeline_id was
    /// known to the registry.
    pub async fn stop(&self, pipeline_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Stop {
                pipeline_id: pipeline_id.to_string(),
                reply,
            })
            .await;
        rx.await.unwrap_or(false)
    }
}

/// Spawns the registry actor task and returns a handle to it.
pub fn spawn() -> RegistryHandle {
    let (tx, mut rx) = mpsc::channel(256);

    tokio::spawn(async move {
        let mut runs: HashMap<String, PipelineStatus> = HashMap::new();

        while let Some(command) = rx.recv().await {
            match command {
                Command::Register {
                    pipeline_id,
                    target_directory,
                    reply,
                } => {
                    runs.insert(
                        pipeline_id.clone(),
                        PipelineStatus {
                            pipeline_id,
                            target_directory,
                            state: RunState::Running,
                            counters: PhaseCounters::default(),
                            last_error: None,
                        },
                    );
                    let _ = reply.send(());
                }
                Command::Increment {
                    pipeline_id,
                    field,
                    by,
                } => {
                    if let Some(status) = runs.get_mut(&pipeline_id) {
                        let counter = match field {
                            CounterField::FilesDiscovered => &mut status.counters.files_discovered,
                            CounterField::FilesAnalyzed => &mut status.counters.files_analyzed,
                            CounterField::DirectoriesResolved => {
                                &mut status.counters.directories_resolved
                            }
                            CounterField::RelationshipsValidated => {
                                &mut status.counters.relationships_validated
                            }
                            CounterField::RelationshipsAccepted => {
                                &mut status.counters.relationships_accepted
                            }
                            CounterField::DeadLetter => &mut status.counters.dead_letter_count,
                        };
                        *counter += by;
                    }
                }
                Command::SetState {
                    pipeline_id,
                    state,
                    last_error,
                } => {
                    if let Some(status) = runs.get_mut(&pipeline_id) {
                        status.state = state;
                        if last_error.is_some() {
                            status.last_error = last_error;
                        }
                    }
                }
                Command::Get { pipeline_id, reply } => {
                    let _ = reply.send(runs.get(&pipeline_id).cloned());
                }
                Command::Stop { pipeline_id, reply } => {
                    if let Some(status) = runs.get_mut(&pipeline_id) {
                        status.state = RunState::Stopping;
                        let _ = reply.send(true);
                    } else {
                        let _ = reply.send(false);
                    }
                }
            }
        }
    });

    RegistryHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_status_roundtrip() {
        let handle = spawn();
        handle.register("run-1".to_string(), "/tmp/repo".to_string()).await;

        let status = handle.status("run-1").await.unwrap();
        assert_eq!(status.state, RunState::Running);
        assert_eq!(status.counters.files_discovered, 0);
    }

    #[tokio::test]
    async fn test_increment_updates_counter() {
        let handle = spawn();
        handle.register("run-1".to_string(), "/tmp/repo".to_string()).await;
        handle.increment("run-1", CounterField::FilesAnalyzed, 3).await;
        handle.increment("run-1", CounterField::FilesAnalyzed, 2).await;

        let status = handle.status("run-1").await.unwrap();
        assert_eq!(status.counters.files_analyzed, 5);
    }

    #[tokio::test]
    async fn test_stop_unknown_pipeline_returns_false() {
        let handle = spawn();
        assert!(!handle.stop("nonexistent").await);
    }

    #[tokio::test]
    async fn test_stop_known_pipeline_sets_stopping_state() {
        let handle = spawn();
        handle.register("run-1".to_string(), "/tmp/repo".to_string()).await;
        assert!(handle.stop("run-1").await);

        let status = handle.status("run-1").await.unwrap();
        assert_eq!(status.state, RunState::Stopping);
    }
}
