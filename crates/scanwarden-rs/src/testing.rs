//! Test doubles shared by the unit tests.

use std::{
    path::PathBuf,
    sync::{atomic::AtomicUsize, atomic::Ordering, Arc},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    notify::{Delivery, Notifier, NotifyError},
    runner::{Invocation, OutputSink, ProcessOutcome, ProcessRunner, RunnerError},
};

pub const SAMPLE: &str = include_str!("../fixtures/nuclei_results.json");

pub enum Script {
    Exit {
        code: i32,
        log: &'static str,
        results: Option<&'static str>,
    },
    BlockUntilCancelled,
    TransientSpawnFailure,
}

/// Plays back a scripted outcome instead of spawning a process. Results
/// are written to the path following `-output`.
pub struct FakeRunner {
    pub calls: AtomicUsize,
    script: Box<dyn Fn(&Invocation, usize) -> Script + Send + Sync>,
}

impl FakeRunner {
    pub fn new(script: impl Fn(&Invocation, usize) -> Script + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Box::new(script),
        })
    }

    pub fn succeeding(results: &'static str) -> Arc<Self> {
        Self::new(move |_, _| Script::Exit {
            code: 0,
            log: "",
            results: Some(results),
        })
    }
}

fn output_arg(inv: &Invocation) -> PathBuf {
    let pos = inv
        .args
        .iter()
        .position(|a| a == "-output")
        .expect("invocation has an -output flag");
    PathBuf::from(&inv.args[pos + 1])
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<ProcessOutcome, RunnerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match (self.script)(invocation, call) {
            Script::Exit { code, log, results } => {
                sink.write_chunk(log.as_bytes()).await?;
                if let Some(results) = results {
                    tokio::fs::write(output_arg(invocation), results).await?;
                }
                Ok(ProcessOutcome {
                    exit_code: Some(code),
                    killed: false,
                    timed_out: false,
                    output_tail: log.to_string(),
                })
            }
            Script::BlockUntilCancelled => {
                sink.write_chunk(b"started\n").await?;
                cancel.cancelled().await;
                Ok(ProcessOutcome {
                    exit_code: None,
                    killed: true,
                    timed_out: false,
                    output_tail: String::new(),
                })
            }
            Script::TransientSpawnFailure => Err(RunnerError::Spawn {
                binary: invocation.binary.clone(),
                source: std::io::Error::new(std::io::ErrorKind::WouldBlock, "try again"),
            }),
        }
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) -> Result<Delivery, NotifyError> {
        self.messages.lock().push(message.to_string());
        Ok(Delivery::Sent)
    }
}
