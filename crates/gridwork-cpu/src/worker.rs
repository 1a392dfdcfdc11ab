//! Stream worker threads.
//!
//! Every stream is a thread draining an unbounded command channel, so commands
//! run strictly in submission order. The submitting side counts commands, the
//! worker counts completions. A stream is drained when both counts agree, and
//! a synchronize returns once completions reach the count it started from.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{error, trace, warn};

use gridwork_core::device::{DeviceOp, StreamId};
use gridwork_core::error::{GridworkError, Result};

use crate::event::EventState;

pub(crate) enum Command {
    Op(DeviceOp),
    Record {
        event: Arc<EventState>,
        generation: u64,
    },
    Wait {
        event: Arc<EventState>,
        generation: u64,
    },
}

#[derive(Debug, Default)]
struct ProgressState {
    submitted: u64,
    completed: u64,
    fault: Option<String>,
}

#[derive(Debug, Default)]
struct Progress {
    state: Mutex<ProgressState>,
    drained: Condvar,
}

/// One stream: a command channel and the thread executing it.
pub(crate) struct StreamWorker {
    id: StreamId,
    sender: Option<Sender<Command>>,
    progress: Arc<Progress>,
    thread: Option<JoinHandle<()>>,
}

impl StreamWorker {
    pub(crate) fn spawn(id: StreamId, name: String, compute: Arc<ThreadPool>) -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let progress = Arc::new(Progress::default());

        let thread = {
            let progress = Arc::clone(&progress);
            thread::Builder::new()
                .name(name)
                .spawn(move || run(id, receiver, progress, compute))
                .map_err(|e| GridworkError::StreamCreation(e.to_string()))?
        };

        Ok(Self {
            id,
            sender: Some(sender),
            progress,
            thread: Some(thread),
        })
    }

    pub(crate) fn submit(&self, command: Command) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| GridworkError::Launch(format!("{} is shut down", self.id)))?;

        let mut state = self.progress.state.lock();
        state.submitted += 1;
        if sender.send(command).is_err() {
            state.submitted -= 1;
            return Err(GridworkError::Launch(format!(
                "{} worker has exited",
                self.id
            )));
        }
        Ok(())
    }

    /// True when drained. A faulted stream reports its fault instead.
    pub(crate) fn query(&self) -> Result<bool> {
        let state = self.progress.state.lock();
        match &state.fault {
            Some(reason) => Err(GridworkError::DeviceFault(format!("{}: {}", self.id, reason))),
            None => Ok(state.completed == state.submitted),
        }
    }

    /// Block until everything submitted so far has run. Reports a fault once
    /// the stream has been poisoned by a panicking operation.
    pub(crate) fn synchronize(&self) -> Result<()> {
        let mut state = self.progress.state.lock();
        let target = state.submitted;
        while state.completed < target {
            self.progress.drained.wait(&mut state);
        }
        match &state.fault {
            Some(reason) => Err(GridworkError::DeviceFault(format!("{}: {}", self.id, reason))),
            None => Ok(()),
        }
    }

    /// Close the channel and join the thread once queued work has run.
    pub(crate) fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(stream = %self.id, "stream worker terminated abnormally");
            }
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(id: StreamId, receiver: Receiver<Command>, progress: Arc<Progress>, compute: Arc<ThreadPool>) {
    trace!(stream = %id, "stream worker started");

    for command in receiver.iter() {
        match command {
            Command::Op(op) => {
                let poisoned = progress.state.lock().fault.is_some();
                if poisoned {
                    // Dropping the op releases its buffer guards.
                    trace!(stream = %id, kind = op.kind(), "skipping op on faulted stream");
                    drop(op);
                } else if let Err(reason) = execute(op, &compute) {
                    warn!(stream = %id, %reason, "device operation panicked");
                    progress.state.lock().fault = Some(reason);
                }
            }
            Command::Record { event, generation } => {
                trace!(stream = %id, generation, "event reached");
                event.complete(generation);
            }
            Command::Wait { event, generation } => {
                event.wait_for(generation);
            }
        }

        // Waiters target different submission counts; wake them all.
        progress.state.lock().completed += 1;
        progress.drained.notify_all();
    }

    trace!(stream = %id, "stream worker stopped");
}

fn execute(op: DeviceOp, compute: &ThreadPool) -> std::result::Result<(), String> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match op {
        DeviceOp::ForEach { len, body } => {
            compute.install(|| (0..len).into_par_iter().for_each(|n| body(n)));
        }
        DeviceOp::Task(task) => task(),
    }));

    outcome.map_err(|payload| {
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "operation panicked".to_string())
    })
}
