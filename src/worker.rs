use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Task),
    Exit,
}

struct WorkerState {
    running: bool,
    pending: usize,
}

struct Shared {
    rx: Receiver<Command>,
    state: Mutex<WorkerState>,
    drained: Condvar,
    keep_alive: Duration,
}

/// Single-threaded background executor for segment maintenance tasks.
///
/// Tasks run strictly in enqueue order on one thread, which keeps
/// close/unmap/truncate sequencing on the same file deterministic. The
/// thread exits after an idle period and is respawned by the next enqueue.
/// One worker is typically shared across every term log of a process.
pub struct Worker {
    shared: Arc<Shared>,
    tx: Sender<Command>,
}

impl Worker {
    pub fn new(keep_alive: Duration) -> Self {
        let (tx, rx) = unbounded();
        Self {
            shared: Arc::new(Shared {
                rx,
                state: Mutex::new(WorkerState {
                    running: false,
                    pending: 0,
                }),
                drained: Condvar::new(),
                keep_alive,
            }),
            tx,
        }
    }

    /// Enqueues a task, starting the worker thread if it has exited.
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let spawn = {
            let mut state = self.shared.state.lock();
            state.pending += 1;
            let spawn = !state.running;
            if spawn {
                state.running = true;
            }
            spawn
        };

        let _ = self.tx.send(Command::Run(Box::new(task)));

        if spawn {
            Self::spawn_thread(self.shared.clone());
        }
    }

    /// Blocks until every enqueued task has completed.
    ///
    /// With `interrupt` set the worker thread is also asked to exit once
    /// drained; it restarts on the next enqueue.
    pub fn join(&self, interrupt: bool) {
        let mut state = self.shared.state.lock();
        while state.pending > 0 {
            self.shared.drained.wait(&mut state);
        }
        let running = state.running;
        drop(state);
        if interrupt && running {
            let _ = self.tx.send(Command::Exit);
        }
    }

    fn spawn_thread(shared: Arc<Shared>) {
        let _ = thread::Builder::new()
            .name("termlog-worker".to_string())
            .spawn(move || Self::worker_loop(shared));
    }

    fn worker_loop(shared: Arc<Shared>) {
        loop {
            match shared.rx.recv_timeout(shared.keep_alive) {
                Ok(Command::Run(task)) => {
                    task();
                    let mut state = shared.state.lock();
                    state.pending -= 1;
                    if state.pending == 0 {
                        shared.drained.notify_all();
                    }
                }
                Ok(Command::Exit) | Err(RecvTimeoutError::Disconnected) => {
                    shared.state.lock().running = false;
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    let mut state = shared.state.lock();
                    if state.pending == 0 {
                        state.running = false;
                        debug!("worker thread exiting after idle timeout");
                        return;
                    }
                }
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Exit);
    }
}
