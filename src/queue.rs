use crate::error::{Error, Result};
use crate::path::PathBuf;
use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Identifier of an enqueued operation, handed back by `submit` and
/// redeemed by `wait`.
pub type OpId = u64;

/// An operation waiting on the write queue. Authorization happens at
/// submission, so the worker only runs the storage path.
#[derive(Debug)]
pub enum QueuedWrite {
    Set { path: PathBuf, value: Value },
    Delete { path: PathBuf },
}

/// Operations drained per worker wakeup.
const BATCH: usize = 100;

struct State {
    queue: VecDeque<(OpId, QueuedWrite)>,
    done: HashMap<OpId, Result<()>>,
    next_id: OpId,
    shutdown: bool,
    /// Set by the worker once it has executed everything and exited.
    drained: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// Asynchronous write pipeline: a FIFO drained in batches by a single
/// worker thread, which preserves submission order per path, plus a
/// completion map polled by [`WriteQueue::wait`].
pub struct WriteQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl WriteQueue {
    /// Spawns the worker; `exec` runs each drained operation.
    pub fn new(exec: impl Fn(&QueuedWrite) -> Result<()> + Send + 'static) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                done: HashMap::new(),
                next_id: 1,
                shutdown: false,
                drained: false,
            }),
            cond: Condvar::new(),
        });
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("elkyn-writes".into())
                .spawn(move || worker(&shared, exec))
                .expect("spawning the write worker")
        };
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Enqueues an operation and returns its id.
    pub fn submit(&self, op: QueuedWrite) -> Result<OpId> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::QueueClosed);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.queue.push_back((id, op));
        self.shared.cond.notify_one();
        Ok(id)
    }

    /// Polls until the operation's outcome is recorded, then consumes
    /// and returns it.
    pub fn wait(&self, id: OpId) -> Result<()> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if let Some(outcome) = state.done.remove(&id) {
                    return outcome;
                }
                // the worker drains the queue before exiting, so an
                // outcome can still arrive after shutdown
                if state.drained {
                    return Err(Error::QueueClosed);
                }
            }
            thread::sleep(Duration::from_micros(500));
        }
    }

}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

fn worker(shared: &Shared, exec: impl Fn(&QueuedWrite) -> Result<()>) {
    loop {
        let batch: Vec<(OpId, QueuedWrite)> = {
            let mut state = shared.state.lock();
            while state.queue.is_empty() && !state.shutdown {
                shared.cond.wait(&mut state);
            }
            if state.queue.is_empty() && state.shutdown {
                state.drained = true;
                return;
            }
            let n = state.queue.len().min(BATCH);
            state.queue.drain(..n).collect()
        };
        let outcomes: Vec<(OpId, Result<()>)> = batch
            .iter()
            .map(|(id, op)| {
                let outcome = exec(op);
                if let Err(err) = &outcome {
                    tracing::debug!("queued write {} failed: {}", id, err);
                }
                (*id, outcome)
            })
            .collect();
        let mut state = shared.state.lock();
        for (id, outcome) in outcomes {
            state.done.insert(id, outcome);
        }
    }
}
