//! Fixed-size compute thread pool with a bounded task queue.
//!
//! Keeps blocking or CPU-heavy work off the I/O threads: the server's
//! message callback pushes a task here, a compute thread runs it, and the
//! result re-enters the owning event loop through `Connection::send`.
//! The queue is bounded so a slow consumer applies back-pressure to the
//! producer instead of growing without limit.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

type Task = Box<dyn FnOnce() + Send>;

struct QueueState {
    tasks: VecDeque<Task>,
    open: bool,
}

/// Bounded MPMC task queue: `push` blocks when full, `pop` blocks when
/// empty and returns `None` once the queue is draining for shutdown.
struct TaskQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl TaskQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::with_capacity(capacity),
                open: true,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn push(&self, task: Task) {
        let mut state = self.state.lock().unwrap();
        while state.tasks.len() == self.capacity && state.open {
            state = self.not_full.wait(state).unwrap();
        }
        state.tasks.push_back(task);
        self.not_empty.notify_one();
    }

    fn pop(&self) -> Option<Task> {
        let mut state = self.state.lock().unwrap();
        while state.tasks.is_empty() && state.open {
            state = self.not_empty.wait(state).unwrap();
        }
        let task = state.tasks.pop_front();
        if task.is_some() {
            self.not_full.notify_one();
        }
        task
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    /// Mark the queue draining and release every blocked thread.
    fn wakeup(&self) {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// Fixed pool of named compute threads over a [`TaskQueue`].
pub struct ThreadPool {
    queue: Arc<TaskQueue>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    thread_count: usize,
}

impl ThreadPool {
    pub fn new(thread_count: usize, queue_capacity: usize) -> Self {
        Self {
            queue: Arc::new(TaskQueue::new(queue_capacity)),
            workers: Mutex::new(Vec::new()),
            thread_count,
        }
    }

    /// Spawn the compute threads.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap();
        for i in 0..self.thread_count {
            let queue = Arc::clone(&self.queue);
            let handle = thread::Builder::new()
                .name(format!("compute-{i}"))
                .spawn(move || {
                    debug!("compute thread started");
                    while let Some(task) = queue.pop() {
                        task();
                    }
                    debug!("compute thread stopped");
                })
                .expect("failed to spawn compute thread");
            workers.push(handle);
        }
        info!(threads = self.thread_count, "compute pool started");
    }

    /// Submit a task; blocks while the queue is full.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.queue.push(Box::new(task));
    }

    /// Wait for queued work to drain, then stop and join every thread.
    pub fn stop(&self) {
        while self.queue.len() > 0 {
            thread::sleep(Duration::from_millis(20));
        }
        self.queue.wakeup();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.join();
        }
        info!("compute pool stopped");
    }
}
