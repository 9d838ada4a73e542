//! The reactor: one epoll instance, one thread, one task queue.
//!
//! An `EventLoop` owns an epoll descriptor, an eventfd used to break the
//! wait from other threads, a table mapping descriptors to their handlers,
//! and a queue of tasks posted by other threads. `run()` parks in
//! `epoll_wait`, dispatches readiness to handlers, then drains the task
//! queue; everything that touches loop-owned state from outside the loop
//! thread goes through that queue.

use crate::runtime::handler::EventHandler;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, trace};

/// Idle `epoll_wait` timeout so quit transitions propagate even without
/// traffic. A responsiveness knob, not a correctness requirement.
const POLL_TIMEOUT_MS: i32 = 10_000;

/// Initial scratch event array capacity; doubled whenever the kernel
/// fills it completely.
const INITIAL_EVENT_CAPACITY: usize = 1024;

type Task = Box<dyn FnOnce() + Send>;

/// A single-threaded reactor over Linux epoll.
///
/// The owning thread identity is recorded at [`EventLoop::run`] entry, so a
/// loop may be constructed on one thread and run on another.
pub struct EventLoop {
    epoll_fd: OwnedFd,
    wakeup_fd: OwnedFd,
    handlers: Mutex<HashMap<RawFd, Arc<EventHandler>>>,
    pending_tasks: Mutex<Vec<Task>>,
    draining_tasks: AtomicBool,
    quit: AtomicBool,
    running: AtomicBool,
    thread_id: Mutex<Option<ThreadId>>,
}

impl EventLoop {
    /// Create the epoll instance and the wake-up eventfd, and register the
    /// eventfd for readable events with a handler that drains it on fire.
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(epoll_fd) };

        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wakeup_fd = unsafe { OwnedFd::from_raw_fd(wakeup_fd) };

        let event_loop = Self {
            epoll_fd,
            wakeup_fd,
            handlers: Mutex::new(HashMap::new()),
            pending_tasks: Mutex::new(Vec::new()),
            draining_tasks: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            running: AtomicBool::new(false),
            thread_id: Mutex::new(None),
        };

        let wfd = event_loop.wakeup_fd.as_raw_fd();
        let wakeup_handler = Arc::new(EventHandler::new(wfd));
        wakeup_handler.set_read_callback(move || drain_wakeup(wfd));
        wakeup_handler.enable_reading();
        event_loop.ctl(libc::EPOLL_CTL_ADD, &wakeup_handler)?;
        event_loop
            .handlers
            .lock()
            .unwrap()
            .insert(wfd, wakeup_handler);

        debug!(
            epoll_fd = event_loop.epoll_fd.as_raw_fd(),
            wakeup_fd = wfd,
            "event loop created"
        );
        Ok(event_loop)
    }

    /// Run the reactor on the current thread until [`EventLoop::stop`].
    pub fn run(&self) {
        *self.thread_id.lock().unwrap() = Some(thread::current().id());
        self.quit.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);
        info!("event loop started");

        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENT_CAPACITY];

        while !self.quit.load(Ordering::Acquire) {
            self.poll_once(&mut events, POLL_TIMEOUT_MS);
            self.drain_pending_tasks();
        }

        self.running.store(false, Ordering::Release);
        info!("event loop stopped");
    }

    /// Request the loop to exit; wakes it when called from another thread.
    pub fn stop(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the caller is the thread that entered [`EventLoop::run`].
    pub fn is_in_loop_thread(&self) -> bool {
        self.thread_id
            .lock()
            .unwrap()
            .map_or(false, |id| id == thread::current().id())
    }

    /// Run `task` on the loop thread: synchronously when already there,
    /// otherwise via the pending queue plus a wake-up.
    pub fn run_in_loop(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always defer `task` to a later loop turn, never inline.
    ///
    /// Wakes the loop when called off-thread, and also when called while
    /// the loop is mid-drain so the task does not wait out the idle
    /// timeout.
    pub fn queue_in_loop(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.pending_tasks.lock().unwrap();
            pending.push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.draining_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Register a handler (`EPOLL_CTL_ADD`); re-enqueued onto the loop
    /// thread when called from elsewhere.
    pub fn add_handler(self: &Arc<Self>, handler: Arc<EventHandler>) {
        if self.is_in_loop_thread() {
            self.add_handler_in_loop(&handler);
        } else {
            let event_loop = Arc::clone(self);
            self.queue_in_loop(move || event_loop.add_handler_in_loop(&handler));
        }
    }

    /// Commit a handler's interest mask to epoll (`EPOLL_CTL_MOD`).
    pub fn update_handler(self: &Arc<Self>, handler: Arc<EventHandler>) {
        if self.is_in_loop_thread() {
            self.update_handler_in_loop(&handler);
        } else {
            let event_loop = Arc::clone(self);
            self.queue_in_loop(move || event_loop.update_handler_in_loop(&handler));
        }
    }

    /// Unregister a handler (`EPOLL_CTL_DEL`).
    ///
    /// Serialised through the loop thread so removal cannot race dispatch;
    /// removing an already-removed handler is a no-op on the table.
    pub fn remove_handler(self: &Arc<Self>, handler: Arc<EventHandler>) {
        if self.is_in_loop_thread() {
            self.remove_handler_in_loop(&handler);
        } else {
            let event_loop = Arc::clone(self);
            self.queue_in_loop(move || event_loop.remove_handler_in_loop(&handler));
        }
    }

    fn add_handler_in_loop(&self, handler: &Arc<EventHandler>) {
        let fd = handler.fd();
        if let Err(e) = self.ctl(libc::EPOLL_CTL_ADD, handler) {
            error!(fd, error = %e, "epoll_ctl ADD failed");
            return;
        }
        self.handlers.lock().unwrap().insert(fd, Arc::clone(handler));
        trace!(fd, "handler added");
    }

    fn update_handler_in_loop(&self, handler: &Arc<EventHandler>) {
        let fd = handler.fd();
        if let Err(e) = self.ctl(libc::EPOLL_CTL_MOD, handler) {
            error!(fd, error = %e, "epoll_ctl MOD failed");
            return;
        }
        trace!(fd, events = handler.events(), "handler updated");
    }

    fn remove_handler_in_loop(&self, handler: &Arc<EventHandler>) {
        let fd = handler.fd();
        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll_fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            error!(fd, error = %io::Error::last_os_error(), "epoll_ctl DEL failed");
            return;
        }
        self.handlers.lock().unwrap().remove(&fd);
        trace!(fd, "handler removed");
    }

    fn ctl(&self, op: libc::c_int, handler: &Arc<EventHandler>) -> io::Result<()> {
        let fd = handler.fd();
        let mut event = libc::epoll_event {
            events: handler.events(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn poll_once(&self, events: &mut Vec<libc::epoll_event>, timeout_ms: i32) {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                error!(error = %err, "epoll_wait failed");
            }
            return;
        }

        let n = n as usize;
        if n > 0 {
            trace!(count = n, "events ready");
        }

        for i in 0..n {
            let fd = events[i].u64 as RawFd;
            let revents = events[i].events;
            // The handler may have been removed between kernel notification
            // and dispatch; a missing entry is silently ignored.
            let handler = self.handlers.lock().unwrap().get(&fd).cloned();
            if let Some(handler) = handler {
                handler.handle_events(revents);
            }
        }

        if n == events.len() {
            events.resize(n * 2, libc::epoll_event { events: 0, u64: 0 });
        }
    }

    fn drain_pending_tasks(&self) {
        let tasks = std::mem::take(&mut *self.pending_tasks.lock().unwrap());
        if tasks.is_empty() {
            return;
        }
        // Tasks run outside the mutex; anything enqueued meanwhile is
        // deferred to the next iteration.
        self.draining_tasks.store(true, Ordering::Release);
        for task in tasks {
            task();
        }
        self.draining_tasks.store(false, Ordering::Release);
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            error!(written = n, "wakeup write was not 8 bytes");
        }
    }
}

fn drain_wakeup(fd: RawFd) {
    let mut value: u64 = 0;
    let n = unsafe {
        libc::read(
            fd,
            &mut value as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if n != std::mem::size_of::<u64>() as isize {
        error!(read = n, "wakeup drain was not 8 bytes");
    }
}
