//! Event handler: the unit of registration with an event loop.
//!
//! An `EventHandler` ties a descriptor to an interest mask and four
//! callbacks. The mask is edited in memory only; committing it to epoll is
//! the event loop's job, so after any `add`/`update` the mask mirrors the
//! kernel's view.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

const EVENT_READ: u32 = libc::EPOLLIN as u32;
const EVENT_WRITE: u32 = libc::EPOLLOUT as u32;
const EVENT_ERROR: u32 = libc::EPOLLERR as u32;
const EVENT_HANGUP: u32 = libc::EPOLLHUP as u32;
const EVENT_PRIORITY: u32 = libc::EPOLLPRI as u32;
const EVENT_PEER_SHUTDOWN: u32 = libc::EPOLLRDHUP as u32;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Descriptor plus interest mask plus read/write/error/close callbacks.
///
/// Shared between its owning connection (or the server, for the listener)
/// and the event loop's handler table. The descriptor is a non-owning
/// reference; whoever owns the socket keeps it alive at least until the
/// handler's last removal from the loop.
pub struct EventHandler {
    fd: RawFd,
    events: AtomicU32,
    read_callback: Mutex<Option<Callback>>,
    write_callback: Mutex<Option<Callback>>,
    error_callback: Mutex<Option<Callback>>,
    close_callback: Mutex<Option<Callback>>,
}

impl EventHandler {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            events: AtomicU32::new(0),
            read_callback: Mutex::new(None),
            write_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Current interest mask as raw epoll bits.
    pub fn events(&self) -> u32 {
        self.events.load(Ordering::Acquire)
    }

    pub fn set_read_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.read_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_write_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.write_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.error_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_close_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.close_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn enable_reading(&self) {
        self.events.fetch_or(EVENT_READ, Ordering::AcqRel);
    }

    pub fn enable_writing(&self) {
        self.events.fetch_or(EVENT_WRITE, Ordering::AcqRel);
    }

    pub fn disable_writing(&self) {
        self.events.fetch_and(!EVENT_WRITE, Ordering::AcqRel);
    }

    pub fn disable_all(&self) {
        self.events.store(0, Ordering::Release);
    }

    pub fn is_writing(&self) -> bool {
        self.events() & EVENT_WRITE != 0
    }

    pub fn is_none_event(&self) -> bool {
        self.events() == 0
    }

    /// Dispatch one delivered event mask.
    ///
    /// Branch order is fixed; each enabled branch runs at most once:
    /// 1. hang-up without readable runs the close callback and stops,
    /// 2. error runs the error callback,
    /// 3. readable / priority / peer-shutdown runs the read callback,
    /// 4. writable runs the write callback.
    pub fn handle_events(&self, revents: u32) {
        if revents & EVENT_HANGUP != 0 && revents & EVENT_READ == 0 {
            self.invoke(&self.close_callback);
            return;
        }

        if revents & EVENT_ERROR != 0 {
            self.invoke(&self.error_callback);
        }

        if revents & (EVENT_READ | EVENT_PRIORITY | EVENT_PEER_SHUTDOWN) != 0 {
            self.invoke(&self.read_callback);
        }

        if revents & EVENT_WRITE != 0 {
            self.invoke(&self.write_callback);
        }
    }

    fn invoke(&self, slot: &Mutex<Option<Callback>>) {
        // Clone out of the slot so user code never runs under the lock.
        let callback = slot.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler() -> (Arc<EventHandler>, [Arc<AtomicUsize>; 4]) {
        let handler = Arc::new(EventHandler::new(0));
        let counters: [Arc<AtomicUsize>; 4] = Default::default();

        let c = Arc::clone(&counters[0]);
        handler.set_read_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&counters[1]);
        handler.set_write_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&counters[2]);
        handler.set_error_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&counters[3]);
        handler.set_close_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        (handler, counters)
    }

    fn counts(counters: &[Arc<AtomicUsize>; 4]) -> [usize; 4] {
        [
            counters[0].load(Ordering::SeqCst),
            counters[1].load(Ordering::SeqCst),
            counters[2].load(Ordering::SeqCst),
            counters[3].load(Ordering::SeqCst),
        ]
    }

    #[test]
    fn test_interest_mask_editing() {
        let handler = EventHandler::new(5);
        assert!(handler.is_none_event());

        handler.enable_reading();
        assert_eq!(handler.events(), EVENT_READ);

        handler.enable_writing();
        assert!(handler.is_writing());
        assert_eq!(handler.events(), EVENT_READ | EVENT_WRITE);

        handler.disable_writing();
        assert!(!handler.is_writing());
        assert_eq!(handler.events(), EVENT_READ);

        handler.disable_all();
        assert!(handler.is_none_event());
    }

    #[test]
    fn test_hangup_without_readable_closes_only() {
        let (handler, counters) = counting_handler();
        handler.handle_events(EVENT_HANGUP | EVENT_ERROR | EVENT_WRITE);
        // Close short-circuits every other branch.
        assert_eq!(counts(&counters), [0, 0, 0, 1]);
    }

    #[test]
    fn test_hangup_with_readable_reads() {
        let (handler, counters) = counting_handler();
        handler.handle_events(EVENT_HANGUP | EVENT_READ);
        assert_eq!(counts(&counters), [1, 0, 0, 0]);
    }

    #[test]
    fn test_error_then_read_then_write() {
        let (handler, counters) = counting_handler();
        handler.handle_events(EVENT_ERROR | EVENT_READ | EVENT_WRITE);
        assert_eq!(counts(&counters), [1, 1, 1, 0]);
    }

    #[test]
    fn test_peer_shutdown_and_priority_hit_read() {
        let (handler, counters) = counting_handler();
        handler.handle_events(EVENT_PEER_SHUTDOWN);
        handler.handle_events(EVENT_PRIORITY);
        assert_eq!(counts(&counters), [2, 0, 0, 0]);
    }

    #[test]
    fn test_missing_callback_is_ignored() {
        let handler = EventHandler::new(1);
        // No callbacks installed: dispatch must be a no-op, not a panic.
        handler.handle_events(EVENT_READ | EVENT_WRITE | EVENT_ERROR | EVENT_HANGUP);
    }
}
