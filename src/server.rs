//! TCP echo server over a main/worker reactor split.
//!
//! The main loop owns the listening socket and accepts; each accepted
//! connection is handed to a worker loop chosen round-robin (or kept on
//! the main loop when no workers are configured) and lives there for its
//! whole life. The default message handler echoes its input; applications
//! can replace any of the callbacks before `start`.

use crate::runtime::buffer::Buffer;
use crate::runtime::connection::{
    CloseCallback, Connection, ConnectionCallback, ErrorCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::runtime::event_loop::EventLoop;
use crate::runtime::handler::EventHandler;
use crate::runtime::socket::Socket;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, info, trace, warn};

/// Multi-reactor echo server.
pub struct Server {
    address: String,
    port: u16,
    worker_threads: usize,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    next_worker: AtomicUsize,
    main_loop: Arc<EventLoop>,
    worker_loops: Mutex<Vec<Arc<EventLoop>>>,
    worker_handles: Mutex<Vec<thread::JoinHandle<()>>>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    error_callback: Mutex<Option<ErrorCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
}

impl Server {
    /// Create a server bound-to-be on `address:port` with `worker_threads`
    /// I/O loops (0 keeps everything on the main loop).
    pub fn new(address: &str, port: u16, worker_threads: usize) -> io::Result<Self> {
        let main_loop = Arc::new(EventLoop::new()?);
        info!(address, port, workers = worker_threads, "server created");
        Ok(Self {
            address: address.to_string(),
            port,
            worker_threads,
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            next_worker: AtomicUsize::new(0),
            main_loop,
            worker_loops: Mutex::new(Vec::new()),
            worker_handles: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
        })
    }

    /// Fired on the owning loop once a connection is established.
    pub fn set_connection_callback(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.connection_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Replaces the default echo handler.
    pub fn set_message_callback(
        &self,
        callback: impl Fn(&Arc<Connection>, &mut Buffer) + Send + Sync + 'static,
    ) {
        *self.message_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Fired on the owning loop after the output buffer drains to zero.
    pub fn set_write_complete_callback(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.write_complete_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Observes connection errors; removal still happens afterwards.
    pub fn set_error_callback(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.error_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Observes closes, once per connection, before the map entry goes away.
    pub fn set_close_callback(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.close_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && self.main_loop.is_running()
    }

    /// Bind, listen, spawn the workers, and run the main loop.
    ///
    /// Blocks until [`Server::stop`]. Startup failures are logged and
    /// returned so the process can exit non-zero.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("server already started");
            return Ok(());
        }

        let listener = self.create_listener().map_err(|e| {
            error!(
                address = %self.address,
                port = self.port,
                error = %e,
                "server startup failed"
            );
            e
        })?;
        info!(
            addr = %listener.local_addr_string(),
            "server listening"
        );

        {
            let mut loops = self.worker_loops.lock().unwrap();
            let mut handles = self.worker_handles.lock().unwrap();
            for i in 0..self.worker_threads {
                let worker = Arc::new(EventLoop::new()?);
                let runner = Arc::clone(&worker);
                let handle = thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || {
                        info!("worker thread started");
                        runner.run();
                        info!("worker thread stopped");
                    })?;
                loops.push(worker);
                handles.push(handle);
            }
        }

        let acceptor_handler = Arc::new(EventHandler::new(listener.fd()));
        let weak = Arc::downgrade(self);
        acceptor_handler.set_read_callback(move || {
            if let Some(server) = weak.upgrade() {
                server.accept_new(&listener);
            }
        });
        acceptor_handler.enable_reading();
        self.main_loop.add_handler(acceptor_handler);

        self.main_loop.run();
        Ok(())
    }

    /// Orderly stop: quit every loop, join the worker threads, then
    /// force-close whatever connections remain and clear the map. No user
    /// callback fires after this returns.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping server");

        self.main_loop.stop();
        for worker in self.worker_loops.lock().unwrap().iter() {
            worker.stop();
        }
        let handles = std::mem::take(&mut *self.worker_handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }

        let mut connections = self.connections.lock().unwrap();
        for conn in connections.values() {
            conn.force_close();
        }
        connections.clear();
        info!("server stopped");
    }

    fn create_listener(&self) -> io::Result<Socket> {
        let listener = Socket::new()?;
        listener.set_reuse_address(true)?;
        listener.set_nonblocking(true)?;
        listener.bind(&self.address, self.port)?;
        listener.listen_default()?;
        Ok(listener)
    }

    /// Drain the accept queue, handing each new connection to a worker.
    fn accept_new(self: &Arc<Self>, listener: &Socket) {
        loop {
            match listener.accept() {
                Ok(Some((socket, peer))) => {
                    if let Err(e) = socket.set_nonblocking(true) {
                        error!(peer = %peer, error = %e, "failed to configure accepted socket");
                        continue;
                    }

                    let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    let name = format!("Connection-{id}");
                    let io_loop = self.next_loop();

                    debug!(name = %name, peer = %peer, "accepted connection");
                    let conn = Connection::new(io_loop, socket, name.clone());
                    self.wire_callbacks(&conn);

                    self.connections
                        .lock()
                        .unwrap()
                        .insert(name, Arc::clone(&conn));
                    conn.establish();
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Install message/close/error/write-complete/connection callbacks.
    ///
    /// Must happen synchronously between construction and `establish` so
    /// the first read dispatch already sees them.
    fn wire_callbacks(self: &Arc<Self>, conn: &Arc<Connection>) {
        match self.message_callback.lock().unwrap().clone() {
            Some(callback) => conn.set_message_callback(move |c, b| callback(c, b)),
            None => conn.set_message_callback(default_echo),
        }

        if let Some(callback) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(move |c| callback(c));
        }

        if let Some(callback) = self.connection_callback.lock().unwrap().clone() {
            conn.set_connection_callback(move |c| callback(c));
        }

        let weak = Arc::downgrade(self);
        conn.set_close_callback(move |c| {
            if let Some(server) = weak.upgrade() {
                if let Some(user) = server.close_callback.lock().unwrap().clone() {
                    user(c);
                }
                server.remove_connection(c);
            }
        });

        // The core only reports errors; closing on error is server policy,
        // and level-triggered epoll would spin on a dead fd otherwise.
        let weak = Arc::downgrade(self);
        conn.set_error_callback(move |c| {
            if let Some(server) = weak.upgrade() {
                if let Some(user) = server.error_callback.lock().unwrap().clone() {
                    user(c);
                }
                server.remove_connection(c);
            }
        });
    }

    fn remove_connection(self: &Arc<Self>, conn: &Arc<Connection>) {
        let server = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.main_loop.run_in_loop(move || {
            let removed = server.connections.lock().unwrap().remove(conn.name());
            if removed.is_some() {
                info!(name = %conn.name(), "connection removed");
                conn.destroy();
            }
        });
    }

    fn next_loop(&self) -> Arc<EventLoop> {
        let loops = self.worker_loops.lock().unwrap();
        if loops.is_empty() {
            return Arc::clone(&self.main_loop);
        }
        let index = self.next_worker.fetch_add(1, Ordering::SeqCst) % loops.len();
        Arc::clone(&loops[index])
    }
}

/// Default application handler: echo the input back unchanged.
fn default_echo(conn: &Arc<Connection>, buffer: &mut Buffer) {
    let message = buffer.retrieve_all_as_bytes();
    trace!(name = %conn.name(), bytes = message.len(), "echoing");
    conn.send(message);
}
