//! Connection lifecycle.
//!
//! A [`Connection`] owns one link and runs two tasks over it:
//!
//! ```text
//!              ┌─► writer task: SendPipeline::drain ◄── request_write
//! Connection ──┤
//!              └─► reader task: ReceivePipeline::run ◄── suspend/resume
//! ```
//!
//! States move `Created → Connecting → Started → Closing → Closed`. Every
//! failure goes through one path that reports to the observer at most once
//! and never after a local close.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::buffer::BufferPool;
use crate::cancel::CancelToken;
use crate::config::LinkConfig;
use crate::error::{Result, WireError, DISCONNECTED};
use crate::flow::ReadGate;
use crate::receive::ReceivePipeline;
use crate::send::SendPipeline;
use crate::session::Session;
use crate::transport::{Address, Link, Transport};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connecting.
    Created,
    /// Transport connect in progress.
    Connecting,
    /// Pipelines running.
    Started,
    /// Close requested, pipelines stopping.
    Closing,
    /// Pipelines stopped.
    Closed,
}

/// Receives connection events; implemented by the remote endpoint.
pub trait ConnectionObserver: Send + Sync {
    /// The transport connected. Returning `false` rejects the connection,
    /// which is then closed without starting.
    fn on_connection(&self, connection: &Arc<Connection>) -> bool;

    /// The connection failed. Called at most once per connection.
    fn on_error(&self, connection: &Connection, message: &str, is_fatal: bool);

    /// The session reported it has caught up with the peer.
    fn on_caught_up(&self, _connection: &Connection) {}

    /// The connection reached `Closed`, whatever the cause.
    fn on_closed(&self, _connection: &Connection) {}
}

/// One link plus its send and receive pipelines.
pub struct Connection {
    id: u64,
    address: Option<Address>,
    pool: Arc<BufferPool>,
    config: LinkConfig,
    session: Arc<dyn Session>,
    observer: Option<Weak<dyn ConnectionObserver>>,
    state: Mutex<ConnectionState>,
    /// Set once the error path has reported.
    reported: AtomicBool,
    /// Fired by `close`; stops both tasks.
    closing: CancelToken,
    /// Fired once the connection reaches `Closed`.
    closed: CancelToken,
    write_requested: Notify,
    gate: ReadGate,
    live_tasks: AtomicUsize,
}

impl Connection {
    pub(crate) fn new(
        address: Option<Address>,
        session: Arc<dyn Session>,
        pool: Arc<BufferPool>,
        config: LinkConfig,
        observer: Option<Weak<dyn ConnectionObserver>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address,
            pool,
            config,
            session,
            observer,
            state: Mutex::new(ConnectionState::Created),
            reported: AtomicBool::new(false),
            closing: CancelToken::new(),
            closed: CancelToken::new(),
            write_requested: Notify::new(),
            gate: ReadGate::new(),
            live_tasks: AtomicUsize::new(0),
        })
    }

    /// Connect to `address` and start, without a remote endpoint.
    pub async fn open(
        transport: &dyn Transport,
        address: Address,
        session: Arc<dyn Session>,
        pool: Arc<BufferPool>,
        config: LinkConfig,
    ) -> Result<Arc<Self>> {
        config.validate_for_pool(&pool)?;
        let connection = Self::new(Some(address), session, pool, config, None);
        connection.connect(transport, &CancelToken::new()).await?;
        Ok(connection)
    }

    /// Start over an already established link (e.g. from a listener).
    pub fn accept(
        link: Link,
        session: Arc<dyn Session>,
        pool: Arc<BufferPool>,
        config: LinkConfig,
    ) -> Result<Arc<Self>> {
        config.validate_for_pool(&pool)?;
        let connection = Self::new(None, session, pool, config, None);
        connection.launch(link)?;
        Ok(connection)
    }

    /// Run the transport connect, notify the observer and start.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        transport: &dyn Transport,
        cancel: &CancelToken,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Created {
                return Err(WireError::InvalidState(format!(
                    "connect in state {:?}",
                    *state
                )));
            }
            *state = ConnectionState::Connecting;
        }

        let Some(address) = self.address.as_ref() else {
            self.abandon();
            return Err(WireError::InvalidState("connect without address".into()));
        };
        debug!(connection = self.id, %address, "Connecting");

        let timeout = self.config.connect_timeout();
        let result = tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(WireError::Cancelled),
            r = tokio::time::timeout(timeout, transport.connect(address, cancel)) => {
                r.unwrap_or(Err(WireError::ConnectTimeout))
            }
        };

        let link = match result {
            Ok(link) => link,
            Err(e) => {
                debug!(connection = self.id, %address, error = %e, "Connect failed");
                self.abandon();
                return Err(e);
            }
        };

        if let Some(weak) = &self.observer {
            let accepted = weak
                .upgrade()
                .map_or(false, |observer| observer.on_connection(self));
            if !accepted {
                debug!(connection = self.id, "Connection rejected by observer");
                self.abandon();
                return Err(WireError::Cancelled);
            }
        }

        self.launch(link)
    }

    /// Mark `Started`, fire `on_started` and spawn both pipeline tasks.
    fn launch(self: &Arc<Self>, link: Link) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Created | ConnectionState::Connecting => {
                    *state = ConnectionState::Started;
                }
                other => {
                    return Err(WireError::InvalidState(format!(
                        "launch in state {:?}",
                        other
                    )));
                }
            }
        }

        let Link { sender, receiver } = link;
        let send = SendPipeline::new(sender, self.pool.clone(), self.config.max_drain_bytes);
        let receive = ReceivePipeline::new(
            receiver,
            self.pool.clone(),
            self.config.header_reserve,
            self.gate.clone(),
        );

        self.live_tasks.store(2, Ordering::Release);
        debug!(connection = self.id, "Connection started");
        self.session.on_started(self.handle());

        tokio::spawn(self.clone().write_loop(send));
        tokio::spawn(self.clone().read_loop(receive));
        Ok(())
    }

    async fn write_loop(self: Arc<Self>, mut pipeline: SendPipeline) {
        let writes = AssertUnwindSafe(self.drive_writes(&mut pipeline)).catch_unwind();
        let result = tokio::select! {
            biased;
            _ = self.closing.cancelled() => Ok(()),
            r = writes => r.unwrap_or_else(|payload| Err(session_panicked(payload))),
        };

        if let Err(e) = result {
            self.fail(&e.to_string());
        }

        match tokio::time::timeout(self.config.connect_timeout(), pipeline.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connection = self.id, error = %e, "Send close failed"),
            Err(_) => {
                pipeline.release();
                debug!(connection = self.id, "Send close timed out");
            }
        }
        drop(pipeline);
        self.task_exited();
    }

    async fn drive_writes(&self, pipeline: &mut SendPipeline) -> Result<()> {
        loop {
            pipeline.drain(&*self.session).await?;
            self.write_requested.notified().await;
        }
    }

    async fn read_loop(self: Arc<Self>, mut pipeline: ReceivePipeline) {
        let reads = AssertUnwindSafe(pipeline.run(&*self.session)).catch_unwind();
        let result = tokio::select! {
            biased;
            _ = self.closing.cancelled() => None,
            r = reads => Some(r.unwrap_or_else(|payload| Err(session_panicked(payload)))),
        };
        pipeline.release();

        match result {
            Some(Ok(())) => self.fail(DISCONNECTED),
            Some(Err(e)) => self.fail(&e.to_string()),
            None => {}
        }

        drop(pipeline);
        self.task_exited();
    }

    /// Single error path: report once, then close.
    fn fail(&self, message: &str) {
        if matches!(
            *self.state.lock(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }
        if self.reported.swap(true, Ordering::AcqRel) {
            return;
        }

        warn!(connection = self.id, error = message, "Connection failed");
        if let Some(observer) = self.observer() {
            observer.on_error(self, message, true);
        }
        self.close();
    }

    fn task_exited(&self) {
        if self.live_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            *self.state.lock() = ConnectionState::Closed;
            debug!(connection = self.id, "Connection closed");
            self.session.on_closed();
            if let Some(observer) = self.observer() {
                observer.on_closed(self);
            }
            self.closed.cancel();
        }
    }

    /// Close before the pipelines ever started.
    fn abandon(&self) {
        *self.state.lock() = ConnectionState::Closed;
        self.closing.cancel();
        self.closed.cancel();
    }

    /// Close the connection.
    ///
    /// Stops both pipelines and closes the send direction; the state reaches
    /// `Closed` once both tasks exit. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        let current = *state;
        match current {
            ConnectionState::Closing | ConnectionState::Closed => {}
            ConnectionState::Created | ConnectionState::Connecting => {
                *state = ConnectionState::Closed;
                drop(state);
                self.closing.cancel();
                self.closed.cancel();
            }
            ConnectionState::Started => {
                *state = ConnectionState::Closing;
                drop(state);
                debug!(connection = self.id, "Closing connection");
                self.closing.cancel();
            }
        }
    }

    /// Wait until the connection is `Closed`.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Ask the writer to run another drain cycle.
    pub fn request_write(&self) {
        self.write_requested.notify_one();
    }

    /// Pause the receive pump after the in-flight receive.
    pub fn suspend_read(&self) {
        if self.gate.suspend() {
            debug!(connection = self.id, "Reads suspended");
        }
    }

    /// Resume the receive pump.
    pub fn resume_read(&self) {
        if self.gate.resume() {
            debug!(connection = self.id, "Reads resumed");
        }
    }

    /// Whether reads are suspended.
    pub fn is_read_suspended(&self) -> bool {
        self.gate.is_suspended()
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address (`None` for accepted connections).
    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether the pipelines are running.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Started
    }

    /// Buffer pool used by this connection.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Weak handle for the session.
    pub fn handle(self: &Arc<Self>) -> ConnectionHandle {
        ConnectionHandle {
            inner: Arc::downgrade(self),
        }
    }

    fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.observer.as_ref().and_then(Weak::upgrade)
    }
}

/// Turn a panic caught in a pipeline task into a fatal error.
fn session_panicked(payload: Box<dyn Any + Send>) -> WireError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    WireError::Protocol(format!("session panicked: {}", detail))
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Weak handle a session uses to drive its connection.
///
/// Operations on a dropped connection are no-ops.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    inner: Weak<Connection>,
}

impl ConnectionHandle {
    fn with<F: FnOnce(&Arc<Connection>)>(&self, f: F) {
        if let Some(connection) = self.inner.upgrade() {
            f(&connection);
        }
    }

    /// Ask for another drain cycle.
    pub fn request_write(&self) {
        self.with(|c| c.request_write());
    }

    /// Pause reads.
    pub fn suspend_read(&self) {
        self.with(|c| c.suspend_read());
    }

    /// Resume reads.
    pub fn resume_read(&self) {
        self.with(|c| c.resume_read());
    }

    /// Report that the session has caught up with the peer.
    pub fn caught_up(&self) {
        self.with(|c| {
            if let Some(observer) = c.observer() {
                observer.on_caught_up(c);
            }
        });
    }

    /// Close the connection.
    pub fn close(&self) {
        self.with(|c| c.close());
    }

    /// Connection id, if the connection still exists.
    pub fn id(&self) -> Option<u64> {
        self.inner.upgrade().map(|c| c.id())
    }

    /// Whether the connection still exists and is started.
    pub fn is_open(&self) -> bool {
        self.inner.upgrade().map_or(false, |c| c.is_open())
    }
}
