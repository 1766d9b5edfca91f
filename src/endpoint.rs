//! Remote endpoint: connect, retry and status tracking for one address.
//!
//! ```text
//! DISCONNECTED ──start──► CONNECTING ──success──► SYNCHRONIZING ──caught up──► UP_TO_DATE
//!                            ▲   │
//!                     timer  │   │ failure
//!                            │   ▼
//!                        WAITING_RETRY ◄──────── error (any state)
//! ```
//!
//! Each connect runs as a cancellable attempt. An attempt only installs its
//! connection if its token is still live when checked under the endpoint
//! lock, so a cancelled attempt's late completion never changes the
//! endpoint.
//!
//! # Example
//!
//! ```ignore
//! use objwire::{Address, LinkConfig, RemoteEndpoint, Status};
//!
//! let endpoint = RemoteEndpoint::new(address, factory, LinkConfig::default())?;
//! let mut status = endpoint.subscribe();
//! endpoint.start();
//! while *status.borrow_and_update() != Status::UpToDate {
//!     status.changed().await?;
//! }
//! ```

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::cancel::CancelToken;
use crate::config::LinkConfig;
use crate::connection::{Connection, ConnectionObserver};
use crate::error::{Result, WireError};
use crate::session::SessionFactory;
use crate::transport::{Address, DefaultTransport, Transport};

/// Endpoint status as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Not running.
    Disconnected,
    /// An attempt is connecting.
    Connecting,
    /// Waiting for the backoff timer before the next attempt.
    WaitingRetry,
    /// Connected; the session is catching up.
    Synchronizing,
    /// Connected and caught up.
    UpToDate,
}

impl Status {
    /// Upper-case status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Disconnected => "DISCONNECTED",
            Status::Connecting => "CONNECTING",
            Status::WaitingRetry => "WAITING_RETRY",
            Status::Synchronizing => "SYNCHRONIZING",
            Status::UpToDate => "UP_TO_DATE",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attempt in progress.
struct AttemptSlot {
    id: u64,
    cancel: CancelToken,
    /// Set once the attempt task has built its connection.
    connection_id: Option<u64>,
}

/// The live connection and the attempt that produced it.
struct Installed {
    connection: Arc<Connection>,
    attempt_id: u64,
    cancel: CancelToken,
}

#[derive(Default)]
struct EndpointState {
    running: bool,
    next_attempt_id: u64,
    attempt: Option<AttemptSlot>,
    installed: Option<Installed>,
    retry: Option<CancelToken>,
    /// Consecutive failed attempts or lost connections.
    failures: u32,
}

struct EndpointInner {
    me: Weak<EndpointInner>,
    address: Address,
    factory: Arc<dyn SessionFactory>,
    transport: Arc<dyn Transport>,
    pool: Arc<BufferPool>,
    config: LinkConfig,
    status: watch::Sender<Status>,
    state: Mutex<EndpointState>,
}

/// Keeps one connection to a remote address alive.
///
/// Dropping the endpoint stops it: the attempt and retry timer are cancelled
/// and any connection is closed.
pub struct RemoteEndpoint {
    inner: Arc<EndpointInner>,
}

impl RemoteEndpoint {
    /// Create an endpoint using the scheme's default transport and its own
    /// buffer pool.
    pub fn new<F: SessionFactory>(address: Address, factory: F, config: LinkConfig) -> Result<Self> {
        let pool = Arc::new(BufferPool::with_max_idle(
            config.buffer_capacity,
            config.max_idle_buffers,
        ));
        Self::with_parts(
            address,
            Arc::new(factory),
            Arc::new(DefaultTransport),
            pool,
            config,
        )
    }

    /// Create an endpoint with an explicit transport and a shared pool.
    pub fn with_parts(
        address: Address,
        factory: Arc<dyn SessionFactory>,
        transport: Arc<dyn Transport>,
        pool: Arc<BufferPool>,
        config: LinkConfig,
    ) -> Result<Self> {
        config.validate_for_pool(&pool)?;

        let (status, _) = watch::channel(Status::Disconnected);
        let inner = Arc::new_cyclic(|me| EndpointInner {
            me: me.clone(),
            address,
            factory,
            transport,
            pool,
            config,
            status,
            state: Mutex::new(EndpointState::default()),
        });
        Ok(Self { inner })
    }

    /// Start connecting. No-op if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if state.running {
            return;
        }
        state.running = true;
        state.failures = 0;
        info!(address = %self.inner.address, "Endpoint started");
        self.inner.begin_attempt(&mut state);
    }

    /// Stop: cancel the attempt and retry timer, close the connection.
    pub fn stop(&self) {
        self.inner.shutdown();
    }

    /// Handle to the current attempt, or to the attempt that installed the
    /// current connection.
    pub fn attempt(&self) -> Option<AttemptHandle> {
        let state = self.inner.state.lock();
        let (id, cancel) = match (&state.attempt, &state.installed) {
            (Some(slot), _) => (slot.id, slot.cancel.clone()),
            (None, Some(installed)) => (installed.attempt_id, installed.cancel.clone()),
            (None, None) => return None,
        };
        Some(AttemptHandle {
            endpoint: self.inner.me.clone(),
            id,
            cancel,
        })
    }

    /// Current status.
    pub fn status(&self) -> Status {
        *self.inner.status.borrow()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.inner.status.subscribe()
    }

    /// The installed connection, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner
            .state
            .lock()
            .installed
            .as_ref()
            .map(|i| i.connection.clone())
    }

    /// Remote address.
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Buffer pool shared by this endpoint's connections.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.inner.pool
    }

    /// Whether the endpoint is started.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }
}

impl Drop for RemoteEndpoint {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("address", &self.inner.address)
            .field("status", &self.status())
            .finish()
    }
}

/// Cancellable handle to one connection attempt.
#[derive(Clone)]
pub struct AttemptHandle {
    endpoint: Weak<EndpointInner>,
    id: u64,
    cancel: CancelToken,
}

impl AttemptHandle {
    /// Cancel the attempt. Idempotent.
    ///
    /// A pending connect is aborted; if the attempt already installed its
    /// connection, that connection is closed. Either way the endpoint ends
    /// up `Disconnected` with nothing installed.
    pub fn cancel(&self) {
        if !self.cancel.cancel() {
            return;
        }
        if let Some(inner) = self.endpoint.upgrade() {
            inner.attempt_cancelled(self.id);
        }
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Attempt id, unique per endpoint.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for AttemptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl EndpointInner {
    fn set_status(&self, status: Status) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            debug!(address = %self.address, %status, "Endpoint status");
        }
    }

    fn begin_attempt(&self, state: &mut EndpointState) {
        let id = state.next_attempt_id;
        state.next_attempt_id += 1;

        let cancel = CancelToken::new();
        state.attempt = Some(AttemptSlot {
            id,
            cancel: cancel.clone(),
            connection_id: None,
        });
        self.set_status(Status::Connecting);

        tokio::spawn(run_attempt(self.me.clone(), id, cancel));
    }

    /// Back off and retry, or give up.
    fn schedule_retry(&self, state: &mut EndpointState) {
        if !state.running {
            self.set_status(Status::Disconnected);
            return;
        }

        state.failures += 1;
        let policy = &self.config.reconnect;
        if !policy.allows_retry(state.failures) {
            warn!(
                address = %self.address,
                failures = state.failures,
                "Giving up on endpoint"
            );
            state.running = false;
            self.set_status(Status::Disconnected);
            return;
        }

        let delay = policy.delay_for(state.failures);
        let timer = CancelToken::new();
        if let Some(previous) = state.retry.replace(timer.clone()) {
            previous.cancel();
        }
        debug!(
            address = %self.address,
            attempt = state.failures,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.set_status(Status::WaitingRetry);

        let endpoint = self.me.clone();
        tokio::spawn(async move {
            if timer
                .run_until_cancelled(tokio::time::sleep(delay))
                .await
                .is_none()
            {
                return;
            }
            if let Some(inner) = endpoint.upgrade() {
                inner.retry_fired(&timer);
            }
        });
    }

    fn retry_fired(&self, timer: &CancelToken) {
        let mut state = self.state.lock();
        let current = state.retry.as_ref().map_or(false, |t| t.same_as(timer));
        if !current {
            return;
        }
        state.retry = None;
        if state.running && state.attempt.is_none() && state.installed.is_none() {
            self.begin_attempt(&mut state);
        }
    }

    fn attempt_failed(&self, attempt_id: u64, error: &WireError) {
        let mut state = self.state.lock();
        if state.attempt.as_ref().map(|a| a.id) != Some(attempt_id) {
            return;
        }
        state.attempt = None;
        warn!(address = %self.address, error = %error, "Connect attempt failed");
        self.schedule_retry(&mut state);
    }

    fn attempt_cancelled(&self, attempt_id: u64) {
        let closing = {
            let mut state = self.state.lock();
            let pending = state.attempt.as_ref().map(|a| a.id) == Some(attempt_id);
            let live = state.installed.as_ref().map(|i| i.attempt_id) == Some(attempt_id);
            if !pending && !live {
                return;
            }

            if pending {
                state.attempt = None;
            }
            let closing = if live { state.installed.take() } else { None };
            state.running = false;
            if let Some(timer) = state.retry.take() {
                timer.cancel();
            }
            self.set_status(Status::Disconnected);
            closing
        };

        debug!(address = %self.address, attempt = attempt_id, "Attempt cancelled");
        if let Some(installed) = closing {
            installed.connection.close();
        }
    }

    fn shutdown(&self) {
        let (attempt, installed, retry) = {
            let mut state = self.state.lock();
            let was_running = state.running;
            state.running = false;
            let parts = (
                state.attempt.take(),
                state.installed.take(),
                state.retry.take(),
            );
            self.set_status(Status::Disconnected);
            if was_running {
                info!(address = %self.address, "Endpoint stopped");
            }
            parts
        };

        if let Some(slot) = attempt {
            slot.cancel.cancel();
        }
        if let Some(timer) = retry {
            timer.cancel();
        }
        if let Some(installed) = installed {
            installed.cancel.cancel();
            installed.connection.close();
        }
    }

    fn is_installed(state: &EndpointState, connection: &Connection) -> bool {
        state
            .installed
            .as_ref()
            .map_or(false, |i| i.connection.id() == connection.id())
    }
}

impl ConnectionObserver for EndpointInner {
    fn on_connection(&self, connection: &Arc<Connection>) -> bool {
        let mut state = self.state.lock();
        let slot = match state.attempt.take() {
            Some(slot)
                if slot.connection_id == Some(connection.id()) && !slot.cancel.is_cancelled() =>
            {
                slot
            }
            other => {
                state.attempt = other;
                return false;
            }
        };

        info!(address = %self.address, connection = connection.id(), "Connected");
        state.installed = Some(Installed {
            connection: connection.clone(),
            attempt_id: slot.id,
            cancel: slot.cancel,
        });
        state.failures = 0;
        self.set_status(Status::Synchronizing);
        true
    }

    fn on_error(&self, connection: &Connection, message: &str, is_fatal: bool) {
        if !is_fatal {
            debug!(address = %self.address, error = message, "Connection warning");
            return;
        }

        let mut state = self.state.lock();
        if !Self::is_installed(&state, connection) {
            return;
        }
        state.installed = None;
        warn!(
            address = %self.address,
            connection = connection.id(),
            error = message,
            "Connection lost"
        );
        self.schedule_retry(&mut state);
    }

    fn on_caught_up(&self, connection: &Connection) {
        let state = self.state.lock();
        if Self::is_installed(&state, connection) && *self.status.borrow() == Status::Synchronizing
        {
            self.set_status(Status::UpToDate);
        }
    }

    fn on_closed(&self, connection: &Connection) {
        let mut state = self.state.lock();
        if !Self::is_installed(&state, connection) {
            return;
        }
        // Closed by its own session rather than by us.
        state.installed = None;
        debug!(address = %self.address, connection = connection.id(), "Connection closed");
        self.schedule_retry(&mut state);
    }
}

async fn run_attempt(endpoint: Weak<EndpointInner>, attempt_id: u64, cancel: CancelToken) {
    let (connection, transport) = {
        let Some(inner) = endpoint.upgrade() else {
            return;
        };
        let session = inner.factory.create(&inner.address);
        let observer: Weak<dyn ConnectionObserver> = endpoint.clone();
        let connection = Connection::new(
            Some(inner.address.clone()),
            session,
            inner.pool.clone(),
            inner.config.clone(),
            Some(observer),
        );

        {
            let mut state = inner.state.lock();
            match state.attempt.as_mut() {
                Some(slot) if slot.id == attempt_id && !cancel.is_cancelled() => {
                    slot.connection_id = Some(connection.id());
                }
                _ => return,
            }
        }
        (connection, inner.transport.clone())
    };

    if let Err(e) = connection.connect(&*transport, &cancel).await {
        if cancel.is_cancelled() {
            debug!(attempt = attempt_id, "Cancelled attempt finished");
            return;
        }
        if let Some(inner) = endpoint.upgrade() {
            inner.attempt_failed(attempt_id, &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buff;
    use crate::send::OutgoingQueue;
    use crate::session::Session;
    use crate::transport::{stream_link, Link};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    struct QuietSession;

    impl Session for QuietSession {
        fn fill(&self, _pool: &BufferPool, _max_bytes: usize) -> Option<OutgoingQueue> {
            None
        }

        fn read(&self, _buff: &mut Buff) -> Result<()> {
            Ok(())
        }

        fn on_started(&self, handle: crate::ConnectionHandle) {
            handle.caught_up();
        }
    }

    fn quiet_factory() -> Arc<dyn SessionFactory> {
        Arc::new(|_: &Address| -> Arc<dyn Session> { Arc::new(QuietSession) })
    }

    /// Transport scripted per connect: `Some(peer)` succeeds over a duplex
    /// whose far end is kept, `None` fails.
    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<bool>>,
        peers: Mutex<Vec<DuplexStream>>,
        connects: AtomicUsize,
        hang: bool,
    }

    impl ScriptedTransport {
        fn new(outcomes: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                peers: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                hang: false,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(VecDeque::new()),
                peers: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                hang: true,
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self, _address: &Address, cancel: &CancelToken) -> Result<Link> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                cancel.cancelled().await;
                return Err(WireError::Cancelled);
            }
            let succeed = self.outcomes.lock().pop_front().unwrap_or(false);
            if !succeed {
                return Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            let (ours, theirs) = tokio::io::duplex(256);
            self.peers.lock().push(theirs);
            Ok(stream_link(ours))
        }
    }

    fn endpoint(transport: Arc<ScriptedTransport>, config: LinkConfig) -> RemoteEndpoint {
        RemoteEndpoint::with_parts(
            Address::tcp("peer.test", 7000),
            quiet_factory(),
            transport,
            Arc::new(BufferPool::new(256)),
            config,
        )
        .unwrap()
    }

    fn fast_retry(max_attempts: Option<u32>) -> LinkConfig {
        LinkConfig::default().with_reconnect(crate::config::ReconnectConfig {
            initial_delay_ms: 100,
            max_delay_ms: 400,
            backoff_multiplier: 2.0,
            max_attempts,
        })
    }

    async fn wait_for(rx: &mut watch::Receiver<Status>, wanted: Status) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
            .await
            .expect("status not reached")
            .expect("endpoint dropped");
    }

    #[tokio::test]
    async fn test_connects_and_catches_up() {
        let transport = ScriptedTransport::new(&[true]);
        let endpoint = endpoint(transport.clone(), fast_retry(None));
        let mut status = endpoint.subscribe();
        assert_eq!(endpoint.status(), Status::Disconnected);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = seen.clone();
            tokio::spawn(async move {
                while status.changed().await.is_ok() {
                    let current = *status.borrow_and_update();
                    seen.lock().push(current);
                    if current == Status::UpToDate {
                        break;
                    }
                }
            })
        };

        endpoint.start();
        tokio::time::timeout(Duration::from_secs(5), recorder)
            .await
            .unwrap()
            .unwrap();

        let seen = seen.lock().clone();
        assert_eq!(seen.last(), Some(&Status::UpToDate));
        assert!(!seen.contains(&Status::WaitingRetry), "{:?}", seen);
        assert!(endpoint.connection().is_some());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_waits_then_retries() {
        let transport = ScriptedTransport::new(&[false, false, true]);
        let endpoint = endpoint(transport.clone(), fast_retry(None));
        let mut status = endpoint.subscribe();

        endpoint.start();
        wait_for(&mut status, Status::WaitingRetry).await;
        wait_for(&mut status, Status::UpToDate).await;

        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let transport = ScriptedTransport::new(&[]);
        let endpoint = endpoint(transport.clone(), fast_retry(Some(2)));
        let mut status = endpoint.subscribe();

        endpoint.start();
        wait_for(&mut status, Status::WaitingRetry).await;
        wait_for(&mut status, Status::Disconnected).await;

        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert!(!endpoint.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_reconnects() {
        let transport = ScriptedTransport::new(&[true, true]);
        let endpoint = endpoint(transport.clone(), fast_retry(None));
        let mut status = endpoint.subscribe();

        endpoint.start();
        wait_for(&mut status, Status::UpToDate).await;
        let first = endpoint.connection().unwrap();

        // Peer hangs up.
        transport.peers.lock().clear();
        wait_for(&mut status, Status::WaitingRetry).await;
        wait_for(&mut status, Status::UpToDate).await;

        let second = endpoint.connection().unwrap();
        assert_ne!(first.id(), second.id());
        first.wait_closed().await;
    }

    #[tokio::test]
    async fn test_cancel_pending_attempt() {
        let transport = ScriptedTransport::hanging();
        let endpoint = endpoint(transport.clone(), fast_retry(None));

        endpoint.start();
        assert_eq!(endpoint.status(), Status::Connecting);
        let attempt = endpoint.attempt().unwrap();

        attempt.cancel();
        attempt.cancel();

        assert!(attempt.is_cancelled());
        assert_eq!(endpoint.status(), Status::Disconnected);
        assert!(endpoint.connection().is_none());
        assert!(endpoint.attempt().is_none());

        // The aborted connect must not install anything later.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(endpoint.connection().is_none());
        assert_eq!(endpoint.status(), Status::Disconnected);
    }

    #[tokio::test]
    async fn test_cancel_after_success_closes_connection() {
        let transport = ScriptedTransport::new(&[true]);
        let endpoint = endpoint(transport, fast_retry(None));
        let mut status = endpoint.subscribe();

        endpoint.start();
        wait_for(&mut status, Status::UpToDate).await;
        let connection = endpoint.connection().unwrap();

        endpoint.attempt().unwrap().cancel();

        assert!(endpoint.connection().is_none());
        assert_eq!(endpoint.status(), Status::Disconnected);
        tokio::time::timeout(Duration::from_secs(1), connection.wait_closed())
            .await
            .unwrap();
        assert_eq!(endpoint.status(), Status::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_and_drop_cancel_everything() {
        let transport = ScriptedTransport::new(&[true]);
        let endpoint = endpoint(transport, fast_retry(None));
        let mut status = endpoint.subscribe();

        endpoint.start();
        wait_for(&mut status, Status::UpToDate).await;
        let connection = endpoint.connection().unwrap();

        endpoint.stop();
        assert_eq!(endpoint.status(), Status::Disconnected);
        tokio::time::timeout(Duration::from_secs(1), connection.wait_closed())
            .await
            .unwrap();

        endpoint.start();
        assert!(endpoint.is_running());
        drop(endpoint);
    }

    #[tokio::test]
    async fn test_rejects_pool_smaller_than_reserve() {
        let result = RemoteEndpoint::with_parts(
            Address::tcp("peer.test", 7000),
            quiet_factory(),
            ScriptedTransport::new(&[]),
            Arc::new(BufferPool::new(8)),
            LinkConfig::default(),
        );
        assert!(matches!(result, Err(WireError::Config(_))));
    }

    #[test]
    fn test_status_names() {
        assert_eq!(Status::WaitingRetry.to_string(), "WAITING_RETRY");
        assert_eq!(Status::UpToDate.as_str(), "UP_TO_DATE");
    }
}
