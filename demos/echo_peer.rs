//! Echo Peer - both ends of an objwire link.
//!
//! This demo shows:
//! - Accepting links with a listener and echoing every byte
//! - Keeping a connection alive with `RemoteEndpoint`
//! - Watching endpoint status transitions
//!
//! # Running
//!
//! ```text
//! RUST_LOG=objwire=debug cargo run --example echo_peer -- listen tcp://127.0.0.1:7400
//! RUST_LOG=objwire=debug cargo run --example echo_peer -- connect tcp://127.0.0.1:7400
//! ```
//!
//! `ws://host:port/path` and `unix:///path/to/socket` addresses work too.
//! Link settings come from the `OBJWIRE_*` environment variables.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use objwire::{
    Address, Buff, BufferPool, Connection, ConnectionHandle, LinkConfig, MessageListener,
    OutgoingQueue, RemoteEndpoint, Scheme, Session, StreamListener,
};

/// Queues received bytes and writes them back.
#[derive(Default)]
struct Echo {
    pending: Mutex<Vec<u8>>,
    handle: Mutex<Option<ConnectionHandle>>,
}

impl Session for Echo {
    fn fill(&self, pool: &BufferPool, max_bytes: usize) -> Option<OutgoingQueue> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return None;
        }
        let take = pending.len().min(max_bytes);
        let mut queue = OutgoingQueue::new();
        queue.write_all(pool, &pending[..take]);
        pending.drain(..take);
        Some(queue)
    }

    fn read(&self, buff: &mut Buff) -> objwire::Result<()> {
        self.pending.lock().extend_from_slice(buff.remaining_slice());
        if let Some(handle) = self.handle.lock().as_ref() {
            handle.request_write();
        }
        Ok(())
    }

    fn on_started(&self, handle: ConnectionHandle) {
        *self.handle.lock() = Some(handle);
    }
}

/// Sends one greeting, then counts echoed bytes.
struct Greeter {
    greeting: &'static [u8],
    sent: Mutex<bool>,
    echoed: Mutex<usize>,
    handle: Mutex<Option<ConnectionHandle>>,
}

impl Session for Greeter {
    fn fill(&self, pool: &BufferPool, _max_bytes: usize) -> Option<OutgoingQueue> {
        let mut sent = self.sent.lock();
        if *sent {
            return None;
        }
        *sent = true;
        let mut queue = OutgoingQueue::new();
        queue.write_all(pool, self.greeting);
        Some(queue)
    }

    fn read(&self, buff: &mut Buff) -> objwire::Result<()> {
        let mut echoed = self.echoed.lock();
        *echoed += buff.remaining();
        if *echoed >= self.greeting.len() {
            if let Some(handle) = self.handle.lock().as_ref() {
                handle.caught_up();
            }
        }
        Ok(())
    }

    fn on_started(&self, handle: ConnectionHandle) {
        handle.request_write();
        *self.handle.lock() = Some(handle);
    }
}

async fn listen(address: Address, config: LinkConfig) -> objwire::Result<()> {
    let pool = Arc::new(BufferPool::with_max_idle(
        config.buffer_capacity,
        config.max_idle_buffers,
    ));

    if address.scheme() == Scheme::Ws {
        let listener = MessageListener::bind(&address).await?;
        info!(address = %listener.local_address(), "Listening");
        loop {
            let link = listener.accept().await?;
            Connection::accept(link, Arc::new(Echo::default()), pool.clone(), config.clone())?;
        }
    }

    let listener = StreamListener::bind(&address).await?;
    info!(address = %listener.local_address(), "Listening");
    loop {
        let link = listener.accept().await?;
        Connection::accept(link, Arc::new(Echo::default()), pool.clone(), config.clone())?;
    }
}

async fn connect(address: Address, config: LinkConfig) -> objwire::Result<()> {
    let endpoint = RemoteEndpoint::new(
        address,
        |_: &Address| -> Arc<dyn Session> {
            Arc::new(Greeter {
                greeting: b"hello from objwire",
                sent: Mutex::new(false),
                echoed: Mutex::new(0),
                handle: Mutex::new(None),
            })
        },
        config,
    )?;

    let mut status = endpoint.subscribe();
    endpoint.start();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                info!(status = %*status.borrow_and_update(), "Endpoint status");
            }
            _ = tokio::signal::ctrl_c() => {
                endpoint.stop();
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(mode), Some(address)) = (args.next(), args.next()) else {
        eprintln!("usage: echo_peer <listen|connect> <address>");
        std::process::exit(2);
    };
    let address: Address = address.parse()?;
    let config = LinkConfig::from_env()?;

    match mode.as_str() {
        "listen" => listen(address, config).await?,
        "connect" => connect(address, config).await?,
        other => {
            eprintln!("unknown mode {other:?}");
            std::process::exit(2);
        }
    }
    Ok(())
}
