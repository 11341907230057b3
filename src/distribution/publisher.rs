//! Publisher: pushes every engine document to a relay.
//!
//! The publisher subscribes to its engine's dispatcher for all kinds and hands
//! encoded records to a bounded queue drained by a background writer task.
//! Nothing is acknowledged or retried. When the queue is full the record is
//! dropped and counted, so a slow or absent relay never blocks the engine.

use super::dispatcher::{Subscription, Token};
use super::wire::{self, Origin, RelayAddress, ToRelayAddress};
use crate::config::PublisherConfig;
use crate::error::TransportError;
use crate::experiment::run_engine::EngineHandle;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Records queued before new documents are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// Delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct Stats {
    sent: AtomicU64,
    dropped: AtomicU64,
    connected: AtomicBool,
}

/// Forwards an engine's documents to a proxy.
///
/// Subscribes to the engine's dispatcher and hands every document to a
/// background writer. Emission never blocks: when the queue is full or the
/// proxy is unreachable, documents are dropped and counted.
pub struct Publisher {
    address: RelayAddress,
    origin: Origin,
    engine: EngineHandle,
    token: Option<Token>,
    writer: Option<JoinHandle<()>>,
    stats: Arc<Stats>,
}

impl Publisher {
    /// Publish `engine`'s documents to the relay collection endpoint at
    /// `address`. Must be called from within a Tokio runtime.
    pub fn new(engine: &EngineHandle, address: impl ToRelayAddress) -> Result<Self, TransportError> {
        Self::with_options(
            engine,
            address,
            DEFAULT_QUEUE_CAPACITY,
            DEFAULT_RECONNECT_INTERVAL,
        )
    }

    /// Build from a [`PublisherConfig`]; fails if no address is configured.
    pub fn from_config(engine: &EngineHandle, config: &PublisherConfig) -> Result<Self, TransportError> {
        let address = config
            .address
            .as_deref()
            .ok_or_else(|| TransportError::Address(String::new()))?;
        Self::with_options(
            engine,
            address,
            config.queue_capacity,
            Duration::from_millis(config.reconnect_interval_ms),
        )
    }

    /// Like [`Publisher::new`] with an explicit queue size and reconnect delay.
    pub fn with_options(
        engine: &EngineHandle,
        address: impl ToRelayAddress,
        queue_capacity: usize,
        reconnect_interval: Duration,
    ) -> Result<Self, TransportError> {
        let address = address.to_relay_address()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TransportError::NoRuntime("publisher writer"))?;

        let (tx, rx) = mpsc::channel::<String>(queue_capacity.max(1));
        let stats = Arc::new(Stats::default());
        let writer = runtime.spawn(write_loop(
            address.clone(),
            rx,
            reconnect_interval,
            Arc::clone(&stats),
        ));

        let origin = Origin::local(engine.id());
        let token = {
            let origin = origin.clone();
            let stats = Arc::clone(&stats);
            engine.subscribe(Subscription::All, move |kind, document| {
                let line = wire::encode(&origin, kind, document)?;
                match tx.try_send(line) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        stats.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!(%kind, "Publisher queue full; dropping document");
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
                Ok(())
            })
        };

        info!(engine = %engine.id(), %address, "Publisher created");
        Ok(Self {
            address,
            origin,
            engine: engine.clone(),
            token: Some(token),
            writer: Some(writer),
            stats,
        })
    }

    /// Collection endpoint this publisher writes to.
    pub fn address(&self) -> &RelayAddress {
        &self.address
    }

    /// Origin stamped on every record.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Whether the writer currently holds a connection.
    pub fn is_connected(&self) -> bool {
        self.stats.connected.load(Ordering::Acquire)
    }

    /// Whether [`Publisher::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.token.is_none()
    }

    /// Records written to the relay socket.
    pub fn sent(&self) -> u64 {
        self.stats.sent.load(Ordering::Relaxed)
    }

    /// Records shed because the outbound queue was full.
    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Stop publishing. Queued records are still flushed if the relay is
    /// connected. Safe to call more than once.
    pub fn close(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        // Dropping the subscription drops the queue sender; the writer drains
        // what is left and exits.
        self.engine.unsubscribe(token);
        info!(address = %self.address, sent = self.sent(), dropped = self.dropped(), "Publisher closed");
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.close();
        if let Some(writer) = self.writer.take() {
            if !self.is_connected() {
                writer.abort();
            }
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("address", &self.address)
            .field("origin", &self.origin)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_loop(
    address: RelayAddress,
    mut rx: mpsc::Receiver<String>,
    reconnect_interval: Duration,
    stats: Arc<Stats>,
) {
    let mut warned = false;
    loop {
        let stream = match TcpStream::connect((address.host.as_str(), address.port)).await {
            Ok(stream) => stream,
            Err(err) => {
                if !warned {
                    warn!(%address, error = %err, "Publisher cannot reach relay; retrying");
                    warned = true;
                }
                if rx.is_closed() {
                    return;
                }
                tokio::time::sleep(reconnect_interval).await;
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "Failed to set TCP_NODELAY");
        }
        warned = false;
        stats.connected.store(true, Ordering::Release);
        info!(%address, "Publisher connected to relay");

        let mut writer = BufWriter::new(stream);
        while let Some(line) = rx.recv().await {
            let flush = rx.is_empty();
            if let Err(err) = write_line(&mut writer, &line, flush).await {
                warn!(%address, error = %err, "Publisher lost relay connection");
                break;
            }
            stats.sent.fetch_add(1, Ordering::Relaxed);
        }
        stats.connected.store(false, Ordering::Release);

        if rx.is_closed() && rx.is_empty() {
            let _ = writer.flush().await;
            debug!(%address, "Publisher writer finished");
            return;
        }
    }
}

async fn write_line(writer: &mut BufWriter<TcpStream>, line: &str, flush: bool) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    if flush {
        writer.flush().await?;
    }
    Ok(())
}
