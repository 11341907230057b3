//! Proxy: content-blind relay between publishers and remote dispatchers.
//!
//! Binds a collection port (publishers connect in) and a broadcast port
//! (remote dispatchers connect in). Each line received on the collection side
//! is forwarded as-is to every broadcast connection. A broadcast connection
//! that falls behind loses records; nothing is buffered beyond the channel
//! capacity and nothing is retried. A line longer than the frame limit is
//! dropped on the collection side and never reaches a subscriber.
//!
//! A proxy runs once. After [`Proxy::start`] returns, calling it again fails
//! with [`TransportError::ProxyClosed`].

use crate::config::ProxyConfig;
use crate::distribution::wire::{read_record, RecordRead, MAX_RECORD_BYTES};
use crate::error::TransportError;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Records buffered per subscriber before the slowest one starts losing them.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

type Frame = Arc<[u8]>;

/// Live connection and traffic counters.
#[derive(Debug, Default)]
pub struct ProxyStats {
    publishers: AtomicUsize,
    subscribers: AtomicUsize,
    forwarded: AtomicU64,
    oversize: AtomicU64,
}

impl ProxyStats {
    /// Connected publishers.
    pub fn publishers(&self) -> usize {
        self.publishers.load(Ordering::Acquire)
    }

    /// Connected subscribers.
    pub fn subscribers(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    /// Records accepted from publishers.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Lines discarded for exceeding the frame limit.
    pub fn oversize(&self) -> u64 {
        self.oversize.load(Ordering::Relaxed)
    }
}

/// Interrupts a running [`Proxy::start`]. A stop issued before `start` makes
/// it return immediately.
#[derive(Debug, Clone)]
pub struct ProxyStopHandle {
    notify: Arc<Notify>,
}

impl ProxyStopHandle {
    /// Request shutdown.
    pub fn stop(&self) {
        self.notify.notify_one();
    }
}

/// Content-blind relay between publishers and remote dispatchers.
///
/// Bound on construction, forwarding after [`Proxy::start`].
pub struct Proxy {
    inbound: Option<TcpListener>,
    outbound: Option<TcpListener>,
    in_port: u16,
    out_port: u16,
    capacity: usize,
    max_frame: usize,
    closed: bool,
    stop: Arc<Notify>,
    stats: Arc<ProxyStats>,
}

impl Proxy {
    /// Bind on all interfaces. `None` picks a free port.
    pub async fn bind(in_port: Option<u16>, out_port: Option<u16>) -> Result<Self, TransportError> {
        Self::bind_on("0.0.0.0", in_port, out_port, DEFAULT_BROADCAST_CAPACITY).await
    }

    /// Bind using a [`ProxyConfig`].
    pub async fn from_config(config: &ProxyConfig) -> Result<Self, TransportError> {
        let proxy = Self::bind_on(
            &config.host,
            config.in_port,
            config.out_port,
            config.broadcast_capacity,
        )
        .await?;
        Ok(proxy.with_max_frame_bytes(config.max_frame_bytes))
    }

    /// Bind both sockets. If the second bind fails the first socket is
    /// released before the error is returned.
    pub async fn bind_on(
        host: &str,
        in_port: Option<u16>,
        out_port: Option<u16>,
        capacity: usize,
    ) -> Result<Self, TransportError> {
        let inbound = bind_listener(host, "collection", in_port).await?;
        let outbound = match bind_listener(host, "broadcast", out_port).await {
            Ok(listener) => listener,
            Err(err) => {
                drop(inbound);
                return Err(err);
            }
        };

        let in_port = inbound.local_addr()?.port();
        let out_port = outbound.local_addr()?.port();
        info!(host, in_port, out_port, "Proxy bound");

        Ok(Self {
            inbound: Some(inbound),
            outbound: Some(outbound),
            in_port,
            out_port,
            capacity: capacity.max(1),
            max_frame: MAX_RECORD_BYTES,
            closed: false,
            stop: Arc::new(Notify::new()),
            stats: Arc::new(ProxyStats::default()),
        })
    }

    /// Longest line accepted from a publisher, newline excluded.
    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame = bytes.max(1);
        self
    }

    /// Port publishers connect to.
    pub fn in_port(&self) -> u16 {
        self.in_port
    }

    /// Port remote dispatchers connect to.
    pub fn out_port(&self) -> u16 {
        self.out_port
    }

    /// Whether the proxy has been started or closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Handle for stopping [`Proxy::start`] from another task.
    pub fn stop_handle(&self) -> ProxyStopHandle {
        ProxyStopHandle {
            notify: Arc::clone(&self.stop),
        }
    }

    /// Shared traffic counters.
    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// Release both sockets without forwarding anything. Safe to call more
    /// than once.
    pub fn close(&mut self) {
        let inbound = self.inbound.take();
        let outbound = self.outbound.take();
        if inbound.is_some() || outbound.is_some() {
            info!(in_port = self.in_port, out_port = self.out_port, "Proxy closed");
        }
        self.closed = true;
    }

    /// Forward records until stopped through a [`ProxyStopHandle`].
    pub async fn start(&mut self) -> Result<(), TransportError> {
        let (Some(inbound), Some(outbound)) = (self.inbound.take(), self.outbound.take()) else {
            self.closed = true;
            return Err(TransportError::ProxyClosed(self.to_string()));
        };
        self.closed = true;
        info!(in_port = self.in_port, out_port = self.out_port, "Proxy forwarding");

        let (frames, _) = broadcast::channel::<Frame>(self.capacity);
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                () = self.stop.notified() => break,
                accepted = inbound.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(collect(
                            stream,
                            peer,
                            self.max_frame,
                            frames.clone(),
                            Arc::clone(&self.stats),
                        ));
                    }
                    Err(err) => warn!(error = %err, "Failed to accept publisher"),
                },
                accepted = outbound.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(fan_out(stream, peer, frames.subscribe(), Arc::clone(&self.stats)));
                    }
                    Err(err) => warn!(error = %err, "Failed to accept subscriber"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        info!(
            in_port = self.in_port,
            out_port = self.out_port,
            forwarded = self.stats.forwarded(),
            "Proxy stopped"
        );
        Ok(())
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxy(in_port={}, out_port={})", self.in_port, self.out_port)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("in_port", &self.in_port)
            .field("out_port", &self.out_port)
            .field("closed", &self.closed)
            .finish()
    }
}

async fn bind_listener(
    host: &str,
    role: &'static str,
    port: Option<u16>,
) -> Result<TcpListener, TransportError> {
    let port = port.unwrap_or(0);
    TcpListener::bind((host, port))
        .await
        .map_err(|source| TransportError::Bind { role, port, source })
}

/// Read newline-framed records from one publisher into the broadcast channel.
async fn collect(
    stream: TcpStream,
    peer: SocketAddr,
    max_frame: usize,
    frames: broadcast::Sender<Frame>,
    stats: Arc<ProxyStats>,
) {
    stats.publishers.fetch_add(1, Ordering::AcqRel);
    debug!(%peer, "Publisher connected");

    let mut reader = BufReader::new(stream);
    let mut frame = Vec::new();
    loop {
        match read_record(&mut reader, &mut frame, max_frame).await {
            Ok(RecordRead::Record) => {
                if frame.is_empty() {
                    continue;
                }
                frame.push(b'\n');
                // No subscribers is not an error; the record is simply gone.
                let _ = frames.send(Frame::from(frame.as_slice()));
                stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(RecordRead::Oversize(len)) => {
                warn!(%peer, len, max_frame, "Dropping oversize record");
                stats.oversize.fetch_add(1, Ordering::Relaxed);
            }
            Ok(RecordRead::Closed) => break,
            Err(err) => {
                debug!(%peer, error = %err, "Publisher connection failed");
                break;
            }
        }
    }

    stats.publishers.fetch_sub(1, Ordering::AcqRel);
    debug!(%peer, "Publisher disconnected");
}

/// Write every broadcast record to one subscriber until it disconnects.
async fn fan_out(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut frames: broadcast::Receiver<Frame>,
    stats: Arc<ProxyStats>,
) {
    stats.subscribers.fetch_add(1, Ordering::AcqRel);
    debug!(%peer, "Subscriber connected");

    loop {
        match frames.recv().await {
            Ok(frame) => {
                if let Err(err) = stream.write_all(&frame).await {
                    debug!(%peer, error = %err, "Subscriber connection failed");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(%peer, skipped, "Subscriber lagging; records dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    stats.subscribers.fetch_sub(1, Ordering::AcqRel);
    debug!(%peer, "Subscriber disconnected");
}
