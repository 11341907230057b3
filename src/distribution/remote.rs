//! RemoteDispatcher: re-injects relayed documents into a local dispatcher.
//!
//! Connects to a proxy's broadcast port and runs a receive loop on the Tokio
//! runtime. Each record is parsed and checked against an [`OriginFilter`];
//! matching documents go to the local [`Dispatcher`], everything else is
//! dropped silently. Malformed records are logged and skipped.

use super::dispatcher::{Dispatcher, Subscription, Token};
use super::wire::{self, read_record, OriginFilter, RecordRead, RelayAddress, ToRelayAddress, MAX_RECORD_BYTES};
use crate::config::RemoteConfig;
use crate::error::{TransportError, WireError};
use crate::experiment::document::{Document, DocumentKind};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives relayed documents from a proxy and dispatches the ones whose
/// origin passes the filter.
pub struct RemoteDispatcher {
    address: RelayAddress,
    filter: OriginFilter,
    dispatcher: Dispatcher,
    receiver: Option<JoinHandle<()>>,
}

impl RemoteDispatcher {
    /// Receiver for `address`; nothing connects until [`RemoteDispatcher::start`].
    pub fn new(address: impl ToRelayAddress, filter: OriginFilter) -> Result<Self, TransportError> {
        Ok(Self {
            address: address.to_relay_address()?,
            filter,
            dispatcher: Dispatcher::new(),
            receiver: None,
        })
    }

    /// Build from a [`RemoteConfig`]; fails if no address is configured.
    pub fn from_config(config: &RemoteConfig) -> Result<Self, TransportError> {
        let address = config
            .address
            .as_deref()
            .ok_or_else(|| TransportError::Address(String::new()))?;
        Self::new(address, config.filter())
    }

    /// Proxy broadcast endpoint.
    pub fn address(&self) -> &RelayAddress {
        &self.address
    }

    /// Origin filter applied to each record.
    pub fn filter(&self) -> &OriginFilter {
        &self.filter
    }

    /// Local dispatcher fed by the receive loop.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Register a callback on the local dispatcher.
    pub fn subscribe<S, F>(&self, subscription: S, callback: F) -> Token
    where
        S: Into<Subscription>,
        F: Fn(DocumentKind, &Document) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(subscription, callback)
    }

    /// Remove a callback registered with [`RemoteDispatcher::subscribe`].
    pub fn unsubscribe(&self, token: Token) -> bool {
        self.dispatcher.unsubscribe(token)
    }

    /// Whether the receive loop is still alive.
    pub fn is_running(&self) -> bool {
        self.receiver.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Connect to the relay and spawn the receive loop. Connection failures
    /// are returned; a second call while running is a no-op.
    pub async fn start(&mut self) -> Result<(), TransportError> {
        if self.is_running() {
            debug!(address = %self.address, "RemoteDispatcher already running");
            return Ok(());
        }
        let stream = TcpStream::connect((self.address.host.as_str(), self.address.port))
            .await
            .map_err(|source| TransportError::Connect {
                address: self.address.to_string(),
                source,
            })?;
        info!(address = %self.address, filter = ?self.filter, "RemoteDispatcher connected");

        self.receiver = Some(tokio::spawn(receive_loop(
            stream,
            self.filter.clone(),
            self.dispatcher.clone(),
        )));
        Ok(())
    }

    /// Cancel the receive loop. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
            info!(address = %self.address, "RemoteDispatcher stopped");
        }
    }
}

impl Drop for RemoteDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RemoteDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDispatcher")
            .field("address", &self.address)
            .field("filter", &self.filter)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn receive_loop(stream: TcpStream, filter: OriginFilter, dispatcher: Dispatcher) {
    let mut reader = BufReader::new(stream);
    let mut segment = Vec::new();
    loop {
        match read_record(&mut reader, &mut segment, MAX_RECORD_BYTES).await {
            Ok(RecordRead::Record) => {
                if segment.is_empty() {
                    continue;
                }
                match std::str::from_utf8(&segment) {
                    Ok(line) => {
                        if let Err(err) = deliver(line, &filter, &dispatcher) {
                            warn!(error = %err, "Discarding malformed record");
                        }
                    }
                    Err(err) => warn!(error = %err, "Discarding non-UTF-8 record"),
                }
            }
            Ok(RecordRead::Oversize(len)) => {
                warn!(len, limit = MAX_RECORD_BYTES, "Discarding oversize record");
            }
            Ok(RecordRead::Closed) => {
                info!("Relay closed the connection");
                break;
            }
            Err(err) => {
                warn!(error = %err, "Relay connection failed");
                break;
            }
        }
    }
}

/// Parse one record and hand it to `dispatcher` if its origin matches.
/// Returns whether the document was delivered.
pub(crate) fn deliver(line: &str, filter: &OriginFilter, dispatcher: &Dispatcher) -> Result<bool, WireError> {
    let (origin, kind, payload) = wire::split(line)?;
    if !filter.matches(&origin) {
        return Ok(false);
    }
    let document = Document::from_payload(kind, payload)?;
    dispatcher.process(kind, &document);
    Ok(true)
}
