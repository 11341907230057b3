//! Monitored signals
//!
//! A [`Signal`] is the hardware-facing value a suspender watches: something
//! that can be read right now and that notifies every subscriber when it
//! changes. Notification uses `tokio::sync::watch`, so subscribers await
//! `changed()` instead of polling.
//!
//! Values are `f64`. Boolean-like signals report `0.0` for false and any other
//! value for true (see [`is_truthy`]).
//!
//! # Example
//!
//! ```rust,ignore
//! let shutter = SoftSignal::new("shutter_open", 1.0);
//!
//! let mut rx = shutter.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("shutter now {}", *rx.borrow());
//!     }
//! });
//!
//! shutter.set(0.0)?;
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

/// Read-and-subscribe contract for monitored values.
pub trait Signal: Send + Sync + Debug {
    /// Signal name, used as the data key in event documents.
    fn name(&self) -> &str;

    /// Current value.
    fn read(&self) -> f64;

    /// Receiver notified on every change. The current value is marked seen.
    fn subscribe(&self) -> watch::Receiver<f64>;

    /// Physical units, if known.
    fn units(&self) -> Option<&str> {
        None
    }
}

/// Interpret a signal value as a boolean.
pub fn is_truthy(value: f64) -> bool {
    value != 0.0
}

/// Metadata for a soft signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMetadata {
    /// Signal name
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Physical units (e.g., "mA", "Torr")
    pub units: Option<String>,
    /// Whether `set` is rejected
    pub read_only: bool,
}

/// In-process signal backed by a watch channel.
///
/// Cloning shares the channel, so a clone handed to a suspender observes every
/// `set` made through the original.
#[derive(Clone)]
pub struct SoftSignal {
    sender: watch::Sender<f64>,
    metadata: SignalMetadata,
    validator: Option<Arc<dyn Fn(f64) -> Result<()> + Send + Sync>>,
}

impl Debug for SoftSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftSignal")
            .field("metadata", &self.metadata)
            .field("value", &*self.sender.borrow())
            .finish()
    }
}

impl SoftSignal {
    /// Create a signal with an initial value.
    pub fn new(name: impl Into<String>, initial_value: f64) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            metadata: SignalMetadata {
                name: name.into(),
                description: None,
                units: None,
                read_only: false,
            },
            validator: None,
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    /// Attach physical units.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.metadata.units = Some(units.into());
        self
    }

    /// Reject [`SoftSignal::set`].
    pub fn read_only(mut self) -> Self {
        self.metadata.read_only = true;
        self
    }

    /// Reject values outside `[min, max]`.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.validator = Some(Arc::new(move |value: f64| {
            if value < min || value > max {
                Err(anyhow!("Value {} out of range [{}, {}]", value, min, max))
            } else {
                Ok(())
            }
        }));
        self
    }

    /// Name, units and flags.
    pub fn metadata(&self) -> &SignalMetadata {
        &self.metadata
    }

    /// Set a new value, notifying all subscribers.
    ///
    /// Fails if the signal is read-only or the value is out of range.
    pub fn set(&self, value: f64) -> Result<()> {
        if self.metadata.read_only {
            return Err(anyhow!("Signal '{}' is read-only", self.metadata.name));
        }
        if let Some(validator) = &self.validator {
            validator(value)?;
        }
        self.sender.send_replace(value);
        Ok(())
    }

    /// Set without validation; used by simulated hardware.
    pub fn put(&self, value: f64) {
        self.sender.send_replace(value);
    }

    /// Number of live watchers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Share as a trait object.
    pub fn shared(&self) -> Arc<dyn Signal> {
        Arc::new(self.clone())
    }
}

impl Signal for SoftSignal {
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn read(&self) -> f64 {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<f64> {
        self.sender.subscribe()
    }

    fn units(&self) -> Option<&str> {
        self.metadata.units.as_deref()
    }
}
