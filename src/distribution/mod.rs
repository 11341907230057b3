//! Document distribution.
//!
//! ```text
//! RunEngine ─▶ Dispatcher ─▶ local subscribers
//!                  │
//!                  └─▶ Publisher ─tcp─▶ Proxy ─tcp─▶ RemoteDispatcher ─▶ Dispatcher ─▶ remote subscribers
//! ```
//!
//! Local delivery is synchronous and ordered. Everything past the Publisher
//! is best effort: records may be dropped under backpressure and no ordering
//! is promised across the relay.

pub mod dispatcher;
pub mod proxy;
pub mod publisher;
pub mod remote;
pub mod wire;

pub use dispatcher::{Callback, CallbackFailure, Dispatcher, Subscription, Token};
pub use proxy::{Proxy, ProxyStats, ProxyStopHandle};
pub use publisher::Publisher;
pub use remote::RemoteDispatcher;
pub use wire::{Origin, OriginFilter, RelayAddress, ToRelayAddress, WireRecord};
