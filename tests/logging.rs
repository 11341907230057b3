//! Subscriber installation. Lives in its own test binary because it installs
//! the process-global subscriber.

use daq_relay::config::LoggingConfig;
use daq_relay::logging;

#[test]
fn test_init_installs_once() {
    let config = LoggingConfig {
        level: "debug".to_string(),
        json: true,
    };
    assert!(logging::init(&config));
    tracing::info!(target: "daq_relay", "subscriber installed");

    // A second call keeps the existing subscriber.
    assert!(!logging::init(&LoggingConfig::default()));
}
