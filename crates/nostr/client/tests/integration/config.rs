//! Building a manager from a TOML file.

use super::{MockTransport, init_tracing};
use nostr_client::{ClientError, ManagerConfig, RelayConnectionManager, SystemClock};
use std::io::Write;
use std::sync::Arc;

#[tokio::test]
async fn test_manager_from_toml_file() {
    init_tracing();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
publishTimeoutMs = 1500

[[relays]]
url = "wss://relay.example.com/"
isRequired = true

[[relays]]
url = "wss://archive.example.com"
supportsWrite = false
supportedNips = [1, 50]

[retry]
maxRetries = 5
"#
    )
    .unwrap();

    let config = ManagerConfig::load(file.path()).unwrap();
    let manager = RelayConnectionManager::with_transport(
        config,
        Arc::new(MockTransport::new()),
        Arc::new(SystemClock),
    )
    .unwrap();

    assert_eq!(
        manager.relay_urls(),
        vec!["wss://archive.example.com", "wss://relay.example.com"]
    );
    assert_eq!(manager.config().retry.max_retries, 5);

    let archive = manager.relay_health("wss://archive.example.com").unwrap();
    assert!(!archive.descriptor.supports_write);
    assert!(archive.descriptor.supported_nips.contains(&50));
    assert!(
        manager
            .relay_health("wss://relay.example.com")
            .unwrap()
            .descriptor
            .is_required
    );
}

#[test]
fn test_invalid_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[circuit]\nfailureThreshold = 0").unwrap();

    assert!(matches!(
        ManagerConfig::load(file.path()),
        Err(ClientError::Config(_))
    ));
}
