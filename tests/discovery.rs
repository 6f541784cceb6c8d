//! Discovery against local UDP responders standing in for cameras.

use std::time::Duration;

use tokio::net::UdpSocket;

use camdecode::{Discovery, DiscoveryError};

const PROBE_MATCH: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope"
              xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery">
  <env:Body>
    <d:ProbeMatches>
      <d:ProbeMatch>
        <d:XAddrs>http://a http://b</d:XAddrs>
      </d:ProbeMatch>
    </d:ProbeMatches>
  </env:Body>
</env:Envelope>"#;

async fn responder() -> (UdpSocket, String) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap().to_string();
    (socket, address)
}

#[tokio::test]
async fn test_no_responses_returns_empty_list() {
    let (_silent, address) = responder().await;
    let discovery = Discovery::new(&address).with_timeout(Duration::from_millis(200));

    let addresses = discovery.discover().await.unwrap();
    assert!(addresses.is_empty());
}

#[tokio::test]
async fn test_collects_xaddrs_and_skips_malformed() {
    let (camera, address) = responder().await;
    let discovery = Discovery::new(&address).with_timeout(Duration::from_millis(500));

    let camera_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        let (n, from) = camera.recv_from(&mut buf).await.unwrap();
        let probe = String::from_utf8_lossy(&buf[..n]).to_string();
        camera.send_to(b"<<definitely not xml", from).await.unwrap();
        camera.send_to(PROBE_MATCH.as_bytes(), from).await.unwrap();
        probe
    });

    let addresses = discovery.discover().await.unwrap();
    assert_eq!(addresses, vec!["http://a", "http://b"]);

    let probe = camera_task.await.unwrap();
    assert!(probe.contains("dn:NetworkVideoTransmitter"));
}

#[tokio::test]
async fn test_unresolvable_address_fails() {
    let discovery = Discovery::new("not a socket address").with_timeout(Duration::from_millis(50));
    assert!(matches!(
        discovery.discover().await,
        Err(DiscoveryError::Resolve(_))
    ));
}
