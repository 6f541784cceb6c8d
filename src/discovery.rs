//! WS-Discovery client for ONVIF network video transmitters

use std::net::SocketAddr;
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument, warn};

use crate::error::DiscoveryError;
use crate::DiscoveryConfig;

/// WS-Discovery multicast group and port
pub const DEFAULT_MULTICAST_ADDRESS: &str = "239.255.255.250:3702";

/// How long to collect probe matches after sending the probe
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_RECV_BUFFER: usize = 8192;

/// Element path of each address list inside a probe match response
const XADDRS_PATH: [&[u8]; 5] = [
    b"Envelope",
    b"Body",
    b"ProbeMatches",
    b"ProbeMatch",
    b"XAddrs",
];

/// Finds camera endpoints with a WS-Discovery probe
#[derive(Debug, Clone)]
pub struct Discovery {
    multicast_address: String,
    timeout: Duration,
    recv_buffer: usize,
}

impl Discovery {
    /// Create a client; an empty address selects the standard multicast group.
    pub fn new(multicast_address: &str) -> Self {
        let multicast_address = if multicast_address.is_empty() {
            DEFAULT_MULTICAST_ADDRESS.to_string()
        } else {
            multicast_address.to_string()
        };
        Self {
            multicast_address,
            timeout: DEFAULT_TIMEOUT,
            recv_buffer: DEFAULT_RECV_BUFFER,
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(&config.multicast_address)
            .with_timeout(Duration::from_millis(config.timeout_ms))
            .with_recv_buffer(config.recv_buffer)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_recv_buffer(mut self, recv_buffer: usize) -> Self {
        self.recv_buffer = recv_buffer.max(1);
        self
    }

    pub fn multicast_address(&self) -> &str {
        &self.multicast_address
    }

    /// Build a probe for network video transmitters with a fresh message ID.
    pub fn generate_probe_message(&self) -> String {
        let message_id = uuid::Uuid::new_v4();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope"
                   xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing"
                   xmlns:wsdd="http://schemas.xmlsoap.org/ws/2005/04/discovery">
    <SOAP-ENV:Header>
        <wsa:MessageID>uuid:{message_id}</wsa:MessageID>
        <wsa:To>urn:schemas-xmlsoap-org:ws:2005:04:discovery</wsa:To>
        <wsa:Action>http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</wsa:Action>
    </SOAP-ENV:Header>
    <SOAP-ENV:Body>
        <wsdd:Probe>
            <wsdd:Types>dn:NetworkVideoTransmitter</wsdd:Types>
        </wsdd:Probe>
    </SOAP-ENV:Body>
</SOAP-ENV:Envelope>"#
        )
    }

    /// Send one probe and collect `http://` service addresses until the timeout.
    ///
    /// Responses that fail to parse are skipped. An empty result is not an error.
    #[instrument(skip(self), fields(address = %self.multicast_address))]
    pub async fn discover(&self) -> Result<Vec<String>, DiscoveryError> {
        let target = self.resolve().await?;

        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .await
            .map_err(DiscoveryError::Socket)?;
        socket
            .send_to(self.generate_probe_message().as_bytes(), target)
            .await
            .map_err(DiscoveryError::Send)?;

        let deadline = Instant::now() + self.timeout;
        let mut buffer = vec![0u8; self.recv_buffer];
        let mut discovered = Vec::new();

        loop {
            let (n, from) = match timeout_at(deadline, socket.recv_from(&mut buffer)).await {
                Err(_) => {
                    debug!("Timed out after waiting, {} addresses found", discovered.len());
                    return Ok(discovered);
                }
                Ok(Err(err)) => return Err(DiscoveryError::Recv(err)),
                Ok(Ok(received)) => received,
            };

            match extract_xaddrs_from_probe_match(&buffer[..n]) {
                Ok(xaddrs) => {
                    debug!("{} addresses from {}", xaddrs.len(), from);
                    discovered.extend(xaddrs);
                }
                Err(err) => warn!("Failed to parse response from {}: {}", from, err),
            }
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, DiscoveryError> {
        tokio::net::lookup_host(self.multicast_address.as_str())
            .await
            .ok()
            .and_then(|mut addrs| addrs.find(SocketAddr::is_ipv4))
            .ok_or_else(|| DiscoveryError::Resolve(self.multicast_address.clone()))
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new(DEFAULT_MULTICAST_ADDRESS)
    }
}

/// Pull every `http://` entry out of the `XAddrs` fields of a ProbeMatch envelope.
///
/// Element names are matched without their namespace prefix.
pub fn extract_xaddrs_from_probe_match(response: &[u8]) -> Result<Vec<String>, DiscoveryError> {
    let mut reader = Reader::from_reader(response);
    reader.config_mut().trim_text(true);

    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut seen_root = false;
    let mut xaddrs = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| DiscoveryError::Parse(format!("at byte {}: {}", reader.buffer_position(), e)))?;
        match event {
            Event::Start(start) => {
                let name = start.local_name().as_ref().to_vec();
                if !seen_root {
                    if name != XADDRS_PATH[0] {
                        return Err(DiscoveryError::Parse(format!(
                            "expected Envelope, found {}",
                            String::from_utf8_lossy(&name)
                        )));
                    }
                    seen_root = true;
                }
                path.push(name);
            }
            Event::Empty(empty) if !seen_root => {
                return Err(DiscoveryError::Parse(format!(
                    "expected Envelope, found empty {}",
                    String::from_utf8_lossy(empty.local_name().as_ref())
                )));
            }
            Event::End(_) => {
                path.pop();
                if path.is_empty() {
                    return Ok(xaddrs);
                }
            }
            Event::Text(text) if at_xaddrs(&path) => {
                let text = text
                    .unescape()
                    .map_err(|e| DiscoveryError::Parse(e.to_string()))?;
                xaddrs.extend(
                    text.split_whitespace()
                        .filter(|addr| addr.starts_with("http://"))
                        .map(str::to_string),
                );
            }
            Event::Eof => {
                return Err(DiscoveryError::Parse("unexpected end of document".to_string()));
            }
            _ => {}
        }
    }
}

fn at_xaddrs(path: &[Vec<u8>]) -> bool {
    path.len() == XADDRS_PATH.len()
        && path
            .iter()
            .zip(XADDRS_PATH.iter())
            .all(|(name, expected)| name.as_slice() == *expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_match(xaddrs: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope"
                   xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery">
  <SOAP-ENV:Header><d:AppSequence InstanceId="1" MessageNumber="3"/></SOAP-ENV:Header>
  <SOAP-ENV:Body>
    <d:ProbeMatches>
      <d:ProbeMatch>
        <d:Types>dn:NetworkVideoTransmitter</d:Types>
        <d:XAddrs>{xaddrs}</d:XAddrs>
      </d:ProbeMatch>
    </d:ProbeMatches>
  </SOAP-ENV:Body>
</SOAP-ENV:Envelope>"#
        )
    }

    #[test]
    fn test_extract_xaddrs() {
        let response = probe_match("http://a http://b");
        let xaddrs = extract_xaddrs_from_probe_match(response.as_bytes()).unwrap();
        assert_eq!(xaddrs, vec!["http://a", "http://b"]);
    }

    #[test]
    fn test_extract_xaddrs_drops_non_http() {
        let response = probe_match("https://secure rtsp://cam http://192.168.1.10/onvif/device_service");
        let xaddrs = extract_xaddrs_from_probe_match(response.as_bytes()).unwrap();
        assert_eq!(xaddrs, vec!["http://192.168.1.10/onvif/device_service"]);
    }

    #[test]
    fn test_extract_xaddrs_multiple_matches() {
        let response = r#"<Envelope><Body><ProbeMatches>
            <ProbeMatch><XAddrs>http://one</XAddrs></ProbeMatch>
            <ProbeMatch><XAddrs>http://two
                http://three</XAddrs></ProbeMatch>
        </ProbeMatches></Body></Envelope>"#;
        let xaddrs = extract_xaddrs_from_probe_match(response.as_bytes()).unwrap();
        assert_eq!(xaddrs, vec!["http://one", "http://two", "http://three"]);
    }

    #[test]
    fn test_xaddrs_outside_probe_match_ignored() {
        let response = r#"<Envelope><Body><XAddrs>http://stray</XAddrs></Body></Envelope>"#;
        let xaddrs = extract_xaddrs_from_probe_match(response.as_bytes()).unwrap();
        assert!(xaddrs.is_empty());
    }

    #[test]
    fn test_malformed_responses_rejected() {
        assert!(extract_xaddrs_from_probe_match(b"").is_err());
        assert!(extract_xaddrs_from_probe_match(b"not xml at all").is_err());
        assert!(extract_xaddrs_from_probe_match(b"<Envelope><Body></Envelope>").is_err());
        assert!(extract_xaddrs_from_probe_match(b"<Hello/>").is_err());
    }

    #[test]
    fn test_probe_message_ids_are_unique() {
        let discovery = Discovery::default();
        let first = discovery.generate_probe_message();
        let second = discovery.generate_probe_message();
        assert_ne!(first, second);
        assert!(first.contains("<wsa:MessageID>uuid:"));
        assert!(first.contains("http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe"));
        assert!(first.contains("<wsdd:Types>dn:NetworkVideoTransmitter</wsdd:Types>"));
    }

    #[test]
    fn test_empty_address_uses_default() {
        assert_eq!(Discovery::new("").multicast_address(), DEFAULT_MULTICAST_ADDRESS);
        assert_eq!(Discovery::new("10.0.0.1:3702").multicast_address(), "10.0.0.1:3702");
    }
}
