use crate::error::BridgeError;
use std::{fmt, net::SocketAddr, str::FromStr};

/// Host and port of one side of the bridge. Immutable; the upstream endpoint
/// is combined with a freshly discovered target id on every connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
  host: String,
  port: u16,
}

impl Endpoint {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self { host: host.into(), port }
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  /// HTTP URI for `path` on this endpoint
  pub fn http_uri(&self, path: &str) -> String {
    format!("http://{}:{}/{}", self.host, self.port, path)
  }

  /// WebSocket URI for `path` on this endpoint
  pub fn ws_uri(&self, path: &str) -> String {
    format!("ws://{}:{}/{}", self.host, self.port, path)
  }

  /// Validates if the given host follows basic DNS naming rules
  /// Allows alphanumeric characters (a-z, A-Z, 0-9), dots (.), and hyphens (-)
  fn validate_domain(domain: &str) -> bool {
    !domain.is_empty()
      && domain.len() <= 253
      && domain.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
      && !domain.starts_with('.')
      && !domain.ends_with('.')
      && !domain.contains("..")
  }
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

impl From<SocketAddr> for Endpoint {
  fn from(addr: SocketAddr) -> Self {
    Self {
      host: addr.ip().to_string(),
      port: addr.port(),
    }
  }
}

impl FromStr for Endpoint {
  type Err = BridgeError;

  /// Parses `IP:PORT` or `DOMAIN:PORT` into an endpoint
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Ok(socket_addr) = s.parse::<SocketAddr>() {
      return Ok(socket_addr.into());
    }

    match s.rsplit_once(':') {
      Some((host, port)) => {
        if !Self::validate_domain(host) {
          return Err(BridgeError::InvalidAddress(String::from("Invalid host name")));
        }
        let port = port
          .parse::<u16>()
          .map_err(|_| BridgeError::InvalidAddress(String::from("Invalid port number")))?;
        Ok(Endpoint::new(host, port))
      }
      None => Err(BridgeError::InvalidAddress(String::from(
        "Invalid address format - missing port number",
      ))),
    }
  }
}
