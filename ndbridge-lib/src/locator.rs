use crate::{constants::DISCOVERY_TIMEOUT_MSEC, endpoint::Endpoint, error::LocatorError, trace::*};
use std::time::Duration;

/// One entry of the upstream `/json/list` response; only the id matters here.
#[derive(Debug, serde::Deserialize)]
struct TargetDescriptor {
  id: String,
}

/// Resolves the current debug target from the upstream's introspection
/// endpoint. The target id changes whenever the upstream restarts, so it is
/// re-resolved on every connect attempt.
#[derive(Debug, Clone)]
pub struct TargetLocator {
  base: Endpoint,
}

impl TargetLocator {
  pub fn new(base: Endpoint) -> Self {
    Self { base }
  }

  /// Query `GET {base}/json/list` and return the id of the first descriptor.
  /// Blocking; run it on the blocking pool when called from async context.
  pub fn current_target(&self) -> Result<String, LocatorError> {
    let uri = self.base.http_uri("json/list");
    let client = reqwest::blocking::Client::builder()
      .timeout(Duration::from_millis(DISCOVERY_TIMEOUT_MSEC))
      .build()
      .map_err(LocatorError::RequestFailed)?;
    let body = client
      .get(&uri)
      .send()
      .map_err(|e| {
        if e.is_connect() || e.is_timeout() {
          LocatorError::Unreachable(e)
        } else {
          LocatorError::RequestFailed(e)
        }
      })?
      .text()
      .map_err(LocatorError::RequestFailed)?;
    let target_id = first_target_id(&body)?;
    debug!("current upstream target: {target_id}");
    Ok(target_id)
  }

  /// Upstream websocket URI for the given target id
  pub fn websocket_uri(&self, target_id: &str) -> String {
    self.base.ws_uri(target_id)
  }
}

/// Pick the first descriptor of a `/json/list` payload
fn first_target_id(body: &str) -> Result<String, LocatorError> {
  let descriptors: Vec<TargetDescriptor> =
    serde_json::from_str(body).map_err(|e| LocatorError::MalformedTargetList(e.to_string()))?;
  descriptors
    .into_iter()
    .next()
    .map(|descriptor| descriptor.id)
    .ok_or(LocatorError::NoTargets)
}
