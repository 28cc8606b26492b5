//! In-process link driver.
//!
//! The platform radio stacks (Bluetooth adapter, LoRa serial bridge) are
//! external collaborators; a transport only needs a driver that can attach
//! an endpoint, move raw bytes to one or all endpoints in the same air
//! space, and toggle link availability. [`LinkHub`] is that seam: one hub
//! instance per shared broadcast domain, used by both transports and by
//! every simulated-topology test.

use emberlink_core::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A raw frame crossing the shared air space.
#[derive(Debug, Clone)]
pub struct AirFrame {
    /// Device id the frame originated from
    pub from: String,
    /// Raw frame bytes
    pub bytes: Vec<u8>,
}

struct Endpoint {
    tx: mpsc::UnboundedSender<AirFrame>,
    up: bool,
}

struct HubInner {
    endpoints: HashMap<String, Endpoint>,
}

/// Shared broadcast domain connecting attached device endpoints.
#[derive(Clone)]
pub struct LinkHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LinkHub {
    /// Create an empty air space.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                endpoints: HashMap::new(),
            })),
        }
    }

    /// Attach a device and get its inbound frame stream.
    ///
    /// Re-attaching an id replaces the previous endpoint.
    pub fn attach(&self, device_id: &str) -> mpsc::UnboundedReceiver<AirFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .endpoints
            .insert(device_id.to_string(), Endpoint { tx, up: true });
        rx
    }

    /// Detach a device from the air space.
    pub fn detach(&self, device_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.endpoints.remove(device_id);
    }

    /// Toggle link availability for a device (radio off, permission lost).
    pub fn set_link(&self, device_id: &str, up: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(endpoint) = inner.endpoints.get_mut(device_id) {
            endpoint.up = up;
        }
    }

    /// Whether a device's link is currently up.
    pub fn is_up(&self, device_id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.endpoints.get(device_id).map(|e| e.up).unwrap_or(false)
    }

    /// Device ids with a live link, excluding `except`.
    pub fn reachable(&self, except: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .endpoints
            .iter()
            .filter(|(id, ep)| ep.up && id.as_str() != except)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Transmit `bytes` from `from` to one endpoint or to everyone in range.
    ///
    /// Returns the number of endpoints the frame reached. Down endpoints
    /// never receive; transmitting from a down endpoint fails.
    pub fn transmit(&self, from: &str, to: Option<&str>, bytes: &[u8]) -> CoreResult<usize> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let sender_up = inner.endpoints.get(from).map(|e| e.up).unwrap_or(false);
        if !sender_up {
            return Err(CoreError::TransportUnavailable {
                transport: from.to_string(),
            });
        }

        let frame = AirFrame {
            from: from.to_string(),
            bytes: bytes.to_vec(),
        };

        let mut delivered = 0;
        match to {
            Some(target) => {
                if let Some(endpoint) = inner.endpoints.get(target) {
                    if endpoint.up && endpoint.tx.send(frame).is_ok() {
                        delivered = 1;
                    }
                }
            }
            None => {
                for (id, endpoint) in inner.endpoints.iter() {
                    if id != from && endpoint.up && endpoint.tx.send(frame.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }

        Ok(delivered)
    }
}

impl Default for LinkHub {
    fn default() -> Self {
        Self::new()
    }
}
