//! Accept-path binding of incoming rdmacm requests to endpoints.
//!
//! The listener cannot trust anything in a connect request: the sid and
//! nonce are attacker-controlled bytes. Every mismatch is dropped without
//! failing the victim connection, with a rate-limited diagnostic so a probe
//! storm cannot flood the log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use tracing::warn;

use super::cm::RdmaCm;
use super::endpoint::protocol::ConnectRequest;
use super::endpoint::Endpoint;
use crate::error::{Error, Result};

/// At most one warning per second per call site.
fn should_log(last_second: &AtomicU64) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let prev = last_second.load(Ordering::Relaxed);
    prev != now
        && last_second
            .compare_exchange(prev, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
}

macro_rules! warn_every_second {
    ($($arg:tt)*) => {{
        static LAST: AtomicU64 = AtomicU64::new(0);
        if should_log(&LAST) {
            warn!($($arg)*);
        }
    }};
}

/// Socket-id lookup table for the accept path.
#[derive(Default)]
pub struct EndpointTable {
    map: RwLock<FxHashMap<u64, Arc<Endpoint>>>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ep` reachable by its connection's socket id.
    pub fn register(&self, ep: Arc<Endpoint>) {
        let sid = ep.conn().id();
        self.map
            .write()
            .expect("endpoint table poisoned")
            .insert(sid, ep);
    }

    pub fn deregister(&self, sid: u64) {
        self.map
            .write()
            .expect("endpoint table poisoned")
            .remove(&sid);
    }

    pub fn lookup(&self, sid: u64) -> Option<Arc<Endpoint>> {
        self.map
            .read()
            .expect("endpoint table poisoned")
            .get(&sid)
            .cloned()
    }
}

/// Bind a connect request to its endpoint: look up the sid, verify the
/// nonce byte-for-byte, adopt the CM, negotiate the windows down, and wake
/// the endpoint's handshake through its pipe.
///
/// On any mismatch the request is dropped; the victim connection is never
/// failed here (a forged request must not kill a healthy socket).
pub fn initialize_from_accept(
    table: &EndpointTable,
    rcm: Box<dyn RdmaCm>,
    private_data: &[u8],
) -> Result<()> {
    let Some(req) = ConnectRequest::deserialize(private_data) else {
        warn_every_second!("malformed private data in rdma accept");
        return Err(Error::Protocol("malformed connect request"));
    };

    let Some(ep) = table.lookup(req.sid) else {
        warn_every_second!("invalid socket id for rdma accept");
        return Err(Error::Protocol("unknown socket id"));
    };

    if let Err(e) = ep.init_from_accept(rcm, &req) {
        warn_every_second!("rdma accept rejected: {e}");
        return Err(e);
    }
    Ok(())
}
