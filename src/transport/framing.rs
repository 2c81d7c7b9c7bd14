use std::io;
use std::sync::Arc;

use super::HostConnection;

/// Default maximum message size accepted from a peer (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Parses application messages out of a connection's read buffer.
///
/// The completion pump calls this after appending received bytes, so the
/// parser sees data in arrival order regardless of which transport carried
/// it.
pub trait MessageFramer: Send + Sync {
    /// `new_bytes` were just appended to `conn.read_buf()`; `received_us` is
    /// the wall-clock receive timestamp in microseconds.
    fn process_new_message(
        &self,
        conn: &Arc<dyn HostConnection>,
        new_bytes: usize,
        received_us: i64,
    ) -> io::Result<()>;
}

/// Validates that a parsed frame length does not exceed the maximum.
pub fn validate_frame_len(len: usize, max_len: usize) -> io::Result<()> {
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message length {} exceeds maximum allowed size {}", len, max_len),
        ));
    }
    Ok(())
}
