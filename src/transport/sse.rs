//! Text event-stream framing.
//!
//! Every frame ends with a blank line:
//!
//! ```text
//! event: connected\ndata:\n\n      sent once when the stream opens
//! data: {"name":"seq:done",...}\n\n one queued item
//! event: probe\ndata:\n\n          idle keepalive
//! ```

use serde::Serialize;

use crate::Result;

/// Sentinel sent as soon as a stream opens.
pub fn connected() -> String {
    "event: connected\ndata:\n\n".to_string()
}

/// Zero-data keepalive sent after an idle timeout.
pub fn probe() -> String {
    "event: probe\ndata:\n\n".to_string()
}

/// Unnamed frame carrying `item` as JSON.
pub fn data<T: Serialize>(item: &T) -> Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(item)?))
}
