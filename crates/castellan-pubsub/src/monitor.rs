//! Observation of subscribed broker traffic.
//!
//! Every message received on a monitored topic is classified and handed to
//! the configured [`MessageMonitor`]. Delivery must never block the
//! adapter's receive task.

/// A classified broker message.
#[derive(Debug, Clone)]
pub struct LoggedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
    pub duplicate: bool,
    pub is_utf8: bool,
    pub is_json: bool,
    pub is_base64: bool,
    pub looks_compressed: bool,
    pub looks_encrypted: bool,
}

impl LoggedMessage {
    /// Classify a received payload.
    pub fn classify(topic: &str, payload: Vec<u8>, qos: u8, retained: bool, duplicate: bool) -> Self {
        let is_utf8 = std::str::from_utf8(&payload).is_ok();
        let mut message = Self {
            topic: topic.to_string(),
            payload,
            qos,
            retained,
            duplicate,
            is_utf8,
            is_json: false,
            is_base64: false,
            looks_compressed: false,
            looks_encrypted: false,
        };

        if message.is_utf8 {
            if serde_json::from_slice::<serde_json::Value>(&message.payload).is_ok() {
                message.is_json = true;
            } else {
                message.is_base64 = is_base64(&message.payload);
            }
        } else if looks_compressed(&message.payload) {
            message.looks_compressed = true;
        } else {
            message.looks_encrypted = looks_encrypted(&message.payload);
        }

        message
    }
}

/// Magic numbers of common compression formats (gzip, zlib, zstd, xz).
fn looks_compressed(payload: &[u8]) -> bool {
    payload.starts_with(&[0x1f, 0x8b])
        || payload.starts_with(&[0x78, 0x01])
        || payload.starts_with(&[0x78, 0x9c])
        || payload.starts_with(&[0x78, 0xda])
        || payload.starts_with(&[0x28, 0xb5, 0x2f, 0xfd])
        || payload.starts_with(&[0xfd, 0x37, 0x7a])
}

/// Ciphertext heuristic: enough data and a near-uniform byte distribution.
fn looks_encrypted(payload: &[u8]) -> bool {
    if payload.len() < 16 {
        return false;
    }
    let mut seen = [false; 256];
    for &b in payload {
        seen[b as usize] = true;
    }
    let distinct = seen.iter().filter(|&&s| s).count();
    distinct * 2 >= payload.len().min(256)
}

fn is_base64(payload: &[u8]) -> bool {
    !payload.is_empty()
        && payload.len() % 4 == 0
        && payload
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

/// Sink for monitored traffic.
pub trait MessageMonitor: Send + Sync {
    fn on_message(&self, message: LoggedMessage);
}

/// Monitor that logs classified messages through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl MessageMonitor for TracingMonitor {
    fn on_message(&self, message: LoggedMessage) {
        tracing::debug!(
            topic = %message.topic,
            size = message.payload.len(),
            is_utf8 = message.is_utf8,
            is_json = message.is_json,
            looks_encrypted = message.looks_encrypted,
            "observed message on monitored topic"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_json() {
        let message =
            LoggedMessage::classify("t", br#"{"hello":"world"}"#.to_vec(), 0, false, false);
        assert!(message.is_utf8);
        assert!(message.is_json);
        assert!(!message.is_base64);
    }

    #[test]
    fn classifies_base64() {
        let message = LoggedMessage::classify("t", b"aGVsbG8gd29ybGQ=".to_vec(), 0, false, false);
        assert!(message.is_utf8);
        assert!(!message.is_json);
        assert!(message.is_base64);
    }

    #[test]
    fn classifies_compressed() {
        let mut payload = vec![0x1f, 0x8b, 0x08];
        payload.extend_from_slice(&[0xff; 20]);
        let message = LoggedMessage::classify("t", payload, 0, false, false);
        assert!(!message.is_utf8);
        assert!(message.looks_compressed);
        assert!(!message.looks_encrypted);
    }

    #[test]
    fn classifies_encrypted() {
        // 0x80 leads with a UTF-8 continuation byte; all 64 values distinct.
        let payload: Vec<u8> = (0x80..0xc0u8).collect();
        let message = LoggedMessage::classify("t", payload, 0, false, false);
        assert!(!message.is_utf8);
        assert!(!message.looks_compressed);
        assert!(message.looks_encrypted);
    }
}
