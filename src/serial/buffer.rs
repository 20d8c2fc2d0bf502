use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything received from the bridge since the buffer was last cleared.
///
/// The reader task is the only writer; the protocol side reads, drains and clears.
#[derive(Debug, Clone, Default)]
pub struct ReceiveBuffer {
    inner: Arc<Mutex<Received>>,
}

#[derive(Debug, Default)]
struct Received {
    text: String,
    /// Start of a multi-byte character whose remaining bytes are still in flight
    partial: Vec<u8>,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes, dropping anything that is not valid UTF-8. A character cut off at the
    /// end of `bytes` is held back until the next append completes it.
    pub async fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;
        let mut data = std::mem::take(&mut inner.partial);
        data.extend_from_slice(bytes);

        let (text, incomplete) = decode_permissive(&data);
        inner.text.push_str(&text);
        inner.partial = incomplete.to_vec();
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.text.clear();
        inner.partial.clear();
    }

    /// Take the buffered text, leaving the buffer empty
    pub async fn drain(&self) -> String {
        std::mem::take(&mut self.inner.lock().await.text)
    }

    pub async fn snapshot(&self) -> String {
        self.inner.lock().await.text.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.text.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.text.len()
    }
}

/// Valid text in `bytes` with invalid sequences skipped, plus a trailing incomplete character
fn decode_permissive(bytes: &[u8]) -> (String, &[u8]) {
    let mut text = String::new();
    let mut rest = bytes;

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                return (text, &[][..]);
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                text.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(invalid) => rest = &after[invalid..],
                    None => return (text, after),
                }
            }
        }
    }
}
