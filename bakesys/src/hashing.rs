/*!
Deterministic hashing of JSON-shaped values.

Everything in the build graph is content-addressed through a single
operation: serialize a JSON value with sorted keys and feed it through
SHA-256. The hex digest of that stream is the hash used throughout the
crate.
*/

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Streaming hash writer. Implements `std::io::Write` so serializers and
/// file copies can feed it directly.
pub struct HashWriter {
    digest: Sha256,
}

impl HashWriter {
    pub fn new() -> Self {
        Self {
            digest: Sha256::new(),
        }
    }

    /// Feed a JSON value into the hash stream. Object keys are serialized
    /// in sorted order.
    pub fn update_value(&mut self, value: &Value) {
        // Serialization of an in-memory value into an infallible writer
        // cannot fail.
        serde_json::to_writer(&mut *self, value).expect("JSON value serialization failed");
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    /// Consume the writer and return the hex digest.
    pub fn finish(self) -> String {
        hex::encode(self.digest.finalize())
    }
}

impl Default for HashWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::io::Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.digest.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Hash a JSON-shaped value, returning the hex digest.
pub fn hash_value(value: &Value) -> String {
    let mut writer = HashWriter::new();
    writer.update_value(value);
    writer.finish()
}
