//! The shared request payload.
//!
//! One immutable buffer, sized to the I/O chunk, reused by every send on
//! every stream. The first eight bytes carry the total response length the
//! server should produce, so even a zero-length upload still ships enough
//! bytes for the peer to read the hint. The final send of a stream may
//! reference a shorter prefix to attach the FIN flag on a short tail.

use bytes::Bytes;

/// Number of leading payload bytes reserved for the response-length hint.
pub const RESPONSE_HINT_SIZE: usize = std::mem::size_of::<u64>();

/// Immutable request payload shared by all workers and in-flight sends.
#[derive(Debug, Clone)]
pub struct RequestBuffer {
    data: Bytes,
}

impl RequestBuffer {
    /// Builds the payload. `response_hint` is the download size in bytes,
    /// or `u64::MAX` for timed transfers.
    pub fn new(io_size: u32, response_hint: u64) -> Self {
        let len = (io_size as usize).max(RESPONSE_HINT_SIZE);
        let mut data = vec![0u8; len];
        data[..RESPONSE_HINT_SIZE].copy_from_slice(&response_hint.to_le_bytes());
        Self {
            data: Bytes::from(data),
        }
    }

    /// The full I/O-sized payload.
    pub fn full(&self) -> Bytes {
        self.data.clone()
    }

    /// A shortened descriptor over the same payload, for the final send.
    pub fn last(&self, len: u64) -> Bytes {
        let len = (len as usize).min(self.data.len());
        self.data.slice(..len)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Reads the response-length hint from the head of a received payload.
pub fn read_response_hint(payload: &[u8]) -> Option<u64> {
    let head: [u8; RESPONSE_HINT_SIZE] = payload.get(..RESPONSE_HINT_SIZE)?.try_into().ok()?;
    Some(u64::from_le_bytes(head))
}
