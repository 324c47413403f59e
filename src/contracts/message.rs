/// A single task bound for the broker.
///
/// The payload is opaque to the publishing side: it is whatever the row
/// translator produced for one input record. `index` is the 1-based
/// position of that record in the source and is carried along purely so
/// failures can be reported against the row that caused them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    routing_key: String,
    index: u64,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(routing_key: impl Into<String>, index: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            index,
            payload: payload.into(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Lossy text view of the payload, used for log lines only.
    pub fn preview(&self, max_chars: usize) -> String {
        String::from_utf8_lossy(&self.payload)
            .chars()
            .take(max_chars)
            .collect()
    }
}
