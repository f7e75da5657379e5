#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

/// An owned inbound record as delivered by a source.
///
/// Carries everything needed to acknowledge it later (topic, partition and
/// offset) alongside the raw key and payload bytes. Never mutated once built:
/// stages attach derived values to the surrounding `Envelope` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    partition: Partition,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    /// Milliseconds since the epoch, if the broker supplied one
    timestamp: Option<i64>,
}

/// Text view of a [`Message`] handed to user functions that run on the raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub key: String,
    pub value: String,
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        timestamp: Option<i64>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            payload,
            timestamp,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// Lossy UTF-8 view of key and payload. Missing fields decode to an empty string.
    pub fn decode(&self) -> DecodedRecord {
        DecodedRecord {
            key: lossy_text(self.key()),
            value: lossy_text(self.payload()),
            timestamp: self.timestamp,
        }
    }
}

fn lossy_text(bytes: Option<&[u8]>) -> String {
    bytes
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}
