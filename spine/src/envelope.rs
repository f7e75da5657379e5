use crate::message::{DecodedRecord, Message};

/// What a stage has produced for a message so far.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<T> {
    /// No stage has derived a value yet; user functions see the decoded record.
    Raw,
    Derived(T),
}

/// The argument handed to user transform and batch functions.
#[derive(Debug, Clone, PartialEq)]
pub enum Input<T> {
    Raw(DecodedRecord),
    Derived(T),
}

impl<T> Input<T> {
    pub fn derived(self) -> Option<T> {
        match self {
            Input::Derived(value) => Some(value),
            Input::Raw(_) => None,
        }
    }

    pub fn raw(self) -> Option<DecodedRecord> {
        match self {
            Input::Raw(record) => Some(record),
            Input::Derived(_) => None,
        }
    }
}

/// A message travelling through the pipeline: the original record, which is
/// needed at the sink for acknowledgment, plus whatever the previous stage derived.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    record: Message,
    payload: Payload<T>,
}

impl Envelope<()> {
    /// Wrap a freshly received record. Nothing has been derived from it yet.
    pub fn new(record: Message) -> Self {
        Self {
            record,
            payload: Payload::Raw,
        }
    }
}

impl<T> Envelope<T> {
    pub fn with_payload(record: Message, payload: Payload<T>) -> Self {
        Self { record, payload }
    }

    /// Build the envelope a stage emits after its user function returned `result`.
    /// `None` means "no derived value yet", so the next stage sees the raw record again.
    pub fn from_result(record: Message, result: Option<T>) -> Self {
        let payload = match result {
            Some(value) => Payload::Derived(value),
            None => Payload::Raw,
        };
        Self { record, payload }
    }

    pub fn record(&self) -> &Message {
        &self.record
    }

    pub fn payload(&self) -> &Payload<T> {
        &self.payload
    }

    pub fn derived(&self) -> Option<&T> {
        match &self.payload {
            Payload::Derived(value) => Some(value),
            Payload::Raw => None,
        }
    }

    /// Split into the record and the input for the next user function.
    pub fn into_input(self) -> (Message, Input<T>) {
        let input = match self.payload {
            Payload::Derived(value) => Input::Derived(value),
            Payload::Raw => Input::Raw(self.record.decode()),
        };
        (self.record, input)
    }

    pub fn into_record(self) -> Message {
        self.record
    }
}
