pub mod chunked;
pub mod config;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod metrics_consts;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod source;
pub mod spine;
pub mod test_utils;
pub mod transform;

pub use config::Config;
pub use envelope::{Envelope, Input, Payload};
pub use error::PipelineError;
pub use lifecycle::{LifecycleGuard, ShutdownReason, ShutdownSignal};
pub use message::{DecodedRecord, Message, Partition};
pub use pipeline::{Pipeline, PipelineSummary, RunnablePipeline};
pub use retry::RetryPolicy;
pub use source::{Acknowledger, Disconnect, MessageSource};
pub use spine::{BatchSettings, Spine, SpinePipeline};
