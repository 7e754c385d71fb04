//! Notification sink: human-readable status for whatever surface hosts the
//! agent. The daemon reports through tracing; an editor front-end would
//! provide its own implementation.

use tracing::{error, info};

pub trait StatusSink: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// Reports status through the tracing pipeline.
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn info(&self, message: &str) {
        info!("{}", message);
    }

    fn error(&self, message: &str) {
        error!("{}", message);
    }
}
