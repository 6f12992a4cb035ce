//! Structured logging for segment processing.

use tracing::{error, info, warn, Span};
use vscale_models::DispatchMessage;

/// Logs the lifecycle of one dispatch message with its job, segment and
/// queue id attached to every line.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    segment: String,
    message_id: String,
}

impl JobLogger {
    pub fn new(message_id: &str, message: &DispatchMessage) -> Self {
        Self {
            job_id: message.job_id.to_string(),
            segment: message.segment_name.clone(),
            message_id: message_id.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            segment = %self.segment,
            message_id = %self.message_id,
            "Segment started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            segment = %self.segment,
            "Segment progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            segment = %self.segment,
            message_id = %self.message_id,
            "Segment warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            segment = %self.segment,
            message_id = %self.message_id,
            "Segment error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            segment = %self.segment,
            message_id = %self.message_id,
            "Segment completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    /// Span wrapping all work done for this delivery.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "segment",
            job_id = %self.job_id,
            segment = %self.segment,
            message_id = %self.message_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vscale_models::JobId;

    #[test]
    fn test_logger_fields() {
        let message = DispatchMessage::new(JobId::from_string("job-1"), "job-1_00000003.mp4");
        let logger = JobLogger::new("17-0", &message);

        assert_eq!(logger.job_id(), "job-1");
        assert_eq!(logger.segment(), "job-1_00000003.mp4");
    }
}
