//! Structured job logging utilities.

use tracing::{error, info, warn, Span};

use encnode_models::{AcquisitionPath, JobId};

/// Job logger carrying the job id and how the job was acquired.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    path: AcquisitionPath,
}

impl JobLogger {
    pub fn new(job_id: &JobId, path: AcquisitionPath) -> Self {
        Self {
            job_id: job_id.to_string(),
            path,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(job_id = %self.job_id, path = %self.path, "Job started: {}", message);
    }

    pub fn log_progress(&self, message: &str) {
        info!(job_id = %self.job_id, path = %self.path, "Job progress: {}", message);
    }

    pub fn log_warning(&self, message: &str) {
        warn!(job_id = %self.job_id, path = %self.path, "Job warning: {}", message);
    }

    pub fn log_error(&self, message: &str) {
        error!(job_id = %self.job_id, path = %self.path, "Job error: {}", message);
    }

    pub fn log_completion(&self, message: &str) {
        info!(job_id = %self.job_id, path = %self.path, "Job completed: {}", message);
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn path(&self) -> AcquisitionPath {
        self.path
    }

    /// Span for everything done on behalf of this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("job", job_id = %self.job_id, path = %self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_creation() {
        let job_id = JobId::from_string("J1");
        let logger = JobLogger::new(&job_id, AcquisitionPath::Rescued);

        assert_eq!(logger.job_id(), "J1");
        assert_eq!(logger.path(), AcquisitionPath::Rescued);
    }
}
