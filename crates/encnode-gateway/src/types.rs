//! Gateway wire types.

use serde::{Deserialize, Serialize};

use encnode_models::{JobDescription, JobResult};

#[derive(Debug, Clone, Serialize)]
pub struct NextJobRequest<'a> {
    pub worker_id: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextJobResponse {
    #[serde(default)]
    pub job: Option<JobDescription>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptRequest<'a> {
    pub worker_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressRequest<'a> {
    pub worker_id: &'a str,
    pub percent: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompleteRequest<'a> {
    pub worker_id: &'a str,
    pub result: &'a JobResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailRequest<'a> {
    pub worker_id: &'a str,
    pub reason: &'a str,
}
