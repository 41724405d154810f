//! Satellite network double that records every submission.

use crate::models::CommandRequest;
use crate::orchestration::{CommandSubmitter, SubmissionError};
use async_trait::async_trait;
use parking_lot::Mutex;

/// How the fake network answers a submission
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitBehavior {
    Accept,
    Reject,
    Fail(SubmissionError),
}

#[derive(Debug)]
pub struct RecordingSubmitter {
    behavior: Mutex<SubmitBehavior>,
    submitted: Mutex<Vec<CommandRequest>>,
}

impl RecordingSubmitter {
    pub fn new() -> Self {
        Self::with_behavior(SubmitBehavior::Accept)
    }

    pub fn with_behavior(behavior: SubmitBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: SubmitBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn submitted(&self) -> Vec<CommandRequest> {
        self.submitted.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submitted.lock().len()
    }
}

impl Default for RecordingSubmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandSubmitter for RecordingSubmitter {
    async fn submit_command(&self, request: &CommandRequest) -> Result<bool, SubmissionError> {
        self.submitted.lock().push(request.clone());
        match self.behavior.lock().clone() {
            SubmitBehavior::Accept => Ok(true),
            SubmitBehavior::Reject => Ok(false),
            SubmitBehavior::Fail(error) => Err(error),
        }
    }
}
