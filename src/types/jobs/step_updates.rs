use chrono::{DateTime, Utc};

use crate::error::JobError;
use crate::types::jobs::types::StepState;

/// Defining a structure that contains the changes to be made to one step of
/// a job, matched by task id. Only the fields set here are written; absent
/// fields are left untouched (a patch, not a replace).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StepDetailsUpdate {
    pub state: Option<StepState>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub warning: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// implements only needed singular changes
impl StepDetailsUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_state(mut self, state: StepState) -> StepDetailsUpdate {
        self.state = Some(state);
        self
    }

    pub fn update_progress(mut self, progress: f64) -> StepDetailsUpdate {
        self.progress = Some(progress);
        self
    }

    pub fn update_message(mut self, message: String) -> StepDetailsUpdate {
        self.message = Some(message);
        self
    }

    pub fn update_warning(mut self, warning: String) -> StepDetailsUpdate {
        self.warning = Some(warning);
        self
    }

    pub fn update_start_time(mut self, start_time: DateTime<Utc>) -> StepDetailsUpdate {
        self.start_time = Some(start_time);
        self
    }

    pub fn update_end_time(mut self, end_time: DateTime<Utc>) -> StepDetailsUpdate {
        self.end_time = Some(end_time);
        self
    }

    pub fn build(self) -> Result<StepDetailsUpdate, JobError> {
        if self.state.is_none()
            && self.progress.is_none()
            && self.message.is_none()
            && self.warning.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
        {
            Err(JobError::NoUpdateFound)
        } else {
            Ok(self)
        }
    }
}
