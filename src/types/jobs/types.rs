use mongodb::bson::Bson;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Lifecycle state of a job.
///
/// States carry a strict numeric ordering so that the store can run range
/// queries over them (e.g. `state < Finished` selects everything the forward
/// and revert arms have not finished with yet). The ordinal is the persisted
/// representation; renumbering variants is a breaking schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display)]
pub enum JobState {
    /// Received by the platform, not yet eligible for scheduling
    Submitted = 0,
    /// Eligible to be claimed by a scheduler replica
    ReadyForScheduling = 1,
    /// Claimed by a scheduler replica, execution not yet recorded
    Scheduling = 2,
    /// Execution identifiers recorded, workload handed to the backend
    Scheduled = 3,
    /// The workload is running
    Running = 4,
    /// A cancellation is in flight; `state_group` retains the pre-cancel group
    Canceling = 5,
    /// Terminal: the job was cancelled
    Cancelled = 6,
    /// Eligible to be claimed for a compensating (revert) run
    ReadyForRevert = 7,
    /// Claimed for reverting, revert execution not yet recorded
    RevertScheduling = 8,
    /// Revert execution identifiers recorded
    RevertScheduled = 9,
    /// The compensating workload is running
    RevertRunning = 10,
    /// Terminal: the job completed successfully
    Finished = 11,
    /// Terminal: the job failed
    Failed = 12,
}

impl JobState {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Submitted),
            1 => Some(Self::ReadyForScheduling),
            2 => Some(Self::Scheduling),
            3 => Some(Self::Scheduled),
            4 => Some(Self::Running),
            5 => Some(Self::Canceling),
            6 => Some(Self::Cancelled),
            7 => Some(Self::ReadyForRevert),
            8 => Some(Self::RevertScheduling),
            9 => Some(Self::RevertScheduled),
            10 => Some(Self::RevertRunning),
            11 => Some(Self::Finished),
            12 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished | Self::Failed)
    }

    pub fn terminal_states() -> [Self; 3] {
        [Self::Cancelled, Self::Finished, Self::Failed]
    }
}

impl Serialize for JobState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

impl<'de> Deserialize<'de> for JobState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i32::deserialize(deserializer)?;
        JobState::from_i32(value).ok_or_else(|| D::Error::custom(format!("invalid job state ordinal: {}", value)))
    }
}

impl From<JobState> for Bson {
    fn from(state: JobState) -> Self {
        Bson::Int32(state.as_i32())
    }
}

/// Coarse projection of [`JobState`] used to remember where a job "belongs"
/// across the `Canceling` detour: a running job being cancelled keeps
/// `state_group = Running` so a failed cancellation can restore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
pub enum JobStateGroup {
    Scheduled,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl From<JobStateGroup> for Bson {
    fn from(group: JobStateGroup) -> Self {
        Bson::String(group.to_string())
    }
}

/// State of a single task step within a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum StepState {
    Waiting,
    Running,
    Finished,
    Cancelled,
}

impl From<StepState> for Bson {
    fn from(state: StepState) -> Self {
        Bson::String(state.to_string())
    }
}

/// Bookkeeping state of a GPU reservation. The state machine only records
/// reservation and release; allocation itself happens elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum GpuState {
    Reserved,
    Released,
}

impl From<GpuState> for Bson {
    fn from(state: GpuState) -> Self {
        Bson::String(state.to_string())
    }
}
