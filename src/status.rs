use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppError;

/// Workflow status attached to an assignment. The string keys are a persisted
/// contract: stored rows and external clients reference them by key, so they
/// must never be renamed without a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    StartWorking,
    NeedMoreInstructions,
    SubmittedToTeacher,
    Approved,
    Rejected,
    AssignToStudent,
}

/// Display order for dashboards and summary counts.
pub const ALL_STATUSES: [TrackStatus; 6] = [
    TrackStatus::StartWorking,
    TrackStatus::NeedMoreInstructions,
    TrackStatus::SubmittedToTeacher,
    TrackStatus::Approved,
    TrackStatus::Rejected,
    TrackStatus::AssignToStudent,
];

/// Statuses an assigned student may submit.
pub const STUDENT_STATUSES: [TrackStatus; 3] = [
    TrackStatus::StartWorking,
    TrackStatus::NeedMoreInstructions,
    TrackStatus::SubmittedToTeacher,
];

/// Statuses an assigned teacher may submit.
pub const TEACHER_STATUSES: [TrackStatus; 2] = [TrackStatus::Approved, TrackStatus::Rejected];

impl TrackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackStatus::StartWorking => "start_working",
            TrackStatus::NeedMoreInstructions => "need_more_instructions",
            TrackStatus::SubmittedToTeacher => "submitted_to_teacher",
            TrackStatus::Approved => "approved",
            TrackStatus::Rejected => "rejected",
            TrackStatus::AssignToStudent => "assign_to_student",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, AppError> {
        match s {
            "start_working" => Ok(TrackStatus::StartWorking),
            "need_more_instructions" => Ok(TrackStatus::NeedMoreInstructions),
            "submitted_to_teacher" => Ok(TrackStatus::SubmittedToTeacher),
            "approved" => Ok(TrackStatus::Approved),
            "rejected" => Ok(TrackStatus::Rejected),
            "assign_to_student" => Ok(TrackStatus::AssignToStudent),
            _ => Err(AppError::Validation(format!("Unknown status: {}", s))),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TrackStatus::StartWorking => "Start Working",
            TrackStatus::NeedMoreInstructions => "Need More Instructions",
            TrackStatus::SubmittedToTeacher => "Submitted to Teacher",
            TrackStatus::Approved => "Approved",
            TrackStatus::Rejected => "Rejected",
            TrackStatus::AssignToStudent => "Assign to Student",
        }
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The caller's relationship to the assignment whose status is being written.
/// Authors and admins have full authoring control; assigned teachers and
/// students get role-scoped subsets. Anyone else never reaches this check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWriter {
    Author,
    Admin,
    AssignedTeacher,
    AssignedStudent,
}

impl StatusWriter {
    /// Whether this writer may store the given status. `None` clears the
    /// stored value, which only full authoring control allows.
    pub fn may_set(&self, status: Option<TrackStatus>) -> bool {
        match self {
            StatusWriter::Author | StatusWriter::Admin => true,
            StatusWriter::AssignedStudent => match status {
                Some(s) => STUDENT_STATUSES.contains(&s),
                None => false,
            },
            StatusWriter::AssignedTeacher => match status {
                Some(s) => TEACHER_STATUSES.contains(&s),
                None => false,
            },
        }
    }
}
