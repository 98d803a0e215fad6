use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{self, FieldDef};
use crate::status::TrackStatus;

#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author_id: i64,
    pub teacher_id: Option<i64>,
    pub student_id: Option<i64>,
    pub status: Option<TrackStatus>,
    /// Frozen copy of the author's field schema, taken at create/update time.
    pub fields_schema: Vec<FieldDef>,
    pub last_notified_teacher_id: i64,
    pub last_notified_student_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbAssignment {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub author_id: Option<i64>,
    pub teacher_id: Option<i64>,
    pub student_id: Option<i64>,
    pub status: Option<String>,
    pub fields_schema: Option<String>,
    pub last_notified_teacher_id: Option<i64>,
    pub last_notified_student_id: Option<i64>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl From<DbAssignment> for Assignment {
    fn from(row: DbAssignment) -> Self {
        Self {
            id: row.id.unwrap_or_default(),
            title: row.title.unwrap_or_default(),
            content: row.content.unwrap_or_default(),
            author_id: row.author_id.unwrap_or_default(),
            // A zero slot id means "cleared"; normalize it away here.
            teacher_id: row.teacher_id.filter(|id| *id > 0),
            student_id: row.student_id.filter(|id| *id > 0),
            status: row
                .status
                .as_deref()
                .and_then(|s| TrackStatus::from_str(s).ok()),
            fields_schema: schema::parse_schema_json(row.fields_schema.as_deref().unwrap_or("[]")),
            last_notified_teacher_id: row.last_notified_teacher_id.unwrap_or_default(),
            last_notified_student_id: row.last_notified_student_id.unwrap_or_default(),
            created_at: Utc.from_utc_datetime(&row.created_at.unwrap_or_default()),
            updated_at: Utc.from_utc_datetime(&row.updated_at.unwrap_or_default()),
        }
    }
}

/// Everything a single assignment write carries through the validated write
/// path. Raw assignee ids come straight from the form: zero or negative
/// clears the slot, a positive id must pass role validation.
#[derive(Debug, Clone, Default)]
pub struct AssignmentWrite {
    pub title: String,
    pub content: String,
    pub teacher_id: i64,
    pub student_id: i64,
    pub status: Option<TrackStatus>,
    pub fields_schema: Vec<FieldDef>,
    pub field_values: Vec<(String, Value)>,
    pub category_ids: Vec<i64>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: String,
    pub user_id: i64,
    pub assignment_id: i64,
    /// User who triggered the assignment change; 0 means the system itself.
    pub assigned_by: i64,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbNotification {
    pub public_id: Option<String>,
    pub user_id: Option<i64>,
    pub assignment_id: Option<i64>,
    pub assigned_by: Option<i64>,
    pub read: Option<bool>,
    pub created_at: Option<NaiveDateTime>,
}

impl From<DbNotification> for Notification {
    fn from(row: DbNotification) -> Self {
        Self {
            id: row.public_id.unwrap_or_default(),
            user_id: row.user_id.unwrap_or_default(),
            assignment_id: row.assignment_id.unwrap_or_default(),
            assigned_by: row.assigned_by.unwrap_or_default(),
            read: row.read.unwrap_or_default(),
            created_at: Utc.from_utc_datetime(&row.created_at.unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: i64,
    pub assignment_id: i64,
    pub sender_id: i64,
    pub sender_name: String,
    pub sender_label: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbChatMessage {
    pub id: Option<i64>,
    pub assignment_id: Option<i64>,
    pub sender_id: Option<i64>,
    pub sender_name: Option<String>,
    pub sender_role: Option<String>,
    pub content: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}

impl From<DbChatMessage> for ChatMessage {
    fn from(row: DbChatMessage) -> Self {
        let sender_label = match row.sender_role.as_deref() {
            Some("admin") => "Admin",
            Some("teacher") => "Teacher",
            Some("student") => "Student",
            _ => "Assigner",
        };
        Self {
            id: row.id.unwrap_or_default(),
            assignment_id: row.assignment_id.unwrap_or_default(),
            sender_id: row.sender_id.unwrap_or_default(),
            sender_name: row.sender_name.unwrap_or_default(),
            sender_label: sender_label.to_string(),
            content: row.content.unwrap_or_default(),
            created_at: Utc.from_utc_datetime(&row.created_at.unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

/// One row of a dashboard status-summary badge strip.
#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub label: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub counts: Vec<StatusCount>,
    pub total: i64,
}
