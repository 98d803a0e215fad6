use crate::{
    auth::{DbUser, DbUserSession, Role, User, UserSession},
    error::AppError,
    models::{
        Assignment, AssignmentWrite, Category, ChatMessage, DbAssignment, DbChatMessage,
        DbNotification, Notification, StatusCount, StatusSummary, Tag,
    },
    schema,
    status::{ALL_STATUSES, STUDENT_STATUSES, TEACHER_STATUSES, StatusWriter, TrackStatus},
};
use chrono::{NaiveDateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::Value;
use sqlx::{Pool, Sqlite, Transaction};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::ValidateEmail;

/// Hard cap on any single user's notification list. Oldest entries are
/// evicted first once the cap is exceeded.
pub const NOTIFICATION_CAP: i64 = 300;

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[instrument(skip(pool))]
pub async fn get_user(pool: &Pool<Sqlite>, id: i64) -> Result<User, AppError> {
    info!("Fetching user by ID");
    let row = sqlx::query_as::<_, DbUser>(
        "SELECT id, username, email, role, display_name, created_by, archived FROM users WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(user) => Ok(User::from(user)),
        _ => Err(AppError::NotFound(format!(
            "User with id {} not found in database",
            id
        ))),
    }
}

#[derive(sqlx::FromRow)]
struct AuthRow {
    id: i64,
    password: String,
}

#[instrument(skip_all, fields(username))]
pub async fn authenticate_user(
    pool: &Pool<Sqlite>,
    username: &str,
    password: &str,
) -> Result<Option<User>, AppError> {
    info!("Authenticating user");
    let row = sqlx::query_as::<_, AuthRow>("SELECT id, password FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => match bcrypt::verify(password, &row.password) {
            Ok(true) => Ok(Some(get_user(pool, row.id).await?)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

#[derive(Debug)]
pub struct ProvisionedUser {
    pub id: i64,
    /// Set when the caller left the password empty and one was generated.
    pub generated_password: Option<String>,
}

/// Creates an account. Username and a syntactically valid email are required
/// and must be unique; an empty password is replaced by a generated one.
#[instrument(skip(pool, password), fields(username, role = %role.as_str()))]
pub async fn create_user(
    pool: &Pool<Sqlite>,
    username: &str,
    email: &str,
    password: &str,
    role: Role,
    created_by: Option<i64>,
) -> Result<ProvisionedUser, AppError> {
    info!("Creating new user");

    let username = schema::sanitize_text(username);
    let email = schema::sanitize_email(email);

    if username.is_empty() {
        return Err(AppError::Validation("Username is required".to_string()));
    }
    if email.is_empty() || !email.validate_email() {
        return Err(AppError::Validation(
            "A valid email address is required".to_string(),
        ));
    }

    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM users WHERE username = ? OR email = ?")
            .bind(&username)
            .bind(&email)
            .fetch_optional(pool)
            .await?;

    if existing.is_some() {
        return Err(AppError::Validation(format!(
            "A user with username '{}' or email '{}' already exists",
            username, email
        )));
    }

    let generated = if password.is_empty() {
        Some(generate_password())
    } else {
        None
    };
    let effective_password = generated.as_deref().unwrap_or(password);
    let hashed_password = bcrypt::hash(effective_password, bcrypt::DEFAULT_COST)?;

    let res = sqlx::query(
        "INSERT INTO users (username, email, password, role, created_by) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&username)
    .bind(&email)
    .bind(&hashed_password)
    .bind(role.as_str())
    .bind(created_by)
    .execute(pool)
    .await?;

    Ok(ProvisionedUser {
        id: res.last_insert_rowid(),
        generated_password: generated,
    })
}

/// Teacher/student accounts provisioned by the given user, for the "my
/// users" table.
#[instrument(skip(pool))]
pub async fn get_users_created_by(
    pool: &Pool<Sqlite>,
    creator_id: i64,
) -> Result<Vec<User>, AppError> {
    info!("Listing users by creator");
    let rows = sqlx::query_as::<_, DbUser>(
        "SELECT id, username, email, role, display_name, created_by, archived FROM users
         WHERE created_by = ? AND role IN ('teacher', 'student')
         ORDER BY username",
    )
    .bind(creator_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(User::from).collect())
}

#[instrument(skip(pool))]
pub async fn get_all_users(pool: &Pool<Sqlite>) -> Result<Vec<User>, AppError> {
    let rows = sqlx::query_as::<_, DbUser>(
        "SELECT id, username, email, role, display_name, created_by, archived FROM users ORDER BY username",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(User::from).collect())
}

/// Deletes an account. A subscriber may only delete teacher/student accounts
/// they created; an admin may delete any non-administrator account, including
/// subscribers. Assignee slots pointing at the account are cleared,
/// assignments it authored are removed with their notifications, and the
/// account's sessions, notifications and chat messages go in the same
/// transaction.
#[instrument(skip(pool, actor), fields(actor_id = actor.id))]
pub async fn delete_user(pool: &Pool<Sqlite>, actor: &User, target_id: i64) -> Result<(), AppError> {
    info!("Deleting user");

    let target = get_user(pool, target_id).await?;

    if target.role == Role::Admin {
        return Err(AppError::Authorization(
            "Administrator accounts cannot be deleted".to_string(),
        ));
    }
    if actor.role != Role::Admin {
        if !matches!(target.role, Role::Teacher | Role::Student) {
            return Err(AppError::Validation(
                "Only teacher and student accounts can be deleted here".to_string(),
            ));
        }
        if target.created_by != Some(actor.id) {
            return Err(AppError::Authorization(
                "You can only delete accounts you created".to_string(),
            ));
        }
    }

    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE assignments SET teacher_id = NULL WHERE teacher_id = ?")
        .bind(target_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE assignments SET student_id = NULL WHERE student_id = ?")
        .bind(target_id)
        .execute(&mut *tx)
        .await?;
    // Assignments the account authored disappear with it, notifications first
    // so nothing points at a vanished assignment.
    sqlx::query(
        "DELETE FROM notifications WHERE assignment_id IN
             (SELECT id FROM assignments WHERE author_id = ?)",
    )
    .bind(target_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM assignments WHERE author_id = ?")
        .bind(target_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE users SET created_by = NULL WHERE created_by = ?")
        .bind(target_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM field_schema_templates WHERE user_id = ?")
        .bind(target_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM notifications WHERE user_id = ?")
        .bind(target_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chat_messages WHERE sender_id = ?")
        .bind(target_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM user_sessions WHERE user_id = ?")
        .bind(target_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(target_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

#[instrument(skip(pool))]
pub async fn update_user_display_name(
    pool: &Pool<Sqlite>,
    user_id: i64,
    display_name: &str,
) -> Result<(), AppError> {
    info!("Updating user display name");
    sqlx::query("UPDATE users SET display_name = ? WHERE id = ?")
        .bind(schema::sanitize_text(display_name))
        .bind(user_id)
        .execute(pool)
        .await?;

    Ok(())
}

#[instrument(skip_all, fields(user_id))]
pub async fn update_user_password(
    pool: &Pool<Sqlite>,
    user_id: i64,
    new_password: &str,
) -> Result<(), AppError> {
    info!("Updating user password");
    let hashed_password = bcrypt::hash(new_password, bcrypt::DEFAULT_COST)?;

    sqlx::query("UPDATE users SET password = ? WHERE id = ?")
        .bind(hashed_password)
        .bind(user_id)
        .execute(pool)
        .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[instrument(skip(pool, token))]
pub async fn create_user_session(
    pool: &Pool<Sqlite>,
    user_id: i64,
    token: &str,
    expires_at: NaiveDateTime,
) -> Result<i64, AppError> {
    info!("Creating user session");

    let res = sqlx::query("INSERT INTO user_sessions (user_id, token, expires_at) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(token)
        .bind(expires_at)
        .execute(pool)
        .await?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip(pool, token))]
pub async fn get_session_by_token(
    pool: &Pool<Sqlite>,
    token: &str,
) -> Result<UserSession, AppError> {
    info!("Getting session by token");

    let session = sqlx::query_as::<_, DbUserSession>(
        "SELECT id, user_id, token, created_at, expires_at FROM user_sessions WHERE token = ?",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    match session {
        Some(session) => Ok(UserSession::from(session)),
        _ => Err(AppError::Authentication(
            "Invalid session token".to_string(),
        )),
    }
}

#[instrument(skip(pool, token))]
pub async fn invalidate_session(pool: &Pool<Sqlite>, token: &str) -> Result<(), AppError> {
    info!("Invalidating session");

    sqlx::query("DELETE FROM user_sessions WHERE token = ?")
        .bind(token)
        .execute(pool)
        .await?;

    Ok(())
}

#[instrument(skip(pool))]
pub async fn clean_expired_sessions(pool: &Pool<Sqlite>) -> Result<u64, AppError> {
    info!("Cleaning expired sessions");

    let now = Utc::now().naive_utc();

    let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at < ?")
        .bind(now)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Assignee validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssigneeSlot {
    Teacher,
    Student,
}

impl AssigneeSlot {
    pub fn expected_role(&self) -> Role {
        match self {
            AssigneeSlot::Teacher => Role::Teacher,
            AssigneeSlot::Student => Role::Student,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AssigneeSlot::Teacher => "teacher",
            AssigneeSlot::Student => "student",
        }
    }
}

/// Validates one assignee slot value. Zero or negative clears the slot; a
/// positive id is accepted only if that user currently holds the slot's
/// role. Everything that writes `teacher_id`/`student_id` goes through here —
/// there is deliberately no other code path that can touch those columns.
#[instrument(skip(pool))]
pub async fn validate_assignee(
    pool: &Pool<Sqlite>,
    slot: AssigneeSlot,
    raw_id: i64,
) -> Result<Option<i64>, AppError> {
    if raw_id <= 0 {
        return Ok(None);
    }

    let user = match get_user(pool, raw_id).await {
        Ok(user) => user,
        Err(AppError::NotFound(_)) => {
            return Err(AppError::Validation(format!(
                "User {} does not exist and cannot fill the {} slot",
                raw_id,
                slot.name()
            )));
        }
        Err(e) => return Err(e),
    };

    if user.role != slot.expected_role() {
        return Err(AppError::Validation(format!(
            "User {} does not hold the {} role",
            raw_id,
            slot.name()
        )));
    }

    Ok(Some(raw_id))
}

// ---------------------------------------------------------------------------
// Assignments
// ---------------------------------------------------------------------------

/// Admin, author, assigned teacher and assigned student may see an
/// assignment; nobody else.
pub fn can_access_assignment(user: &User, assignment: &Assignment) -> bool {
    user.role == Role::Admin
        || assignment.author_id == user.id
        || assignment.teacher_id == Some(user.id)
        || assignment.student_id == Some(user.id)
}

#[instrument(skip(pool))]
pub async fn get_assignment(pool: &Pool<Sqlite>, id: i64) -> Result<Assignment, AppError> {
    info!("Fetching assignment");
    let row = sqlx::query_as::<_, DbAssignment>("SELECT * FROM assignments WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Assignment::from(row)),
        _ => Err(AppError::NotFound(format!("Assignment {} not found", id))),
    }
}

/// Creates an assignment through the validated write path: title/content
/// required, both assignee slots role-checked, status already parsed against
/// the enum. A changed assignee triggers exactly one notification per slot.
#[instrument(skip(pool, author, write), fields(author_id = author.id))]
pub async fn create_assignment(
    pool: &Pool<Sqlite>,
    author: &User,
    write: &AssignmentWrite,
) -> Result<Assignment, AppError> {
    info!("Creating assignment");

    let title = schema::sanitize_text(&write.title);
    let content = schema::sanitize_multiline(&write.content);
    if title.is_empty() || content.is_empty() {
        return Err(AppError::Validation(
            "Title and content are required".to_string(),
        ));
    }

    let teacher_id = validate_assignee(pool, AssigneeSlot::Teacher, write.teacher_id).await?;
    let student_id = validate_assignee(pool, AssigneeSlot::Student, write.student_id).await?;

    let schema_json = serde_json::to_string(&write.fields_schema)?;

    let res = sqlx::query(
        "INSERT INTO assignments (title, content, author_id, teacher_id, student_id, status, fields_schema)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&title)
    .bind(&content)
    .bind(author.id)
    .bind(teacher_id)
    .bind(student_id)
    .bind(write.status.map(|s| s.as_str()))
    .bind(&schema_json)
    .execute(pool)
    .await?;

    let id = res.last_insert_rowid();

    replace_field_values(pool, id, &write.field_values).await?;
    set_assignment_categories(pool, id, &write.category_ids).await?;
    set_assignment_tags(pool, id, &write.tags).await?;
    sync_assignee_notifications(pool, id, author.id).await?;

    get_assignment(pool, id).await
}

/// Full edit of an existing assignment; author or admin only. Runs the same
/// validation as creation and re-freezes the schema snapshot carried in the
/// write.
#[instrument(skip(pool, actor, write), fields(actor_id = actor.id))]
pub async fn update_assignment(
    pool: &Pool<Sqlite>,
    actor: &User,
    id: i64,
    write: &AssignmentWrite,
) -> Result<Assignment, AppError> {
    info!("Updating assignment");

    let existing = get_assignment(pool, id).await?;
    if existing.author_id != actor.id && actor.role != Role::Admin {
        return Err(AppError::Authorization(
            "Only the assignment author or an administrator may edit it".to_string(),
        ));
    }

    let title = schema::sanitize_text(&write.title);
    let content = schema::sanitize_multiline(&write.content);
    if title.is_empty() || content.is_empty() {
        return Err(AppError::Validation(
            "Title and content are required".to_string(),
        ));
    }

    let teacher_id = validate_assignee(pool, AssigneeSlot::Teacher, write.teacher_id).await?;
    let student_id = validate_assignee(pool, AssigneeSlot::Student, write.student_id).await?;

    let schema_json = serde_json::to_string(&write.fields_schema)?;
    let now = Utc::now().naive_utc();

    sqlx::query(
        "UPDATE assignments
         SET title = ?, content = ?, teacher_id = ?, student_id = ?, status = ?, fields_schema = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&title)
    .bind(&content)
    .bind(teacher_id)
    .bind(student_id)
    .bind(write.status.map(|s| s.as_str()))
    .bind(&schema_json)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    replace_field_values(pool, id, &write.field_values).await?;
    set_assignment_categories(pool, id, &write.category_ids).await?;
    set_assignment_tags(pool, id, &write.tags).await?;
    sync_assignee_notifications(pool, id, actor.id).await?;

    get_assignment(pool, id).await
}

/// Deletes an assignment. Notification cleanup runs inside the same
/// transaction as the row delete so no dashboard ever sees a notification
/// pointing at a vanished assignment.
#[instrument(skip(pool, actor), fields(actor_id = actor.id))]
pub async fn delete_assignment(pool: &Pool<Sqlite>, actor: &User, id: i64) -> Result<(), AppError> {
    info!("Deleting assignment");

    let existing = get_assignment(pool, id).await?;
    if existing.author_id != actor.id && actor.role != Role::Admin {
        return Err(AppError::Authorization(
            "Only the assignment author or an administrator may delete it".to_string(),
        ));
    }

    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM notifications WHERE assignment_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM assignments WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Status writes funnel through here. The caller's relationship to the
/// assignment picks the allowed subset; a disallowed or unknown value leaves
/// the stored status untouched and reports the failure.
#[instrument(skip(pool, actor), fields(actor_id = actor.id))]
pub async fn update_track_status(
    pool: &Pool<Sqlite>,
    actor: &User,
    id: i64,
    status: Option<TrackStatus>,
) -> Result<Assignment, AppError> {
    info!("Updating assignment status");

    let assignment = get_assignment(pool, id).await?;

    let writer = if actor.role == Role::Admin {
        StatusWriter::Admin
    } else if assignment.author_id == actor.id {
        StatusWriter::Author
    } else if assignment.teacher_id == Some(actor.id) {
        StatusWriter::AssignedTeacher
    } else if assignment.student_id == Some(actor.id) {
        StatusWriter::AssignedStudent
    } else {
        return Err(AppError::Authorization(
            "You are not assigned to this assignment".to_string(),
        ));
    };

    if !writer.may_set(status) {
        return Err(AppError::Validation(format!(
            "Status '{}' is not allowed for your role on this assignment",
            status.map(|s| s.as_str()).unwrap_or("")
        )));
    }

    let now = Utc::now().naive_utc();
    sqlx::query("UPDATE assignments SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.map(|s| s.as_str()))
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;

    get_assignment(pool, id).await
}

/// Role-scoped listing, newest first: authors see what they authored,
/// teachers/students what they are assigned to, admins everything.
#[instrument(skip(pool, user), fields(user_id = user.id, role = %user.role.as_str()))]
pub async fn list_assignments_for(
    pool: &Pool<Sqlite>,
    user: &User,
) -> Result<Vec<Assignment>, AppError> {
    info!("Listing assignments");

    let rows = match user.role {
        Role::Admin => {
            sqlx::query_as::<_, DbAssignment>(
                "SELECT * FROM assignments ORDER BY created_at DESC, id DESC",
            )
            .fetch_all(pool)
            .await?
        }
        Role::Subscriber => {
            sqlx::query_as::<_, DbAssignment>(
                "SELECT * FROM assignments WHERE author_id = ? ORDER BY created_at DESC, id DESC",
            )
            .bind(user.id)
            .fetch_all(pool)
            .await?
        }
        Role::Teacher => {
            sqlx::query_as::<_, DbAssignment>(
                "SELECT * FROM assignments WHERE teacher_id = ? ORDER BY created_at DESC, id DESC",
            )
            .bind(user.id)
            .fetch_all(pool)
            .await?
        }
        Role::Student => {
            sqlx::query_as::<_, DbAssignment>(
                "SELECT * FROM assignments WHERE student_id = ? ORDER BY created_at DESC, id DESC",
            )
            .bind(user.id)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows.into_iter().map(Assignment::from).collect())
}

#[derive(sqlx::FromRow)]
struct StatusCountRow {
    status: Option<String>,
    n: i64,
}

/// Dashboard badge counts. Authors and admins see every status plus a grand
/// total; students and teachers see the subset of statuses they act on, with
/// the teacher's `submitted_to_teacher` bucket surfaced as "Pending Review".
#[instrument(skip(pool, user), fields(user_id = user.id))]
pub async fn status_summary(pool: &Pool<Sqlite>, user: &User) -> Result<StatusSummary, AppError> {
    info!("Building status summary");

    let (query, scoped) = match user.role {
        Role::Admin => (
            "SELECT status, COUNT(*) AS n FROM assignments GROUP BY status",
            false,
        ),
        Role::Subscriber => (
            "SELECT status, COUNT(*) AS n FROM assignments WHERE author_id = ? GROUP BY status",
            true,
        ),
        Role::Teacher => (
            "SELECT status, COUNT(*) AS n FROM assignments WHERE teacher_id = ? GROUP BY status",
            true,
        ),
        Role::Student => (
            "SELECT status, COUNT(*) AS n FROM assignments WHERE student_id = ? GROUP BY status",
            true,
        ),
    };

    let mut q = sqlx::query_as::<_, StatusCountRow>(query);
    if scoped {
        q = q.bind(user.id);
    }
    let rows = q.fetch_all(pool).await?;

    let count_for = |status: TrackStatus| -> i64 {
        rows.iter()
            .filter(|r| r.status.as_deref() == Some(status.as_str()))
            .map(|r| r.n)
            .sum()
    };

    let counts: Vec<StatusCount> = match user.role {
        Role::Admin | Role::Subscriber => ALL_STATUSES
            .iter()
            .map(|s| StatusCount {
                status: s.as_str().to_string(),
                label: s.label().to_string(),
                count: count_for(*s),
            })
            .collect(),
        Role::Student => STUDENT_STATUSES
            .iter()
            .map(|s| StatusCount {
                status: s.as_str().to_string(),
                label: s.label().to_string(),
                count: count_for(*s),
            })
            .collect(),
        Role::Teacher => TEACHER_STATUSES
            .iter()
            .chain([TrackStatus::SubmittedToTeacher].iter())
            .map(|s| StatusCount {
                status: s.as_str().to_string(),
                label: if *s == TrackStatus::SubmittedToTeacher {
                    "Pending Review".to_string()
                } else {
                    s.label().to_string()
                },
                count: count_for(*s),
            })
            .collect(),
    };

    let total = match user.role {
        // Includes assignments with no status yet.
        Role::Admin | Role::Subscriber => rows.iter().map(|r| r.n).sum(),
        _ => counts.iter().map(|c| c.count).sum(),
    };

    Ok(StatusSummary { counts, total })
}

// ---------------------------------------------------------------------------
// Custom field values and schema templates
// ---------------------------------------------------------------------------

#[instrument(skip(pool, values))]
pub async fn replace_field_values(
    pool: &Pool<Sqlite>,
    assignment_id: i64,
    values: &[(String, Value)],
) -> Result<(), AppError> {
    info!("Replacing assignment field values");

    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM assignment_field_values WHERE assignment_id = ?")
        .bind(assignment_id)
        .execute(&mut *tx)
        .await?;

    for (key, value) in values {
        sqlx::query(
            "INSERT INTO assignment_field_values (assignment_id, field_key, value) VALUES (?, ?, ?)",
        )
        .bind(assignment_id)
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct FieldValueRow {
    field_key: String,
    value: String,
}

#[instrument(skip(pool))]
pub async fn get_field_values(
    pool: &Pool<Sqlite>,
    assignment_id: i64,
) -> Result<Vec<(String, Value)>, AppError> {
    let rows = sqlx::query_as::<_, FieldValueRow>(
        "SELECT field_key, value FROM assignment_field_values WHERE assignment_id = ?",
    )
    .bind(assignment_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let value = serde_json::from_str(&row.value).unwrap_or(Value::Null);
            (row.field_key, value)
        })
        .collect())
}

/// The caller's reusable schema template. New assignments snapshot this;
/// editing it later never touches already-created assignments.
#[instrument(skip(pool))]
pub async fn get_schema_template(
    pool: &Pool<Sqlite>,
    user_id: i64,
) -> Result<Vec<schema::FieldDef>, AppError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT schema_json FROM field_schema_templates WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;

    Ok(match row {
        Some((json,)) => schema::parse_schema_json(&json),
        None => Vec::new(),
    })
}

#[instrument(skip(pool, fields))]
pub async fn save_schema_template(
    pool: &Pool<Sqlite>,
    user_id: i64,
    fields: &[schema::FieldDef],
) -> Result<(), AppError> {
    info!("Saving field schema template");

    let json = serde_json::to_string(fields)?;
    let now = Utc::now().naive_utc();

    sqlx::query(
        "INSERT INTO field_schema_templates (user_id, schema_json, updated_at) VALUES (?, ?, ?)
         ON CONFLICT (user_id) DO UPDATE SET schema_json = excluded.schema_json, updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(&json)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// One insert plus the FIFO cap trim, inside the caller's transaction, so the
/// list can never exceed [`NOTIFICATION_CAP`] entries even under concurrent
/// writers.
async fn append_notification(
    tx: &mut Transaction<'_, Sqlite>,
    recipient_id: i64,
    assignment_id: i64,
    assigned_by: i64,
) -> Result<String, AppError> {
    let public_id = format!("n_{}", Uuid::new_v4().simple());

    sqlx::query(
        "INSERT INTO notifications (public_id, user_id, assignment_id, assigned_by) VALUES (?, ?, ?, ?)",
    )
    .bind(&public_id)
    .bind(recipient_id)
    .bind(assignment_id)
    .bind(assigned_by)
    .execute(&mut **tx)
    .await?;

    // FIFO eviction beyond the cap: keep only the newest rows by insert order.
    sqlx::query(
        "DELETE FROM notifications WHERE user_id = ?1 AND id NOT IN (
             SELECT id FROM notifications WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2)",
    )
    .bind(recipient_id)
    .bind(NOTIFICATION_CAP)
    .execute(&mut **tx)
    .await?;

    Ok(public_id)
}

/// Appends one notification to the recipient's list. Non-positive ids are
/// rejected.
#[instrument(skip(pool))]
pub async fn add_notification(
    pool: &Pool<Sqlite>,
    recipient_id: i64,
    assignment_id: i64,
    assigned_by: i64,
) -> Result<String, AppError> {
    if recipient_id <= 0 || assignment_id <= 0 {
        return Err(AppError::Validation(
            "Notification recipient and assignment must be valid ids".to_string(),
        ));
    }

    info!("Appending notification");

    let mut tx = pool.begin().await?;
    let public_id = append_notification(&mut tx, recipient_id, assignment_id, assigned_by).await?;
    tx.commit().await?;

    Ok(public_id)
}

/// Compares the current assignee slots against the last-notified markers and
/// notifies each changed, non-empty slot exactly once. Each notification and
/// its marker advance commit in one transaction, so an interrupted sync can
/// never leave a marker behind its notification and re-notify on retry.
#[instrument(skip(pool))]
pub async fn sync_assignee_notifications(
    pool: &Pool<Sqlite>,
    assignment_id: i64,
    assigned_by: i64,
) -> Result<u64, AppError> {
    let assignment = get_assignment(pool, assignment_id).await?;
    let mut created = 0;

    if let Some(teacher_id) = assignment.teacher_id {
        if teacher_id != assignment.last_notified_teacher_id {
            let mut tx = pool.begin().await?;
            append_notification(&mut tx, teacher_id, assignment_id, assigned_by).await?;
            sqlx::query("UPDATE assignments SET last_notified_teacher_id = ? WHERE id = ?")
                .bind(teacher_id)
                .bind(assignment_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            created += 1;
        }
    }

    if let Some(student_id) = assignment.student_id {
        if student_id != assignment.last_notified_student_id {
            let mut tx = pool.begin().await?;
            append_notification(&mut tx, student_id, assignment_id, assigned_by).await?;
            sqlx::query("UPDATE assignments SET last_notified_student_id = ? WHERE id = ?")
                .bind(student_id)
                .bind(assignment_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            created += 1;
        }
    }

    Ok(created)
}

/// Drops entries whose assignment no longer exists and collapses duplicates
/// sharing the same (assignment, created, triggered-by) triple, keeping the
/// earliest. Surviving entries keep their relative order.
#[instrument(skip(pool))]
pub async fn prune_notifications(pool: &Pool<Sqlite>, user_id: i64) -> Result<u64, AppError> {
    info!("Pruning notifications");

    let mut tx = pool.begin().await?;

    let missing = sqlx::query(
        "DELETE FROM notifications WHERE user_id = ?
         AND assignment_id NOT IN (SELECT id FROM assignments)",
    )
    .bind(user_id)
    .execute(&mut *tx)
    .await?;

    let dupes = sqlx::query(
        "DELETE FROM notifications WHERE user_id = ?1 AND id NOT IN (
             SELECT MIN(id) FROM notifications WHERE user_id = ?1
             GROUP BY assignment_id, created_at, assigned_by)",
    )
    .bind(user_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(missing.rows_affected() + dupes.rows_affected())
}

/// Prunes, then returns the user's notifications newest first.
#[instrument(skip(pool))]
pub async fn notifications_for_user(
    pool: &Pool<Sqlite>,
    user_id: i64,
) -> Result<Vec<Notification>, AppError> {
    prune_notifications(pool, user_id).await?;

    let rows = sqlx::query_as::<_, DbNotification>(
        "SELECT public_id, user_id, assignment_id, assigned_by, read, created_at
         FROM notifications WHERE user_id = ? ORDER BY id DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Notification::from).collect())
}

#[instrument(skip(pool))]
pub async fn mark_notification_read(
    pool: &Pool<Sqlite>,
    user_id: i64,
    public_id: &str,
) -> Result<(), AppError> {
    info!("Marking notification read");

    let result = sqlx::query("UPDATE notifications SET read = TRUE WHERE user_id = ? AND public_id = ?")
        .bind(user_id)
        .bind(public_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "Notification {} not found",
            public_id
        )));
    }

    Ok(())
}

#[instrument(skip(pool))]
pub async fn unread_count(pool: &Pool<Sqlite>, user_id: i64) -> Result<i64, AppError> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read = FALSE",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

const CHAT_MESSAGE_SELECT: &str =
    "SELECT c.id, c.assignment_id, c.sender_id,
            COALESCE(NULLIF(u.display_name, ''), u.username) AS sender_name,
            u.role AS sender_role, c.content, c.created_at
     FROM chat_messages c JOIN users u ON u.id = c.sender_id";

#[instrument(skip(pool, actor), fields(actor_id = actor.id))]
pub async fn get_chat_messages(
    pool: &Pool<Sqlite>,
    actor: &User,
    assignment_id: i64,
) -> Result<Vec<ChatMessage>, AppError> {
    info!("Fetching chat messages");

    let assignment = get_assignment(pool, assignment_id).await?;
    if !can_access_assignment(actor, &assignment) {
        return Err(AppError::Authorization(
            "You do not have access to this assignment".to_string(),
        ));
    }

    let rows = sqlx::query_as::<_, DbChatMessage>(&format!(
        "{} WHERE c.assignment_id = ? ORDER BY c.id",
        CHAT_MESSAGE_SELECT
    ))
    .bind(assignment_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(ChatMessage::from).collect())
}

/// Appends a chat message; auto-approved, access-checked, text stripped to
/// non-empty plain content.
#[instrument(skip(pool, actor, content), fields(actor_id = actor.id))]
pub async fn add_chat_message(
    pool: &Pool<Sqlite>,
    actor: &User,
    assignment_id: i64,
    content: &str,
) -> Result<ChatMessage, AppError> {
    info!("Appending chat message");

    let assignment = get_assignment(pool, assignment_id).await?;
    if !can_access_assignment(actor, &assignment) {
        return Err(AppError::Authorization(
            "You do not have access to this assignment".to_string(),
        ));
    }

    let content = schema::sanitize_multiline(content);
    if content.is_empty() {
        return Err(AppError::Validation(
            "Chat message cannot be empty".to_string(),
        ));
    }

    let res = sqlx::query(
        "INSERT INTO chat_messages (assignment_id, sender_id, content) VALUES (?, ?, ?)",
    )
    .bind(assignment_id)
    .bind(actor.id)
    .bind(&content)
    .execute(pool)
    .await?;

    let row = sqlx::query_as::<_, DbChatMessage>(&format!(
        "{} WHERE c.id = ?",
        CHAT_MESSAGE_SELECT
    ))
    .bind(res.last_insert_rowid())
    .fetch_one(pool)
    .await?;

    Ok(ChatMessage::from(row))
}

// ---------------------------------------------------------------------------
// Categories and tags
// ---------------------------------------------------------------------------

#[instrument(skip(pool))]
pub async fn list_categories(pool: &Pool<Sqlite>) -> Result<Vec<Category>, AppError> {
    let rows =
        sqlx::query_as::<_, Category>("SELECT id, name, parent_id FROM categories ORDER BY name")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

#[instrument(skip(pool))]
pub async fn create_category(
    pool: &Pool<Sqlite>,
    name: &str,
    parent_id: Option<i64>,
) -> Result<Category, AppError> {
    info!("Creating category");

    let name = schema::sanitize_text(name);
    if name.is_empty() {
        return Err(AppError::Validation("Category name is required".to_string()));
    }

    if let Some(parent) = parent_id {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM categories WHERE id = ?")
            .bind(parent)
            .fetch_optional(pool)
            .await?;
        if exists.is_none() {
            return Err(AppError::Validation(format!(
                "Parent category {} does not exist",
                parent
            )));
        }
    }

    let res = sqlx::query("INSERT INTO categories (name, parent_id) VALUES (?, ?)")
        .bind(&name)
        .bind(parent_id)
        .execute(pool)
        .await?;

    Ok(Category {
        id: res.last_insert_rowid(),
        name,
        parent_id,
    })
}

#[instrument(skip(pool))]
pub async fn list_tags(pool: &Pool<Sqlite>) -> Result<Vec<Tag>, AppError> {
    let rows = sqlx::query_as::<_, Tag>("SELECT id, name FROM tags ORDER BY name")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

#[instrument(skip(pool))]
async fn get_or_create_tag(pool: &Pool<Sqlite>, name: &str) -> Result<i64, AppError> {
    let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM tags WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    if let Some((id,)) = existing {
        return Ok(id);
    }

    let res = sqlx::query("INSERT INTO tags (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(res.last_insert_rowid())
}

/// Replaces the assignment's flat tag set. Names are sanitized, empties
/// dropped, and unknown tags created on first use.
#[instrument(skip(pool, tags))]
pub async fn set_assignment_tags(
    pool: &Pool<Sqlite>,
    assignment_id: i64,
    tags: &[String],
) -> Result<(), AppError> {
    let mut tag_ids = Vec::new();
    for name in tags {
        let name = schema::sanitize_text(name);
        if name.is_empty() {
            continue;
        }
        tag_ids.push(get_or_create_tag(pool, &name).await?);
    }

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM assignment_tags WHERE assignment_id = ?")
        .bind(assignment_id)
        .execute(&mut *tx)
        .await?;
    for tag_id in tag_ids {
        sqlx::query("INSERT OR IGNORE INTO assignment_tags (assignment_id, tag_id) VALUES (?, ?)")
            .bind(assignment_id)
            .bind(tag_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(())
}

/// Replaces the assignment's hierarchical category set. Unknown category ids
/// are skipped with a warning rather than failing the whole write.
#[instrument(skip(pool, category_ids))]
pub async fn set_assignment_categories(
    pool: &Pool<Sqlite>,
    assignment_id: i64,
    category_ids: &[i64],
) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM assignment_categories WHERE assignment_id = ?")
        .bind(assignment_id)
        .execute(&mut *tx)
        .await?;

    for category_id in category_ids {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM categories WHERE id = ?")
            .bind(category_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            warn!(category_id = %category_id, "Skipping unknown category");
            continue;
        }
        sqlx::query(
            "INSERT OR IGNORE INTO assignment_categories (assignment_id, category_id) VALUES (?, ?)",
        )
        .bind(assignment_id)
        .bind(category_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

#[instrument(skip(pool))]
pub async fn categories_for_assignment(
    pool: &Pool<Sqlite>,
    assignment_id: i64,
) -> Result<Vec<Category>, AppError> {
    let rows = sqlx::query_as::<_, Category>(
        "SELECT c.id, c.name, c.parent_id FROM categories c
         JOIN assignment_categories ac ON ac.category_id = c.id
         WHERE ac.assignment_id = ? ORDER BY c.name",
    )
    .bind(assignment_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip(pool))]
pub async fn tags_for_assignment(
    pool: &Pool<Sqlite>,
    assignment_id: i64,
) -> Result<Vec<Tag>, AppError> {
    let rows = sqlx::query_as::<_, Tag>(
        "SELECT t.id, t.name FROM tags t
         JOIN assignment_tags at ON at.tag_id = t.id
         WHERE at.assignment_id = ? ORDER BY t.name",
    )
    .bind(assignment_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
