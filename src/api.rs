use rocket::State;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::{Deserialize, Serialize, json::Json};
use serde_json::Value;
use sqlx::{Pool, Sqlite};
use validator::Validate;

use crate::auth::{Permission, Role, User, UserSession};
use crate::db;
use crate::models::{Assignment, AssignmentWrite, Category, ChatMessage, Notification, Tag};
use crate::schema::{self, FieldDef, RawFieldDef};
use crate::status::TrackStatus;
use crate::validation::{
    AppErrorExt, JsonValidateExt, PermissionCheckExt, ToValidationResponse, ValidationResponse,
};

type ApiError = Custom<Json<ValidationResponse>>;

// ---------------------------------------------------------------------------
// Auth and profile
// ---------------------------------------------------------------------------

#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Username is required"))]
    username: String,
    #[validate(length(min = 1, message = "Password is required"))]
    password: String,
}

#[derive(Serialize, Deserialize)]
pub struct LoginResponse {
    pub success: bool,
    pub user: Option<UserData>,
    pub error: Option<String>,
    pub redirect_url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct UserData {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub role: String,
    pub created_by: Option<i64>,
    pub archived: bool,
}

impl From<User> for UserData {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            role: user.role.to_string(),
            created_by: user.created_by,
            archived: user.archived,
        }
    }
}

#[post("/login", data = "<login>")]
pub async fn api_login(
    login: Json<LoginRequest>,
    cookies: &rocket::http::CookieJar<'_>,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<LoginResponse>, ApiError> {
    use chrono::Utc;
    use rocket::http::{Cookie, SameSite};

    let validated = login.validate_custom()?;

    match db::authenticate_user(db, &validated.username, &validated.password)
        .await
        .validate_custom()?
    {
        Some(user) => {
            let token = UserSession::generate_token();
            let expires_at = Utc::now() + chrono::Duration::hours(1);

            db::create_user_session(db, user.id, &token, expires_at.naive_utc())
                .await
                .validate_custom()?;

            let cookie = Cookie::build(("session_token", token))
                .same_site(SameSite::Lax)
                .http_only(true)
                .max_age(rocket::time::Duration::hours(1));
            cookies.add_private(cookie);

            cookies.add_private(
                Cookie::build(("user_role", user.role.to_string()))
                    .same_site(SameSite::Lax)
                    .max_age(rocket::time::Duration::hours(1)),
            );

            let redirect_url = if user.can_access_dashboard() {
                "/ui/dashboard".to_string()
            } else {
                "/ui/assignments".to_string()
            };

            Ok(Json(LoginResponse {
                success: true,
                user: Some(UserData::from(user)),
                error: None,
                redirect_url: Some(redirect_url),
            }))
        }
        None => Ok(Json(LoginResponse {
            success: false,
            user: None,
            error: Some("Invalid username or password".to_string()),
            redirect_url: None,
        })),
    }
}

#[post("/logout")]
pub async fn api_logout(
    cookies: &rocket::http::CookieJar<'_>,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    if let Some(cookie) = cookies.get_private("session_token") {
        db::invalidate_session(db, cookie.value())
            .await
            .validate_custom()?;
    }

    cookies.remove_private(rocket::http::Cookie::build("session_token"));
    cookies.remove_private(rocket::http::Cookie::build("user_role"));

    Ok(Status::Ok)
}

#[get("/me")]
pub async fn api_me(user: User) -> Result<Json<UserData>, ApiError> {
    user.require_permission(Permission::ViewOwnProfile)
        .validate_custom()?;
    Ok(Json(UserData::from(user)))
}

#[derive(Deserialize, Validate)]
pub struct ProfileUpdateRequest {
    #[validate(length(min = 1, message = "Display name is required"))]
    display_name: String,
}

#[put("/profile", data = "<profile>")]
pub async fn api_update_profile(
    profile: Json<ProfileUpdateRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    user.require_permission(Permission::EditOwnProfile)
        .validate_custom()?;
    let validated = profile.validate_custom()?;

    db::update_user_display_name(db, user.id, &validated.display_name)
        .await
        .validate_custom()?;

    Ok(Status::Ok)
}

#[derive(Deserialize, Validate)]
pub struct PasswordChangeRequest {
    #[validate(length(min = 1, message = "Current password is required"))]
    current_password: String,
    #[validate(length(min = 8, message = "New password must be at least 8 characters"))]
    new_password: String,
}

#[put("/password", data = "<request>")]
pub async fn api_change_password(
    request: Json<PasswordChangeRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    user.require_permission(Permission::EditOwnProfile)
        .validate_custom()?;
    let validated = request.validate_custom()?;

    let authenticated = db::authenticate_user(db, &user.username, &validated.current_password)
        .await
        .validate_custom()?;
    if authenticated.is_none() {
        return Err(crate::error::AppError::Authentication(
            "Current password is incorrect".to_string(),
        )
        .to_validation_response());
    }

    db::update_user_password(db, user.id, &validated.new_password)
        .await
        .validate_custom()?;

    Ok(Status::Ok)
}

// ---------------------------------------------------------------------------
// Assignments
// ---------------------------------------------------------------------------

#[derive(Deserialize, Validate)]
pub struct AssignmentRequest {
    #[validate(length(min = 1, message = "Title is required"))]
    title: String,
    #[validate(length(min = 1, message = "Content is required"))]
    content: String,
    #[serde(default)]
    teacher_id: Option<i64>,
    #[serde(default)]
    student_id: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    category_ids: Vec<i64>,
    #[serde(default)]
    tags: Vec<String>,
    /// Schema snapshot to freeze onto the assignment. Absent on create means
    /// "use my stored template"; absent on update means "keep the frozen one".
    #[serde(default)]
    fields_schema: Option<Vec<RawFieldDef>>,
    #[serde(default)]
    field_values: Option<serde_json::Map<String, Value>>,
}

#[derive(Serialize)]
pub struct AssignmentResponse {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author_id: i64,
    pub teacher_id: Option<i64>,
    pub student_id: Option<i64>,
    pub status: Option<String>,
    pub status_label: Option<String>,
    pub fields_schema: Vec<FieldDef>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Assignment> for AssignmentResponse {
    fn from(a: Assignment) -> Self {
        Self {
            id: a.id,
            title: a.title,
            content: a.content,
            author_id: a.author_id,
            teacher_id: a.teacher_id,
            student_id: a.student_id,
            status: a.status.map(|s| s.as_str().to_string()),
            status_label: a.status.map(|s| s.label().to_string()),
            fields_schema: a.fields_schema,
            created_at: a.created_at.to_rfc3339(),
            updated_at: a.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct AssignmentDetailResponse {
    #[serde(flatten)]
    pub assignment: AssignmentResponse,
    pub field_values: serde_json::Map<String, Value>,
    pub categories: Vec<Category>,
    pub tags: Vec<Tag>,
    pub can_edit: bool,
    pub can_delete: bool,
}

fn parse_status(raw: Option<&str>) -> Result<Option<TrackStatus>, ApiError> {
    match raw {
        None | Some("") => Ok(None),
        Some(s) => TrackStatus::from_str(s).map(Some).validate_custom(),
    }
}

/// Form-boundary assignee handling: an id that is unknown or does not hold
/// the slot's role is dropped, clearing the slot, instead of failing the
/// whole submission. The storage layer still rejects such ids outright for
/// any direct write.
async fn resolve_assignee(
    pool: &Pool<Sqlite>,
    slot: db::AssigneeSlot,
    raw: Option<i64>,
) -> Result<i64, ApiError> {
    let raw = raw.unwrap_or(0);
    match db::validate_assignee(pool, slot, raw).await {
        Ok(Some(id)) => Ok(id),
        Ok(None) => Ok(0),
        Err(crate::error::AppError::Validation(message)) => {
            tracing::warn!(slot = slot.name(), id = raw, %message, "Dropping invalid assignee");
            Ok(0)
        }
        Err(e) => Err(e.to_validation_response()),
    }
}

async fn assignment_detail(
    pool: &Pool<Sqlite>,
    user: &User,
    assignment: Assignment,
) -> Result<AssignmentDetailResponse, ApiError> {
    let values = db::get_field_values(pool, assignment.id)
        .await
        .validate_custom()?;
    let categories = db::categories_for_assignment(pool, assignment.id)
        .await
        .validate_custom()?;
    let tags = db::tags_for_assignment(pool, assignment.id)
        .await
        .validate_custom()?;

    let is_author = assignment.author_id == user.id;
    let is_admin = user.role == Role::Admin;

    Ok(AssignmentDetailResponse {
        assignment: AssignmentResponse::from(assignment),
        field_values: values.into_iter().collect(),
        categories,
        tags,
        can_edit: is_author || is_admin,
        can_delete: is_author || is_admin,
    })
}

#[get("/assignments")]
pub async fn api_list_assignments(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<AssignmentResponse>>, ApiError> {
    user.require_any_permission(&[Permission::ViewAssignedWork, Permission::ViewDashboard])
        .validate_custom()?;

    let assignments = db::list_assignments_for(db, &user).await.validate_custom()?;

    Ok(Json(
        assignments.into_iter().map(AssignmentResponse::from).collect(),
    ))
}

#[post("/assignments", data = "<request>")]
pub async fn api_create_assignment(
    request: Json<AssignmentRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<AssignmentDetailResponse>, ApiError> {
    user.require_permission(Permission::CreateAssignments)
        .validate_custom()?;
    let validated = request.validate_custom()?;

    let status = parse_status(validated.status.as_deref())?;

    let fields_schema = match &validated.fields_schema {
        Some(raw) => schema::normalize_fields(raw),
        None => db::get_schema_template(db, user.id).await.validate_custom()?,
    };

    let submitted = validated.field_values.clone().unwrap_or_default();
    let field_values = schema::collect_values(&fields_schema, &submitted);

    let teacher_id = resolve_assignee(db, db::AssigneeSlot::Teacher, validated.teacher_id).await?;
    let student_id = resolve_assignee(db, db::AssigneeSlot::Student, validated.student_id).await?;

    let write = AssignmentWrite {
        title: validated.title.clone(),
        content: validated.content.clone(),
        teacher_id,
        student_id,
        status,
        fields_schema,
        field_values,
        category_ids: validated.category_ids.clone(),
        tags: validated.tags.clone(),
    };

    let assignment = db::create_assignment(db, &user, &write)
        .await
        .validate_custom()?;

    Ok(Json(assignment_detail(db, &user, assignment).await?))
}

#[get("/assignments/<id>")]
pub async fn api_get_assignment(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<AssignmentDetailResponse>, ApiError> {
    let assignment = db::get_assignment(db, id).await.validate_custom()?;

    if !db::can_access_assignment(&user, &assignment) {
        return Err(Status::Forbidden.to_validation_response());
    }

    Ok(Json(assignment_detail(db, &user, assignment).await?))
}

#[put("/assignments/<id>", data = "<request>")]
pub async fn api_update_assignment(
    id: i64,
    request: Json<AssignmentRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<AssignmentDetailResponse>, ApiError> {
    user.require_any_permission(&[
        Permission::EditOwnAssignments,
        Permission::ManageAllAssignments,
    ])
    .validate_custom()?;
    let validated = request.validate_custom()?;

    let existing = db::get_assignment(db, id).await.validate_custom()?;

    let status = parse_status(validated.status.as_deref())?;

    // Edit mode works against the assignment's own frozen schema, never the
    // author's live template.
    let fields_schema = match &validated.fields_schema {
        Some(raw) => schema::normalize_fields(raw),
        None => existing.fields_schema.clone(),
    };

    let submitted = validated.field_values.clone().unwrap_or_default();
    let field_values = schema::collect_values(&fields_schema, &submitted);

    let teacher_id = resolve_assignee(db, db::AssigneeSlot::Teacher, validated.teacher_id).await?;
    let student_id = resolve_assignee(db, db::AssigneeSlot::Student, validated.student_id).await?;

    let write = AssignmentWrite {
        title: validated.title.clone(),
        content: validated.content.clone(),
        teacher_id,
        student_id,
        status,
        fields_schema,
        field_values,
        category_ids: validated.category_ids.clone(),
        tags: validated.tags.clone(),
    };

    let assignment = db::update_assignment(db, &user, id, &write)
        .await
        .validate_custom()?;

    Ok(Json(assignment_detail(db, &user, assignment).await?))
}

#[delete("/assignments/<id>")]
pub async fn api_delete_assignment(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    user.require_any_permission(&[
        Permission::DeleteOwnAssignments,
        Permission::ManageAllAssignments,
    ])
    .validate_custom()?;

    db::delete_assignment(db, &user, id).await.validate_custom()?;

    Ok(Status::NoContent)
}

#[derive(Deserialize)]
pub struct StatusUpdateRequest {
    #[serde(default)]
    status: Option<String>,
}

#[put("/assignments/<id>/status", data = "<request>")]
pub async fn api_update_status(
    id: i64,
    request: Json<StatusUpdateRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<AssignmentResponse>, ApiError> {
    // Coarse role gate; the relationship check (author / assignee / admin)
    // happens in the status write itself.
    user.require_any_permission(&[
        Permission::UpdateWorkStatus,
        Permission::ReviewSubmissions,
        Permission::EditOwnAssignments,
        Permission::ManageAllAssignments,
    ])
    .validate_custom()?;

    let status = parse_status(request.status.as_deref())?;

    let assignment = db::update_track_status(db, &user, id, status)
        .await
        .validate_custom()?;

    Ok(Json(AssignmentResponse::from(assignment)))
}

#[get("/status_summary")]
pub async fn api_status_summary(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<crate::models::StatusSummary>, ApiError> {
    let summary = db::status_summary(db, &user).await.validate_custom()?;
    Ok(Json(summary))
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Deserialize, Validate)]
pub struct ChatMessageRequest {
    #[validate(length(min = 1, message = "Message is required"))]
    message: String,
}

#[get("/assignments/<id>/chat")]
pub async fn api_get_chat(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let messages = db::get_chat_messages(db, &user, id).await.validate_custom()?;
    Ok(Json(messages))
}

#[post("/assignments/<id>/chat", data = "<request>")]
pub async fn api_post_chat(
    id: i64,
    request: Json<ChatMessageRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<ChatMessage>, ApiError> {
    user.require_permission(Permission::PostChatMessages)
        .validate_custom()?;
    let validated = request.validate_custom()?;

    let message = db::add_chat_message(db, &user, id, &validated.message)
        .await
        .validate_custom()?;

    Ok(Json(message))
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[get("/notifications")]
pub async fn api_get_notifications(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    user.require_permission(Permission::ViewNotifications)
        .validate_custom()?;

    let notifications = db::notifications_for_user(db, user.id)
        .await
        .validate_custom()?;

    Ok(Json(notifications))
}

#[get("/notifications/unread_count")]
pub async fn api_unread_count(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Value>, ApiError> {
    user.require_permission(Permission::ViewNotifications)
        .validate_custom()?;

    let count = db::unread_count(db, user.id).await.validate_custom()?;

    Ok(Json(serde_json::json!({ "unread": count })))
}

#[post("/notifications/<notification_id>/read")]
pub async fn api_mark_notification_read(
    notification_id: &str,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    user.require_permission(Permission::ViewNotifications)
        .validate_custom()?;

    db::mark_notification_read(db, user.id, notification_id)
        .await
        .validate_custom()?;

    Ok(Status::Ok)
}

// ---------------------------------------------------------------------------
// Field schema templates
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SchemaTemplateRequest {
    fields: Vec<RawFieldDef>,
}

#[get("/field_schema")]
pub async fn api_get_field_schema(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<FieldDef>>, ApiError> {
    user.require_permission(Permission::ManageFieldSchema)
        .validate_custom()?;

    let fields = db::get_schema_template(db, user.id).await.validate_custom()?;
    Ok(Json(fields))
}

#[put("/field_schema", data = "<request>")]
pub async fn api_save_field_schema(
    request: Json<SchemaTemplateRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<FieldDef>>, ApiError> {
    user.require_permission(Permission::ManageFieldSchema)
        .validate_custom()?;

    let normalized = schema::normalize_fields(&request.fields);
    db::save_schema_template(db, user.id, &normalized)
        .await
        .validate_custom()?;

    Ok(Json(normalized))
}

// ---------------------------------------------------------------------------
// User provisioning
// ---------------------------------------------------------------------------

#[derive(Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(length(min = 1, message = "Username is required"))]
    username: String,
    #[validate(email(message = "A valid email address is required"))]
    email: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Serialize)]
pub struct CreatedUserResponse {
    pub id: i64,
    pub username: String,
    pub role: String,
    /// Present only when the account was created without a password.
    pub generated_password: Option<String>,
}

#[post("/users", data = "<request>")]
pub async fn api_create_user(
    request: Json<CreateUserRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<CreatedUserResponse>, ApiError> {
    user.require_permission(Permission::ProvisionUsers)
        .validate_custom()?;
    let validated = request.validate_custom()?;

    // Subscriber-provisioned accounts are always teachers or students,
    // whatever was submitted; administrators may hand out any role.
    let role = if user.role == Role::Admin {
        match validated.role.as_deref() {
            None | Some("") => Role::Student,
            Some(submitted) => Role::from_str(submitted)
                .map_err(|e| {
                    crate::error::AppError::Validation(e.to_string()).to_validation_response()
                })?,
        }
    } else {
        Role::provisionable(validated.role.as_deref().unwrap_or(""))
    };

    let created = db::create_user(
        db,
        &validated.username,
        &validated.email,
        validated.password.as_deref().unwrap_or(""),
        role,
        Some(user.id),
    )
    .await
    .validate_custom()?;

    Ok(Json(CreatedUserResponse {
        id: created.id,
        username: validated.username,
        role: role.to_string(),
        generated_password: created.generated_password,
    }))
}

#[get("/users")]
pub async fn api_list_users(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<UserData>>, ApiError> {
    user.require_permission(Permission::ProvisionUsers)
        .validate_custom()?;

    let users = if user.role == Role::Admin {
        db::get_all_users(db).await.validate_custom()?
    } else {
        db::get_users_created_by(db, user.id).await.validate_custom()?
    };

    Ok(Json(users.into_iter().map(UserData::from).collect()))
}

#[delete("/users/<id>")]
pub async fn api_delete_user(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    user.require_any_permission(&[
        Permission::DeleteProvisionedUsers,
        Permission::DeleteAnyUser,
    ])
    .validate_custom()?;

    db::delete_user(db, &user, id).await.validate_custom()?;

    Ok(Status::NoContent)
}

// ---------------------------------------------------------------------------
// Categories and tags
// ---------------------------------------------------------------------------

#[derive(Deserialize, Validate)]
pub struct CategoryRequest {
    #[validate(length(min = 1, message = "Category name is required"))]
    name: String,
    #[serde(default)]
    parent_id: Option<i64>,
}

#[get("/categories")]
pub async fn api_list_categories(
    _user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<Category>>, ApiError> {
    let categories = db::list_categories(db).await.validate_custom()?;
    Ok(Json(categories))
}

#[post("/categories", data = "<request>")]
pub async fn api_create_category(
    request: Json<CategoryRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Category>, ApiError> {
    user.require_permission(Permission::ManageCategories)
        .validate_custom()?;
    let validated = request.validate_custom()?;

    let category = db::create_category(db, &validated.name, validated.parent_id)
        .await
        .validate_custom()?;

    Ok(Json(category))
}

#[get("/tags")]
pub async fn api_list_tags(
    _user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<Tag>>, ApiError> {
    let tags = db::list_tags(db).await.validate_custom()?;
    Ok(Json(tags))
}

#[get("/health")]
pub fn health() -> &'static str {
    "OK"
}
