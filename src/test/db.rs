use crate::auth::Role;
use crate::db::{
    AssigneeSlot, add_chat_message, authenticate_user, clean_expired_sessions, create_assignment,
    create_category, create_user, create_user_session, delete_user, get_chat_messages,
    get_field_values, get_schema_template, get_session_by_token, get_users_created_by,
    list_assignments_for, save_schema_template, status_summary, update_assignment,
    update_track_status, validate_assignee,
};
use crate::error::AppError;
use crate::models::AssignmentWrite;
use crate::schema::{RawFieldDef, normalize_fields};
use crate::status::TrackStatus;
use crate::test::utils::{STANDARD_PASSWORD, TestDbBuilder, create_standard_test_db};
use chrono::{Duration, Utc};
use serde_json::json;

#[rocket::async_test]
async fn permissions_follow_the_role_sets() {
    let test_db = create_standard_test_db().await;

    let subscriber = test_db.user("subscriber_user").await.unwrap();
    assert!(subscriber.has_permission(crate::auth::Permission::CreateAssignments));
    assert!(subscriber.has_permission(crate::auth::Permission::ProvisionUsers));
    assert!(!subscriber.has_permission(crate::auth::Permission::DeleteAnyUser));

    let teacher = test_db.user("teacher_user").await.unwrap();
    assert!(teacher.has_permission(crate::auth::Permission::ReviewSubmissions));
    assert!(!teacher.has_permission(crate::auth::Permission::CreateAssignments));

    let student = test_db.user("student_user").await.unwrap();
    assert!(student.has_permission(crate::auth::Permission::UpdateWorkStatus));
    assert!(!student.has_permission(crate::auth::Permission::ReviewSubmissions));

    let admin = test_db.user("admin_user").await.unwrap();
    assert!(admin.has_permission(crate::auth::Permission::DeleteAnyUser));
    assert!(admin.has_permission(crate::auth::Permission::ManageAllAssignments));

    // Dashboard access follows the permission set, not a hardcoded role list.
    assert!(subscriber.can_access_dashboard());
    assert!(admin.can_access_dashboard());
    assert!(!teacher.can_access_dashboard());
    assert!(!student.can_access_dashboard());
}

#[rocket::async_test]
async fn create_user_generates_password_when_empty() {
    let test_db = create_standard_test_db().await;

    let created = create_user(
        &test_db.pool,
        "fresh_student",
        "fresh_student@example.com",
        "",
        Role::Student,
        None,
    )
    .await
    .unwrap();

    let generated = created.generated_password.unwrap();
    assert_eq!(generated.len(), 12);

    let user = authenticate_user(&test_db.pool, "fresh_student", &generated)
        .await
        .unwrap();
    assert!(user.is_some());
}

#[rocket::async_test]
async fn create_user_rejects_duplicates_and_bad_email() {
    let test_db = create_standard_test_db().await;

    let err = create_user(
        &test_db.pool,
        "student_user",
        "someone_else@example.com",
        "pw",
        Role::Student,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = create_user(
        &test_db.pool,
        "another_name",
        "student_user@example.com",
        "pw",
        Role::Student,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = create_user(&test_db.pool, "no_email", "not an address", "pw", Role::Student, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[rocket::async_test]
async fn authenticate_user_rejects_wrong_password() {
    let test_db = create_standard_test_db().await;

    let user = authenticate_user(&test_db.pool, "student_user", STANDARD_PASSWORD)
        .await
        .unwrap();
    assert!(user.is_some());

    let user = authenticate_user(&test_db.pool, "student_user", "wrong")
        .await
        .unwrap();
    assert!(user.is_none());
}

#[rocket::async_test]
async fn assignee_slots_are_role_checked() {
    let test_db = create_standard_test_db().await;
    let teacher_id = test_db.user_id("teacher_user").unwrap();
    let student_id = test_db.user_id("student_user").unwrap();

    // Correct role fills the slot, zero clears it.
    assert_eq!(
        validate_assignee(&test_db.pool, AssigneeSlot::Teacher, teacher_id)
            .await
            .unwrap(),
        Some(teacher_id)
    );
    assert_eq!(
        validate_assignee(&test_db.pool, AssigneeSlot::Teacher, 0)
            .await
            .unwrap(),
        None
    );
    assert_eq!(
        validate_assignee(&test_db.pool, AssigneeSlot::Student, -3)
            .await
            .unwrap(),
        None
    );

    // Wrong role and unknown user are rejected outright.
    let err = validate_assignee(&test_db.pool, AssigneeSlot::Teacher, student_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = validate_assignee(&test_db.pool, AssigneeSlot::Student, 99999)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[rocket::async_test]
async fn storage_write_path_rejects_invalid_assignee() {
    let test_db = create_standard_test_db().await;
    let author = test_db.user("subscriber_user").await.unwrap();
    let teacher_id = test_db.user_id("teacher_user").unwrap();

    let write = AssignmentWrite {
        title: "Bad Assignee".to_string(),
        content: "content".to_string(),
        // A teacher id in the student slot fails a direct storage write; only
        // the form boundary gets to drop it.
        student_id: teacher_id,
        ..Default::default()
    };

    let err = create_assignment(&test_db.pool, &author, &write)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let listed = list_assignments_for(&test_db.pool, &author).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[rocket::async_test]
async fn create_assignment_requires_title_and_content() {
    let test_db = create_standard_test_db().await;
    let author = test_db.user("subscriber_user").await.unwrap();

    let write = AssignmentWrite {
        title: "<b></b>".to_string(),
        content: "body".to_string(),
        ..Default::default()
    };
    let err = create_assignment(&test_db.pool, &author, &write)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[rocket::async_test]
async fn only_author_or_admin_may_edit() {
    let test_db = create_standard_test_db().await;
    let teacher = test_db.user("teacher_user").await.unwrap();
    let admin = test_db.user("admin_user").await.unwrap();
    let id = test_db.assignment_id("Essay One").unwrap();

    let write = AssignmentWrite {
        title: "Renamed".to_string(),
        content: "new content".to_string(),
        ..Default::default()
    };

    let err = update_assignment(&test_db.pool, &teacher, id, &write)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Authorization(_)));

    let updated = update_assignment(&test_db.pool, &admin, id, &write)
        .await
        .unwrap();
    assert_eq!(updated.title, "Renamed");
}

#[rocket::async_test]
async fn listings_are_scoped_by_relationship() {
    let test_db = TestDbBuilder::new()
        .admin("root", None)
        .subscriber("author_a", None)
        .subscriber("author_b", None)
        .teacher("marker", None)
        .student("pupil", None)
        .assignment("A One", "author_a", Some("marker"), Some("pupil"))
        .assignment("A Two", "author_a", None, None)
        .assignment("B One", "author_b", None, Some("pupil"))
        .build()
        .await
        .unwrap();

    let author_a = test_db.user("author_a").await.unwrap();
    let listed = list_assignments_for(&test_db.pool, &author_a).await.unwrap();
    assert_eq!(listed.len(), 2);

    let marker = test_db.user("marker").await.unwrap();
    let listed = list_assignments_for(&test_db.pool, &marker).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].title, "A One");

    let pupil = test_db.user("pupil").await.unwrap();
    let listed = list_assignments_for(&test_db.pool, &pupil).await.unwrap();
    assert_eq!(listed.len(), 2);

    let root = test_db.user("root").await.unwrap();
    let listed = list_assignments_for(&test_db.pool, &root).await.unwrap();
    assert_eq!(listed.len(), 3);
}

#[rocket::async_test]
async fn template_edits_never_touch_existing_assignments() {
    let test_db = create_standard_test_db().await;
    let author = test_db.user("subscriber_user").await.unwrap();

    let template = normalize_fields(&[RawFieldDef {
        label: Some("Due".to_string()),
        key: Some("due".to_string()),
        field_type: Some("date".to_string()),
        ..Default::default()
    }]);
    save_schema_template(&test_db.pool, author.id, &template)
        .await
        .unwrap();

    let write = AssignmentWrite {
        title: "Snapshot".to_string(),
        content: "content".to_string(),
        fields_schema: template.clone(),
        ..Default::default()
    };
    let created = create_assignment(&test_db.pool, &author, &write)
        .await
        .unwrap();
    assert_eq!(created.fields_schema, template);

    // Replacing the template afterwards leaves the frozen snapshot alone.
    let replacement = normalize_fields(&[RawFieldDef {
        label: Some("Score".to_string()),
        key: Some("score".to_string()),
        field_type: Some("number".to_string()),
        ..Default::default()
    }]);
    save_schema_template(&test_db.pool, author.id, &replacement)
        .await
        .unwrap();

    let stored = crate::db::get_assignment(&test_db.pool, created.id)
        .await
        .unwrap();
    assert_eq!(stored.fields_schema, template);
    assert_eq!(
        get_schema_template(&test_db.pool, author.id).await.unwrap(),
        replacement
    );
}

#[rocket::async_test]
async fn field_values_follow_the_frozen_schema() {
    let test_db = create_standard_test_db().await;
    let author = test_db.user("subscriber_user").await.unwrap();

    let schema = normalize_fields(&[
        RawFieldDef {
            label: Some("Notes".to_string()),
            key: Some("notes".to_string()),
            field_type: Some("text".to_string()),
            ..Default::default()
        },
        RawFieldDef {
            label: Some("Done".to_string()),
            key: Some("done".to_string()),
            field_type: Some("checkbox".to_string()),
            ..Default::default()
        },
    ]);

    let mut submitted = serde_json::Map::new();
    submitted.insert("notes".to_string(), json!("  <i>tidy</i> up "));

    let write = AssignmentWrite {
        title: "With Fields".to_string(),
        content: "content".to_string(),
        field_values: crate::schema::collect_values(&schema, &submitted),
        fields_schema: schema,
        ..Default::default()
    };

    let created = create_assignment(&test_db.pool, &author, &write)
        .await
        .unwrap();

    let mut values = get_field_values(&test_db.pool, created.id).await.unwrap();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        values,
        vec![
            ("done".to_string(), json!("0")),
            ("notes".to_string(), json!("tidy up")),
        ]
    );
}

#[rocket::async_test]
async fn status_summary_is_scoped_per_role() {
    let test_db = TestDbBuilder::new()
        .subscriber("author", None)
        .teacher("marker", None)
        .student("pupil", None)
        .assignment("One", "author", Some("marker"), Some("pupil"))
        .assignment("Two", "author", Some("marker"), Some("pupil"))
        .assignment("Unstatused", "author", None, None)
        .build()
        .await
        .unwrap();

    let author = test_db.user("author").await.unwrap();
    let marker = test_db.user("marker").await.unwrap();
    let pupil = test_db.user("pupil").await.unwrap();

    update_track_status(
        &test_db.pool,
        &pupil,
        test_db.assignment_id("One").unwrap(),
        Some(TrackStatus::SubmittedToTeacher),
    )
    .await
    .unwrap();
    update_track_status(
        &test_db.pool,
        &marker,
        test_db.assignment_id("Two").unwrap(),
        Some(TrackStatus::Approved),
    )
    .await
    .unwrap();

    // Author sees all six statuses and a total that includes the unstatused row.
    let summary = status_summary(&test_db.pool, &author).await.unwrap();
    assert_eq!(summary.counts.len(), 6);
    assert_eq!(summary.total, 3);

    // Teacher sees review statuses plus the pending-review queue.
    let summary = status_summary(&test_db.pool, &marker).await.unwrap();
    assert_eq!(summary.counts.len(), 3);
    let pending = summary
        .counts
        .iter()
        .find(|c| c.status == "submitted_to_teacher")
        .unwrap();
    assert_eq!(pending.label, "Pending Review");
    assert_eq!(pending.count, 1);
    assert_eq!(summary.total, 2);

    // Student sees only their own three progress statuses.
    let summary = status_summary(&test_db.pool, &pupil).await.unwrap();
    assert_eq!(summary.counts.len(), 3);
    assert_eq!(summary.total, 1);
}

#[rocket::async_test]
async fn chat_is_access_checked_and_labeled() {
    let test_db = create_standard_test_db().await;
    let teacher = test_db.user("teacher_user").await.unwrap();
    let student = test_db.user("student_user").await.unwrap();
    let id = test_db.assignment_id("Essay One").unwrap();

    add_chat_message(&test_db.pool, &teacher, id, "Please <b>revise</b> section two")
        .await
        .unwrap();
    add_chat_message(&test_db.pool, &student, id, "Will do")
        .await
        .unwrap();

    let messages = get_chat_messages(&test_db.pool, &student, id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "Please revise section two");
    assert_eq!(messages[0].sender_label, "Teacher");
    assert_eq!(messages[1].sender_label, "Student");

    let outsider = create_user(
        &test_db.pool,
        "outsider",
        "outsider@example.com",
        "pw123456",
        Role::Student,
        None,
    )
    .await
    .unwrap();
    let outsider = crate::db::get_user(&test_db.pool, outsider.id).await.unwrap();

    let err = get_chat_messages(&test_db.pool, &outsider, id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Authorization(_)));

    let err = add_chat_message(&test_db.pool, &student, id, "<p></p>")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[rocket::async_test]
async fn delete_user_enforces_ownership_and_role() {
    let test_db = create_standard_test_db().await;
    let admin = test_db.user("admin_user").await.unwrap();
    let subscriber = test_db.user("subscriber_user").await.unwrap();

    // Subscribers may only delete accounts they provisioned.
    let stranger = create_user(
        &test_db.pool,
        "stray_student",
        "stray_student@example.com",
        "pw123456",
        Role::Student,
        None,
    )
    .await
    .unwrap();
    let err = delete_user(&test_db.pool, &subscriber, stranger.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Authorization(_)));

    // Admin accounts are never deletable; subscribers cannot delete other
    // subscriber accounts.
    let err = delete_user(&test_db.pool, &admin, admin.id).await.unwrap_err();
    assert!(matches!(err, AppError::Authorization(_)));
    let err = delete_user(&test_db.pool, &subscriber, subscriber.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // Deleting an assigned teacher clears the slot and their backlog.
    let teacher_id = test_db.user_id("teacher_user").unwrap();
    delete_user(&test_db.pool, &subscriber, teacher_id)
        .await
        .unwrap();

    let assignment = test_db.assignment("Essay One").await.unwrap();
    assert_eq!(assignment.teacher_id, None);
    assert!(crate::db::get_user(&test_db.pool, teacher_id).await.is_err());

    let remaining = get_users_created_by(&test_db.pool, subscriber.id)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].username, "student_user");
}

#[rocket::async_test]
async fn admin_may_delete_subscriber_accounts() {
    let test_db = create_standard_test_db().await;
    let admin = test_db.user("admin_user").await.unwrap();
    let subscriber_id = test_db.user_id("subscriber_user").unwrap();
    let teacher_id = test_db.user_id("teacher_user").unwrap();
    let student_id = test_db.user_id("student_user").unwrap();
    let assignment_id = test_db.assignment_id("Essay One").unwrap();

    delete_user(&test_db.pool, &admin, subscriber_id)
        .await
        .unwrap();

    assert!(crate::db::get_user(&test_db.pool, subscriber_id).await.is_err());

    // Everything the subscriber authored goes with them, notifications
    // included, and the accounts they provisioned survive unowned.
    assert!(matches!(
        crate::db::get_assignment(&test_db.pool, assignment_id)
            .await
            .unwrap_err(),
        AppError::NotFound(_)
    ));
    assert_eq!(crate::db::unread_count(&test_db.pool, teacher_id).await.unwrap(), 0);
    assert_eq!(crate::db::unread_count(&test_db.pool, student_id).await.unwrap(), 0);

    let teacher = crate::db::get_user(&test_db.pool, teacher_id).await.unwrap();
    assert_eq!(teacher.created_by, None);
}

#[rocket::async_test]
async fn expired_sessions_are_cleaned_up() {
    let test_db = create_standard_test_db().await;
    let user_id = test_db.user_id("student_user").unwrap();

    let live = Utc::now().naive_utc() + Duration::hours(1);
    let dead = Utc::now().naive_utc() - Duration::hours(1);
    create_user_session(&test_db.pool, user_id, "token_live", live)
        .await
        .unwrap();
    create_user_session(&test_db.pool, user_id, "token_dead", dead)
        .await
        .unwrap();

    let removed = clean_expired_sessions(&test_db.pool).await.unwrap();
    assert_eq!(removed, 1);

    assert!(get_session_by_token(&test_db.pool, "token_live").await.is_ok());
    let err = get_session_by_token(&test_db.pool, "token_dead")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Authentication(_)));
}

#[rocket::async_test]
async fn categories_require_existing_parents() {
    let test_db = create_standard_test_db().await;

    let root = create_category(&test_db.pool, "Maths", None).await.unwrap();
    let child = create_category(&test_db.pool, "Algebra", Some(root.id))
        .await
        .unwrap();
    assert_eq!(child.parent_id, Some(root.id));

    let err = create_category(&test_db.pool, "Orphan", Some(99999))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[rocket::async_test]
async fn tags_are_created_on_first_use_and_deduplicated() {
    let test_db = create_standard_test_db().await;
    let author = test_db.user("subscriber_user").await.unwrap();

    let write = AssignmentWrite {
        title: "Tagged".to_string(),
        content: "content".to_string(),
        tags: vec![
            "homework".to_string(),
            " homework ".to_string(),
            "".to_string(),
            "revision".to_string(),
        ],
        ..Default::default()
    };
    let created = create_assignment(&test_db.pool, &author, &write)
        .await
        .unwrap();

    let tags = crate::db::tags_for_assignment(&test_db.pool, created.id)
        .await
        .unwrap();
    let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["homework", "revision"]);
}
