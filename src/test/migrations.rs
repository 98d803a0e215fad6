use sqlx::SqlitePool;

#[rocket::async_test]
async fn migrations_apply_cleanly() {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();

    for expected in [
        "assignment_categories",
        "assignment_field_values",
        "assignment_tags",
        "assignments",
        "categories",
        "chat_messages",
        "field_schema_templates",
        "notifications",
        "tags",
        "user_sessions",
        "users",
    ] {
        assert!(names.contains(&expected), "missing table {}", expected);
    }
}
