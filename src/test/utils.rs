use crate::auth::Role;
use crate::db::{create_assignment, create_user, update_user_display_name};
use crate::error::AppError;
use crate::init_rocket;
use crate::models::AssignmentWrite;
use crate::status::TrackStatus;
use rocket::http::{ContentType, Cookie, Status};
use rocket::local::asynchronous::Client;
use serde_json::json;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::sync::Once;
use tracing::log::LevelFilter;

static INIT: Once = Once::new();
pub static STANDARD_PASSWORD: &str = "password123";

pub struct TestUser {
    pub username: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub password: String,
    pub created_by: Option<String>,
}

pub struct TestAssignment {
    pub title: String,
    pub author: String,
    pub teacher: Option<String>,
    pub student: Option<String>,
    pub status: Option<TrackStatus>,
}

#[derive(Default)]
pub struct TestDbBuilder {
    users: Vec<TestUser>,
    assignments: Vec<TestAssignment>,
}

impl TestDbBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn user(mut self, username: &str, display_name: Option<&str>, role: Role) -> Self {
        self.users.push(TestUser {
            username: username.to_string(),
            display_name: display_name.map(String::from),
            role,
            password: STANDARD_PASSWORD.to_string(),
            created_by: None,
        });
        self
    }

    pub fn admin(self, username: &str, display_name: Option<&str>) -> Self {
        self.user(username, display_name, Role::Admin)
    }

    pub fn subscriber(self, username: &str, display_name: Option<&str>) -> Self {
        self.user(username, display_name, Role::Subscriber)
    }

    pub fn teacher(self, username: &str, display_name: Option<&str>) -> Self {
        self.user(username, display_name, Role::Teacher)
    }

    pub fn student(self, username: &str, display_name: Option<&str>) -> Self {
        self.user(username, display_name, Role::Student)
    }

    /// A teacher/student account with its `created_by` back-reference set,
    /// for provisioning and deletion-rights tests.
    pub fn provisioned(mut self, username: &str, role: Role, creator: &str) -> Self {
        self.users.push(TestUser {
            username: username.to_string(),
            display_name: None,
            role,
            password: STANDARD_PASSWORD.to_string(),
            created_by: Some(creator.to_string()),
        });
        self
    }

    pub fn assignment(
        mut self,
        title: &str,
        author: &str,
        teacher: Option<&str>,
        student: Option<&str>,
    ) -> Self {
        self.assignments.push(TestAssignment {
            title: title.to_string(),
            author: author.to_string(),
            teacher: teacher.map(String::from),
            student: student.map(String::from),
            status: None,
        });
        self
    }

    pub async fn build(self) -> Result<TestDb, AppError> {
        INIT.call_once(|| {
            let _ = env_logger::builder()
                .filter_level(LevelFilter::Debug)
                .is_test(true)
                .try_init();
        });

        let pool = SqlitePool::connect("sqlite::memory:").await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let mut user_id_map: HashMap<String, i64> = HashMap::new();

        for user in &self.users {
            let created_by = user
                .created_by
                .as_ref()
                .and_then(|name| user_id_map.get(name).copied());

            let created = create_user(
                &pool,
                &user.username,
                &format!("{}@example.com", user.username),
                &user.password,
                user.role,
                created_by,
            )
            .await?;

            if let Some(display_name) = &user.display_name {
                update_user_display_name(&pool, created.id, display_name).await?;
            }

            user_id_map.insert(user.username.clone(), created.id);
        }

        let mut assignment_id_map: HashMap<String, i64> = HashMap::new();

        for assignment in &self.assignments {
            let author_id = user_id_map
                .get(&assignment.author)
                .copied()
                .ok_or_else(|| AppError::NotFound(assignment.author.clone()))?;
            let author = crate::db::get_user(&pool, author_id).await?;

            let write = AssignmentWrite {
                title: assignment.title.clone(),
                content: format!("{} content", assignment.title),
                teacher_id: assignment
                    .teacher
                    .as_ref()
                    .and_then(|name| user_id_map.get(name).copied())
                    .unwrap_or(0),
                student_id: assignment
                    .student
                    .as_ref()
                    .and_then(|name| user_id_map.get(name).copied())
                    .unwrap_or(0),
                status: assignment.status,
                ..Default::default()
            };

            let created = create_assignment(&pool, &author, &write).await?;
            assignment_id_map.insert(assignment.title.clone(), created.id);
        }

        Ok(TestDb {
            pool,
            user_id_map,
            assignment_id_map,
        })
    }
}

pub struct TestDb {
    pub pool: Pool<Sqlite>,
    pub user_id_map: HashMap<String, i64>,
    pub assignment_id_map: HashMap<String, i64>,
}

impl TestDb {
    pub fn user_id(&self, username: &str) -> Option<i64> {
        self.user_id_map.get(username).copied()
    }

    pub fn assignment_id(&self, title: &str) -> Option<i64> {
        self.assignment_id_map.get(title).copied()
    }

    pub async fn user(&self, username: &str) -> Result<crate::auth::User, AppError> {
        let id = self
            .user_id(username)
            .ok_or_else(|| AppError::NotFound(username.to_string()))?;
        crate::db::get_user(&self.pool, id).await
    }

    pub async fn assignment(&self, title: &str) -> Result<crate::models::Assignment, AppError> {
        let id = self
            .assignment_id(title)
            .ok_or_else(|| AppError::NotFound(title.to_string()))?;
        crate::db::get_assignment(&self.pool, id).await
    }
}

/// Users covering every role, plus one assignment binding the teacher and
/// student, which most integration tests build on.
pub async fn create_standard_test_db() -> TestDb {
    TestDbBuilder::new()
        .admin("admin_user", Some("Admin User"))
        .subscriber("subscriber_user", Some("Subscriber User"))
        .provisioned("teacher_user", Role::Teacher, "subscriber_user")
        .provisioned("student_user", Role::Student, "subscriber_user")
        .assignment(
            "Essay One",
            "subscriber_user",
            Some("teacher_user"),
            Some("student_user"),
        )
        .build()
        .await
        .expect("failed to build test database")
}

pub async fn setup_test_client(test_db: TestDb) -> (Client, TestDb) {
    let rocket = init_rocket(test_db.pool.clone()).await;
    let client = Client::tracked(rocket)
        .await
        .expect("failed to build test client");
    (client, test_db)
}

pub async fn login_test_user(client: &Client, username: &str, password: &str) -> Vec<Cookie<'static>> {
    let response = client
        .post("/api/login")
        .header(ContentType::JSON)
        .body(
            json!({
                "username": username,
                "password": password
            })
            .to_string(),
        )
        .dispatch()
        .await;

    assert_eq!(response.status(), Status::Ok);

    response
        .cookies()
        .iter()
        .map(|c| c.clone().into_owned())
        .collect()
}
