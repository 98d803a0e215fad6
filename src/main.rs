#[macro_use]
extern crate rocket;

mod api;
mod auth;
mod db;
mod env;
mod error;
mod models;
mod schema;
mod status;
mod telemetry;
#[cfg(test)]
mod test;
mod validation;

use api::{
    api_change_password, api_create_assignment, api_create_category, api_create_user,
    api_delete_assignment, api_delete_user, api_get_assignment, api_get_chat, api_get_field_schema,
    api_get_notifications, api_list_assignments, api_list_categories, api_list_tags,
    api_list_users, api_login, api_logout, api_mark_notification_read, api_me, api_post_chat,
    api_save_field_schema, api_status_summary, api_unread_count, api_update_assignment,
    api_update_profile, api_update_status, health,
};
use auth::{forbidden_api, not_found_api, unauthorized_api};
use db::clean_expired_sessions;
use once_cell::sync::Lazy;
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket, tokio};
use std::sync::Mutex;
use telemetry::{OtelGuard, TelemetryFairing, init_tracing};

use sqlx::SqlitePool;
use tracing::{error, info};

pub static TELEMETRY_GUARD: Lazy<Mutex<Option<OtelGuard>>> = Lazy::new(|| Mutex::new(None));

#[launch]
async fn rocket() -> _ {
    if let Err(e) = env::load_environment() {
        eprintln!("Failed to load environment files: {}", e);
    }
    init_tracing();

    let database_url = std::env::var("DATABASE_URL").unwrap_or_default();

    let pool = SqlitePool::connect(&database_url)
        .await
        .expect("Failed to connect to SQLite database");

    let pool_clone = pool.clone();

    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;

        loop {
            match clean_expired_sessions(&pool_clone).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Cleaned up {} expired sessions", count);
                    }
                }
                Err(e) => {
                    error!("Failed to clean expired sessions: {}", e);
                }
            }

            tokio::time::sleep(tokio::time::Duration::from_secs(3600)).await;
        }
    });

    info!("Running database migrations...");
    match sqlx::migrate!("./migrations").run(&pool).await {
        Ok(_) => info!("Migrations completed successfully"),
        Err(e) => {
            error!("Failed to run migrations: {}", e);
            panic!("Database migration failed: {}", e);
        }
    }

    init_rocket(pool).await
}

pub async fn init_rocket(pool: SqlitePool) -> Rocket<Build> {
    info!("Starting assignment tracker");

    rocket::build()
        .manage(pool)
        .mount(
            "/api",
            routes![
                api_login,
                api_logout,
                api_me,
                api_update_profile,
                api_change_password,
                api_list_assignments,
                api_create_assignment,
                api_get_assignment,
                api_update_assignment,
                api_delete_assignment,
                api_update_status,
                api_status_summary,
                api_get_chat,
                api_post_chat,
                api_get_notifications,
                api_unread_count,
                api_mark_notification_read,
                api_get_field_schema,
                api_save_field_schema,
                api_create_user,
                api_list_users,
                api_delete_user,
                api_list_categories,
                api_create_category,
                api_list_tags,
                health,
            ],
        )
        .register("/api", catchers![unauthorized_api, forbidden_api, not_found_api])
        .attach(TelemetryFairing)
        .attach(AdHoc::on_shutdown("Telemetry shutdown", |_| {
            Box::pin(async {
                telemetry::shutdown_telemetry();
            })
        }))
}
