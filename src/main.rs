#[macro_use]
extern crate rocket;

mod api;
mod auth;
mod database;
mod db;
mod env;
mod error;
mod grading;
mod models;
mod progression;
mod telemetry;
mod validation;
#[cfg(test)]
mod test;

use api::{
    api_auto_grade, api_complete_item, api_create_assessment, api_create_class,
    api_create_course, api_create_discussion_post, api_create_module, api_create_module_item,
    api_delete_assessment, api_delete_course, api_delete_module, api_delete_module_item, api_enroll_student,
    api_get_assessment_submissions, api_get_class, api_get_class_assessments,
    api_get_class_enrollments, api_get_class_grades, api_get_class_modules, api_get_classes,
    api_get_courses, api_get_discussion_posts, api_get_student_grades, api_grade_submission,
    api_login, api_logout, api_me, api_me_unauthorized, api_publish_assessment,
    api_register_user, api_reorder_module_items, api_reorder_modules, api_set_enrollment_status,
    api_submit_assessment, api_update_module, api_update_module_item, health,
};
use auth::unauthorized_api;
use db::clean_expired_sessions;
use env::{AppConfig, load_environment};
use error::AppError;
use rocket::{Build, Rocket, tokio};
use sqlx::{Pool, Sqlite};
use telemetry::TelemetryFairing;
use telemetry::init_tracing;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Anyhow(anyhow::Error),
    #[error("{0}")]
    Rocket(rocket::Error),
    #[error("{0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Application error: {0}")]
    App(#[from] AppError),
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Error::Anyhow(value)
    }
}

impl From<rocket::Error> for Error {
    fn from(value: rocket::Error) -> Self {
        Error::Rocket(value)
    }
}

#[rocket::main]
async fn main() -> Result<(), Error> {
    load_environment().map_err(|e| anyhow::anyhow!("Failed to load environment: {}", e))?;

    let config = AppConfig::from_env()?;
    init_tracing(&config);

    let pool = database::connect(&config.database_url).await?;
    database::init_schema(&pool).await?;

    spawn_session_cleanup(pool.clone(), config.session_cleanup_secs);

    let _ = init_rocket(pool, config).await.launch().await?;
    Ok(())
}

fn spawn_session_cleanup(pool: Pool<Sqlite>, interval_secs: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;

        loop {
            match clean_expired_sessions(&pool).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Cleaned up {} expired sessions", count);
                    }
                }
                Err(e) => {
                    error!("Failed to clean expired sessions: {}", e);
                }
            }

            tokio::time::sleep(tokio::time::Duration::from_secs(interval_secs)).await;
        }
    });
}

pub async fn init_rocket(pool: Pool<Sqlite>, config: AppConfig) -> Rocket<Build> {
    info!(env = %config.deployment_env, "Starting classroom tracker");

    rocket::build()
        .manage(pool)
        .manage(config)
        .mount(
            "/api",
            routes![
                api_login,
                api_me,
                api_me_unauthorized,
                api_logout,
                api_register_user,
                api_get_courses,
                api_create_course,
                api_delete_course,
                api_create_class,
                api_get_classes,
                api_get_class,
                api_enroll_student,
                api_set_enrollment_status,
                api_get_class_enrollments,
                api_get_class_modules,
                api_create_module,
                api_update_module,
                api_delete_module,
                api_reorder_modules,
                api_create_module_item,
                api_update_module_item,
                api_delete_module_item,
                api_reorder_module_items,
                api_complete_item,
                api_create_assessment,
                api_get_class_assessments,
                api_publish_assessment,
                api_submit_assessment,
                api_get_assessment_submissions,
                api_grade_submission,
                api_get_discussion_posts,
                api_create_discussion_post,
                api_get_student_grades,
                api_get_class_grades,
                api_auto_grade,
                api_delete_assessment,
            ],
        )
        .register("/api", catchers![unauthorized_api])
        .mount("/api", routes![health])
        .attach(TelemetryFairing)
}
