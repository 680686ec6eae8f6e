#[cfg(test)]
pub mod test_db {
    use crate::auth::Role;
    use crate::database::init_schema;
    use crate::db::{
        NewAssessment, NewModule, NewModuleItem, create_assessment, create_class, create_course,
        create_module, create_module_item, create_user, enroll_student,
    };
    use crate::env::AppConfig;
    use crate::error::AppError;
    use crate::init_rocket;
    use crate::models::{AssessmentType, ItemType};
    use rocket::http::{ContentType, Cookie, Status};
    use rocket::local::asynchronous::Client;
    use serde_json::json;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use sqlx::{Pool, Sqlite};
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::Once;

    static INIT: Once = Once::new();
    pub static STANDARD_PASSWORD: &str = "password123";

    #[derive(Default)]
    pub struct TestDbBuilder {
        users: Vec<TestUser>,
        classes: Vec<TestClass>,
        enrollments: Vec<(String, String)>,
    }

    pub struct TestUser {
        pub username: String,
        pub display_name: Option<String>,
        pub role: Role,
        pub password: String,
    }

    pub struct TestClass {
        pub name: String,
        pub professor_username: Option<String>,
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
            });
            self
        }

        pub fn student(self, username: &str, display_name: Option<&str>) -> Self {
            self.user(username, display_name, Role::Student)
        }

        pub fn professor(self, username: &str, display_name: Option<&str>) -> Self {
            self.user(username, display_name, Role::Professor)
        }

        pub fn admin(self, username: &str, display_name: Option<&str>) -> Self {
            self.user(username, display_name, Role::Admin)
        }

        pub fn class(mut self, name: &str, professor_username: Option<&str>) -> Self {
            self.classes.push(TestClass {
                name: name.to_string(),
                professor_username: professor_username.map(String::from),
            });
            self
        }

        pub fn enroll(mut self, class_name: &str, student_username: &str) -> Self {
            self.enrollments
                .push((class_name.to_string(), student_username.to_string()));
            self
        }

        pub async fn build(self) -> Result<TestDb, AppError> {
            INIT.call_once(|| {
                let _ = env_logger::builder()
                    .parse_filters("debug")
                    .is_test(true)
                    .try_init();
            });

            // A single long-lived connection, otherwise every connection
            // would open its own empty in-memory database.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?;

            init_schema(&pool).await?;

            let mut user_id_map: HashMap<String, i64> = HashMap::new();
            let mut class_id_map: HashMap<String, i64> = HashMap::new();

            for user in &self.users {
                let user_id = create_user(
                    &pool,
                    &user.username,
                    &user.password,
                    user.role,
                    user.display_name.as_deref(),
                )
                .await?;

                user_id_map.insert(user.username.clone(), user_id);
            }

            if !self.classes.is_empty() {
                let course_id =
                    create_course(&pool, "TEST-101", "Test Course", "Course for tests").await?;

                for class in &self.classes {
                    let professor_id = class
                        .professor_username
                        .as_ref()
                        .and_then(|name| user_id_map.get(name).copied());

                    let class_id =
                        create_class(&pool, course_id, &class.name, "2025-FALL", professor_id)
                            .await?;
                    class_id_map.insert(class.name.clone(), class_id);
                }
            }

            for (class_name, student_username) in &self.enrollments {
                let (Some(class_id), Some(student_id)) = (
                    class_id_map.get(class_name).copied(),
                    user_id_map.get(student_username).copied(),
                ) else {
                    return Err(AppError::Internal(format!(
                        "Unknown class '{}' or student '{}' in test enrollment",
                        class_name, student_username
                    )));
                };
                enroll_student(&pool, class_id, student_id).await?;
            }

            Ok(TestDb {
                pool,
                user_id_map,
                class_id_map,
            })
        }
    }

    pub struct TestDb {
        pub pool: Pool<Sqlite>,
        pub user_id_map: HashMap<String, i64>,
        pub class_id_map: HashMap<String, i64>,
    }

    impl TestDb {
        pub fn user_id(&self, username: &str) -> Option<i64> {
            self.user_id_map.get(username).copied()
        }

        pub fn class_id(&self, name: &str) -> Option<i64> {
            self.class_id_map.get(name).copied()
        }

        /// Published module with the given prerequisites.
        pub async fn module(&self, class_id: i64, title: &str, prerequisite_ids: &[i64]) -> i64 {
            create_module(
                &self.pool,
                NewModule {
                    class_id,
                    title,
                    description: "",
                    order_index: None,
                    is_published: true,
                    unlock_at: None,
                    prerequisite_ids,
                },
            )
            .await
            .expect("Failed to create module")
        }

        /// Published page item.
        pub async fn page(&self, module_id: i64, title: &str, is_required: bool) -> i64 {
            create_module_item(
                &self.pool,
                NewModuleItem {
                    module_id,
                    title,
                    item_type: ItemType::Page,
                    order_index: None,
                    is_published: true,
                    is_required,
                    assessment_id: None,
                    url: None,
                    content: Some("Reading"),
                },
            )
            .await
            .expect("Failed to create page item")
        }

        /// Published, required item pointing at an assessment.
        pub async fn assessment_item(&self, module_id: i64, assessment_id: i64) -> i64 {
            create_module_item(
                &self.pool,
                NewModuleItem {
                    module_id,
                    title: "Assessment",
                    item_type: ItemType::Assessment,
                    order_index: None,
                    is_published: true,
                    is_required: true,
                    assessment_id: Some(assessment_id),
                    url: None,
                    content: None,
                },
            )
            .await
            .expect("Failed to create assessment item")
        }

        pub async fn assessment(
            &self,
            class_id: i64,
            assessment_type: AssessmentType,
            max_points: f64,
            is_published: bool,
        ) -> i64 {
            create_assessment(
                &self.pool,
                NewAssessment {
                    class_id,
                    title: "Assessment",
                    description: "",
                    assessment_type,
                    max_points,
                    is_published,
                    due_at: None,
                    auto_complete_enabled: false,
                    minimum_reply_count: None,
                },
            )
            .await
            .expect("Failed to create assessment")
        }

        pub async fn discussion(&self, class_id: i64, max_points: f64, minimum_replies: i64) -> i64 {
            create_assessment(
                &self.pool,
                NewAssessment {
                    class_id,
                    title: "Discussion",
                    description: "Introduce yourself",
                    assessment_type: AssessmentType::Discussion,
                    max_points,
                    is_published: true,
                    due_at: None,
                    auto_complete_enabled: true,
                    minimum_reply_count: Some(minimum_replies),
                },
            )
            .await
            .expect("Failed to create discussion")
        }
    }

    /// Professor `prof`, students `alice` and `bob` enrolled in `Algorithms`,
    /// student `carol` not enrolled, and an `admin`.
    pub async fn create_standard_test_db() -> TestDb {
        TestDbBuilder::new()
            .admin("admin", Some("Admin User"))
            .professor("prof", Some("Professor Plum"))
            .professor("other_prof", None)
            .student("alice", Some("Alice"))
            .student("bob", Some("Bob"))
            .student("carol", Some("Carol"))
            .class("Algorithms", Some("prof"))
            .enroll("Algorithms", "alice")
            .enroll("Algorithms", "bob")
            .build()
            .await
            .expect("Failed to build standard test database")
    }

    pub async fn setup_test_client(test_db: TestDb) -> (Client, TestDb) {
        let rocket = init_rocket(test_db.pool.clone(), AppConfig::default()).await;
        let client = Client::untracked(rocket)
            .await
            .expect("Failed to create test client");
        (client, test_db)
    }

    /// Logs in and returns the private session cookie to attach to requests.
    pub async fn login_test_user(client: &Client, username: &str, password: &str) -> Cookie<'static> {
        let response = client
            .post("/api/login")
            .header(ContentType::JSON)
            .body(json!({ "username": username, "password": password }).to_string())
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::Ok);

        response
            .cookies()
            .get_private("session_token")
            .expect("Login did not set a session cookie")
    }
}
