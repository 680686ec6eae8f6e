use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{Pool, Sqlite};
use tracing::{info, instrument, warn};

use crate::{
    auth::{DbUser, DbUserSession, Role, User, UserSession},
    error::{AppError, is_unique_violation},
    models::{
        Assessment, AssessmentSubmission, AssessmentType, Class, Course, DbAssessment,
        DbAssessmentSubmission, DbClass, DbCourse, DbDiscussionPost, DbEnrollment,
        DbGradedSubmission, DbModule, DbModuleCompletion, DbModuleItem, DbModuleItemCompletion,
        DiscussionPost, Enrollment, EnrollmentStatus, GradedSubmission, ItemType, Module,
        ModuleCompletion, ModuleItem, ModuleItemCompletion, SubmissionStatus,
    },
};

const USER_COLUMNS: &str = "id, username, role, display_name, archived";
const CLASS_COLUMNS: &str = "id, course_id, name, term, professor_id";
const ENROLLMENT_COLUMNS: &str = "id, class_id, student_id, status, enrolled_at";
const MODULE_COLUMNS: &str =
    "id, class_id, title, description, order_index, is_published, unlock_at";
const ITEM_COLUMNS: &str = "mi.id, mi.module_id, mi.title, mi.item_type, mi.order_index, \
     mi.is_published, mi.is_required, mi.assessment_id, mi.url, mi.content";
const ASSESSMENT_COLUMNS: &str = "id, class_id, title, description, assessment_type, max_points, \
     is_published, due_at, auto_complete_enabled, minimum_reply_count";
const SUBMISSION_COLUMNS: &str = "id, assessment_id, student_id, status, content, total_score, \
     manual_score, auto_score, discussion_reply_count, feedback, submitted_at, graded_at";
const POST_COLUMNS: &str = "p.id, p.assessment_id, p.author_id, \
     COALESCE(u.display_name, u.username) AS author_name, p.parent_id, p.body, p.created_at";

// Users & sessions

#[instrument]
pub async fn get_user(pool: &Pool<Sqlite>, id: i64) -> Result<User, AppError> {
    info!("Fetching user by ID");
    let row = sqlx::query_as::<_, DbUser>(&format!(
        "SELECT {} FROM users WHERE id = ?",
        USER_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(user) => User::try_from(user),
        _ => Err(AppError::NotFound(format!(
            "User with id {} not found in database",
            id
        ))),
    }
}

#[instrument]
pub async fn find_user_by_username(
    pool: &Pool<Sqlite>,
    username: &str,
) -> Result<Option<User>, AppError> {
    info!("Finding user by username");
    let row = sqlx::query_as::<_, DbUser>(&format!(
        "SELECT {} FROM users WHERE username = ?",
        USER_COLUMNS
    ))
    .bind(username)
    .fetch_optional(pool)
    .await?;

    row.map(User::try_from).transpose()
}

#[instrument(skip_all, fields(username))]
pub async fn authenticate_user(
    pool: &Pool<Sqlite>,
    username: &str,
    password: &str,
) -> Result<Option<User>, AppError> {
    info!("Authenticating user");
    let hash = sqlx::query_scalar::<_, String>("SELECT password FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;

    let Some(hash) = hash else {
        return Ok(None);
    };

    match bcrypt::verify(password, &hash) {
        Ok(true) => find_user_by_username(pool, username).await,
        Ok(false) => Ok(None),
        Err(e) => {
            warn!(error = %e, "Stored password hash could not be verified");
            Ok(None)
        }
    }
}

#[instrument(skip_all, fields(username, role = %role))]
pub async fn create_user(
    pool: &Pool<Sqlite>,
    username: &str,
    password: &str,
    role: Role,
    display_name: Option<&str>,
) -> Result<i64, AppError> {
    info!("Creating new user");

    if find_user_by_username(pool, username).await?.is_some() {
        return Err(AppError::Conflict(format!(
            "Username '{}' already exists",
            username
        )));
    }

    let hashed_password = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;

    let res = sqlx::query(
        "INSERT INTO users (username, password, role, display_name) VALUES (?, ?, ?, ?)",
    )
    .bind(username)
    .bind(hashed_password)
    .bind(role.as_str())
    .bind(display_name)
    .execute(pool)
    .await?;

    Ok(res.last_insert_rowid())
}

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

// Courses & classes

#[instrument(skip(pool))]
pub async fn create_course(
    pool: &Pool<Sqlite>,
    code: &str,
    title: &str,
    description: &str,
) -> Result<i64, AppError> {
    info!("Creating course");
    let res = sqlx::query("INSERT INTO courses (code, title, description) VALUES (?, ?, ?)")
        .bind(code)
        .bind(title)
        .bind(description)
        .execute(pool)
        .await
        .map_err(|e| AppError::conflict_on_unique(e, || format!("Course code '{}' already exists", code)))?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip(pool))]
pub async fn get_courses(pool: &Pool<Sqlite>) -> Result<Vec<Course>, AppError> {
    info!("Getting all courses");
    let rows = sqlx::query_as::<_, DbCourse>(
        "SELECT id, code, title, description FROM courses ORDER BY code",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Course::from).collect())
}

#[instrument(skip(pool))]
pub async fn delete_course(pool: &Pool<Sqlite>, course_id: i64) -> Result<(), AppError> {
    info!("Deleting course");
    let res = sqlx::query("DELETE FROM courses WHERE id = ?")
        .bind(course_id)
        .execute(pool)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Course {} not found", course_id)));
    }

    Ok(())
}

#[instrument(skip(pool))]
pub async fn create_class(
    pool: &Pool<Sqlite>,
    course_id: i64,
    name: &str,
    term: &str,
    professor_id: Option<i64>,
) -> Result<i64, AppError> {
    info!("Creating class");
    let res = sqlx::query(
        "INSERT INTO classes (course_id, name, term, professor_id) VALUES (?, ?, ?, ?)",
    )
    .bind(course_id)
    .bind(name)
    .bind(term)
    .bind(professor_id)
    .execute(pool)
    .await?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip(pool))]
pub async fn get_class(pool: &Pool<Sqlite>, class_id: i64) -> Result<Class, AppError> {
    let row = sqlx::query_as::<_, DbClass>(&format!(
        "SELECT {} FROM classes WHERE id = ?",
        CLASS_COLUMNS
    ))
    .bind(class_id)
    .fetch_optional(pool)
    .await?;

    row.map(Class::from)
        .ok_or_else(|| AppError::NotFound(format!("Class {} not found", class_id)))
}

#[instrument(skip(pool))]
pub async fn get_all_classes(pool: &Pool<Sqlite>) -> Result<Vec<Class>, AppError> {
    let rows = sqlx::query_as::<_, DbClass>(&format!(
        "SELECT {} FROM classes ORDER BY name",
        CLASS_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Class::from).collect())
}

#[instrument(skip(pool))]
pub async fn get_classes_for_professor(
    pool: &Pool<Sqlite>,
    professor_id: i64,
) -> Result<Vec<Class>, AppError> {
    let rows = sqlx::query_as::<_, DbClass>(&format!(
        "SELECT {} FROM classes WHERE professor_id = ? ORDER BY name",
        CLASS_COLUMNS
    ))
    .bind(professor_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Class::from).collect())
}

#[instrument(skip(pool))]
pub async fn get_classes_for_student(
    pool: &Pool<Sqlite>,
    student_id: i64,
) -> Result<Vec<Class>, AppError> {
    let rows = sqlx::query_as::<_, DbClass>(
        "SELECT c.id, c.course_id, c.name, c.term, c.professor_id
         FROM classes c
         JOIN enrollments e ON e.class_id = c.id
         WHERE e.student_id = ? AND e.status = 'active'
         ORDER BY c.name",
    )
    .bind(student_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Class::from).collect())
}

// Enrollments

/// Enrolls the student, reactivating an existing enrollment row if there is one.
#[instrument(skip(pool))]
pub async fn enroll_student(
    pool: &Pool<Sqlite>,
    class_id: i64,
    student_id: i64,
) -> Result<Enrollment, AppError> {
    info!("Enrolling student");
    sqlx::query(
        "INSERT INTO enrollments (class_id, student_id, status) VALUES (?, ?, 'active')
         ON CONFLICT (class_id, student_id) DO UPDATE SET status = 'active'",
    )
    .bind(class_id)
    .bind(student_id)
    .execute(pool)
    .await?;

    find_enrollment(pool, class_id, student_id)
        .await?
        .ok_or_else(|| AppError::Internal("Enrollment vanished after insert".to_string()))
}

#[instrument(skip(pool))]
pub async fn set_enrollment_status(
    pool: &Pool<Sqlite>,
    class_id: i64,
    student_id: i64,
    status: EnrollmentStatus,
) -> Result<(), AppError> {
    info!(status = status.as_str(), "Updating enrollment status");
    let res = sqlx::query("UPDATE enrollments SET status = ? WHERE class_id = ? AND student_id = ?")
        .bind(status.as_str())
        .bind(class_id)
        .bind(student_id)
        .execute(pool)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "Student {} is not enrolled in class {}",
            student_id, class_id
        )));
    }

    Ok(())
}

#[instrument(skip(pool))]
pub async fn find_enrollment(
    pool: &Pool<Sqlite>,
    class_id: i64,
    student_id: i64,
) -> Result<Option<Enrollment>, AppError> {
    let row = sqlx::query_as::<_, DbEnrollment>(&format!(
        "SELECT {} FROM enrollments WHERE class_id = ? AND student_id = ?",
        ENROLLMENT_COLUMNS
    ))
    .bind(class_id)
    .bind(student_id)
    .fetch_optional(pool)
    .await?;

    row.map(Enrollment::try_from).transpose()
}

#[instrument(skip(pool))]
pub async fn get_class_enrollments(
    pool: &Pool<Sqlite>,
    class_id: i64,
) -> Result<Vec<Enrollment>, AppError> {
    let rows = sqlx::query_as::<_, DbEnrollment>(&format!(
        "SELECT {} FROM enrollments WHERE class_id = ? ORDER BY student_id",
        ENROLLMENT_COLUMNS
    ))
    .bind(class_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Enrollment::try_from).collect()
}

// Modules

pub struct NewModule<'a> {
    pub class_id: i64,
    pub title: &'a str,
    pub description: &'a str,
    pub order_index: Option<i64>,
    pub is_published: bool,
    pub unlock_at: Option<DateTime<Utc>>,
    pub prerequisite_ids: &'a [i64],
}

#[derive(Default)]
pub struct ModuleUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub is_published: Option<bool>,
    /// `Some(None)` clears the unlock time.
    pub unlock_at: Option<Option<DateTime<Utc>>>,
    pub prerequisite_ids: Option<Vec<i64>>,
}

fn check_prerequisites(module_id: Option<i64>, prerequisite_ids: &[i64]) -> Result<(), AppError> {
    if let Some(id) = module_id {
        if prerequisite_ids.contains(&id) {
            return Err(AppError::Validation(
                "A module cannot be its own prerequisite".to_string(),
            ));
        }
    }
    Ok(())
}

async fn replace_prerequisites(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    module_id: i64,
    prerequisite_ids: &[i64],
) -> Result<(), AppError> {
    sqlx::query("DELETE FROM module_prerequisites WHERE module_id = ?")
        .bind(module_id)
        .execute(&mut **tx)
        .await?;

    let unique: HashSet<i64> = prerequisite_ids.iter().copied().collect();
    for prerequisite_id in unique {
        sqlx::query("INSERT INTO module_prerequisites (module_id, prerequisite_id) VALUES (?, ?)")
            .bind(module_id)
            .bind(prerequisite_id)
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}

#[instrument(skip(pool, module), fields(class_id = module.class_id, title = module.title))]
pub async fn create_module(pool: &Pool<Sqlite>, module: NewModule<'_>) -> Result<i64, AppError> {
    info!("Creating module");
    let mut tx = pool.begin().await?;

    let order_index = match module.order_index {
        Some(index) => index,
        None => {
            sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(order_index) + 1, 0) FROM modules WHERE class_id = ?",
            )
            .bind(module.class_id)
            .fetch_one(&mut *tx)
            .await?
        }
    };

    let res = sqlx::query(
        "INSERT INTO modules (class_id, title, description, order_index, is_published, unlock_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(module.class_id)
    .bind(module.title)
    .bind(module.description)
    .bind(order_index)
    .bind(module.is_published)
    .bind(module.unlock_at.map(|dt| dt.naive_utc()))
    .execute(&mut *tx)
    .await?;

    let module_id = res.last_insert_rowid();
    check_prerequisites(Some(module_id), module.prerequisite_ids)?;
    replace_prerequisites(&mut tx, module_id, module.prerequisite_ids).await?;

    tx.commit().await?;
    Ok(module_id)
}

#[instrument(skip(pool, update))]
pub async fn update_module(
    pool: &Pool<Sqlite>,
    module_id: i64,
    update: ModuleUpdate,
) -> Result<(), AppError> {
    info!("Updating module");
    let current = get_module(pool, module_id).await?;

    if let Some(ids) = &update.prerequisite_ids {
        check_prerequisites(Some(module_id), ids)?;
    }

    let unlock_at = match update.unlock_at {
        Some(value) => value,
        None => current.unlock_at,
    };

    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE modules SET title = ?, description = ?, is_published = ?, unlock_at = ?
         WHERE id = ?",
    )
    .bind(update.title.unwrap_or(current.title))
    .bind(update.description.unwrap_or(current.description))
    .bind(update.is_published.unwrap_or(current.is_published))
    .bind(unlock_at.map(|dt| dt.naive_utc()))
    .bind(module_id)
    .execute(&mut *tx)
    .await?;

    if let Some(ids) = &update.prerequisite_ids {
        replace_prerequisites(&mut tx, module_id, ids).await?;
    }

    tx.commit().await?;
    Ok(())
}

#[instrument(skip(pool))]
pub async fn delete_module(pool: &Pool<Sqlite>, module_id: i64) -> Result<(), AppError> {
    info!("Deleting module");
    let res = sqlx::query("DELETE FROM modules WHERE id = ?")
        .bind(module_id)
        .execute(pool)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Module {} not found", module_id)));
    }
    Ok(())
}

#[instrument(skip(pool))]
pub async fn get_module(pool: &Pool<Sqlite>, module_id: i64) -> Result<Module, AppError> {
    let row = sqlx::query_as::<_, DbModule>(&format!(
        "SELECT {} FROM modules WHERE id = ?",
        MODULE_COLUMNS
    ))
    .bind(module_id)
    .fetch_optional(pool)
    .await?;

    let mut module = row
        .map(Module::from)
        .ok_or_else(|| AppError::NotFound(format!("Module {} not found", module_id)))?;

    module.prerequisite_ids = sqlx::query_scalar::<_, i64>(
        "SELECT prerequisite_id FROM module_prerequisites WHERE module_id = ?
         ORDER BY prerequisite_id",
    )
    .bind(module_id)
    .fetch_all(pool)
    .await?;

    Ok(module)
}

/// All modules of a class, published or not, with prerequisites attached,
/// in display order.
#[instrument(skip(pool))]
pub async fn get_class_modules(
    pool: &Pool<Sqlite>,
    class_id: i64,
) -> Result<Vec<Module>, AppError> {
    info!("Getting class modules");
    let rows = sqlx::query_as::<_, DbModule>(&format!(
        "SELECT {} FROM modules WHERE class_id = ? ORDER BY order_index, id",
        MODULE_COLUMNS
    ))
    .bind(class_id)
    .fetch_all(pool)
    .await?;

    let edges = sqlx::query_as::<_, (i64, i64)>(
        "SELECT mp.module_id, mp.prerequisite_id
         FROM module_prerequisites mp
         JOIN modules m ON m.id = mp.module_id
         WHERE m.class_id = ?
         ORDER BY mp.module_id, mp.prerequisite_id",
    )
    .bind(class_id)
    .fetch_all(pool)
    .await?;

    let mut prerequisites: HashMap<i64, Vec<i64>> = HashMap::new();
    for (module_id, prerequisite_id) in edges {
        prerequisites.entry(module_id).or_default().push(prerequisite_id);
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let mut module = Module::from(row);
            module.prerequisite_ids = prerequisites.remove(&module.id).unwrap_or_default();
            module
        })
        .collect())
}

#[instrument(skip(pool))]
pub async fn reorder_modules(
    pool: &Pool<Sqlite>,
    class_id: i64,
    module_ids: &[i64],
) -> Result<(), AppError> {
    info!("Reordering modules");
    let existing: HashSet<i64> =
        sqlx::query_scalar::<_, i64>("SELECT id FROM modules WHERE class_id = ?")
            .bind(class_id)
            .fetch_all(pool)
            .await?
            .into_iter()
            .collect();

    if let Some(stray) = module_ids.iter().find(|id| !existing.contains(id)) {
        return Err(AppError::Validation(format!(
            "Module {} does not belong to class {}",
            stray, class_id
        )));
    }

    let mut tx = pool.begin().await?;
    for (index, module_id) in module_ids.iter().enumerate() {
        sqlx::query("UPDATE modules SET order_index = ? WHERE id = ?")
            .bind(index as i64)
            .bind(module_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(())
}

// Module items

pub struct NewModuleItem<'a> {
    pub module_id: i64,
    pub title: &'a str,
    pub item_type: ItemType,
    pub order_index: Option<i64>,
    pub is_published: bool,
    pub is_required: bool,
    pub assessment_id: Option<i64>,
    pub url: Option<&'a str>,
    pub content: Option<&'a str>,
}

#[derive(Default)]
pub struct ModuleItemUpdate {
    pub title: Option<String>,
    pub is_published: Option<bool>,
    pub is_required: Option<bool>,
    pub url: Option<String>,
    pub content: Option<String>,
}

#[instrument(skip(pool, item), fields(module_id = item.module_id, title = item.title))]
pub async fn create_module_item(
    pool: &Pool<Sqlite>,
    item: NewModuleItem<'_>,
) -> Result<i64, AppError> {
    info!("Creating module item");
    let order_index = match item.order_index {
        Some(index) => index,
        None => {
            sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(order_index) + 1, 0) FROM module_items WHERE module_id = ?",
            )
            .bind(item.module_id)
            .fetch_one(pool)
            .await?
        }
    };

    let res = sqlx::query(
        "INSERT INTO module_items
         (module_id, title, item_type, order_index, is_published, is_required, assessment_id, url, content)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(item.module_id)
    .bind(item.title)
    .bind(item.item_type.as_str())
    .bind(order_index)
    .bind(item.is_published)
    .bind(item.is_required)
    .bind(item.assessment_id)
    .bind(item.url)
    .bind(item.content)
    .execute(pool)
    .await?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip(pool, update))]
pub async fn update_module_item(
    pool: &Pool<Sqlite>,
    item_id: i64,
    update: ModuleItemUpdate,
) -> Result<(), AppError> {
    info!("Updating module item");
    let current = find_module_item(pool, item_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Module item {} not found", item_id)))?;

    sqlx::query(
        "UPDATE module_items SET title = ?, is_published = ?, is_required = ?, url = ?, content = ?
         WHERE id = ?",
    )
    .bind(update.title.unwrap_or(current.title))
    .bind(update.is_published.unwrap_or(current.is_published))
    .bind(update.is_required.unwrap_or(current.is_required))
    .bind(update.url.or(current.url))
    .bind(update.content.or(current.content))
    .bind(item_id)
    .execute(pool)
    .await?;

    Ok(())
}

#[instrument(skip(pool))]
pub async fn delete_module_item(pool: &Pool<Sqlite>, item_id: i64) -> Result<(), AppError> {
    info!("Deleting module item");
    let res = sqlx::query("DELETE FROM module_items WHERE id = ?")
        .bind(item_id)
        .execute(pool)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Module item {} not found", item_id)));
    }
    Ok(())
}

#[instrument(skip(pool))]
pub async fn find_module_item(
    pool: &Pool<Sqlite>,
    item_id: i64,
) -> Result<Option<ModuleItem>, AppError> {
    let row = sqlx::query_as::<_, DbModuleItem>(&format!(
        "SELECT {} FROM module_items mi WHERE mi.id = ?",
        ITEM_COLUMNS
    ))
    .bind(item_id)
    .fetch_optional(pool)
    .await?;

    row.map(ModuleItem::try_from).transpose()
}

#[instrument(skip(pool))]
pub async fn get_module_items(
    pool: &Pool<Sqlite>,
    module_id: i64,
) -> Result<Vec<ModuleItem>, AppError> {
    let rows = sqlx::query_as::<_, DbModuleItem>(&format!(
        "SELECT {} FROM module_items mi WHERE mi.module_id = ? ORDER BY mi.order_index, mi.id",
        ITEM_COLUMNS
    ))
    .bind(module_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ModuleItem::try_from).collect()
}

#[instrument(skip(pool))]
pub async fn get_class_module_items(
    pool: &Pool<Sqlite>,
    class_id: i64,
) -> Result<Vec<ModuleItem>, AppError> {
    let rows = sqlx::query_as::<_, DbModuleItem>(&format!(
        "SELECT {} FROM module_items mi
         JOIN modules m ON m.id = mi.module_id
         WHERE m.class_id = ?
         ORDER BY mi.module_id, mi.order_index, mi.id",
        ITEM_COLUMNS
    ))
    .bind(class_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ModuleItem::try_from).collect()
}

#[instrument(skip(pool))]
pub async fn reorder_module_items(
    pool: &Pool<Sqlite>,
    module_id: i64,
    item_ids: &[i64],
) -> Result<(), AppError> {
    info!("Reordering module items");
    let existing: HashSet<i64> =
        sqlx::query_scalar::<_, i64>("SELECT id FROM module_items WHERE module_id = ?")
            .bind(module_id)
            .fetch_all(pool)
            .await?
            .into_iter()
            .collect();

    if let Some(stray) = item_ids.iter().find(|id| !existing.contains(id)) {
        return Err(AppError::Validation(format!(
            "Item {} does not belong to module {}",
            stray, module_id
        )));
    }

    let mut tx = pool.begin().await?;
    for (index, item_id) in item_ids.iter().enumerate() {
        sqlx::query("UPDATE module_items SET order_index = ? WHERE id = ?")
            .bind(index as i64)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(())
}

// Assessments

pub struct NewAssessment<'a> {
    pub class_id: i64,
    pub title: &'a str,
    pub description: &'a str,
    pub assessment_type: AssessmentType,
    pub max_points: f64,
    pub is_published: bool,
    pub due_at: Option<DateTime<Utc>>,
    pub auto_complete_enabled: bool,
    pub minimum_reply_count: Option<i64>,
}

#[instrument(skip(pool, assessment), fields(class_id = assessment.class_id, title = assessment.title))]
pub async fn create_assessment(
    pool: &Pool<Sqlite>,
    assessment: NewAssessment<'_>,
) -> Result<i64, AppError> {
    info!("Creating assessment");
    let res = sqlx::query(
        "INSERT INTO assessments
         (class_id, title, description, assessment_type, max_points, is_published, due_at,
          auto_complete_enabled, minimum_reply_count)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(assessment.class_id)
    .bind(assessment.title)
    .bind(assessment.description)
    .bind(assessment.assessment_type.as_str())
    .bind(assessment.max_points)
    .bind(assessment.is_published)
    .bind(assessment.due_at.map(|dt| dt.naive_utc()))
    .bind(assessment.auto_complete_enabled)
    .bind(assessment.minimum_reply_count)
    .execute(pool)
    .await?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip(pool))]
pub async fn get_assessment(pool: &Pool<Sqlite>, assessment_id: i64) -> Result<Assessment, AppError> {
    let row = sqlx::query_as::<_, DbAssessment>(&format!(
        "SELECT {} FROM assessments WHERE id = ?",
        ASSESSMENT_COLUMNS
    ))
    .bind(assessment_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Assessment::try_from(row),
        None => Err(AppError::NotFound(format!(
            "Assessment {} not found",
            assessment_id
        ))),
    }
}

#[instrument(skip(pool))]
pub async fn get_class_assessments(
    pool: &Pool<Sqlite>,
    class_id: i64,
) -> Result<Vec<Assessment>, AppError> {
    let rows = sqlx::query_as::<_, DbAssessment>(&format!(
        "SELECT {} FROM assessments WHERE class_id = ? ORDER BY id",
        ASSESSMENT_COLUMNS
    ))
    .bind(class_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Assessment::try_from).collect()
}

#[instrument(skip(pool))]
pub async fn set_assessment_published(
    pool: &Pool<Sqlite>,
    assessment_id: i64,
    is_published: bool,
) -> Result<(), AppError> {
    info!("Setting assessment publish flag");
    let res = sqlx::query("UPDATE assessments SET is_published = ? WHERE id = ?")
        .bind(is_published)
        .bind(assessment_id)
        .execute(pool)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "Assessment {} not found",
            assessment_id
        )));
    }
    Ok(())
}

#[instrument(skip(pool))]
pub async fn delete_assessment(pool: &Pool<Sqlite>, assessment_id: i64) -> Result<(), AppError> {
    info!("Deleting assessment");
    let res = sqlx::query("DELETE FROM assessments WHERE id = ?")
        .bind(assessment_id)
        .execute(pool)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "Assessment {} not found",
            assessment_id
        )));
    }
    Ok(())
}

// Completions

#[instrument(skip(pool))]
pub async fn find_item_completion(
    pool: &Pool<Sqlite>,
    student_id: i64,
    item_id: i64,
) -> Result<Option<ModuleItemCompletion>, AppError> {
    let row = sqlx::query_as::<_, DbModuleItemCompletion>(
        "SELECT id, module_item_id, student_id, completed_at FROM module_item_completions
         WHERE student_id = ? AND module_item_id = ?",
    )
    .bind(student_id)
    .bind(item_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(ModuleItemCompletion::from))
}

/// Inserts the completion row. Returns `None` when a row for the pair already
/// exists, so concurrent identical calls resolve to the same record.
#[instrument(skip(pool))]
pub async fn insert_item_completion(
    pool: &Pool<Sqlite>,
    student_id: i64,
    item_id: i64,
) -> Result<Option<ModuleItemCompletion>, AppError> {
    info!("Recording item completion");
    let res = sqlx::query(
        "INSERT INTO module_item_completions (module_item_id, student_id, completed_at)
         VALUES (?, ?, ?)",
    )
    .bind(item_id)
    .bind(student_id)
    .bind(Utc::now().naive_utc())
    .execute(pool)
    .await;

    match res {
        Ok(_) => find_item_completion(pool, student_id, item_id).await,
        Err(e) if is_unique_violation(&e) => {
            info!("Item completion already recorded by a concurrent request");
            Ok(None)
        }
        Err(e) => Err(AppError::Database(e)),
    }
}

#[instrument(skip(pool))]
pub async fn get_item_completion_ids_for_class(
    pool: &Pool<Sqlite>,
    student_id: i64,
    class_id: i64,
) -> Result<HashSet<i64>, AppError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT c.module_item_id FROM module_item_completions c
         JOIN module_items mi ON mi.id = c.module_item_id
         JOIN modules m ON m.id = mi.module_id
         WHERE c.student_id = ? AND m.class_id = ?",
    )
    .bind(student_id)
    .bind(class_id)
    .fetch_all(pool)
    .await?;

    Ok(ids.into_iter().collect())
}

#[instrument(skip(pool))]
pub async fn get_item_completion_ids_for_module(
    pool: &Pool<Sqlite>,
    student_id: i64,
    module_id: i64,
) -> Result<HashSet<i64>, AppError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT c.module_item_id FROM module_item_completions c
         JOIN module_items mi ON mi.id = c.module_item_id
         WHERE c.student_id = ? AND mi.module_id = ?",
    )
    .bind(student_id)
    .bind(module_id)
    .fetch_all(pool)
    .await?;

    Ok(ids.into_iter().collect())
}

#[instrument(skip(pool))]
pub async fn find_module_completion(
    pool: &Pool<Sqlite>,
    student_id: i64,
    module_id: i64,
) -> Result<Option<ModuleCompletion>, AppError> {
    let row = sqlx::query_as::<_, DbModuleCompletion>(
        "SELECT id, module_id, student_id, completed_at FROM module_completions
         WHERE student_id = ? AND module_id = ?",
    )
    .bind(student_id)
    .bind(module_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(ModuleCompletion::from))
}

/// Creates the module completion. A uniqueness conflict means another request
/// got there first; that is reported as `Ok(false)` rather than an error.
#[instrument(skip(pool))]
pub async fn insert_module_completion(
    pool: &Pool<Sqlite>,
    student_id: i64,
    module_id: i64,
) -> Result<bool, AppError> {
    info!("Recording module completion");
    let res = sqlx::query(
        "INSERT INTO module_completions (module_id, student_id, completed_at) VALUES (?, ?, ?)",
    )
    .bind(module_id)
    .bind(student_id)
    .bind(Utc::now().naive_utc())
    .execute(pool)
    .await;

    match res {
        Ok(_) => Ok(true),
        Err(e) if is_unique_violation(&e) => {
            info!("Module already completed, ignoring duplicate");
            Ok(false)
        }
        Err(e) => Err(AppError::Database(e)),
    }
}

#[instrument(skip(pool))]
pub async fn get_module_completion_ids_for_class(
    pool: &Pool<Sqlite>,
    student_id: i64,
    class_id: i64,
) -> Result<HashSet<i64>, AppError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT mc.module_id FROM module_completions mc
         JOIN modules m ON m.id = mc.module_id
         WHERE mc.student_id = ? AND m.class_id = ?",
    )
    .bind(student_id)
    .bind(class_id)
    .fetch_all(pool)
    .await?;

    Ok(ids.into_iter().collect())
}

// Submissions

#[instrument(skip(pool))]
pub async fn find_submission(
    pool: &Pool<Sqlite>,
    assessment_id: i64,
    student_id: i64,
) -> Result<Option<AssessmentSubmission>, AppError> {
    let row = sqlx::query_as::<_, DbAssessmentSubmission>(&format!(
        "SELECT {} FROM assessment_submissions WHERE assessment_id = ? AND student_id = ?",
        SUBMISSION_COLUMNS
    ))
    .bind(assessment_id)
    .bind(student_id)
    .fetch_optional(pool)
    .await?;

    row.map(AssessmentSubmission::try_from).transpose()
}

#[instrument(skip(pool))]
pub async fn get_submission(
    pool: &Pool<Sqlite>,
    submission_id: i64,
) -> Result<AssessmentSubmission, AppError> {
    let row = sqlx::query_as::<_, DbAssessmentSubmission>(&format!(
        "SELECT {} FROM assessment_submissions WHERE id = ?",
        SUBMISSION_COLUMNS
    ))
    .bind(submission_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => AssessmentSubmission::try_from(row),
        None => Err(AppError::NotFound(format!(
            "Submission {} not found",
            submission_id
        ))),
    }
}

#[instrument(skip(pool))]
pub async fn get_assessment_submissions(
    pool: &Pool<Sqlite>,
    assessment_id: i64,
) -> Result<Vec<AssessmentSubmission>, AppError> {
    let rows = sqlx::query_as::<_, DbAssessmentSubmission>(&format!(
        "SELECT {} FROM assessment_submissions WHERE assessment_id = ? ORDER BY student_id",
        SUBMISSION_COLUMNS
    ))
    .bind(assessment_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(AssessmentSubmission::try_from).collect()
}

/// Writes the student's submission, creating the row on first submit.
#[instrument(skip(pool, content))]
pub async fn upsert_submission(
    pool: &Pool<Sqlite>,
    assessment_id: i64,
    student_id: i64,
    content: &str,
    status: SubmissionStatus,
) -> Result<AssessmentSubmission, AppError> {
    info!(status = status.as_str(), "Saving submission");
    sqlx::query(
        "INSERT INTO assessment_submissions (assessment_id, student_id, status, content, submitted_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (student_id, assessment_id)
         DO UPDATE SET status = excluded.status, content = excluded.content,
                       submitted_at = excluded.submitted_at",
    )
    .bind(assessment_id)
    .bind(student_id)
    .bind(status.as_str())
    .bind(content)
    .bind(Utc::now().naive_utc())
    .execute(pool)
    .await?;

    find_submission(pool, assessment_id, student_id)
        .await?
        .ok_or_else(|| AppError::Internal("Submission vanished after upsert".to_string()))
}

/// Makes sure a discussion participant has a submission row to count replies
/// and hold the auto-grade against. Existing rows are left untouched.
#[instrument(skip(pool))]
pub async fn ensure_submission(
    pool: &Pool<Sqlite>,
    assessment_id: i64,
    student_id: i64,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO assessment_submissions (assessment_id, student_id, status, submitted_at)
         VALUES (?, ?, 'SUBMITTED', ?)
         ON CONFLICT (student_id, assessment_id) DO NOTHING",
    )
    .bind(assessment_id)
    .bind(student_id)
    .bind(Utc::now().naive_utc())
    .execute(pool)
    .await?;

    Ok(())
}

#[instrument(skip(pool))]
pub async fn increment_reply_count(
    pool: &Pool<Sqlite>,
    assessment_id: i64,
    student_id: i64,
) -> Result<(), AppError> {
    ensure_submission(pool, assessment_id, student_id).await?;

    sqlx::query(
        "UPDATE assessment_submissions SET discussion_reply_count = discussion_reply_count + 1
         WHERE assessment_id = ? AND student_id = ?",
    )
    .bind(assessment_id)
    .bind(student_id)
    .execute(pool)
    .await?;

    Ok(())
}

#[instrument(skip(pool, feedback))]
pub async fn record_manual_grade(
    pool: &Pool<Sqlite>,
    submission_id: i64,
    manual_score: f64,
    total_score: f64,
    feedback: Option<&str>,
) -> Result<(), AppError> {
    info!("Recording manual grade");
    sqlx::query(
        "UPDATE assessment_submissions
         SET manual_score = ?, total_score = ?, feedback = COALESCE(?, feedback),
             status = 'GRADED', graded_at = ?
         WHERE id = ?",
    )
    .bind(manual_score)
    .bind(total_score)
    .bind(feedback)
    .bind(Utc::now().naive_utc())
    .bind(submission_id)
    .execute(pool)
    .await?;

    Ok(())
}

#[instrument(skip(pool))]
pub async fn record_auto_grade(
    pool: &Pool<Sqlite>,
    submission_id: i64,
    auto_score: f64,
    total_score: f64,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE assessment_submissions
         SET auto_score = ?, total_score = ?, status = 'GRADED', graded_at = ?
         WHERE id = ? AND status <> 'GRADED'",
    )
    .bind(auto_score)
    .bind(total_score)
    .bind(Utc::now().naive_utc())
    .bind(submission_id)
    .execute(pool)
    .await?;

    Ok(())
}

const GRADED_SUBMISSION_SELECT: &str = "SELECT s.student_id, a.class_id, c.name AS class_name,
        a.assessment_type, a.max_points, s.status, s.total_score
     FROM assessment_submissions s
     JOIN assessments a ON a.id = s.assessment_id
     JOIN classes c ON c.id = a.class_id";

#[instrument(skip(pool))]
pub async fn get_student_submissions_for_grading(
    pool: &Pool<Sqlite>,
    student_id: i64,
) -> Result<Vec<GradedSubmission>, AppError> {
    let rows = sqlx::query_as::<_, DbGradedSubmission>(&format!(
        "{} WHERE s.student_id = ? ORDER BY a.class_id, a.id",
        GRADED_SUBMISSION_SELECT
    ))
    .bind(student_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(GradedSubmission::try_from).collect()
}

#[instrument(skip(pool))]
pub async fn get_class_submissions_for_grading(
    pool: &Pool<Sqlite>,
    class_id: i64,
) -> Result<Vec<GradedSubmission>, AppError> {
    let rows = sqlx::query_as::<_, DbGradedSubmission>(&format!(
        "{} WHERE a.class_id = ? ORDER BY s.student_id, a.id",
        GRADED_SUBMISSION_SELECT
    ))
    .bind(class_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(GradedSubmission::try_from).collect()
}

// Discussions

#[instrument(skip(pool, body))]
pub async fn create_discussion_post(
    pool: &Pool<Sqlite>,
    assessment_id: i64,
    author_id: i64,
    parent_id: Option<i64>,
    body: &str,
) -> Result<i64, AppError> {
    info!("Creating discussion post");
    let res = sqlx::query(
        "INSERT INTO discussion_posts (assessment_id, author_id, parent_id, body) VALUES (?, ?, ?, ?)",
    )
    .bind(assessment_id)
    .bind(author_id)
    .bind(parent_id)
    .bind(body)
    .execute(pool)
    .await?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip(pool))]
pub async fn find_discussion_post(
    pool: &Pool<Sqlite>,
    post_id: i64,
) -> Result<Option<DiscussionPost>, AppError> {
    let row = sqlx::query_as::<_, DbDiscussionPost>(&format!(
        "SELECT {} FROM discussion_posts p JOIN users u ON u.id = p.author_id WHERE p.id = ?",
        POST_COLUMNS
    ))
    .bind(post_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(DiscussionPost::from))
}

#[instrument(skip(pool))]
pub async fn get_discussion_posts(
    pool: &Pool<Sqlite>,
    assessment_id: i64,
) -> Result<Vec<DiscussionPost>, AppError> {
    let rows = sqlx::query_as::<_, DbDiscussionPost>(&format!(
        "SELECT {} FROM discussion_posts p JOIN users u ON u.id = p.author_id
         WHERE p.assessment_id = ? ORDER BY p.created_at, p.id",
        POST_COLUMNS
    ))
    .bind(assessment_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(DiscussionPost::from).collect())
}

/// Students of an assessment that have at least one top-level post.
#[instrument(skip(pool))]
pub async fn get_discussion_authors(
    pool: &Pool<Sqlite>,
    assessment_id: i64,
) -> Result<HashSet<i64>, AppError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT DISTINCT author_id FROM discussion_posts
         WHERE assessment_id = ? AND parent_id IS NULL",
    )
    .bind(assessment_id)
    .fetch_all(pool)
    .await?;

    Ok(ids.into_iter().collect())
}
