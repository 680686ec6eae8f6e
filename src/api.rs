use chrono::Utc;
use rocket::FromForm;
use rocket::State;
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::response::status::Custom;
use rocket::serde::{Deserialize, Serialize, json::Json};
use serde_json::Value;
use sqlx::{Pool, Sqlite};
use tracing::{info, warn};
use validator::Validate;

use crate::auth::{Permission, Role, User, UserSession};
use crate::db::{
    ModuleItemUpdate, ModuleUpdate, NewAssessment, NewModule, NewModuleItem, authenticate_user,
    create_assessment, create_class, create_course, create_discussion_post, create_module,
    create_module_item, create_user, create_user_session, delete_assessment, delete_course, delete_module,
    delete_module_item, enroll_student, ensure_submission, find_discussion_post, find_enrollment,
    find_module_item, find_submission, get_all_classes, get_assessment,
    get_assessment_submissions, get_class, get_class_assessments, get_class_enrollments,
    get_classes_for_professor, get_classes_for_student, get_courses, get_discussion_posts,
    get_module, get_submission, get_user, increment_reply_count, invalidate_session,
    record_manual_grade, reorder_module_items, reorder_modules, set_assessment_published,
    set_enrollment_status, update_module, update_module_item, upsert_submission,
};
use crate::env::AppConfig;
use crate::error::AppError;
use crate::grading::{
    AutoGradeReport, ClassGradeReport, GradeSummary, auto_grade_discussion, class_grade_report,
    student_grade_summary,
};
use crate::models::{
    Assessment, AssessmentSubmission, AssessmentType, Class, Course, DiscussionPost, Enrollment,
    EnrollmentStatus, ItemType, Module, ModuleItem, SubmissionStatus,
};
use crate::progression::{CompletionOutcome, ModuleProgress, complete_item, student_class_modules};
use crate::validation::{
    ApiError, AppErrorExt, JsonValidateExt, PermissionCheckExt, ToValidationResponse,
    USERNAME_PATTERN, ValidationResponse, parse_id_list,
};

const SESSION_COOKIE: &str = "session_token";

#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    pub user: Option<UserData>,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub role: String,
    pub archived: bool,
}

impl From<User> for UserData {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            role: user.role.to_string(),
            username: user.username,
            display_name: user.display_name,
            archived: user.archived,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreatedResponse {
    pub id: i64,
}

fn created(id: i64) -> Custom<Json<CreatedResponse>> {
    Custom(Status::Created, Json(CreatedResponse { id }))
}

/// Loads a class and checks the caller teaches it.
async fn staff_class(db: &Pool<Sqlite>, user: &User, class_id: i64) -> Result<Class, ApiError> {
    let class = get_class(db, class_id).await.validate_custom()?;
    user.require_teaching(&class).validate_custom()?;
    Ok(class)
}

/// Admins, the class's professor, or a student with an active enrollment.
async fn require_class_access(db: &Pool<Sqlite>, user: &User, class: &Class) -> Result<(), ApiError> {
    if user.teaches(class) {
        return Ok(());
    }

    if user.role == Role::Student {
        let enrollment = find_enrollment(db, class.id, user.id).await.validate_custom()?;
        if enrollment.is_some_and(|e| e.is_active()) {
            return Ok(());
        }
    }

    Err(AppError::Authorization(format!(
        "User {} has no access to class {}",
        user.id, class.id
    ))
    .to_validation_response())
}

async fn staff_module(
    db: &Pool<Sqlite>,
    user: &User,
    module_id: i64,
) -> Result<(Module, Class), ApiError> {
    user.require_permission(Permission::ManageModules)
        .validate_custom()?;
    let module = get_module(db, module_id).await.validate_custom()?;
    let class = staff_class(db, user, module.class_id).await?;
    Ok((module, class))
}

async fn staff_item(db: &Pool<Sqlite>, user: &User, item_id: i64) -> Result<ModuleItem, ApiError> {
    let item = find_module_item(db, item_id)
        .await
        .validate_custom()?
        .ok_or_else(|| {
            AppError::NotFound(format!("Module item {} not found", item_id)).to_validation_response()
        })?;
    staff_module(db, user, item.module_id).await?;
    Ok(item)
}

// Auth

#[post("/login", data = "<login>")]
pub async fn api_login(
    login: Json<LoginRequest>,
    cookies: &CookieJar<'_>,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> Result<Json<LoginResponse>, ApiError> {
    let validated = login.validate_custom()?;

    match authenticate_user(db, &validated.username, &validated.password)
        .await
        .validate_custom()?
    {
        Some(user) => {
            let token = UserSession::generate_token();
            let expires_at = Utc::now() + chrono::Duration::hours(config.session_hours);

            create_user_session(db, user.id, &token, expires_at.naive_utc())
                .await
                .validate_custom()?;

            cookies.add_private(
                Cookie::build((SESSION_COOKIE, token))
                    .same_site(SameSite::Lax)
                    .http_only(true)
                    .max_age(rocket::time::Duration::hours(config.session_hours)),
            );

            cookies.add_private(
                Cookie::build(("user_role", user.role.to_string()))
                    .same_site(SameSite::Lax)
                    .max_age(rocket::time::Duration::hours(config.session_hours)),
            );

            Ok(Json(LoginResponse {
                success: true,
                user: Some(UserData::from(user)),
                error: None,
            }))
        }
        None => Ok(Json(LoginResponse {
            success: false,
            user: None,
            error: Some("Invalid username or password".to_string()),
        })),
    }
}

#[get("/me")]
pub async fn api_me(user: User) -> Json<UserData> {
    Json(UserData::from(user))
}

#[get("/me", rank = 2)]
pub async fn api_me_unauthorized() -> Status {
    Status::Unauthorized
}

#[post("/logout")]
pub async fn api_logout(cookies: &CookieJar<'_>, db: &State<Pool<Sqlite>>) -> Status {
    let token = cookies
        .get_private(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string());

    if let Some(token) = token {
        if let Err(e) = invalidate_session(db, &token).await {
            warn!(error = %e, "Failed to invalidate session on logout");
        }
    }

    cookies.remove_private(Cookie::build(SESSION_COOKIE));
    cookies.remove_private(Cookie::build("user_role"));

    Status::Ok
}

#[derive(Deserialize, Validate, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistrationRequest {
    #[validate(regex(
        path = *USERNAME_PATTERN,
        message = "Username must be 3-32 letters, digits, '.', '_' or '-'"
    ))]
    username: String,
    #[validate(length(min = 1, max = 100, message = "Display name must be 1-100 characters"))]
    display_name: Option<String>,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    password: String,
    role: String,
}

#[post("/register", data = "<registration>")]
pub async fn api_register_user(
    registration: Json<UserRegistrationRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<CreatedResponse>>, ApiError> {
    let validated = registration.validate_custom()?;
    let role: Role = validated.role.parse::<Role>().validate_custom()?;

    match role {
        Role::Admin => user
            .require_all_permissions(&[Permission::EditUserRoles, Permission::RegisterUsers])
            .validate_custom()?,
        _ => user
            .require_permission(Permission::RegisterUsers)
            .validate_custom()?,
    };

    let id = create_user(
        db,
        &validated.username,
        &validated.password,
        role,
        validated.display_name.as_deref(),
    )
    .await
    .validate_custom()?;

    Ok(created(id))
}

#[get("/health")]
pub fn health() -> &'static str {
    "OK"
}

// Courses & classes

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCourseRequest {
    #[validate(length(min = 1, max = 32, message = "Course code must be 1-32 characters"))]
    code: String,
    #[validate(length(min = 1, max = 200, message = "Title must be 1-200 characters"))]
    title: String,
    #[serde(default)]
    description: String,
}

#[get("/courses")]
pub async fn api_get_courses(_user: User, db: &State<Pool<Sqlite>>) -> Result<Json<Vec<Course>>, Status> {
    Ok(Json(get_courses(db).await?))
}

#[post("/courses", data = "<course>")]
pub async fn api_create_course(
    course: Json<CreateCourseRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<CreatedResponse>>, ApiError> {
    user.require_permission(Permission::ManageCourses)
        .validate_custom()?;
    let course = course.validate_custom()?;

    let id = create_course(db, &course.code, &course.title, &course.description)
        .await
        .validate_custom()?;
    Ok(created(id))
}

#[delete("/courses/<id>")]
pub async fn api_delete_course(id: i64, user: User, db: &State<Pool<Sqlite>>) -> Result<Status, Status> {
    user.require_permission(Permission::ManageCourses)?;
    delete_course(db, id).await?;
    Ok(Status::NoContent)
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateClassRequest {
    course_id: i64,
    #[validate(length(min = 1, max = 200, message = "Class name must be 1-200 characters"))]
    name: String,
    #[validate(length(min = 1, max = 50, message = "Term must be 1-50 characters"))]
    term: String,
    professor_id: Option<i64>,
}

#[post("/classes", data = "<class>")]
pub async fn api_create_class(
    class: Json<CreateClassRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<CreatedResponse>>, ApiError> {
    user.require_permission(Permission::ManageClasses)
        .validate_custom()?;
    let class = class.validate_custom()?;

    if let Some(professor_id) = class.professor_id {
        let professor = get_user(db, professor_id).await.validate_custom()?;
        if professor.role != Role::Professor {
            return Err(Custom(
                Status::BadRequest,
                Json(ValidationResponse::with_error(
                    "professorId",
                    "Assigned user is not a professor",
                )),
            ));
        }
    }

    let id = create_class(db, class.course_id, &class.name, &class.term, class.professor_id)
        .await
        .validate_custom()?;
    Ok(created(id))
}

#[get("/classes")]
pub async fn api_get_classes(user: User, db: &State<Pool<Sqlite>>) -> Result<Json<Vec<Class>>, Status> {
    let classes = match user.role {
        Role::Admin => get_all_classes(db).await?,
        Role::Professor => get_classes_for_professor(db, user.id).await?,
        Role::Student => get_classes_for_student(db, user.id).await?,
    };
    Ok(Json(classes))
}

#[get("/classes/<id>")]
pub async fn api_get_class(id: i64, user: User, db: &State<Pool<Sqlite>>) -> Result<Json<Class>, ApiError> {
    let class = get_class(db, id).await.validate_custom()?;
    require_class_access(db, &user, &class).await?;
    Ok(Json(class))
}

// Enrollments

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest {
    student_id: i64,
}

#[derive(Deserialize)]
pub struct EnrollmentStatusRequest {
    status: EnrollmentStatus,
}

#[post("/classes/<class_id>/enrollments", data = "<request>")]
pub async fn api_enroll_student(
    class_id: i64,
    request: Json<EnrollRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<Enrollment>>, ApiError> {
    user.require_permission(Permission::ManageEnrollments)
        .validate_custom()?;
    staff_class(db, &user, class_id).await?;

    let student = get_user(db, request.student_id).await.validate_custom()?;
    if student.role != Role::Student {
        return Err(Custom(
            Status::BadRequest,
            Json(ValidationResponse::with_error(
                "studentId",
                "Only students can be enrolled",
            )),
        ));
    }

    let enrollment = enroll_student(db, class_id, student.id)
        .await
        .validate_custom()?;
    Ok(Custom(Status::Created, Json(enrollment)))
}

#[put("/classes/<class_id>/enrollments/<student_id>", data = "<request>")]
pub async fn api_set_enrollment_status(
    class_id: i64,
    student_id: i64,
    request: Json<EnrollmentStatusRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    user.require_permission(Permission::ManageEnrollments)
        .validate_custom()?;
    staff_class(db, &user, class_id).await?;

    set_enrollment_status(db, class_id, student_id, request.status)
        .await
        .validate_custom()?;
    Ok(Status::Ok)
}

#[get("/classes/<class_id>/enrollments")]
pub async fn api_get_class_enrollments(
    class_id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<Enrollment>>, ApiError> {
    user.require_permission(Permission::ManageEnrollments)
        .validate_custom()?;
    staff_class(db, &user, class_id).await?;

    Ok(Json(
        get_class_enrollments(db, class_id).await.validate_custom()?,
    ))
}

// Modules

#[derive(FromForm)]
pub struct ModulesQueryParams {
    #[field(name = "studentId")]
    student_id: Option<i64>,
}

#[get("/classes/<class_id>/modules?<params..>")]
pub async fn api_get_class_modules(
    class_id: i64,
    params: ModulesQueryParams,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<ModuleProgress>>, ApiError> {
    let student_id = match params.student_id {
        Some(id) if id != user.id => {
            user.require_permission(Permission::ViewClassProgress)
                .validate_custom()?;
            staff_class(db, &user, class_id).await?;
            id
        }
        _ => {
            user.require_permission(Permission::ViewOwnProgress)
                .validate_custom()?;
            user.id
        }
    };

    let modules = student_class_modules(db, student_id, class_id, Utc::now())
        .await
        .validate_custom()?;
    Ok(Json(modules))
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateModuleRequest {
    #[validate(length(min = 1, max = 200, message = "Title must be 1-200 characters"))]
    title: String,
    #[serde(default)]
    description: String,
    order_index: Option<i64>,
    #[serde(default)]
    is_published: bool,
    unlock_at: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    prerequisite_ids: Vec<i64>,
}

#[post("/classes/<class_id>/modules", data = "<module>")]
pub async fn api_create_module(
    class_id: i64,
    module: Json<CreateModuleRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<CreatedResponse>>, ApiError> {
    user.require_permission(Permission::ManageModules)
        .validate_custom()?;
    staff_class(db, &user, class_id).await?;
    let module = module.validate_custom()?;

    let id = create_module(
        db,
        NewModule {
            class_id,
            title: &module.title,
            description: &module.description,
            order_index: module.order_index,
            is_published: module.is_published,
            unlock_at: module.unlock_at,
            prerequisite_ids: &module.prerequisite_ids,
        },
    )
    .await
    .validate_custom()?;
    Ok(created(id))
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateModuleRequest {
    #[validate(length(min = 1, max = 200, message = "Title must be 1-200 characters"))]
    title: Option<String>,
    description: Option<String>,
    is_published: Option<bool>,
    unlock_at: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    clear_unlock_at: bool,
    prerequisite_ids: Option<Vec<i64>>,
}

#[put("/modules/<id>", data = "<update>")]
pub async fn api_update_module(
    id: i64,
    update: Json<UpdateModuleRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Module>, ApiError> {
    staff_module(db, &user, id).await?;
    let update = update.validate_custom()?;

    let unlock_at = if update.clear_unlock_at {
        Some(None)
    } else {
        update.unlock_at.map(Some)
    };

    update_module(
        db,
        id,
        ModuleUpdate {
            title: update.title,
            description: update.description,
            is_published: update.is_published,
            unlock_at,
            prerequisite_ids: update.prerequisite_ids,
        },
    )
    .await
    .validate_custom()?;

    Ok(Json(get_module(db, id).await.validate_custom()?))
}

#[delete("/modules/<id>")]
pub async fn api_delete_module(id: i64, user: User, db: &State<Pool<Sqlite>>) -> Result<Status, ApiError> {
    staff_module(db, &user, id).await?;
    delete_module(db, id).await.validate_custom()?;
    Ok(Status::NoContent)
}

#[put("/classes/<class_id>/modules/order", data = "<body>")]
pub async fn api_reorder_modules(
    class_id: i64,
    body: Json<Value>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    user.require_permission(Permission::ManageModules)
        .validate_custom()?;
    staff_class(db, &user, class_id).await?;

    let ids = parse_id_list(&body, "moduleIds").validate_custom()?;
    reorder_modules(db, class_id, &ids).await.validate_custom()?;
    Ok(Status::Ok)
}

// Module items

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateModuleItemRequest {
    #[validate(length(min = 1, max = 200, message = "Title must be 1-200 characters"))]
    title: String,
    item_type: ItemType,
    order_index: Option<i64>,
    #[serde(default)]
    is_published: bool,
    is_required: Option<bool>,
    assessment_id: Option<i64>,
    #[validate(url(message = "Must be a valid URL"))]
    url: Option<String>,
    content: Option<String>,
}

#[post("/modules/<module_id>/items", data = "<item>")]
pub async fn api_create_module_item(
    module_id: i64,
    item: Json<CreateModuleItemRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<CreatedResponse>>, ApiError> {
    let (_, class) = staff_module(db, &user, module_id).await?;
    let item = item.validate_custom()?;

    match item.item_type {
        ItemType::Assessment => {
            let Some(assessment_id) = item.assessment_id else {
                return Err(AppError::Validation(
                    "Assessment items need an assessmentId".to_string(),
                )
                .to_validation_response());
            };
            let assessment = get_assessment(db, assessment_id).await.validate_custom()?;
            if assessment.class_id != class.id {
                return Err(AppError::Validation(format!(
                    "Assessment {} does not belong to class {}",
                    assessment_id, class.id
                ))
                .to_validation_response());
            }
        }
        ItemType::ExternalLink if item.url.is_none() => {
            return Err(
                AppError::Validation("External links need a url".to_string())
                    .to_validation_response(),
            );
        }
        _ => {}
    }

    let id = create_module_item(
        db,
        NewModuleItem {
            module_id,
            title: &item.title,
            item_type: item.item_type,
            order_index: item.order_index,
            is_published: item.is_published,
            is_required: item.is_required.unwrap_or(true),
            assessment_id: item.assessment_id,
            url: item.url.as_deref(),
            content: item.content.as_deref(),
        },
    )
    .await
    .validate_custom()?;
    Ok(created(id))
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateModuleItemRequest {
    #[validate(length(min = 1, max = 200, message = "Title must be 1-200 characters"))]
    title: Option<String>,
    is_published: Option<bool>,
    is_required: Option<bool>,
    #[validate(url(message = "Must be a valid URL"))]
    url: Option<String>,
    content: Option<String>,
}

#[put("/module-items/<id>", data = "<update>")]
pub async fn api_update_module_item(
    id: i64,
    update: Json<UpdateModuleItemRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<ModuleItem>, ApiError> {
    staff_item(db, &user, id).await?;
    let update = update.validate_custom()?;

    update_module_item(
        db,
        id,
        ModuleItemUpdate {
            title: update.title,
            is_published: update.is_published,
            is_required: update.is_required,
            url: update.url,
            content: update.content,
        },
    )
    .await
    .validate_custom()?;

    find_module_item(db, id)
        .await
        .validate_custom()?
        .map(Json)
        .ok_or_else(|| Status::NotFound.to_validation_response())
}

#[delete("/module-items/<id>")]
pub async fn api_delete_module_item(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    staff_item(db, &user, id).await?;
    delete_module_item(db, id).await.validate_custom()?;
    Ok(Status::NoContent)
}

#[put("/modules/<module_id>/items/order", data = "<body>")]
pub async fn api_reorder_module_items(
    module_id: i64,
    body: Json<Value>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    staff_module(db, &user, module_id).await?;

    let ids = parse_id_list(&body, "itemIds").validate_custom()?;
    reorder_module_items(db, module_id, &ids)
        .await
        .validate_custom()?;
    Ok(Status::Ok)
}

#[post("/module-items/<item_id>/complete")]
pub async fn api_complete_item(
    item_id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<CompletionOutcome>, ApiError> {
    user.require_permission(Permission::CompleteItems)
        .validate_custom()?;

    let outcome = complete_item(db, user.id, item_id).await.validate_custom()?;
    Ok(Json(outcome))
}

// Assessments & submissions

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateAssessmentRequest {
    #[validate(length(min = 1, max = 200, message = "Title must be 1-200 characters"))]
    title: String,
    #[serde(default)]
    description: String,
    assessment_type: AssessmentType,
    #[validate(range(min = 0.0, message = "Max points cannot be negative"))]
    max_points: f64,
    #[serde(default)]
    is_published: bool,
    due_at: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    auto_complete_enabled: bool,
    #[validate(range(min = 1, message = "Minimum reply count must be at least 1"))]
    minimum_reply_count: Option<i64>,
}

#[post("/classes/<class_id>/assessments", data = "<assessment>")]
pub async fn api_create_assessment(
    class_id: i64,
    assessment: Json<CreateAssessmentRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<CreatedResponse>>, ApiError> {
    user.require_permission(Permission::ManageAssessments)
        .validate_custom()?;
    staff_class(db, &user, class_id).await?;
    let assessment = assessment.validate_custom()?;

    let id = create_assessment(
        db,
        NewAssessment {
            class_id,
            title: &assessment.title,
            description: &assessment.description,
            assessment_type: assessment.assessment_type,
            max_points: assessment.max_points,
            is_published: assessment.is_published,
            due_at: assessment.due_at,
            auto_complete_enabled: assessment.auto_complete_enabled,
            minimum_reply_count: assessment.minimum_reply_count,
        },
    )
    .await
    .validate_custom()?;
    Ok(created(id))
}

#[get("/classes/<class_id>/assessments")]
pub async fn api_get_class_assessments(
    class_id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<Assessment>>, ApiError> {
    let class = get_class(db, class_id).await.validate_custom()?;
    require_class_access(db, &user, &class).await?;

    let mut assessments = get_class_assessments(db, class_id)
        .await
        .validate_custom()?;
    if !user.teaches(&class) {
        assessments.retain(|a| a.is_published);
    }
    Ok(Json(assessments))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    is_published: bool,
}

async fn staff_assessment(
    db: &Pool<Sqlite>,
    user: &User,
    assessment_id: i64,
    permission: Permission,
) -> Result<Assessment, ApiError> {
    user.require_permission(permission).validate_custom()?;
    let assessment = get_assessment(db, assessment_id).await.validate_custom()?;
    staff_class(db, user, assessment.class_id).await?;
    Ok(assessment)
}

/// Assessment as seen by a class member. Unpublished assessments are hidden
/// from students.
async fn visible_assessment(
    db: &Pool<Sqlite>,
    user: &User,
    assessment_id: i64,
) -> Result<Assessment, ApiError> {
    let assessment = get_assessment(db, assessment_id).await.validate_custom()?;
    let class = get_class(db, assessment.class_id).await.validate_custom()?;
    require_class_access(db, user, &class).await?;

    if !assessment.is_published && !user.teaches(&class) {
        return Err(AppError::NotFound(format!("Assessment {} not found", assessment_id))
            .to_validation_response());
    }
    Ok(assessment)
}

#[put("/assessments/<id>/publish", data = "<request>")]
pub async fn api_publish_assessment(
    id: i64,
    request: Json<PublishRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    staff_assessment(db, &user, id, Permission::ManageAssessments).await?;
    set_assessment_published(db, id, request.is_published)
        .await
        .validate_custom()?;
    Ok(Status::Ok)
}

#[derive(Deserialize, Validate)]
pub struct SubmitRequest {
    #[serde(default)]
    content: String,
}

#[post("/assessments/<id>/submissions", data = "<submission>")]
pub async fn api_submit_assessment(
    id: i64,
    submission: Json<SubmitRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<AssessmentSubmission>, ApiError> {
    user.require_permission(Permission::SubmitAssessments)
        .validate_custom()?;
    let assessment = visible_assessment(db, &user, id).await?;
    let submission = submission.validate_custom()?;

    if let Some(existing) = find_submission(db, id, user.id).await.validate_custom()? {
        if existing.status == SubmissionStatus::Graded {
            return Err(AppError::Conflict(format!(
                "Submission for assessment {} has already been graded",
                id
            ))
            .to_validation_response());
        }
    }

    let status = match assessment.due_at {
        Some(due_at) if Utc::now() > due_at => SubmissionStatus::Late,
        _ => SubmissionStatus::Submitted,
    };

    let saved = upsert_submission(db, id, user.id, &submission.content, status)
        .await
        .validate_custom()?;
    Ok(Json(saved))
}

#[delete("/assessments/<id>")]
pub async fn api_delete_assessment(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    staff_assessment(db, &user, id, Permission::ManageAssessments).await?;
    delete_assessment(db, id).await.validate_custom()?;
    info!(assessment_id = id, "Deleted assessment");
    Ok(Status::NoContent)
}

#[get("/assessments/<id>/submissions")]
pub async fn api_get_assessment_submissions(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<AssessmentSubmission>>, ApiError> {
    staff_assessment(db, &user, id, Permission::GradeSubmissions).await?;
    Ok(Json(
        get_assessment_submissions(db, id).await.validate_custom()?,
    ))
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GradeRequest {
    manual_score: f64,
    feedback: Option<String>,
}

#[put("/submissions/<id>/grade", data = "<grade>")]
pub async fn api_grade_submission(
    id: i64,
    grade: Json<GradeRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<AssessmentSubmission>, ApiError> {
    let submission = get_submission(db, id).await.validate_custom()?;
    let assessment = staff_assessment(
        db,
        &user,
        submission.assessment_id,
        Permission::GradeSubmissions,
    )
    .await?;
    let grade = grade.validate_custom()?;

    // auto and manual scores share the assessment's points
    let auto_score = submission.auto_score.unwrap_or(0.0);
    let remaining = (assessment.max_points - auto_score).max(0.0);
    if !(0.0..=remaining).contains(&grade.manual_score) {
        return Err(Custom(
            Status::BadRequest,
            Json(ValidationResponse::with_error(
                "manualScore",
                &format!("Score must be between 0 and {}", remaining),
            )),
        ));
    }

    let total = auto_score + grade.manual_score;
    record_manual_grade(db, id, grade.manual_score, total, grade.feedback.as_deref())
        .await
        .validate_custom()?;

    Ok(Json(get_submission(db, id).await.validate_custom()?))
}

// Discussions

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostRequest {
    #[validate(length(min = 1, max = 10000, message = "Post body must be 1-10000 characters"))]
    body: String,
    parent_id: Option<i64>,
}

#[get("/assessments/<id>/posts")]
pub async fn api_get_discussion_posts(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<DiscussionPost>>, ApiError> {
    visible_assessment(db, &user, id).await?;
    Ok(Json(get_discussion_posts(db, id).await.validate_custom()?))
}

#[post("/assessments/<id>/posts", data = "<post>")]
pub async fn api_create_discussion_post(
    id: i64,
    post: Json<CreatePostRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<DiscussionPost>>, ApiError> {
    user.require_permission(Permission::PostDiscussions)
        .validate_custom()?;
    let assessment = visible_assessment(db, &user, id).await?;
    let post = post.validate_custom()?;

    if assessment.assessment_type != AssessmentType::Discussion {
        return Err(AppError::Validation(format!(
            "Assessment {} is not a discussion",
            id
        ))
        .to_validation_response());
    }

    let parent = match post.parent_id {
        Some(parent_id) => match find_discussion_post(db, parent_id).await.validate_custom()? {
            Some(parent) if parent.assessment_id == id => Some(parent),
            _ => {
                return Err(AppError::Validation(format!(
                    "Post {} is not part of assessment {}",
                    parent_id, id
                ))
                .to_validation_response());
            }
        },
        None => None,
    };

    let post_id = create_discussion_post(db, id, user.id, post.parent_id, &post.body)
        .await
        .validate_custom()?;

    if user.role == Role::Student {
        match &parent {
            None => ensure_submission(db, id, user.id).await.validate_custom()?,
            Some(parent) if parent.author_id != user.id => {
                increment_reply_count(db, id, user.id)
                    .await
                    .validate_custom()?;
                info!(parent_id = parent.id, "Counted discussion reply");
            }
            Some(_) => {}
        }
    }

    let created_post = find_discussion_post(db, post_id)
        .await
        .validate_custom()?
        .ok_or_else(|| Status::InternalServerError.to_validation_response())?;
    Ok(Custom(Status::Created, Json(created_post)))
}

// Grades

#[get("/students/<student_id>/grades")]
pub async fn api_get_student_grades(
    student_id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<GradeSummary>, ApiError> {
    let class_filter = if student_id == user.id || user.role == Role::Admin {
        let permission = if student_id == user.id {
            Permission::ViewOwnGrades
        } else {
            Permission::ViewClassGrades
        };
        user.require_permission(permission).validate_custom()?;
        None
    } else {
        user.require_permission(Permission::ViewClassGrades)
            .validate_custom()?;
        let taught: Vec<i64> = get_classes_for_student(db, student_id)
            .await
            .validate_custom()?
            .iter()
            .filter(|class| user.teaches(class))
            .map(|class| class.id)
            .collect();
        if taught.is_empty() {
            return Err(Status::Forbidden.to_validation_response());
        }
        // staff only see the classes they teach
        Some(taught)
    };

    Ok(Json(
        student_grade_summary(db, student_id, class_filter.as_deref())
            .await
            .validate_custom()?,
    ))
}

#[get("/classes/<class_id>/grades")]
pub async fn api_get_class_grades(
    class_id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<ClassGradeReport>, ApiError> {
    user.require_permission(Permission::ViewClassGrades)
        .validate_custom()?;
    staff_class(db, &user, class_id).await?;

    Ok(Json(
        class_grade_report(db, class_id).await.validate_custom()?,
    ))
}

#[post("/assessments/<id>/auto-grade")]
pub async fn api_auto_grade(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<AutoGradeReport>, ApiError> {
    staff_assessment(db, &user, id, Permission::GradeSubmissions).await?;
    Ok(Json(auto_grade_discussion(db, id).await.validate_custom()?))
}
