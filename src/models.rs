use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

fn to_utc(dt: NaiveDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc)
}

fn unknown_value(kind: &str, value: &str) -> AppError {
    AppError::Internal(format!("Unknown {} '{}' stored in database", kind, value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemType {
    Assessment,
    ExternalLink,
    Page,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Assessment => "ASSESSMENT",
            ItemType::ExternalLink => "EXTERNAL_LINK",
            ItemType::Page => "PAGE",
        }
    }
}

impl FromStr for ItemType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ASSESSMENT" => Ok(ItemType::Assessment),
            "EXTERNAL_LINK" => Ok(ItemType::ExternalLink),
            "PAGE" => Ok(ItemType::Page),
            _ => Err(unknown_value("item type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssessmentType {
    Quiz,
    Exam,
    Assignment,
    Project,
    Discussion,
}

impl AssessmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssessmentType::Quiz => "QUIZ",
            AssessmentType::Exam => "EXAM",
            AssessmentType::Assignment => "ASSIGNMENT",
            AssessmentType::Project => "PROJECT",
            AssessmentType::Discussion => "DISCUSSION",
        }
    }
}

impl fmt::Display for AssessmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssessmentType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUIZ" => Ok(AssessmentType::Quiz),
            "EXAM" => Ok(AssessmentType::Exam),
            "ASSIGNMENT" => Ok(AssessmentType::Assignment),
            "PROJECT" => Ok(AssessmentType::Project),
            "DISCUSSION" => Ok(AssessmentType::Discussion),
            _ => Err(unknown_value("assessment type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    None,
    Submitted,
    Graded,
    Late,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::None => "NONE",
            SubmissionStatus::Submitted => "SUBMITTED",
            SubmissionStatus::Graded => "GRADED",
            SubmissionStatus::Late => "LATE",
        }
    }

    /// Submitted work still waiting on a grade.
    pub fn is_pending(&self) -> bool {
        matches!(self, SubmissionStatus::Submitted | SubmissionStatus::Late)
    }
}

impl FromStr for SubmissionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(SubmissionStatus::None),
            "SUBMITTED" => Ok(SubmissionStatus::Submitted),
            "GRADED" => Ok(SubmissionStatus::Graded),
            "LATE" => Ok(SubmissionStatus::Late),
            _ => Err(unknown_value("submission status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Active,
    Dropped,
    Completed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Dropped => "dropped",
            EnrollmentStatus::Completed => "completed",
        }
    }
}

impl FromStr for EnrollmentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EnrollmentStatus::Active),
            "dropped" => Ok(EnrollmentStatus::Dropped),
            "completed" => Ok(EnrollmentStatus::Completed),
            _ => Err(unknown_value("enrollment status", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: i64,
    pub code: String,
    pub title: String,
    pub description: String,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbCourse {
    pub id: Option<i64>,
    pub code: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl From<DbCourse> for Course {
    fn from(course: DbCourse) -> Self {
        Self {
            id: course.id.unwrap_or_default(),
            code: course.code.unwrap_or_default(),
            title: course.title.unwrap_or_default(),
            description: course.description.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Class {
    pub id: i64,
    pub course_id: i64,
    pub name: String,
    pub term: String,
    pub professor_id: Option<i64>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbClass {
    pub id: Option<i64>,
    pub course_id: Option<i64>,
    pub name: Option<String>,
    pub term: Option<String>,
    pub professor_id: Option<i64>,
}

impl From<DbClass> for Class {
    fn from(class: DbClass) -> Self {
        Self {
            id: class.id.unwrap_or_default(),
            course_id: class.course_id.unwrap_or_default(),
            name: class.name.unwrap_or_default(),
            term: class.term.unwrap_or_default(),
            professor_id: class.professor_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: i64,
    pub class_id: i64,
    pub student_id: i64,
    pub status: EnrollmentStatus,
    pub enrolled_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Active
    }
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbEnrollment {
    pub id: Option<i64>,
    pub class_id: Option<i64>,
    pub student_id: Option<i64>,
    pub status: Option<String>,
    pub enrolled_at: Option<NaiveDateTime>,
}

impl TryFrom<DbEnrollment> for Enrollment {
    type Error = AppError;

    fn try_from(db: DbEnrollment) -> Result<Self, Self::Error> {
        Ok(Self {
            id: db.id.unwrap_or_default(),
            class_id: db.class_id.unwrap_or_default(),
            student_id: db.student_id.unwrap_or_default(),
            status: db.status.as_deref().unwrap_or("active").parse()?,
            enrolled_at: db.enrolled_at.map(to_utc).unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub id: i64,
    pub class_id: i64,
    pub title: String,
    pub description: String,
    pub order_index: i64,
    pub is_published: bool,
    pub unlock_at: Option<DateTime<Utc>>,
    pub prerequisite_ids: Vec<i64>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbModule {
    pub id: Option<i64>,
    pub class_id: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub order_index: Option<i64>,
    pub is_published: Option<bool>,
    pub unlock_at: Option<NaiveDateTime>,
}

// Prerequisites live in their own table and are attached after loading.
impl From<DbModule> for Module {
    fn from(db: DbModule) -> Self {
        Self {
            id: db.id.unwrap_or_default(),
            class_id: db.class_id.unwrap_or_default(),
            title: db.title.unwrap_or_default(),
            description: db.description.unwrap_or_default(),
            order_index: db.order_index.unwrap_or_default(),
            is_published: db.is_published.unwrap_or_default(),
            unlock_at: db.unlock_at.map(to_utc),
            prerequisite_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleItem {
    pub id: i64,
    pub module_id: i64,
    pub title: String,
    pub item_type: ItemType,
    pub order_index: i64,
    pub is_published: bool,
    pub is_required: bool,
    pub assessment_id: Option<i64>,
    pub url: Option<String>,
    pub content: Option<String>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbModuleItem {
    pub id: Option<i64>,
    pub module_id: Option<i64>,
    pub title: Option<String>,
    pub item_type: Option<String>,
    pub order_index: Option<i64>,
    pub is_published: Option<bool>,
    pub is_required: Option<bool>,
    pub assessment_id: Option<i64>,
    pub url: Option<String>,
    pub content: Option<String>,
}

impl TryFrom<DbModuleItem> for ModuleItem {
    type Error = AppError;

    fn try_from(db: DbModuleItem) -> Result<Self, Self::Error> {
        Ok(Self {
            id: db.id.unwrap_or_default(),
            module_id: db.module_id.unwrap_or_default(),
            title: db.title.unwrap_or_default(),
            item_type: db.item_type.as_deref().unwrap_or("PAGE").parse()?,
            order_index: db.order_index.unwrap_or_default(),
            is_published: db.is_published.unwrap_or_default(),
            is_required: db.is_required.unwrap_or_default(),
            assessment_id: db.assessment_id,
            url: db.url,
            content: db.content,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub id: i64,
    pub class_id: i64,
    pub title: String,
    pub description: String,
    pub assessment_type: AssessmentType,
    pub max_points: f64,
    pub is_published: bool,
    pub due_at: Option<DateTime<Utc>>,
    pub auto_complete_enabled: bool,
    pub minimum_reply_count: Option<i64>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbAssessment {
    pub id: Option<i64>,
    pub class_id: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub assessment_type: Option<String>,
    pub max_points: Option<f64>,
    pub is_published: Option<bool>,
    pub due_at: Option<NaiveDateTime>,
    pub auto_complete_enabled: Option<bool>,
    pub minimum_reply_count: Option<i64>,
}

impl TryFrom<DbAssessment> for Assessment {
    type Error = AppError;

    fn try_from(db: DbAssessment) -> Result<Self, Self::Error> {
        Ok(Self {
            id: db.id.unwrap_or_default(),
            class_id: db.class_id.unwrap_or_default(),
            title: db.title.unwrap_or_default(),
            description: db.description.unwrap_or_default(),
            assessment_type: db.assessment_type.as_deref().unwrap_or("ASSIGNMENT").parse()?,
            max_points: db.max_points.unwrap_or_default(),
            is_published: db.is_published.unwrap_or_default(),
            due_at: db.due_at.map(to_utc),
            auto_complete_enabled: db.auto_complete_enabled.unwrap_or_default(),
            minimum_reply_count: db.minimum_reply_count,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleItemCompletion {
    pub id: i64,
    pub module_item_id: i64,
    pub student_id: i64,
    pub completed_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbModuleItemCompletion {
    pub id: Option<i64>,
    pub module_item_id: Option<i64>,
    pub student_id: Option<i64>,
    pub completed_at: Option<NaiveDateTime>,
}

impl From<DbModuleItemCompletion> for ModuleItemCompletion {
    fn from(db: DbModuleItemCompletion) -> Self {
        Self {
            id: db.id.unwrap_or_default(),
            module_item_id: db.module_item_id.unwrap_or_default(),
            student_id: db.student_id.unwrap_or_default(),
            completed_at: db.completed_at.map(to_utc).unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleCompletion {
    pub id: i64,
    pub module_id: i64,
    pub student_id: i64,
    pub completed_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbModuleCompletion {
    pub id: Option<i64>,
    pub module_id: Option<i64>,
    pub student_id: Option<i64>,
    pub completed_at: Option<NaiveDateTime>,
}

impl From<DbModuleCompletion> for ModuleCompletion {
    fn from(db: DbModuleCompletion) -> Self {
        Self {
            id: db.id.unwrap_or_default(),
            module_id: db.module_id.unwrap_or_default(),
            student_id: db.student_id.unwrap_or_default(),
            completed_at: db.completed_at.map(to_utc).unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentSubmission {
    pub id: i64,
    pub assessment_id: i64,
    pub student_id: i64,
    pub status: SubmissionStatus,
    pub content: String,
    pub total_score: Option<f64>,
    pub manual_score: Option<f64>,
    pub auto_score: Option<f64>,
    pub discussion_reply_count: i64,
    pub feedback: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub graded_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow, Clone, Default)]
pub struct DbAssessmentSubmission {
    pub id: Option<i64>,
    pub assessment_id: Option<i64>,
    pub student_id: Option<i64>,
    pub status: Option<String>,
    pub content: Option<String>,
    pub total_score: Option<f64>,
    pub manual_score: Option<f64>,
    pub auto_score: Option<f64>,
    pub discussion_reply_count: Option<i64>,
    pub feedback: Option<String>,
    pub submitted_at: Option<NaiveDateTime>,
    pub graded_at: Option<NaiveDateTime>,
}

impl TryFrom<DbAssessmentSubmission> for AssessmentSubmission {
    type Error = AppError;

    fn try_from(db: DbAssessmentSubmission) -> Result<Self, Self::Error> {
        Ok(Self {
            id: db.id.unwrap_or_default(),
            assessment_id: db.assessment_id.unwrap_or_default(),
            student_id: db.student_id.unwrap_or_default(),
            status: db.status.as_deref().unwrap_or("NONE").parse()?,
            content: db.content.unwrap_or_default(),
            total_score: db.total_score,
            manual_score: db.manual_score,
            auto_score: db.auto_score,
            discussion_reply_count: db.discussion_reply_count.unwrap_or_default(),
            feedback: db.feedback,
            submitted_at: db.submitted_at.map(to_utc),
            graded_at: db.graded_at.map(to_utc),
        })
    }
}

/// A submission joined with the assessment and class it belongs to, which is
/// everything the grade aggregator needs.
#[derive(Debug, Clone)]
pub struct GradedSubmission {
    pub student_id: i64,
    pub class_id: i64,
    pub class_name: String,
    pub assessment_type: AssessmentType,
    pub max_points: f64,
    pub status: SubmissionStatus,
    pub total_score: Option<f64>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbGradedSubmission {
    pub student_id: Option<i64>,
    pub class_id: Option<i64>,
    pub class_name: Option<String>,
    pub assessment_type: Option<String>,
    pub max_points: Option<f64>,
    pub status: Option<String>,
    pub total_score: Option<f64>,
}

impl TryFrom<DbGradedSubmission> for GradedSubmission {
    type Error = AppError;

    fn try_from(db: DbGradedSubmission) -> Result<Self, Self::Error> {
        Ok(Self {
            student_id: db.student_id.unwrap_or_default(),
            class_id: db.class_id.unwrap_or_default(),
            class_name: db.class_name.unwrap_or_default(),
            assessment_type: db.assessment_type.as_deref().unwrap_or("ASSIGNMENT").parse()?,
            max_points: db.max_points.unwrap_or_default(),
            status: db.status.as_deref().unwrap_or("NONE").parse()?,
            total_score: db.total_score,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionPost {
    pub id: i64,
    pub assessment_id: i64,
    pub author_id: i64,
    pub author_name: String,
    pub parent_id: Option<i64>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbDiscussionPost {
    pub id: Option<i64>,
    pub assessment_id: Option<i64>,
    pub author_id: Option<i64>,
    pub author_name: Option<String>,
    pub parent_id: Option<i64>,
    pub body: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}

impl From<DbDiscussionPost> for DiscussionPost {
    fn from(db: DbDiscussionPost) -> Self {
        Self {
            id: db.id.unwrap_or_default(),
            assessment_id: db.assessment_id.unwrap_or_default(),
            author_id: db.author_id.unwrap_or_default(),
            author_name: db.author_name.unwrap_or_default(),
            parent_id: db.parent_id,
            body: db.body.unwrap_or_default(),
            created_at: db.created_at.map(to_utc).unwrap_or_else(Utc::now),
        }
    }
}
