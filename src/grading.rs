use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::{Pool, Sqlite};
use tracing::{info, instrument};

use crate::db::{
    get_assessment, get_assessment_submissions, get_class_enrollments,
    get_class_submissions_for_grading, get_discussion_authors,
    get_student_submissions_for_grading, record_auto_grade,
};
use crate::error::AppError;
use crate::models::{AssessmentType, GradedSubmission, SubmissionStatus};

const DEFAULT_MINIMUM_REPLY_COUNT: i64 = 1;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypeBreakdown {
    pub assessment_type: AssessmentType,
    pub earned: f64,
    pub possible: f64,
    pub average: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassBreakdown {
    pub class_id: i64,
    pub class_name: String,
    pub earned: f64,
    pub possible: f64,
    pub average: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GradeSummary {
    pub total_earned: f64,
    pub total_possible: f64,
    pub overall_average: f64,
    pub graded_count: usize,
    pub pending_count: usize,
    pub by_type: Vec<TypeBreakdown>,
    pub by_class: Vec<ClassBreakdown>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentGradeSummary {
    pub student_id: i64,
    pub summary: GradeSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassGradeReport {
    pub class_id: i64,
    pub overall: GradeSummary,
    pub students: Vec<StudentGradeSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoGradeReport {
    pub assessment_id: i64,
    pub graded: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct Bucket {
    earned: f64,
    possible: f64,
    count: usize,
}

impl Bucket {
    fn add(&mut self, earned: f64, possible: f64) {
        self.earned += earned;
        self.possible += possible;
        self.count += 1;
    }
}

pub fn percentage(earned: f64, possible: f64) -> f64 {
    if possible > 0.0 {
        earned / possible * 100.0
    } else {
        0.0
    }
}

/// Folds graded submissions into point totals. Only GRADED rows with a
/// total score contribute; pending ones are only counted.
pub fn summarize(submissions: &[GradedSubmission]) -> GradeSummary {
    let mut by_type: BTreeMap<AssessmentType, Bucket> = BTreeMap::new();
    let mut by_class: BTreeMap<i64, (String, Bucket)> = BTreeMap::new();
    let mut total = Bucket::default();
    let mut pending_count = 0;

    for submission in submissions {
        if submission.status.is_pending() {
            pending_count += 1;
        }

        let Some(score) = submission.total_score else {
            continue;
        };
        if submission.status != SubmissionStatus::Graded {
            continue;
        }

        by_type
            .entry(submission.assessment_type)
            .or_default()
            .add(score, submission.max_points);
        by_class
            .entry(submission.class_id)
            .or_insert_with(|| (submission.class_name.clone(), Bucket::default()))
            .1
            .add(score, submission.max_points);
        total.add(score, submission.max_points);
    }

    GradeSummary {
        total_earned: total.earned,
        total_possible: total.possible,
        overall_average: percentage(total.earned, total.possible),
        graded_count: total.count,
        pending_count,
        by_type: by_type
            .into_iter()
            .map(|(assessment_type, bucket)| TypeBreakdown {
                assessment_type,
                earned: bucket.earned,
                possible: bucket.possible,
                average: percentage(bucket.earned, bucket.possible),
                count: bucket.count,
            })
            .collect(),
        by_class: by_class
            .into_iter()
            .map(|(class_id, (class_name, bucket))| ClassBreakdown {
                class_id,
                class_name,
                earned: bucket.earned,
                possible: bucket.possible,
                average: percentage(bucket.earned, bucket.possible),
                count: bucket.count,
            })
            .collect(),
    }
}

/// Discussion credit: full marks with a post and enough replies, otherwise
/// linear partial credit on replies, capped at `max_points`.
pub fn discussion_auto_score(
    reply_count: i64,
    has_post: bool,
    minimum_reply_count: Option<i64>,
    max_points: f64,
) -> f64 {
    let required = minimum_reply_count
        .unwrap_or(DEFAULT_MINIMUM_REPLY_COUNT)
        .max(1);

    if has_post && reply_count >= required {
        max_points
    } else {
        (reply_count.max(0) as f64 / required as f64 * max_points).min(max_points)
    }
}

/// Summary over all of a student's classes, or only `class_ids` when given.
#[instrument(skip(pool))]
pub async fn student_grade_summary(
    pool: &Pool<Sqlite>,
    student_id: i64,
    class_ids: Option<&[i64]>,
) -> Result<GradeSummary, AppError> {
    let mut submissions = get_student_submissions_for_grading(pool, student_id).await?;
    if let Some(class_ids) = class_ids {
        submissions.retain(|s| class_ids.contains(&s.class_id));
    }
    Ok(summarize(&submissions))
}

/// Class-wide summary plus one summary per actively enrolled student, even
/// those without any submissions yet. The class-wide totals cover the same
/// active students.
#[instrument(skip(pool))]
pub async fn class_grade_report(
    pool: &Pool<Sqlite>,
    class_id: i64,
) -> Result<ClassGradeReport, AppError> {
    let submissions = get_class_submissions_for_grading(pool, class_id).await?;
    let enrollments = get_class_enrollments(pool, class_id).await?;

    let mut per_student: BTreeMap<i64, Vec<GradedSubmission>> = enrollments
        .iter()
        .filter(|e| e.is_active())
        .map(|e| (e.student_id, Vec::new()))
        .collect();

    for submission in &submissions {
        if let Some(rows) = per_student.get_mut(&submission.student_id) {
            rows.push(submission.clone());
        }
    }

    let active_rows: Vec<GradedSubmission> = per_student.values().flatten().cloned().collect();

    Ok(ClassGradeReport {
        class_id,
        overall: summarize(&active_rows),
        students: per_student
            .into_iter()
            .map(|(student_id, rows)| StudentGradeSummary {
                student_id,
                summary: summarize(&rows),
            })
            .collect(),
    })
}

/// Grades every not-yet-graded submission of a discussion assessment.
/// Submissions already GRADED are left alone, so later replies do not
/// change an awarded score.
#[instrument(skip(pool))]
pub async fn auto_grade_discussion(
    pool: &Pool<Sqlite>,
    assessment_id: i64,
) -> Result<AutoGradeReport, AppError> {
    let assessment = get_assessment(pool, assessment_id).await?;

    if assessment.assessment_type != AssessmentType::Discussion {
        return Err(AppError::Validation(format!(
            "Assessment {} is not a discussion",
            assessment_id
        )));
    }
    if !assessment.auto_complete_enabled {
        return Err(AppError::Validation(format!(
            "Auto-completion is not enabled for assessment {}",
            assessment_id
        )));
    }

    let authors = get_discussion_authors(pool, assessment_id).await?;
    let submissions = get_assessment_submissions(pool, assessment_id).await?;

    let mut report = AutoGradeReport {
        assessment_id,
        graded: 0,
        skipped: 0,
    };

    for submission in submissions {
        if submission.status == SubmissionStatus::Graded {
            report.skipped += 1;
            continue;
        }

        let score = discussion_auto_score(
            submission.discussion_reply_count,
            authors.contains(&submission.student_id),
            assessment.minimum_reply_count,
            assessment.max_points,
        );
        let total = score + submission.manual_score.unwrap_or(0.0);

        record_auto_grade(pool, submission.id, score, total).await?;
        report.graded += 1;
    }

    info!(graded = report.graded, skipped = report.skipped, "Discussion auto-graded");
    Ok(report)
}
