#[cfg(test)]
mod tests {
    use rocket::tokio;

    use crate::db::{
        create_discussion_post, ensure_submission, find_submission, increment_reply_count,
        record_manual_grade, set_enrollment_status, upsert_submission,
    };
    use crate::error::AppError;
    use crate::grading::{
        auto_grade_discussion, class_grade_report, discussion_auto_score, percentage,
        student_grade_summary, summarize,
    };
    use crate::models::{AssessmentType, EnrollmentStatus, GradedSubmission, SubmissionStatus};
    use crate::test::test_db::create_standard_test_db;

    fn graded(
        class_id: i64,
        assessment_type: AssessmentType,
        max_points: f64,
        status: SubmissionStatus,
        total_score: Option<f64>,
    ) -> GradedSubmission {
        GradedSubmission {
            student_id: 1,
            class_id,
            class_name: format!("Class {}", class_id),
            assessment_type,
            max_points,
            status,
            total_score,
        }
    }

    #[test]
    fn test_percentage_guards_zero_possible() {
        assert_eq!(percentage(0.0, 0.0), 0.0);
        assert_eq!(percentage(5.0, 10.0), 50.0);
    }

    #[test]
    fn test_summarize_counts_only_graded_scores() {
        let rows = vec![
            graded(1, AssessmentType::Quiz, 10.0, SubmissionStatus::Graded, Some(8.0)),
            graded(1, AssessmentType::Exam, 100.0, SubmissionStatus::Graded, Some(70.0)),
            graded(2, AssessmentType::Quiz, 10.0, SubmissionStatus::Graded, Some(10.0)),
            graded(2, AssessmentType::Project, 50.0, SubmissionStatus::Submitted, None),
            graded(2, AssessmentType::Project, 50.0, SubmissionStatus::Late, None),
            graded(1, AssessmentType::Assignment, 20.0, SubmissionStatus::None, None),
        ];

        let summary = summarize(&rows);

        assert_eq!(summary.total_earned, 88.0);
        assert_eq!(summary.total_possible, 120.0);
        assert_eq!(summary.graded_count, 3);
        assert_eq!(summary.pending_count, 2);
        assert!((summary.overall_average - 73.333).abs() < 0.01);

        let quiz = summary
            .by_type
            .iter()
            .find(|t| t.assessment_type == AssessmentType::Quiz)
            .unwrap();
        assert_eq!(quiz.count, 2);
        assert_eq!(quiz.average, 90.0);
        assert!(
            summary
                .by_type
                .iter()
                .all(|t| t.assessment_type != AssessmentType::Project)
        );

        let class_ids: Vec<i64> = summary.by_class.iter().map(|c| c.class_id).collect();
        assert_eq!(class_ids, vec![1, 2]);
        assert_eq!(summary.by_class[1].earned, 10.0);
    }

    #[test]
    fn test_summarize_empty() {
        let summary = summarize(&[]);
        assert_eq!(summary.overall_average, 0.0);
        assert!(summary.by_type.is_empty());
        assert!(summary.by_class.is_empty());
    }

    #[test]
    fn test_discussion_auto_score() {
        // post plus enough replies earns full marks
        assert_eq!(discussion_auto_score(2, true, Some(2), 10.0), 10.0);
        assert_eq!(discussion_auto_score(5, true, Some(2), 10.0), 10.0);

        // otherwise linear on replies
        assert_eq!(discussion_auto_score(1, true, Some(2), 10.0), 5.0);
        assert_eq!(discussion_auto_score(0, true, Some(2), 10.0), 0.0);

        // replies without a post are capped at max points
        assert_eq!(discussion_auto_score(4, false, Some(2), 10.0), 10.0);
        assert_eq!(discussion_auto_score(1, false, Some(4), 8.0), 2.0);

        // unset or non-positive minimum behaves like one reply
        assert_eq!(discussion_auto_score(1, true, None, 10.0), 10.0);
        assert_eq!(discussion_auto_score(0, false, Some(0), 10.0), 0.0);
    }

    #[tokio::test]
    async fn test_auto_grade_discussion_scores_replies() {
        let test_db = create_standard_test_db().await;
        let class_id = test_db.class_id("Algorithms").unwrap();
        let alice = test_db.user_id("alice").unwrap();
        let bob = test_db.user_id("bob").unwrap();

        let discussion = test_db.discussion(class_id, 10.0, 2).await;

        let alice_post = create_discussion_post(&test_db.pool, discussion, alice, None, "Hi")
            .await
            .unwrap();
        ensure_submission(&test_db.pool, discussion, alice).await.unwrap();

        create_discussion_post(&test_db.pool, discussion, bob, Some(alice_post), "Hello")
            .await
            .unwrap();
        increment_reply_count(&test_db.pool, discussion, bob).await.unwrap();

        let bob_post = create_discussion_post(&test_db.pool, discussion, bob, None, "Me too")
            .await
            .unwrap();
        ensure_submission(&test_db.pool, discussion, bob).await.unwrap();

        create_discussion_post(&test_db.pool, discussion, alice, Some(bob_post), "Nice")
            .await
            .unwrap();
        increment_reply_count(&test_db.pool, discussion, alice).await.unwrap();

        let report = auto_grade_discussion(&test_db.pool, discussion).await.unwrap();
        assert_eq!(report.graded, 2);
        assert_eq!(report.skipped, 0);

        let alice_sub = find_submission(&test_db.pool, discussion, alice)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alice_sub.status, SubmissionStatus::Graded);
        assert_eq!(alice_sub.auto_score, Some(5.0));
        assert_eq!(alice_sub.total_score, Some(5.0));
        assert_eq!(alice_sub.discussion_reply_count, 1);

        // a second run leaves graded submissions alone
        increment_reply_count(&test_db.pool, discussion, alice).await.unwrap();
        let report = auto_grade_discussion(&test_db.pool, discussion).await.unwrap();
        assert_eq!(report.graded, 0);
        assert_eq!(report.skipped, 2);

        let alice_sub = find_submission(&test_db.pool, discussion, alice)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alice_sub.total_score, Some(5.0));
    }

    #[tokio::test]
    async fn test_auto_grade_rejects_non_discussions() {
        let test_db = create_standard_test_db().await;
        let class_id = test_db.class_id("Algorithms").unwrap();

        let quiz = test_db
            .assessment(class_id, AssessmentType::Quiz, 10.0, true)
            .await;

        let result = auto_grade_discussion(&test_db.pool, quiz).await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let result = auto_grade_discussion(&test_db.pool, 4242).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_grade_summaries_from_store() {
        let test_db = create_standard_test_db().await;
        let class_id = test_db.class_id("Algorithms").unwrap();
        let alice = test_db.user_id("alice").unwrap();
        let bob = test_db.user_id("bob").unwrap();

        let quiz = test_db
            .assessment(class_id, AssessmentType::Quiz, 10.0, true)
            .await;
        let project = test_db
            .assessment(class_id, AssessmentType::Project, 40.0, true)
            .await;

        let submission = upsert_submission(&test_db.pool, quiz, alice, "answers", SubmissionStatus::Submitted)
            .await
            .unwrap();
        record_manual_grade(&test_db.pool, submission.id, 9.0, 9.0, Some("Good"))
            .await
            .unwrap();
        upsert_submission(&test_db.pool, project, alice, "repo", SubmissionStatus::Late)
            .await
            .unwrap();

        let summary = student_grade_summary(&test_db.pool, alice, None).await.unwrap();
        assert_eq!(summary.total_earned, 9.0);
        assert_eq!(summary.total_possible, 10.0);
        assert_eq!(summary.graded_count, 1);
        assert_eq!(summary.pending_count, 1);
        assert_eq!(summary.by_class[0].class_name, "Algorithms");

        let report = class_grade_report(&test_db.pool, class_id).await.unwrap();
        let students: Vec<i64> = report.students.iter().map(|s| s.student_id).collect();
        let mut expected = vec![alice, bob];
        expected.sort();
        assert_eq!(students, expected);

        let bob_summary = report
            .students
            .iter()
            .find(|s| s.student_id == bob)
            .unwrap();
        assert_eq!(bob_summary.summary.graded_count, 0);
        assert_eq!(report.overall.total_earned, 9.0);
    }

    #[tokio::test]
    async fn test_class_overall_matches_active_students() {
        let test_db = create_standard_test_db().await;
        let class_id = test_db.class_id("Algorithms").unwrap();
        let alice = test_db.user_id("alice").unwrap();
        let bob = test_db.user_id("bob").unwrap();

        let quiz = test_db
            .assessment(class_id, AssessmentType::Quiz, 10.0, true)
            .await;

        for (student, score) in [(alice, 6.0), (bob, 10.0)] {
            let submission =
                upsert_submission(&test_db.pool, quiz, student, "answers", SubmissionStatus::Submitted)
                    .await
                    .unwrap();
            record_manual_grade(&test_db.pool, submission.id, score, score, None)
                .await
                .unwrap();
        }

        set_enrollment_status(&test_db.pool, class_id, bob, EnrollmentStatus::Dropped)
            .await
            .unwrap();

        let report = class_grade_report(&test_db.pool, class_id).await.unwrap();
        assert_eq!(report.students.len(), 1);
        assert_eq!(report.overall.total_earned, 6.0);
        assert_eq!(report.overall.graded_count, 1);

        let student_total: f64 = report
            .students
            .iter()
            .map(|s| s.summary.total_earned)
            .sum();
        assert_eq!(report.overall.total_earned, student_total);
    }

    #[tokio::test]
    async fn test_student_summary_class_filter() {
        let test_db = create_standard_test_db().await;
        let class_id = test_db.class_id("Algorithms").unwrap();
        let alice = test_db.user_id("alice").unwrap();

        let quiz = test_db
            .assessment(class_id, AssessmentType::Quiz, 10.0, true)
            .await;
        let submission = upsert_submission(&test_db.pool, quiz, alice, "a", SubmissionStatus::Submitted)
            .await
            .unwrap();
        record_manual_grade(&test_db.pool, submission.id, 7.0, 7.0, None)
            .await
            .unwrap();

        let summary = student_grade_summary(&test_db.pool, alice, Some(&[class_id][..]))
            .await
            .unwrap();
        assert_eq!(summary.total_earned, 7.0);

        let summary = student_grade_summary(&test_db.pool, alice, Some(&[class_id + 1000][..]))
            .await
            .unwrap();
        assert_eq!(summary.graded_count, 0);
        assert!(summary.by_class.is_empty());
    }
}
