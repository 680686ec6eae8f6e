#[cfg(test)]
mod tests {
    use crate::auth::Role;
    use crate::db::{
        ModuleUpdate, authenticate_user, create_course, create_user, enroll_student,
        find_enrollment, find_user_by_username, get_class_module_items, get_class_modules,
        get_classes_for_student, get_module, insert_item_completion, insert_module_completion,
        reorder_module_items, reorder_modules, set_enrollment_status, update_module,
    };
    use crate::error::AppError;
    use crate::models::EnrollmentStatus;
    use crate::test::test_db::{TestDbBuilder, create_standard_test_db};

    use rocket::tokio;

    #[tokio::test]
    async fn test_create_and_find_user() {
        let test_db = TestDbBuilder::new().build().await.expect("Failed to build");

        create_user(&test_db.pool, "dana", "password123", Role::Professor, Some("Dana"))
            .await
            .expect("Failed to create test user");

        let user = find_user_by_username(&test_db.pool, "dana")
            .await
            .expect("Failed to get user")
            .expect("User should exist");

        assert_eq!(user.username, "dana");
        assert_eq!(user.display_name, "Dana");
        assert_eq!(user.role, Role::Professor);
    }

    #[tokio::test]
    async fn test_duplicate_username_is_conflict() {
        let test_db = create_standard_test_db().await;

        let result = create_user(&test_db.pool, "alice", "password123", Role::Student, None).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_authenticate_user() {
        let test_db = create_standard_test_db().await;

        let ok = authenticate_user(&test_db.pool, "alice", "password123")
            .await
            .expect("Authentication query failed");
        assert_eq!(ok.map(|u| u.username), Some("alice".to_string()));

        let bad = authenticate_user(&test_db.pool, "alice", "nope")
            .await
            .expect("Authentication query failed");
        assert!(bad.is_none());

        let missing = authenticate_user(&test_db.pool, "nobody", "password123")
            .await
            .expect("Authentication query failed");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_course_code_is_conflict() {
        let test_db = create_standard_test_db().await;

        let result = create_course(&test_db.pool, "TEST-101", "Again", "").await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_enrollment_status_and_reactivation() {
        let test_db = create_standard_test_db().await;
        let class_id = test_db.class_id("Algorithms").unwrap();
        let alice = test_db.user_id("alice").unwrap();

        set_enrollment_status(&test_db.pool, class_id, alice, EnrollmentStatus::Dropped)
            .await
            .expect("Failed to drop");

        let enrollment = find_enrollment(&test_db.pool, class_id, alice)
            .await
            .unwrap()
            .unwrap();
        assert!(!enrollment.is_active());
        assert!(
            get_classes_for_student(&test_db.pool, alice)
                .await
                .unwrap()
                .is_empty()
        );

        let enrollment = enroll_student(&test_db.pool, class_id, alice)
            .await
            .expect("Failed to re-enroll");
        assert!(enrollment.is_active());

        let carol = test_db.user_id("carol").unwrap();
        let result =
            set_enrollment_status(&test_db.pool, class_id, carol, EnrollmentStatus::Completed).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_module_prerequisites_round_trip_and_self_reference() {
        let test_db = create_standard_test_db().await;
        let class_id = test_db.class_id("Algorithms").unwrap();

        let a = test_db.module(class_id, "A", &[]).await;
        let b = test_db.module(class_id, "B", &[a]).await;

        let module = get_module(&test_db.pool, b).await.unwrap();
        assert_eq!(module.prerequisite_ids, vec![a]);

        let result = update_module(
            &test_db.pool,
            b,
            ModuleUpdate {
                prerequisite_ids: Some(vec![a, b]),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(msg)) if msg.contains("own prerequisite")));

        update_module(
            &test_db.pool,
            b,
            ModuleUpdate {
                prerequisite_ids: Some(vec![]),
                title: Some("B2".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("Failed to update module");

        let module = get_module(&test_db.pool, b).await.unwrap();
        assert_eq!(module.title, "B2");
        assert!(module.prerequisite_ids.is_empty());
    }

    #[tokio::test]
    async fn test_modules_get_sequential_order() {
        let test_db = create_standard_test_db().await;
        let class_id = test_db.class_id("Algorithms").unwrap();

        let first = test_db.module(class_id, "First", &[]).await;
        let second = test_db.module(class_id, "Second", &[]).await;

        let modules = get_class_modules(&test_db.pool, class_id).await.unwrap();
        let order: Vec<(i64, i64)> = modules.iter().map(|m| (m.id, m.order_index)).collect();
        assert_eq!(order, vec![(first, 0), (second, 1)]);
    }

    #[tokio::test]
    async fn test_reorder_modules() {
        let test_db = create_standard_test_db().await;
        let class_id = test_db.class_id("Algorithms").unwrap();

        let a = test_db.module(class_id, "A", &[]).await;
        let b = test_db.module(class_id, "B", &[]).await;
        let c = test_db.module(class_id, "C", &[]).await;

        reorder_modules(&test_db.pool, class_id, &[c, a, b])
            .await
            .expect("Failed to reorder");

        let ids: Vec<i64> = get_class_modules(&test_db.pool, class_id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![c, a, b]);
    }

    #[tokio::test]
    async fn test_reorder_items_rejects_foreign_item() {
        let test_db = create_standard_test_db().await;
        let class_id = test_db.class_id("Algorithms").unwrap();

        let m1 = test_db.module(class_id, "M1", &[]).await;
        let m2 = test_db.module(class_id, "M2", &[]).await;
        let x = test_db.page(m1, "x", true).await;
        let y = test_db.page(m1, "y", true).await;
        let stranger = test_db.page(m2, "z", true).await;

        let result = reorder_module_items(&test_db.pool, m1, &[y, stranger]).await;
        match result {
            Err(AppError::Validation(msg)) => {
                assert_eq!(msg, format!("Item {} does not belong to module {}", stranger, m1))
            }
            other => panic!("Expected validation error, got {:?}", other),
        }

        reorder_module_items(&test_db.pool, m1, &[y, x])
            .await
            .expect("Failed to reorder");

        let ids: Vec<i64> = get_class_module_items(&test_db.pool, class_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.module_id == m1)
            .map(|i| (i.order_index, i.id))
            .collect::<std::collections::BTreeMap<_, _>>()
            .into_values()
            .collect();
        assert_eq!(ids, vec![y, x]);
    }

    #[tokio::test]
    async fn test_duplicate_module_completion_is_benign() {
        let test_db = create_standard_test_db().await;
        let class_id = test_db.class_id("Algorithms").unwrap();
        let alice = test_db.user_id("alice").unwrap();
        let module_id = test_db.module(class_id, "M", &[]).await;

        let first = insert_module_completion(&test_db.pool, alice, module_id)
            .await
            .expect("First insert failed");
        let second = insert_module_completion(&test_db.pool, alice, module_id)
            .await
            .expect("Duplicate insert should not error");

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_duplicate_item_completion_returns_none() {
        let test_db = create_standard_test_db().await;
        let class_id = test_db.class_id("Algorithms").unwrap();
        let alice = test_db.user_id("alice").unwrap();
        let module_id = test_db.module(class_id, "M", &[]).await;
        let item = test_db.page(module_id, "p", true).await;

        let first = insert_item_completion(&test_db.pool, alice, item)
            .await
            .expect("First insert failed");
        let second = insert_item_completion(&test_db.pool, alice, item)
            .await
            .expect("Duplicate insert should not error");

        assert_eq!(first.map(|c| c.module_item_id), Some(item));
        assert!(second.is_none());
    }
}
