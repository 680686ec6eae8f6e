#[cfg(test)]
mod tests {
    use crate::{
        db::{
            clean_expired_sessions, create_user_session, get_session_by_token, invalidate_session,
        },
        error::AppError,
        test::test_db::{TestDb, TestDbBuilder, setup_test_client},
    };
    use chrono::{Duration, Utc};
    use rocket::http::{Cookie, Status};
    use rocket::tokio;
    use uuid::Uuid;

    async fn session_db() -> (TestDb, i64) {
        let test_db = TestDbBuilder::new()
            .student("session_user", None)
            .build()
            .await
            .expect("Failed to build test database");

        let user_id = test_db.user_id("session_user").expect("User not found");
        (test_db, user_id)
    }

    fn token(label: &str) -> String {
        format!("{}_{}", label, Uuid::new_v4().simple())
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let (test_db, user_id) = session_db().await;
        let token = token("create");
        let expires_at = (Utc::now() + Duration::hours(1)).naive_utc();

        let session_id = create_user_session(&test_db.pool, user_id, &token, expires_at)
            .await
            .expect("Failed to create session");
        assert!(session_id > 0);

        let session = get_session_by_token(&test_db.pool, &token)
            .await
            .expect("Failed to get session");

        assert_eq!(session.user_id, user_id);
        assert_eq!(session.token, token);
        assert!(session.is_valid());

        let drift = (session.expires_at.and_utc().timestamp() - expires_at.and_utc().timestamp()).abs();
        assert!(drift <= 1, "Expiry should round-trip within a second");
    }

    #[tokio::test]
    async fn test_unknown_token_is_authentication_error() {
        let (test_db, _) = session_db().await;

        match get_session_by_token(&test_db.pool, "nonexistent_token").await {
            Err(AppError::Authentication(msg)) => assert_eq!(msg, "Invalid session token"),
            other => panic!("Expected Authentication error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalidate_session() {
        let (test_db, user_id) = session_db().await;
        let token = token("logout");
        let expires_at = (Utc::now() + Duration::hours(1)).naive_utc();

        create_user_session(&test_db.pool, user_id, &token, expires_at)
            .await
            .expect("Failed to create session");

        invalidate_session(&test_db.pool, &token)
            .await
            .expect("Failed to invalidate session");

        assert!(get_session_by_token(&test_db.pool, &token).await.is_err());
    }

    #[tokio::test]
    async fn test_clean_expired_sessions_keeps_live_ones() {
        let (test_db, user_id) = session_db().await;
        let pool = &test_db.pool;

        let expired = token("expired");
        let soon = token("soon");
        let later = token("later");

        create_user_session(pool, user_id, &expired, (Utc::now() - Duration::hours(1)).naive_utc())
            .await
            .expect("Failed to create expired session");
        create_user_session(pool, user_id, &soon, (Utc::now() + Duration::minutes(1)).naive_utc())
            .await
            .expect("Failed to create session");
        create_user_session(pool, user_id, &later, (Utc::now() + Duration::days(1)).naive_utc())
            .await
            .expect("Failed to create session");

        let cleaned = clean_expired_sessions(pool)
            .await
            .expect("Failed to clean expired sessions");

        assert_eq!(cleaned, 1);
        assert!(get_session_by_token(pool, &expired).await.is_err());
        assert!(get_session_by_token(pool, &soon).await.is_ok());
        assert!(get_session_by_token(pool, &later).await.is_ok());
    }

    #[rocket::async_test]
    async fn test_expired_session_is_rejected_by_guard() {
        let (test_db, user_id) = session_db().await;
        let token = token("stale");
        create_user_session(
            &test_db.pool,
            user_id,
            &token,
            (Utc::now() - Duration::minutes(5)).naive_utc(),
        )
        .await
        .expect("Failed to create expired session");

        let (client, _) = setup_test_client(test_db).await;

        let response = client
            .get("/api/me")
            .private_cookie(Cookie::new("session_token", token))
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::Unauthorized);
    }

    #[test]
    fn test_role_permission_table() {
        use crate::auth::{Permission, Role};

        assert!(Role::Student.has_permission(Permission::CompleteItems));
        assert!(Role::Student.has_permission(Permission::ViewOwnGrades));
        assert!(!Role::Student.has_permission(Permission::ManageModules));
        assert!(!Role::Student.has_permission(Permission::ViewClassGrades));

        assert!(Role::Professor.has_permission(Permission::GradeSubmissions));
        assert!(!Role::Professor.has_permission(Permission::CompleteItems));
        assert!(!Role::Professor.has_permission(Permission::RegisterUsers));

        assert!(
            Role::Professor
                .permissions()
                .is_subset(Role::Admin.permissions())
        );
        assert!(Role::Admin.has_permission(Permission::EditUserRoles));
    }
}
