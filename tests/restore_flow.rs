mod common;

use common::*;
use serde_json::json;
use snapshot_relay::db::{self, NewOperation};
use snapshot_relay::error::RunError;
use snapshot_relay::model::{Component, OperationStatus};
use snapshot_relay::{export, restore};
use tokio_util::sync::CancellationToken;

fn blog_platform() -> FakePlatform {
    PlatformBuilder::new()
        .project("src", |p| {
            blog_schema(p);
            with_storage(p);
        })
        .project("dst", |_| {})
        .build()
}

async fn backup_of_src(h: &Harness) -> String {
    let id = export::request(&h.svc, USER, "src", Component::ALL.to_vec()).await.unwrap();
    export::run(&h.svc, &id, &CancellationToken::new()).await.unwrap();
    id
}

#[tokio::test]
async fn round_trip_into_empty_project() {
    let h = Harness::new(blog_platform(), test_config()).await;
    let backup = backup_of_src(&h).await;

    let id = restore::request(&h.svc, USER, "dst", &backup).await.unwrap();
    let summary = restore::run(&h.svc, &id, &CancellationToken::new()).await.unwrap();
    assert!(summary.success);
    assert_eq!(summary.tables_created, 2);
    assert_eq!(summary.tables_restored, 2);
    assert_eq!(summary.total_rows, 5);
    assert_eq!(summary.storage_buckets_created, 1);
    assert_eq!(summary.storage_objects_copied, 2);

    let dst = h.platform.project("dst");
    assert_eq!(dst.table_rows("users").len(), 3);
    assert_eq!(dst.table_rows("posts").len(), 2);
    let ddl = dst.migration_text().join("\n");
    assert!(ddl.contains("DEFAULT 'Untitled'"));
    assert!(ddl.contains("GENERATED BY DEFAULT AS IDENTITY"));
    assert!(ddl.contains(r#"ALTER TABLE "public"."users" ENABLE ROW LEVEL SECURITY;"#));
    assert!(ddl.contains(r#"SELECT setval('"public"."users_id_seq"', 42, true);"#));
    let objects = dst.objects.lock().unwrap().clone();
    assert_eq!(objects.get(&("avatars".to_string(), "nested/b.txt".to_string())), Some(&b"beta".to_vec()));

    let op = db::get_operation(h.pool(), &id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.progress, 100);
    assert!(op.errors.is_empty());
    assert_eq!(op.summary.unwrap()["total_rows"], 5);
    let audit = db::list_audit(h.pool(), &id).await.unwrap();
    assert_eq!(audit.first().unwrap().action, "restore_started");
    assert_eq!(audit.last().unwrap().action, "restore_completed");

    // Restoring the same backup again leaves existing rows alone.
    let again = restore::request(&h.svc, USER, "dst", &backup).await.unwrap();
    restore::run(&h.svc, &again, &CancellationToken::new()).await.unwrap();
    assert_eq!(dst.table_rows("users").len(), 3);
    assert_eq!(dst.table_rows("posts").len(), 2);
}

#[tokio::test]
async fn cancellation_stops_before_next_phase() {
    let h = Harness::new(blog_platform(), test_config()).await;
    let backup = backup_of_src(&h).await;
    let id = restore::request(&h.svc, USER, "dst", &backup).await.unwrap();

    let dst = h.platform.project("dst");
    *dst.cancel_on.lock().unwrap() = Some(CancelOnMigration {
        needle: "CREATE TABLE".to_string(),
        pool: h.pool().clone(),
        operation_id: id.clone(),
    });

    let err = restore::run(&h.svc, &id, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RunError::Cancelled));
    assert!(!dst.migration_text().iter().any(|m| m.contains("setval")));

    let op = db::get_operation(h.pool(), &id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Cancelled);
    assert!(op.errors.is_empty());
    assert!(op.summary.is_none());
    let audit = db::list_audit(h.pool(), &id).await.unwrap();
    assert_eq!(audit.last().unwrap().action, "restore_cancelled");
}

#[tokio::test]
async fn shutdown_leaves_restore_resumable() {
    let h = Harness::new(blog_platform(), test_config()).await;
    let backup = backup_of_src(&h).await;
    let id = restore::request(&h.svc, USER, "dst", &backup).await.unwrap();

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let err = restore::run(&h.svc, &id, &shutdown).await.unwrap_err();
    assert!(matches!(err, RunError::Interrupted));
    let op = db::get_operation(h.pool(), &id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Running);
    assert!(op.errors.is_empty());
    let dst = h.platform.project("dst");
    assert!(dst.migration_text().is_empty());
    let audit = db::list_audit(h.pool(), &id).await.unwrap();
    assert_eq!(audit.last().unwrap().action, "restore_interrupted");

    let summary = restore::resume(&h.svc, &id, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.tables_created, 2);
    assert_eq!(dst.table_rows("users").len(), 3);
    let op = db::get_operation(h.pool(), &id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
}

#[tokio::test]
async fn rerunning_a_finished_restore_is_rejected() {
    let h = Harness::new(blog_platform(), test_config()).await;
    let backup = backup_of_src(&h).await;
    let id = restore::request(&h.svc, USER, "dst", &backup).await.unwrap();
    restore::run(&h.svc, &id, &CancellationToken::new()).await.unwrap();
    let before = db::list_audit(h.pool(), &id).await.unwrap().len();

    let err = restore::run(&h.svc, &id, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.phase(), Some("setup"));
    assert!(err.to_string().contains("already completed"));

    let op = db::get_operation(h.pool(), &id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    let audit = db::list_audit(h.pool(), &id).await.unwrap();
    assert_eq!(audit.len(), before);
    assert!(!audit.iter().any(|a| a.action == "restore_cancelled"));
}

#[tokio::test]
async fn trigger_without_target_function_is_reported() {
    let platform = PlatformBuilder::new()
        .project("src", |p| {
            blog_schema(p);
            p.sql.push((
                "FROM pg_trigger t".to_string(),
                json!([{
                    "schema": "public", "table": "users", "name": "touch_users",
                    "definition": "CREATE TRIGGER touch_users BEFORE UPDATE ON public.users FOR EACH ROW EXECUTE FUNCTION stamp()",
                    "function_schema": "public", "function_name": "stamp"
                }]),
            ));
        })
        .project("dst", |p| p.sql.push(("p.proname = 'stamp'".to_string(), json!([]))))
        .build();
    let h = Harness::new(platform, test_config()).await;
    let backup = backup_of_src(&h).await;
    let id = restore::request(&h.svc, USER, "dst", &backup).await.unwrap();

    let summary = restore::run(&h.svc, &id, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.triggers_created, 0);
    assert_eq!(summary.trigger_errors, 1);
    let triggers = &summary.phases["triggers"];
    assert_eq!(triggers.attempted, 1);
    assert_eq!(triggers.errors.len(), 1);
    assert_eq!(triggers.errors[0].item, "public.users.touch_users");
    assert!(triggers.errors[0].error.contains("stamp does not exist"));
    assert!(!h
        .platform
        .project("dst")
        .migration_text()
        .iter()
        .any(|m| m.contains("CREATE TRIGGER")));
}

#[tokio::test]
async fn one_failed_table_does_not_fail_the_restore() {
    let platform = PlatformBuilder::new()
        .project("src", blog_schema)
        .project("dst", |p| {
            p.reject.push(r#"CREATE TABLE IF NOT EXISTS "public"."posts""#.to_string())
        })
        .build();
    let h = Harness::new(platform, test_config()).await;
    let backup = backup_of_src(&h).await;
    let id = restore::request(&h.svc, USER, "dst", &backup).await.unwrap();

    let summary = restore::run(&h.svc, &id, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.tables_created, 1);
    let tables = &summary.phases["tables"];
    assert_eq!(tables.attempted, 2);
    assert_eq!(tables.errors.len(), 1);
    assert_eq!(tables.errors[0].item, "public.posts");

    let dst = h.platform.project("dst");
    assert_eq!(dst.table_rows("users").len(), 3);
    assert!(dst.table_rows("posts").is_empty());
    let op = db::get_operation(h.pool(), &id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert!(op.warnings.iter().any(|w| w == "tables: 1 of 2 failed"));
}

#[tokio::test]
async fn rls_failures_count_towards_policy_attempts() {
    let platform = PlatformBuilder::new()
        .project("src", blog_schema)
        .project("dst", |p| p.reject.push("ENABLE ROW LEVEL SECURITY".to_string()))
        .build();
    let h = Harness::new(platform, test_config()).await;
    let backup = backup_of_src(&h).await;
    let id = restore::request(&h.svc, USER, "dst", &backup).await.unwrap();

    let summary = restore::run(&h.svc, &id, &CancellationToken::new()).await.unwrap();
    let policies = &summary.phases["policies"];
    assert_eq!(policies.attempted, 2);
    assert_eq!(policies.created, 1);
    assert_eq!(policies.failed(), 1);
    assert_eq!(policies.errors[0].item, "rls:public.users");
    let op = db::get_operation(h.pool(), &id).await.unwrap().unwrap();
    assert!(op.warnings.iter().any(|w| w == "policies: 1 of 2 failed"));
}

#[tokio::test]
async fn no_tables_created_fails_the_restore() {
    let platform = PlatformBuilder::new()
        .project("src", blog_schema)
        .project("dst", |p| p.reject.push("CREATE TABLE".to_string()))
        .build();
    let h = Harness::new(platform, test_config()).await;
    let backup = backup_of_src(&h).await;
    let id = restore::request(&h.svc, USER, "dst", &backup).await.unwrap();

    let err = restore::run(&h.svc, &id, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.phase(), Some("tables"));

    let op = db::get_operation(h.pool(), &id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.errors.len(), 1);
    assert_eq!(op.errors[0].phase, "tables");
    assert!(op.errors[0].message.contains("no tables restored out of 2"));
    assert!(h.platform.project("dst").table_rows("users").is_empty());
    let audit = db::list_audit(h.pool(), &id).await.unwrap();
    assert_eq!(audit.last().unwrap().action, "restore_failed");
}

#[tokio::test]
async fn resume_skips_completed_phases() {
    let h = Harness::new(blog_platform(), test_config()).await;
    let backup = backup_of_src(&h).await;
    let id = restore::request(&h.svc, USER, "dst", &backup).await.unwrap();

    // A previous attempt got through the tables phase before the process died.
    let done = json!({ "stage": "completed", "report": { "attempted": 2, "created": 2, "skipped": 0 } });
    for phase in ["extensions", "custom_types", "tables"] {
        db::insert_checkpoint(h.pool(), &id, phase, &done).await.unwrap();
    }
    let dst = h.platform.project("dst");
    dst.create_table("users");
    dst.create_table("posts");
    assert!(db::mark_running(h.pool(), &id, 30).await.unwrap());

    let summary = restore::resume(&h.svc, &id, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.tables_created, 2);
    assert_eq!(summary.total_rows, 5);
    assert!(!dst.migration_text().iter().any(|m| m.contains("CREATE TABLE")));
    assert_eq!(dst.table_rows("users").len(), 3);

    let audit = db::list_audit(h.pool(), &id).await.unwrap();
    let started = audit.iter().find(|a| a.action == "restore_started").unwrap();
    assert_eq!(started.details["resumed"], true);

    // Terminal operations cannot be resumed.
    let err = restore::resume(&h.svc, &id, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.phase(), Some("setup"));
}

#[tokio::test]
async fn missing_snapshot_file_fails_in_download() {
    let h = Harness::new(blog_platform(), test_config()).await;
    let backup = db::create_operation(h.pool(), &NewOperation::backup(USER, "src", vec![Component::Schema]))
        .await
        .unwrap();
    db::complete_backup(h.pool(), &backup, "backups/gone.json", 10, &json!({}))
        .await
        .unwrap();
    let id = restore::request(&h.svc, USER, "dst", &backup).await.unwrap();

    let err = restore::run(&h.svc, &id, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.phase(), Some("download"));
    let op = db::get_operation(h.pool(), &id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.errors[0].phase, "download");
}

#[tokio::test]
async fn request_requires_completed_backup() {
    let h = Harness::new(blog_platform(), test_config()).await;
    let pending = export::request(&h.svc, USER, "src", vec![Component::Schema]).await.unwrap();
    let err = restore::request(&h.svc, USER, "dst", &pending).await.unwrap_err();
    assert!(err.to_string().contains("no snapshot to restore"));

    let err = restore::request(&h.svc, USER, "dst", "nope").await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}
