use anchor_agent::domain::entry::VerifyState;
use anchor_agent::services::ledger_service::LedgerService;
use time::OffsetDateTime;

mod common;

#[tokio::test]
async fn processed_files_are_not_reprocessed_until_their_generation_changes() {
    let (ledger, _dir) = common::temp_ledger().await;

    // Untracked path is always processed.
    assert!(ledger.should_process("docs/a.txt", "gen-1").await);

    assert!(ledger.mark_processed("docs/a.txt", "gen-1", "hash-1").await);
    assert!(!ledger.should_process("docs/a.txt", "gen-1").await);

    // A new generation id re-qualifies the path.
    assert!(ledger.should_process("docs/a.txt", "gen-2").await);
}

#[tokio::test]
async fn success_resets_failures_and_requeues_verification() {
    let (ledger, _dir) = common::temp_ledger().await;

    assert_eq!(ledger.increment_failure("b.txt").await, 1);
    assert_eq!(ledger.increment_failure("b.txt").await, 2);
    assert_eq!(ledger.failure_count("b.txt").await, 2);

    assert!(ledger.mark_processed("b.txt", "g", "h").await);
    assert_eq!(ledger.failure_count("b.txt").await, 0);

    let entry = ledger.entry("b.txt").await.unwrap().unwrap();
    assert_eq!(entry.verify_state, VerifyState::Pending);
    assert_eq!(entry.content_hash, "h");
}

#[tokio::test]
async fn reset_all_failures_unquarantines_every_path() {
    let (ledger, _dir) = common::temp_ledger().await;
    for _ in 0..3 {
        ledger.increment_failure("stuck.bin").await;
    }
    assert_eq!(ledger.failure_count("stuck.bin").await, 3);

    ledger.reset_all_failures().await;
    assert_eq!(ledger.failure_count("stuck.bin").await, 0);
}

#[tokio::test]
async fn rename_moves_the_exact_row_and_the_whole_subtree() {
    let (ledger, _dir) = common::temp_ledger().await;
    ledger.mark_processed("old", "g0", "h0").await;
    ledger.mark_processed("old/a.txt", "g1", "h1").await;
    ledger.mark_processed("old/nested/b.txt", "g2", "h2").await;
    ledger.mark_processed("older/c.txt", "g3", "h3").await;

    ledger.rename("old", "new").await;

    // No row keeps the old prefix.
    let paths = ledger.all_tracked_paths().await.unwrap();
    assert!(!paths.iter().any(|p| p == "old" || p.starts_with("old/")));
    assert!(paths.contains(&"new".to_string()));
    assert!(paths.contains(&"new/a.txt".to_string()));
    assert!(paths.contains(&"new/nested/b.txt".to_string()));
    // Sibling prefixes sharing the string head are untouched.
    assert!(paths.contains(&"older/c.txt".to_string()));

    assert!(!ledger.should_process("new/a.txt", "g1").await);
}

#[tokio::test]
async fn stored_casing_is_preserved_and_matched_case_insensitively() {
    let (ledger, _dir) = common::temp_ledger().await;
    ledger.mark_processed("Docs/Foo.txt", "g", "h").await;

    assert_eq!(ledger.stored_casing("docs/foo.txt").await, Some("Docs/Foo.txt".to_string()));
    assert_eq!(ledger.stored_casing("Docs/Foo.txt").await, Some("Docs/Foo.txt".to_string()));
    assert_eq!(ledger.stored_casing("other.txt").await, None);
}

#[tokio::test]
async fn prefix_deletion_and_wipe() {
    let (ledger, _dir) = common::temp_ledger().await;
    ledger.mark_processed("keep/a", "g", "h").await;
    ledger.mark_processed("drop/b", "g", "h").await;
    ledger.mark_processed("drop/c", "g", "h").await;

    ledger.delete_prefix("drop/").await;
    let paths = ledger.all_tracked_paths().await.unwrap();
    assert_eq!(paths, vec!["keep/a".to_string()]);

    ledger.wipe().await;
    assert!(ledger.all_tracked_paths().await.unwrap().is_empty());
}

#[tokio::test]
async fn upload_rows_live_for_the_duration_of_a_multipart_upload() {
    let (ledger, _dir) = common::temp_ledger().await;

    ledger.record_upload("drive/big.bin", "upload-1").await.unwrap();
    let entry = ledger.find_upload("drive/big.bin").await.unwrap();
    assert_eq!(entry.upload_id, "upload-1");

    // Exactly one row per key: re-recording replaces.
    ledger.record_upload("drive/big.bin", "upload-2").await.unwrap();
    assert_eq!(ledger.find_upload("drive/big.bin").await.unwrap().upload_id, "upload-2");
    assert_eq!(ledger.active_uploads().await.unwrap().len(), 1);

    ledger.clear_upload("drive/big.bin").await;
    assert!(ledger.find_upload("drive/big.bin").await.is_none());
    assert!(ledger.active_uploads().await.unwrap().is_empty());
}

#[tokio::test]
async fn auditing_pulls_pending_entries_least_recently_verified_first() {
    let (ledger, _dir) = common::temp_ledger().await;
    ledger.mark_processed("fresh", "g", "h1").await;
    ledger.mark_processed("stale", "g", "h2").await;
    ledger.mark_processed("never", "g", "h3").await;

    let now = OffsetDateTime::now_utc();
    ledger.update_verification("stale", VerifyState::Pending, now - time::Duration::hours(2)).await;
    ledger.update_verification("fresh", VerifyState::Pending, now).await;

    let batch = ledger.files_for_auditing(10).await.unwrap();
    let order: Vec<&str> = batch.iter().map(|e| e.path.as_str()).collect();
    // Never-verified first, then oldest attempt.
    assert_eq!(order, vec!["never", "stale", "fresh"]);

    ledger.update_verification("never", VerifyState::Verified, now).await;
    let batch = ledger.files_for_auditing(10).await.unwrap();
    assert!(!batch.iter().any(|e| e.path == "never"));
}

#[tokio::test]
async fn baseline_entries_skip_upload_and_auditing() {
    let (ledger, _dir) = common::temp_ledger().await;
    ledger.mark_baseline("seen/before.txt", "g-base").await;

    assert!(!ledger.should_process("seen/before.txt", "g-base").await);
    assert!(ledger.should_process("seen/before.txt", "g-later").await);
    assert!(ledger.files_for_auditing(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn corrupt_ledger_file_is_reset_on_open() {
    common::setup_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    std::fs::write(&path, b"this is not a database").unwrap();

    let (ledger, was_reset) = LedgerService::open(&path).await.expect("reset and reopen");
    assert!(was_reset);

    // The store works after the reset.
    assert!(ledger.mark_processed("a", "g", "h").await);
    assert!(!ledger.should_process("a", "g").await);
}
