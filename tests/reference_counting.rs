//! Mapping-store occurrence counts across the record lifecycle.

use std::sync::Arc;

use hexmask::{
    Hasher, MaskError, MaskedRepository, MasterKey, MaskingEngine, MemoryMappingStore,
    MemoryRecordStore, UserRecord,
};

type Users = MaskedRepository<UserRecord, MemoryRecordStore<UserRecord>>;

fn repository() -> Users {
    let hasher = Hasher::new(&MasterKey::from_bytes([42u8; 32])).unwrap();
    let engine = MaskingEngine::new(hasher, Arc::new(MemoryMappingStore::new()));
    MaskedRepository::new(engine, MemoryRecordStore::new()).unwrap()
}

async fn count(repo: &Users, plaintext: &str) -> Option<u64> {
    let pseudonym = repo.engine().mask_string(plaintext);
    match repo.engine().mapping_store().read_by_key(&pseudonym).await {
        Ok(entry) => Some(entry.occurrences),
        Err(MaskError::NotFound(_)) => None,
        Err(e) => panic!("unexpected store error: {e}"),
    }
}

#[tokio::test]
async fn test_shared_value_counts_every_record() {
    let repo = repository();
    for name in ["u1", "u2", "u3"] {
        repo.create(UserRecord::new(name).with_phone_number("555-0100"))
            .await
            .unwrap();
    }
    assert_eq!(count(&repo, "555-0100").await, Some(3));

    repo.delete("u1").await.unwrap();
    assert_eq!(count(&repo, "555-0100").await, Some(2));

    repo.delete_many(&["u2", "u3"]).await.unwrap();
    assert_eq!(count(&repo, "555-0100").await, None);
    assert_eq!(repo.engine().mapping_store().len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_update_with_same_value_leaves_counts_alone() {
    let repo = repository();
    repo.create(
        UserRecord::new("alice")
            .with_email("a@x.com")
            .with_phone_number("555-0100"),
    )
    .await
    .unwrap();

    repo.update(UserRecord::new("alice").with_email("a@x.com").with_login_failures(1, 1_700_000_000))
        .await
        .unwrap();

    assert_eq!(count(&repo, "alice").await, Some(1));
    assert_eq!(count(&repo, "a@x.com").await, Some(1));
    assert_eq!(count(&repo, "555-0100").await, Some(1));

    let stored = repo.read("alice").await.unwrap();
    assert_eq!(stored.login_failures, Some(1));
    assert_eq!(stored.email.as_deref(), Some("a@x.com"));
}

#[tokio::test]
async fn test_update_moves_reference_to_new_value() {
    let repo = repository();
    repo.create(UserRecord::new("alice").with_email("a@x.com"))
        .await
        .unwrap();
    repo.create(UserRecord::new("bob").with_email("a@x.com"))
        .await
        .unwrap();
    assert_eq!(count(&repo, "a@x.com").await, Some(2));

    repo.update(UserRecord::new("alice").with_email("b@x.com"))
        .await
        .unwrap();

    assert_eq!(count(&repo, "a@x.com").await, Some(1));
    assert_eq!(count(&repo, "b@x.com").await, Some(1));
    assert_eq!(
        repo.read("alice").await.unwrap().email.as_deref(),
        Some("b@x.com")
    );
    assert_eq!(
        repo.read("bob").await.unwrap().email.as_deref(),
        Some("a@x.com")
    );
}

#[tokio::test]
async fn test_unspecified_fields_are_kept_on_update() {
    let repo = repository();
    repo.create(
        UserRecord::new("carol")
            .with_name("Carol")
            .with_phone_number("555-0199"),
    )
    .await
    .unwrap();

    repo.update(UserRecord::new("carol").with_disabled(true))
        .await
        .unwrap();

    let stored = repo.read("carol").await.unwrap();
    assert_eq!(stored.name.as_deref(), Some("Carol"));
    assert_eq!(stored.phone_number.as_deref(), Some("555-0199"));
    assert_eq!(stored.disabled, Some(true));
    assert_eq!(count(&repo, "Carol").await, Some(1));
}

#[tokio::test]
async fn test_missing_mapping_surfaces_as_not_found() {
    let repo = repository();
    repo.create(UserRecord::new("dave").with_email("d@x.com"))
        .await
        .unwrap();

    let pseudonym = repo.engine().mask_string("d@x.com");
    repo.engine()
        .mapping_store()
        .delete_by_keys(&[pseudonym])
        .await
        .unwrap();

    let err = repo.read("dave").await.unwrap_err();
    assert!(err.is_integrity_violation());
    assert!(err.to_string().contains("email"));
}

#[tokio::test]
async fn test_delete_missing_record_changes_nothing() {
    let repo = repository();
    repo.create(UserRecord::new("erin")).await.unwrap();

    let err = repo.delete_many(&["erin", "ghost"]).await.unwrap_err();
    assert!(matches!(err, MaskError::NotFound(_)));
    assert!(repo.exists("erin").await.unwrap());
    assert_eq!(count(&repo, "erin").await, Some(1));
}

#[tokio::test]
async fn test_create_many_rejects_taken_key_up_front() {
    let repo = repository();
    repo.create(UserRecord::new("frank")).await.unwrap();

    let err = repo
        .create_many(vec![
            UserRecord::new("gina").with_email("g@x.com"),
            UserRecord::new("frank"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, MaskError::DuplicateKey(_)));
    assert!(!repo.exists("gina").await.unwrap());
    assert_eq!(count(&repo, "g@x.com").await, None);
}
