use std::sync::Arc;

use hexmask::{
    Hasher, IpAddressRecord, MaskMode, MaskedRepository, MasterKey, MaskingEngine,
    MemoryMappingStore, MemoryRecordStore, UserRecord,
};

fn engine(seed: u8) -> MaskingEngine {
    let hasher = Hasher::new(&MasterKey::from_bytes([seed; 32])).unwrap();
    MaskingEngine::new(hasher, Arc::new(MemoryMappingStore::new()))
}

#[tokio::test]
async fn test_record_store_dump_reveals_no_plaintext() {
    // Threat Model: attacker obtains a copy of the record store only.
    // Goal: no masked plaintext appears anywhere in the persisted rows.
    let repo = MaskedRepository::new(engine(1), MemoryRecordStore::new()).unwrap();
    repo.create(
        UserRecord::new("mallory")
            .with_name("Mallory Smith")
            .with_email("mallory@example.com")
            .with_phone_number("555-0142")
            .with_user_type("admin"),
    )
    .await
    .unwrap();

    let dump = serde_json::to_string(&repo.records().rows().await).unwrap();
    for secret in ["mallory", "Mallory Smith", "mallory@example.com", "555-0142"] {
        assert!(!dump.contains(secret), "{secret} leaked into the record store");
    }
    // Unmasked fields are stored as-is.
    assert!(dump.contains("admin"));
}

#[tokio::test]
async fn test_pseudonyms_differ_across_deployments() {
    // Threat Model: attacker with a dictionary of pseudonyms from one
    // deployment tries to match them against another.
    let a = engine(1)
        .mask(IpAddressRecord::new("203.0.113.9"), MaskMode::Create)
        .await
        .unwrap();
    let b = engine(2)
        .mask(IpAddressRecord::new("203.0.113.9"), MaskMode::Create)
        .await
        .unwrap();
    assert_ne!(a.ip, b.ip);
}

#[tokio::test]
async fn test_logs_and_debug_output_hide_plaintext() {
    let engine = engine(3);
    let debug = format!("{:?}", engine);
    assert!(debug.contains("[REDACTED]"));

    engine
        .mask(UserRecord::new("trent").with_email("t@x.com"), MaskMode::Create)
        .await
        .unwrap();
    let entry = engine
        .mapping_store()
        .read_by_key(&engine.mask_string("t@x.com"))
        .await
        .unwrap();
    assert!(!format!("{:?}", entry).contains("t@x.com"));
    for record in engine.audit_records().unwrap() {
        assert!(!serde_json::to_string(&record).unwrap().contains("t@x.com"));
    }
}
