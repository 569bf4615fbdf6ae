//! Minimal example: hexmask in front of a user table.
//!
//! Shows shared reference counting, partial updates and the audit trail.
//! Run with: `RUST_LOG=hexmask=debug cargo run --example user_accounts_demo`
//!
//! - Two users share a phone number; the mapping store holds it once.
//! - Changing one user's email releases the old value.
//! - Every counter change is persisted to a JSONL audit file.

use std::sync::Arc;

use hexmask::audit::FileAuditSink;
use hexmask::config::MaskingConfig;
use hexmask::{
    generate_master_key, Hasher, MaskedRepository, MaskingEngine, MemoryMappingStore,
    MemoryRecordStore, UserRecord,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 1. Setup. Without HEXMASK_* set, run on a throwaway in-memory engine.
    let engine = match MaskingConfig::from_env() {
        Ok(config) => config.build_engine()?,
        Err(_) => {
            let hasher = Hasher::new(&generate_master_key()?)?;
            MaskingEngine::new(hasher, Arc::new(MemoryMappingStore::new()))
        }
    };

    let audit_path = std::env::temp_dir().join("hexmask_audit.jsonl");
    engine.add_audit_sink(Box::new(FileAuditSink::new(&audit_path)?))?;

    let users = MaskedRepository::new(engine, MemoryRecordStore::<UserRecord>::new())?;

    // 2. Two users share a phone number
    users
        .create(
            UserRecord::new("alice")
                .with_email("alice@example.com")
                .with_phone_number("555-0100"),
        )
        .await?;
    users
        .create(
            UserRecord::new("bob")
                .with_email("bob@example.com")
                .with_phone_number("555-0100"),
        )
        .await?;
    let phone = users.engine().mask_string("555-0100");
    let shared = users.engine().mapping_store().read_by_key(&phone).await?;
    println!("phone {} referenced {} times", phone.short(), shared.occurrences);

    // 3. What the record store actually holds
    for row in users.records().rows().await {
        println!("stored row: username={:?} email={:?}", row.username, row.email);
    }

    // 4. Partial update: only the email changes
    users
        .update(UserRecord::new("alice").with_email("alice@work.example"))
        .await?;
    let alice = users.read("alice").await?;
    println!("alice now: email={:?} phone={:?}", alice.email, alice.phone_number);

    // 5. Delete bob; the shared phone drops to one reference
    users.delete("bob").await?;
    let shared = users.engine().mapping_store().read_by_key(&phone).await?;
    println!("phone {} referenced {} times", phone.short(), shared.occurrences);

    // 6. Inspect audit trail
    for record in users.engine().audit_records()? {
        println!(
            "[{}] {:?} {} -> {}",
            record.timestamp,
            record.operation,
            record.pseudonym.short(),
            record.occurrences
        );
    }
    println!("Audit log persisted to: {}", audit_path.display());

    Ok(())
}
