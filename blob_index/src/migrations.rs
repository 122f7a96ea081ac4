//! Layout migrations for the RocksDB index.
//!
//! Version 0 stored one JSON document per `(namespace, blob)`. Version 1 is
//! the wide-column layout. Migrating backfills every legacy document into the
//! new column families, deleting each document in the same write batch, and
//! then stamps the new version. Readers only ever look at the new layout.

use anyhow::{Context, Result};
use data_model::{BlobId, BlobReference, NamespaceId};
use rocksdb::{IteratorMode, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    rocks::{entry_key, reference_key, region_key, IndexColumns},
    serializer::{JsonEncode, JsonEncoder},
    validate_region,
};

pub(crate) const LAYOUT_VERSION_KEY: &[u8] = b"layout_version";

pub(crate) const LATEST_LAYOUT_VERSION: u32 = 1;

const BACKFILL_BATCH_SIZE: usize = 500;

/// One index entry in the version 0 layout.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LegacyIndexDocument {
    pub namespace: NamespaceId,
    pub blob: BlobId,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub references: Vec<BlobReference>,
}

/// Bring the database to the latest layout and return the resulting version.
pub fn run(db: &DB) -> Result<u32> {
    let version = read_layout_version(db)?;
    if version >= LATEST_LAYOUT_VERSION {
        info!(
            "Blob index already at layout version {}. No migrations needed.",
            version
        );
        return Ok(version);
    }

    info!(
        "Starting blob index migration from v{} to v{}",
        version, LATEST_LAYOUT_VERSION
    );
    let migrated = backfill_legacy_documents(db)
        .with_context(|| format!("Backfilling legacy documents into v{LATEST_LAYOUT_VERSION}"))?;
    write_layout_version(db, LATEST_LAYOUT_VERSION)?;
    info!(
        migrated,
        "Completed blob index migration. Layout now at version {}", LATEST_LAYOUT_VERSION
    );
    Ok(LATEST_LAYOUT_VERSION)
}

pub(crate) fn read_layout_version(db: &DB) -> Result<u32> {
    let meta = db.get_cf(IndexColumns::Metadata.cf_db(db)?, LAYOUT_VERSION_KEY)?;
    match meta {
        Some(meta) => JsonEncoder::decode(&meta),
        None => Ok(0),
    }
}

fn write_layout_version(db: &DB, version: u32) -> Result<()> {
    db.put_cf(
        IndexColumns::Metadata.cf_db(db)?,
        LAYOUT_VERSION_KEY,
        JsonEncoder::encode(&version)?,
    )?;
    Ok(())
}

/// Copy every legacy document into the wide-column families. Safe to rerun
/// after an interruption: migrated documents are gone from the legacy family.
fn backfill_legacy_documents(db: &DB) -> Result<usize> {
    let legacy = IndexColumns::LegacyDocuments.cf_db(db)?;
    let entries = IndexColumns::Entries.cf_db(db)?;
    let regions = IndexColumns::Regions.cf_db(db)?;
    let references = IndexColumns::References.cf_db(db)?;

    let mut batch = WriteBatch::default();
    let mut pending = 0;
    let mut migrated = 0;
    for item in db.iterator_cf(legacy, IteratorMode::Start) {
        let (key, value) = item?;
        let document: LegacyIndexDocument = JsonEncoder::decode(&value)?;
        let (ns, blob) = (&document.namespace, &document.blob);

        batch.put_cf(entries, entry_key(ns, blob), b"");
        for region in &document.regions {
            if let Err(e) = validate_region(region) {
                warn!(namespace = %ns, blob = %blob, "dropping legacy region: {}", e);
                continue;
            }
            batch.put_cf(regions, region_key(ns, blob, region), b"");
        }
        for reference in &document.references {
            batch.put_cf(
                references,
                reference_key(ns, blob, reference),
                JsonEncoder::encode(reference)?,
            );
        }
        batch.delete_cf(legacy, key);

        pending += 1;
        migrated += 1;
        if pending == BACKFILL_BATCH_SIZE {
            db.write(std::mem::take(&mut batch))?;
            pending = 0;
            info!(migrated, "backfilled legacy index documents");
        }
    }
    if pending > 0 {
        db.write(batch)?;
    }
    Ok(migrated)
}

#[cfg(test)]
mod tests {
    use data_model::{BucketId, RefId};
    use futures::TryStreamExt;
    use tempfile::TempDir;

    use super::*;
    use crate::{rocks::open_db, BlobIndex, RocksDbBlobIndex};

    fn write_legacy(db: &DB, document: &LegacyIndexDocument) {
        db.put_cf(
            IndexColumns::LegacyDocuments.cf_db(db).unwrap(),
            entry_key(&document.namespace, &document.blob),
            JsonEncoder::encode(document).unwrap(),
        )
        .unwrap();
    }

    fn legacy_count(db: &DB) -> usize {
        db.iterator_cf(
            IndexColumns::LegacyDocuments.cf_db(db).unwrap(),
            IteratorMode::Start,
        )
        .count()
    }

    #[test]
    fn test_fresh_database_is_stamped() {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path()).unwrap();
        assert_eq!(read_layout_version(&db).unwrap(), 0);
        assert_eq!(run(&db).unwrap(), LATEST_LAYOUT_VERSION);
        assert_eq!(read_layout_version(&db).unwrap(), LATEST_LAYOUT_VERSION);
    }

    #[tokio::test]
    async fn test_backfills_legacy_documents() {
        let dir = TempDir::new().unwrap();
        let ns = NamespaceId::new("test-ns").unwrap();
        let chunk = BlobId::from_content(b"chunk");
        let object = BlobId::from_content(b"object");
        let reference = BlobReference::Ref {
            bucket: BucketId::new("bucket").unwrap(),
            key: RefId::new("key").unwrap(),
        };
        {
            let db = open_db(dir.path()).unwrap();
            write_legacy(
                &db,
                &LegacyIndexDocument {
                    namespace: ns.clone(),
                    blob: chunk,
                    regions: vec!["r1".to_string(), "r2".to_string()],
                    references: vec![reference.clone(), BlobReference::Blob { blob: object }],
                },
            );
            write_legacy(
                &db,
                &LegacyIndexDocument {
                    namespace: ns.clone(),
                    blob: object,
                    regions: Vec::new(),
                    references: Vec::new(),
                },
            );
        }

        let index = RocksDbBlobIndex::open(dir.path(), "r1").unwrap();
        assert_eq!(index.get_blob_regions(&ns, &chunk).await.unwrap(), vec!["r1", "r2"]);
        assert!(index.get_blob_regions(&ns, &object).await.unwrap().is_empty());
        let refs: Vec<BlobReference> = index
            .get_blob_references(&ns, &chunk)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&reference));
        drop(index);

        let db = open_db(dir.path()).unwrap();
        assert_eq!(legacy_count(&db), 0);
        assert_eq!(read_layout_version(&db).unwrap(), LATEST_LAYOUT_VERSION);
    }

    #[tokio::test]
    async fn test_migrated_database_ignores_legacy_layout() {
        let dir = TempDir::new().unwrap();
        let ns = NamespaceId::new("test-ns").unwrap();
        let blob = BlobId::from_content(b"late");
        {
            let db = open_db(dir.path()).unwrap();
            run(&db).unwrap();
            write_legacy(
                &db,
                &LegacyIndexDocument {
                    namespace: ns.clone(),
                    blob,
                    regions: vec!["r1".to_string()],
                    references: Vec::new(),
                },
            );
        }

        let index = RocksDbBlobIndex::open(dir.path(), "r1").unwrap();
        assert!(index.get_blob_regions(&ns, &blob).await.is_err());
    }
}
