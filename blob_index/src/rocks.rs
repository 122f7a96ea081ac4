//! Persistent index on RocksDB.
//!
//! Wide-column layout, one row per fact so that adding or removing a region
//! touches a single key:
//! - `Entries`: `<ns>/<blob>` -> empty
//! - `Regions`: `<ns>/<blob>/<region>` -> empty
//! - `References`: `<ns>/<blob>/<reference key>` -> `BlobReference`

use std::{path::Path, sync::Arc};

use anyhow::{anyhow, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use data_model::{BlobError, BlobId, BlobReference, BlobResult, BucketId, NamespaceId, RefId};
use futures::{stream::BoxStream, StreamExt};
use rocksdb::{
    ColumnFamily,
    ColumnFamilyDescriptor,
    Direction,
    IteratorMode,
    Options,
    WriteBatch,
    DB,
};
use strum::{AsRefStr, IntoEnumIterator};
use tracing::info;

use crate::{
    migrations,
    serializer::{JsonEncode, JsonEncoder},
    validate_region,
    BlobIndex,
    BlobReferenceStream,
    IndexedBlobStream,
};

const DEFAULT_PAGE_SIZE: usize = 1_000;

#[derive(AsRefStr, strum::Display, strum::EnumIter, Clone, Copy)]
pub(crate) enum IndexColumns {
    Metadata,        //  layout_version -> u32
    Entries,         //  Ns/Blob -> empty
    Regions,         //  Ns/Blob/Region -> empty
    References,      //  Ns/Blob/RefKey -> BlobReference
    LegacyDocuments, //  Ns/Blob -> LegacyIndexDocument
}

impl IndexColumns {
    pub fn cf_db<'a>(&self, db: &'a DB) -> Result<&'a ColumnFamily> {
        db.cf_handle(self.as_ref())
            .ok_or_else(|| anyhow!("failed to get column family handle for {}", self.as_ref()))
    }
}

pub(crate) fn entry_key(ns: &NamespaceId, blob: &BlobId) -> String {
    format!("{}/{}", ns, blob)
}

fn child_prefix(ns: &NamespaceId, blob: &BlobId) -> String {
    format!("{}/{}/", ns, blob)
}

pub(crate) fn region_key(ns: &NamespaceId, blob: &BlobId, region: &str) -> String {
    format!("{}/{}/{}", ns, blob, region)
}

pub(crate) fn reference_key(ns: &NamespaceId, blob: &BlobId, reference: &BlobReference) -> String {
    format!("{}/{}/{}", ns, blob, reference.key())
}

fn parse_entry_key(key: &[u8]) -> Result<(NamespaceId, BlobId)> {
    let key = std::str::from_utf8(key)?;
    let (ns, blob) = key
        .split_once('/')
        .ok_or_else(|| anyhow!("malformed index key {:?}", key))?;
    Ok((ns.parse()?, blob.parse()?))
}

/// Open the database with every index column family, creating it if needed.
pub(crate) fn open_db(path: &Path) -> Result<DB> {
    std::fs::create_dir_all(path).map_err(|e| anyhow!("failed to create blob index dir: {e}"))?;
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    let column_families = IndexColumns::iter()
        .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
    Ok(DB::open_cf_descriptors(&options, path, column_families)?)
}

type Row = (Box<[u8]>, Box<[u8]>);

/// Read up to `limit` rows starting at `start` whose keys begin with
/// `prefix`.
fn read_page(
    db: &DB,
    column: IndexColumns,
    prefix: &[u8],
    start: &[u8],
    limit: usize,
) -> Result<Vec<Row>> {
    let cf = column.cf_db(db)?;
    let mut page = Vec::new();
    for item in db.iterator_cf(cf, IteratorMode::From(start, Direction::Forward)) {
        if page.len() >= limit {
            break;
        }
        let (key, value) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        page.push((key, value));
    }
    Ok(page)
}

async fn fetch_page(
    db: Arc<DB>,
    column: IndexColumns,
    prefix: Vec<u8>,
    start: Vec<u8>,
    limit: usize,
) -> BlobResult<Vec<Row>> {
    let page = tokio::task::spawn_blocking(move || read_page(&db, column, &prefix, &start, limit))
        .await
        .map_err(anyhow::Error::from)?;
    Ok(page?)
}

fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

pub struct RocksDbBlobIndex {
    db: Arc<DB>,
    current_region: String,
    page_size: usize,
}

impl RocksDbBlobIndex {
    /// Open (or create) the index at `path` and bring its layout up to date.
    pub fn open(path: &Path, current_region: impl Into<String>) -> Result<Self> {
        let current_region = current_region.into();
        validate_region(&current_region)?;
        info!("opening blob index database at {}", path.display());
        let db = open_db(path)?;
        migrations::run(&db)?;
        Ok(Self {
            db: Arc::new(db),
            current_region,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    fn region<'a>(&'a self, region: Option<&'a str>) -> BlobResult<&'a str> {
        let region = region.unwrap_or(&self.current_region);
        validate_region(region)?;
        Ok(region)
    }

    fn has_entry(&self, ns: &NamespaceId, blob: &BlobId) -> Result<bool> {
        let cf = IndexColumns::Entries.cf_db(&self.db)?;
        Ok(self.db.get_pinned_cf(cf, entry_key(ns, blob))?.is_some())
    }

    fn put_references(
        &self,
        ns: &NamespaceId,
        references: &[(BlobId, BlobReference)],
    ) -> Result<()> {
        let entries = IndexColumns::Entries.cf_db(&self.db)?;
        let refs = IndexColumns::References.cf_db(&self.db)?;
        let mut batch = WriteBatch::default();
        for (blob, reference) in references {
            batch.put_cf(entries, entry_key(ns, blob), b"");
            batch.put_cf(
                refs,
                reference_key(ns, blob, reference),
                JsonEncoder::encode(reference)?,
            );
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Stream every row of `column` under `prefix`, one page at a time.
    fn scan(&self, column: IndexColumns, prefix: Vec<u8>) -> BoxStream<'static, BlobResult<Row>> {
        let db = self.db.clone();
        let page_size = self.page_size;
        let stream = try_stream! {
            let mut start = prefix.clone();
            loop {
                let page =
                    fetch_page(db.clone(), column, prefix.clone(), start.clone(), page_size).await?;
                let exhausted = page.len() < page_size;
                if let Some((last, _)) = page.last() {
                    start = next_key(last);
                }
                for row in page {
                    yield row;
                }
                if exhausted {
                    break;
                }
            }
        };
        stream.boxed()
    }

    async fn collect_keys(&self, column: IndexColumns, prefix: String) -> BlobResult<Vec<Box<[u8]>>> {
        let mut rows = self.scan(column, prefix.into_bytes());
        let mut keys = Vec::new();
        while let Some(row) = rows.next().await {
            keys.push(row?.0);
        }
        Ok(keys)
    }
}

#[async_trait]
impl BlobIndex for RocksDbBlobIndex {
    fn current_region(&self) -> &str {
        &self.current_region
    }

    async fn add_blob_to_index(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        region: Option<&str>,
    ) -> BlobResult<()> {
        let region = self.region(region)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(IndexColumns::Entries.cf_db(&self.db)?, entry_key(ns, blob), b"");
        batch.put_cf(
            IndexColumns::Regions.cf_db(&self.db)?,
            region_key(ns, blob, region),
            b"",
        );
        self.db.write(batch).map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn remove_blob_from_region(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        region: Option<&str>,
    ) -> BlobResult<()> {
        let region = self.region(region)?;
        self.db
            .delete_cf(
                IndexColumns::Regions.cf_db(&self.db)?,
                region_key(ns, blob, region),
            )
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn blob_exists_in_region(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        region: Option<&str>,
    ) -> BlobResult<bool> {
        let region = self.region(region)?;
        let found = self
            .db
            .get_pinned_cf(
                IndexColumns::Regions.cf_db(&self.db)?,
                region_key(ns, blob, region),
            )
            .map_err(anyhow::Error::from)?;
        Ok(found.is_some())
    }

    async fn get_blob_regions(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<Vec<String>> {
        if !self.has_entry(ns, blob)? {
            return Err(BlobError::blob_not_found(ns, blob));
        }
        let prefix = child_prefix(ns, blob);
        let keys = self.collect_keys(IndexColumns::Regions, prefix.clone()).await?;
        let mut regions = Vec::with_capacity(keys.len());
        for key in keys {
            let region = std::str::from_utf8(&key[prefix.len()..]).map_err(anyhow::Error::from)?;
            regions.push(region.to_string());
        }
        Ok(regions)
    }

    async fn add_ref_to_blobs(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        blobs: &[BlobId],
    ) -> BlobResult<()> {
        let references: Vec<(BlobId, BlobReference)> = blobs
            .iter()
            .map(|blob| {
                (
                    *blob,
                    BlobReference::Ref {
                        bucket: bucket.clone(),
                        key: key.clone(),
                    },
                )
            })
            .collect();
        self.put_references(ns, &references)?;
        Ok(())
    }

    async fn add_blob_references(
        &self,
        ns: &NamespaceId,
        source: &BlobId,
        target: &BlobId,
    ) -> BlobResult<()> {
        self.put_references(ns, &[(*target, BlobReference::Blob { blob: *source })])?;
        Ok(())
    }

    async fn remove_references(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        refs: Option<&[BlobReference]>,
    ) -> BlobResult<()> {
        let keys: Vec<Vec<u8>> = match refs {
            Some(refs) => refs
                .iter()
                .map(|reference| reference_key(ns, blob, reference).into_bytes())
                .collect(),
            None => self
                .collect_keys(IndexColumns::References, child_prefix(ns, blob))
                .await?
                .into_iter()
                .map(Vec::from)
                .collect(),
        };
        let cf = IndexColumns::References.cf_db(&self.db)?;
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete_cf(cf, key);
        }
        self.db.write(batch).map_err(anyhow::Error::from)?;
        Ok(())
    }

    fn get_blob_references(&self, ns: &NamespaceId, blob: &BlobId) -> BlobReferenceStream {
        self.scan(IndexColumns::References, child_prefix(ns, blob).into_bytes())
            .map(|row| -> BlobResult<BlobReference> {
                let (_, value) = row?;
                Ok(JsonEncoder::decode::<BlobReference>(&value)?)
            })
            .boxed()
    }

    fn get_all_blobs(&self) -> IndexedBlobStream {
        self.scan(IndexColumns::Entries, Vec::new())
            .map(|row| -> BlobResult<(NamespaceId, BlobId)> {
                let (key, _) = row?;
                Ok(parse_entry_key(&key)?)
            })
            .boxed()
    }
}
