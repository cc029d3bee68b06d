//! redb-backed document store

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use folio_core::{AppId, DocumentId, SessionKey, UserId};
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument};

use super::{
    lock_available, now_millis, AppRecord, DocumentRecord, DocumentStore, LockRow, PayloadRow,
    SnapshotRecord, UpdateId, UpdateRecord,
};
use crate::error::{StorageError, StorageResult};

// Key: document id, Value: serialized DocumentRecord
const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

// Key: app id, Value: serialized AppRecord
const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

// Key: session key, Value: serialized SnapshotRecord
const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

// Key: (app id, viewer id), Value: empty
const APP_VIEWERS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("app_viewers");

// Key: update id, Value: serialized UpdateRecord
const UPDATES: TableDefinition<u64, &[u8]> = TableDefinition::new("updates");

// Key: (session key, update id), Value: empty
const UPDATE_INDEX: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("update_index");

// Key: payload id, Value: serialized PayloadRow
const PAYLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("payloads");

// Key: lock name, Value: serialized LockRow
const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

// Key: counter name, Value: last issued value
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

const UPDATE_COUNTER: &str = "update_id";

const EMPTY: &[u8] = &[];

/// Configuration for the redb store
#[derive(Debug, Clone)]
pub struct RedbStoreConfig {
    /// Path to the database file
    pub db_path: PathBuf,
}

impl Default for RedbStoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/folio.redb"),
        }
    }
}

/// redb implementation of [`DocumentStore`]
pub struct RedbStore {
    db: Arc<Database>,
}

fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    postcard::from_bytes(bytes).map_err(|e| StorageError::Deserialization(e.to_string()))
}

impl RedbStore {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbStoreConfig) -> StorageResult<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&config.db_path)?;
        info!("Opened redb database");

        let store = Self { db: Arc::new(db) };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> StorageResult<()> {
        let txn = self.db.begin_write()?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(APPS)?;
        txn.open_table(SNAPSHOTS)?;
        txn.open_table(APP_VIEWERS)?;
        txn.open_table(UPDATES)?;
        txn.open_table(UPDATE_INDEX)?;
        txn.open_table(PAYLOADS)?;
        txn.open_table(LOCKS)?;
        txn.open_table(COUNTERS)?;
        txn.commit()?;

        debug!("Initialized redb tables");
        Ok(())
    }

    fn put_raw(&self, table: TableDefinition<&str, &[u8]>, key: &str, value: &[u8]) -> StorageResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(table)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get_raw(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn get_decoded<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StorageResult<Option<T>> {
        self.get_raw(table, key)?.map(|bytes| decode(&bytes)).transpose()
    }

    /// Read-modify-write of one lock row inside a single write transaction
    fn update_lock<F>(&self, name: &str, f: F) -> StorageResult<bool>
    where
        F: FnOnce(Option<LockRow>) -> Option<Option<LockRow>>,
    {
        let txn = self.db.begin_write()?;
        let changed = {
            let mut table = txn.open_table(LOCKS)?;
            let current = match table.get(name)? {
                Some(bytes) => Some(decode::<LockRow>(bytes.value())?),
                None => None,
            };
            match f(current) {
                None => false,
                Some(Some(row)) => {
                    let bytes = encode(&row)?;
                    table.insert(name, bytes.as_slice())?;
                    true
                }
                Some(None) => {
                    table.remove(name)?;
                    true
                }
            }
        };
        txn.commit()?;
        Ok(changed)
    }
}

#[async_trait]
impl DocumentStore for RedbStore {
    async fn put_document(&self, record: &DocumentRecord) -> StorageResult<()> {
        self.put_raw(DOCUMENTS, record.id.as_str(), &encode(record)?)
    }

    async fn get_document(&self, id: &DocumentId) -> StorageResult<Option<DocumentRecord>> {
        self.get_decoded(DOCUMENTS, id.as_str())
    }

    async fn delete_document(&self, id: &DocumentId) -> StorageResult<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.remove(id.as_str())?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    async fn update_title(&self, id: &DocumentId, title: &str) -> StorageResult<bool> {
        let txn = self.db.begin_write()?;
        let updated = {
            let mut table = txn.open_table(DOCUMENTS)?;
            let existing = match table.get(id.as_str())? {
                Some(bytes) => Some(decode::<DocumentRecord>(bytes.value())?),
                None => None,
            };
            match existing {
                Some(mut record) => {
                    record.title = title.to_string();
                    record.updated_at_millis = now_millis();
                    let bytes = encode(&record)?;
                    table.insert(id.as_str(), bytes.as_slice())?;
                    true
                }
                None => false,
            }
        };
        txn.commit()?;
        Ok(updated)
    }

    async fn put_app(&self, record: &AppRecord) -> StorageResult<()> {
        self.put_raw(APPS, record.id.as_str(), &encode(record)?)
    }

    async fn get_app(&self, id: &AppId) -> StorageResult<Option<AppRecord>> {
        self.get_decoded(APPS, id.as_str())
    }

    async fn latest_app(&self, document_id: &DocumentId) -> StorageResult<Option<AppRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(APPS)?;
        let mut latest: Option<AppRecord> = None;
        for entry in table.iter()? {
            let (_, value) = entry?;
            let app: AppRecord = decode(value.value())?;
            if &app.document_id != document_id {
                continue;
            }
            if latest
                .as_ref()
                .is_none_or(|l| l.created_at_millis < app.created_at_millis)
            {
                latest = Some(app);
            }
        }
        Ok(latest)
    }

    async fn get_snapshot(&self, key: &SessionKey) -> StorageResult<Option<SnapshotRecord>> {
        self.get_decoded(SNAPSHOTS, &key.to_string())
    }

    async fn put_snapshot(&self, key: &SessionKey, record: &SnapshotRecord) -> StorageResult<()> {
        let bytes = encode(record)?;
        let key_str = key.to_string();
        let txn = self.db.begin_write()?;
        {
            let mut snapshots = txn.open_table(SNAPSHOTS)?;
            snapshots.insert(key_str.as_str(), bytes.as_slice())?;
            if let SessionKey::App {
                app_id,
                viewer: Some(viewer),
                ..
            } = key
            {
                let mut viewers = txn.open_table(APP_VIEWERS)?;
                viewers.insert((app_id.as_str(), viewer.as_str()), EMPTY)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    async fn app_viewers(&self, app_id: &AppId) -> StorageResult<Vec<UserId>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(APP_VIEWERS)?;
        let mut viewers = Vec::new();
        for entry in table.range((app_id.as_str(), "")..)? {
            let (key, _) = entry?;
            let (app, viewer) = key.value();
            if app != app_id.as_str() {
                break;
            }
            viewers.push(UserId::new(viewer));
        }
        Ok(viewers)
    }

    async fn append_update(
        &self,
        key: &SessionKey,
        clock: u64,
        data: &[u8],
    ) -> StorageResult<UpdateId> {
        let key_str = key.to_string();
        let txn = self.db.begin_write()?;
        let id = {
            let mut counters = txn.open_table(COUNTERS)?;
            let id = counters.get(UPDATE_COUNTER)?.map(|v| v.value()).unwrap_or(0) + 1;
            counters.insert(UPDATE_COUNTER, id)?;

            let record = UpdateRecord {
                id,
                key: key_str.clone(),
                clock,
                data: data.to_vec(),
            };
            let bytes = encode(&record)?;
            txn.open_table(UPDATES)?.insert(id, bytes.as_slice())?;
            txn.open_table(UPDATE_INDEX)?
                .insert((key_str.as_str(), id), EMPTY)?;
            id
        };
        txn.commit()?;
        Ok(id)
    }

    async fn updates(&self, key: &SessionKey) -> StorageResult<Vec<UpdateRecord>> {
        let key_str = key.to_string();
        let txn = self.db.begin_read()?;
        let index = txn.open_table(UPDATE_INDEX)?;
        let updates = txn.open_table(UPDATES)?;
        let mut records = Vec::new();
        for entry in index.range((key_str.as_str(), 0u64)..)? {
            let (index_key, _) = entry?;
            let (update_key, id) = index_key.value();
            if update_key != key_str {
                break;
            }
            if let Some(bytes) = updates.get(id)? {
                records.push(decode(bytes.value())?);
            }
        }
        Ok(records)
    }

    async fn delete_updates(&self, ids: &[UpdateId]) -> StorageResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut updates = txn.open_table(UPDATES)?;
            let mut index = txn.open_table(UPDATE_INDEX)?;
            for id in ids {
                let removed = match updates.remove(*id)? {
                    Some(bytes) => Some(decode::<UpdateRecord>(bytes.value())?),
                    None => None,
                };
                if let Some(record) = removed {
                    index.remove((record.key.as_str(), record.id))?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    async fn put_payload(&self, data: &[u8]) -> StorageResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let row = PayloadRow {
            created_at_millis: now_millis(),
            data: data.to_vec(),
        };
        self.put_raw(PAYLOADS, &id, &encode(&row)?)?;
        Ok(id)
    }

    async fn get_payload(&self, id: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .get_decoded::<PayloadRow>(PAYLOADS, id)?
            .map(|row| row.data))
    }

    async fn prune_payloads(&self, before_millis: i64) -> StorageResult<usize> {
        let txn = self.db.begin_write()?;
        let pruned = {
            let mut table = txn.open_table(PAYLOADS)?;
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let row: PayloadRow = decode(value.value())?;
                if row.created_at_millis < before_millis {
                    stale.push(key.value().to_string());
                }
            }
            for key in &stale {
                table.remove(key.as_str())?;
            }
            stale.len()
        };
        txn.commit()?;
        Ok(pruned)
    }

    async fn try_lock(&self, name: &str, owner: &str, ttl_millis: i64) -> StorageResult<bool> {
        let now = now_millis();
        self.update_lock(name, |current| {
            if lock_available(current.as_ref(), owner, now) {
                Some(Some(LockRow {
                    owner: owner.to_string(),
                    expires_at_millis: now + ttl_millis,
                }))
            } else {
                None
            }
        })
    }

    async fn extend_lock(&self, name: &str, owner: &str, ttl_millis: i64) -> StorageResult<bool> {
        self.update_lock(name, |current| match current {
            Some(mut row) if row.owner == owner => {
                row.expires_at_millis = now_millis() + ttl_millis;
                Some(Some(row))
            }
            _ => None,
        })
    }

    async fn release_lock(&self, name: &str, owner: &str) -> StorageResult<bool> {
        self.update_lock(name, |current| match current {
            Some(row) if row.owner == owner => Some(None),
            _ => None,
        })
    }
}
