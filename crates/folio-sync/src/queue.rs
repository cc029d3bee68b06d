//! Execution queue stored inside the notebook document
//!
//! The queue is a list of batches; each batch is a list of items. Every
//! process and every viewer reads the same queue, so executor progress is
//! visible everywhere through ordinary document sync.
//!
//! Items and batches are addressed by their stored `id`, never by position:
//! concurrent edits can shift positions between a read and a write.

use automerge::transaction::Transactable;
use automerge::{ObjId, ObjType, ReadDoc, ScalarValue, Value};
use folio_core::{CompletedOutcome, ItemMetadata, ItemStatus, MetadataTag, UserId};
use serde_json::Value as Json;
use tracing::warn;
use uuid::Uuid;

use crate::document::{keys, NotebookDocument};
use crate::error::SyncResult;
use crate::json::{put_json, read_json};

mod fields {
    pub const ID: &str = "id";
    pub const VERSION: &str = "version";
    pub const QUEUE: &str = "queue";
    pub const IS_RUN_ALL: &str = "isRunAll";
    pub const SCHEDULE_ID: &str = "scheduleId";
    pub const BLOCK_ID: &str = "blockId";
    pub const USER_ID: &str = "userId";
    pub const STATUS: &str = "status";
    pub const METADATA: &str = "metadata";
}

const BATCH_VERSION: i64 = 1;

/// Aggregate status of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Enqueued,
    Aborting,
    Running,
    Completed,
    Unknown,
}

/// Who asked for a run-all batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunAllSource {
    User(Option<UserId>),
    Schedule { schedule_id: String },
}

/// Stable address of one item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemRef {
    pub batch_id: String,
    pub item_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemSnapshot {
    pub id: String,
    pub block_id: String,
    pub user_id: Option<UserId>,
    pub status: ItemStatus,
    pub metadata: ItemMetadata,
}

impl ItemSnapshot {
    pub fn complete_status(&self) -> Option<CompletedOutcome> {
        self.status.complete_status()
    }

    fn from_json(value: &Json) -> Option<Self> {
        Some(Self {
            id: value.get(fields::ID)?.as_str()?.to_string(),
            block_id: value
                .get(fields::BLOCK_ID)
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string(),
            user_id: value
                .get(fields::USER_ID)
                .and_then(Json::as_str)
                .map(UserId::from),
            status: ItemStatus::from_json(value.get(fields::STATUS)),
            metadata: ItemMetadata::from_json(value.get(fields::METADATA)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSnapshot {
    pub id: String,
    pub is_run_all: bool,
    pub schedule_id: Option<String>,
    pub items: Vec<ItemSnapshot>,
}

impl BatchSnapshot {
    /// First item that has not completed
    pub fn current(&self) -> Option<&ItemSnapshot> {
        self.items.iter().find(|item| !item.status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items from the first non-completed one to the end
    pub fn remaining(&self) -> usize {
        let done = self
            .items
            .iter()
            .take_while(|item| item.status.is_terminal())
            .count();
        self.items.len() - done
    }

    pub fn status(&self) -> BatchStatus {
        let mut status = BatchStatus::Unknown;
        for item in &self.items {
            match item.status {
                ItemStatus::Completed { .. } => status = BatchStatus::Completed,
                ItemStatus::Running => return BatchStatus::Running,
                ItemStatus::Unknown => return BatchStatus::Unknown,
                ItemStatus::Aborting => return BatchStatus::Aborting,
                ItemStatus::Enqueued => return BatchStatus::Enqueued,
            }
        }
        status
    }

    pub fn item_ref(&self, item: &ItemSnapshot) -> ItemRef {
        ItemRef {
            batch_id: self.id.clone(),
            item_id: item.id.clone(),
        }
    }

    fn from_json(value: &Json) -> Option<Self> {
        let items = value
            .get(fields::QUEUE)
            .and_then(Json::as_array)
            .map(|items| items.iter().filter_map(ItemSnapshot::from_json).collect())
            .unwrap_or_default();
        Some(Self {
            id: value.get(fields::ID)?.as_str()?.to_string(),
            is_run_all: value
                .get(fields::IS_RUN_ALL)
                .and_then(Json::as_bool)
                .unwrap_or(false),
            schedule_id: value
                .get(fields::SCHEDULE_ID)
                .and_then(Json::as_str)
                .map(str::to_string),
            items,
        })
    }
}

/// An item together with the batch it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub batch_id: String,
    pub item: ItemSnapshot,
}

impl Execution {
    pub fn item_ref(&self) -> ItemRef {
        ItemRef {
            batch_id: self.batch_id.clone(),
            item_id: self.item.id.clone(),
        }
    }
}

struct NewItem {
    block_id: String,
    metadata: ItemMetadata,
}

impl NotebookDocument {
    fn queue_obj(&self) -> SyncResult<ObjId> {
        self.root_obj(keys::EXECUTION_QUEUE)
    }

    /// Every batch, oldest first
    pub fn batches(&self) -> SyncResult<Vec<BatchSnapshot>> {
        let queue = self.queue_obj()?;
        let mut batches = Vec::new();
        for index in 0..self.doc.length(&queue) {
            if let Some(batch) = read_json(&self.doc, &queue, index)?
                .as_ref()
                .and_then(BatchSnapshot::from_json)
            {
                batches.push(batch);
            }
        }
        Ok(batches)
    }

    pub fn batch(&self, batch_id: &str) -> SyncResult<Option<BatchSnapshot>> {
        Ok(self.batches()?.into_iter().find(|batch| batch.id == batch_id))
    }

    /// First well-formed batch and its position in the queue
    fn head_batch(&self) -> SyncResult<Option<(usize, BatchSnapshot)>> {
        let queue = self.queue_obj()?;
        for index in 0..self.doc.length(&queue) {
            if let Some(batch) = read_json(&self.doc, &queue, index)?
                .as_ref()
                .and_then(BatchSnapshot::from_json)
            {
                return Ok(Some((index, batch)));
            }
        }
        Ok(None)
    }

    /// The batch at the head of the queue
    ///
    /// Entries that do not parse as a batch are skipped.
    pub fn current_batch(&self) -> SyncResult<Option<BatchSnapshot>> {
        Ok(self.head_batch()?.map(|(_, batch)| batch))
    }

    /// Drop the head batch along with any malformed entries before it
    pub fn advance_queue(&mut self) -> SyncResult<()> {
        let Some((index, batch)) = self.head_batch()? else {
            return Ok(());
        };
        if index > 0 {
            warn!(skipped = index, batch_id = %batch.id, "Dropping malformed queue entries");
        }
        let queue = self.queue_obj()?;
        for _ in 0..=index {
            self.doc.delete(&queue, 0usize)?;
        }
        Ok(())
    }

    /// Queue one operation on one block
    ///
    /// Returns `None` when the block does not exist.
    pub fn enqueue_block(
        &mut self,
        block_id: &str,
        user_id: Option<&UserId>,
        metadata: ItemMetadata,
    ) -> SyncResult<Option<ItemRef>> {
        if self.block(block_id)?.is_none() {
            return Ok(None);
        }
        let (batch_id, item_ids) = self.push_batch(
            vec![NewItem {
                block_id: block_id.to_string(),
                metadata,
            }],
            user_id,
            false,
            None,
        )?;
        Ok(item_ids.into_iter().next().map(|item_id| ItemRef {
            batch_id,
            item_id,
        }))
    }

    /// Queue the code and visualization tabs of a layout group
    ///
    /// Returns the batch id, or `None` when the group is unknown or has
    /// nothing runnable.
    pub fn enqueue_block_group(
        &mut self,
        group_id: &str,
        user_id: Option<&UserId>,
    ) -> SyncResult<Option<String>> {
        let Some(group) = self.block_group(group_id)? else {
            return Ok(None);
        };
        let blocks = self.blocks()?;
        let items: Vec<NewItem> = group
            .tabs
            .iter()
            .filter_map(|tab| {
                let metadata = blocks.get(tab)?.kind()?.group_run_metadata()?;
                Some(NewItem {
                    block_id: tab.clone(),
                    metadata,
                })
            })
            .collect();
        if items.is_empty() {
            return Ok(None);
        }
        let (batch_id, _) = self.push_batch(items, user_id, false, None)?;
        Ok(Some(batch_id))
    }

    /// Queue every runnable block in layout order
    pub fn enqueue_run_all(&mut self, source: RunAllSource) -> SyncResult<String> {
        let blocks = self.blocks()?;
        let items: Vec<NewItem> = self
            .layout()?
            .iter()
            .flat_map(|group| group.tabs.iter())
            .filter_map(|tab| {
                let metadata = blocks.get(tab)?.kind()?.run_metadata()?;
                Some(NewItem {
                    block_id: tab.clone(),
                    metadata,
                })
            })
            .collect();

        let (user_id, schedule_id) = match source {
            RunAllSource::User(user_id) => (user_id, None),
            RunAllSource::Schedule { schedule_id } => (None, Some(schedule_id)),
        };
        let (batch_id, _) = self.push_batch(items, user_id.as_ref(), true, schedule_id)?;
        Ok(batch_id)
    }

    fn push_batch(
        &mut self,
        items: Vec<NewItem>,
        user_id: Option<&UserId>,
        is_run_all: bool,
        schedule_id: Option<String>,
    ) -> SyncResult<(String, Vec<String>)> {
        let queue = self.queue_obj()?;
        let batch_id = Uuid::new_v4().to_string();
        let index = self.doc.length(&queue);

        let batch = self.doc.insert_object(&queue, index, ObjType::Map)?;
        self.doc.put(&batch, fields::ID, batch_id.as_str())?;
        self.doc.put(&batch, fields::VERSION, BATCH_VERSION)?;
        self.doc.put(&batch, fields::IS_RUN_ALL, is_run_all)?;
        match &schedule_id {
            Some(id) => self.doc.put(&batch, fields::SCHEDULE_ID, id.as_str())?,
            None => self.doc.put(&batch, fields::SCHEDULE_ID, ScalarValue::Null)?,
        }

        let list = self.doc.put_object(&batch, fields::QUEUE, ObjType::List)?;
        let mut item_ids = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            let item_id = Uuid::new_v4().to_string();
            let obj = self.doc.insert_object(&list, i, ObjType::Map)?;
            self.doc.put(&obj, fields::ID, item_id.as_str())?;
            self.doc.put(&obj, fields::BLOCK_ID, item.block_id.as_str())?;
            match user_id {
                Some(user) => self.doc.put(&obj, fields::USER_ID, user.as_str())?,
                None => self.doc.put(&obj, fields::USER_ID, ScalarValue::Null)?,
            }
            put_json(&mut self.doc, &obj, fields::STATUS, &ItemStatus::Enqueued.to_json())?;
            put_json(&mut self.doc, &obj, fields::METADATA, &item.metadata.to_json())?;
            item_ids.push(item_id);
        }
        Ok((batch_id, item_ids))
    }

    /// Every queued item targeting `block_id`, optionally filtered by operation
    pub fn block_executions(
        &self,
        block_id: &str,
        tag: Option<MetadataTag>,
    ) -> SyncResult<Vec<Execution>> {
        let mut executions = Vec::new();
        for batch in self.batches()? {
            for item in batch.items {
                if item.block_id == block_id && tag.is_none_or(|tag| item.metadata.tag() == tag)
                {
                    executions.push(Execution {
                        batch_id: batch.id.clone(),
                        item,
                    });
                }
            }
        }
        Ok(executions)
    }

    pub fn run_all_batches(&self) -> SyncResult<Vec<BatchSnapshot>> {
        Ok(self
            .batches()?
            .into_iter()
            .filter(|batch| batch.is_run_all)
            .collect())
    }

    fn find_batch_obj(&self, batch_id: &str) -> SyncResult<Option<ObjId>> {
        let queue = self.queue_obj()?;
        for index in 0..self.doc.length(&queue) {
            let Some((Value::Object(ObjType::Map), batch)) = self.doc.get(&queue, index)? else {
                continue;
            };
            if read_json(&self.doc, &batch, fields::ID)?.as_ref().and_then(Json::as_str)
                == Some(batch_id)
            {
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }

    fn batch_items_obj(&self, batch_id: &str) -> SyncResult<Option<ObjId>> {
        let Some(batch) = self.find_batch_obj(batch_id)? else {
            return Ok(None);
        };
        match self.doc.get(&batch, fields::QUEUE)? {
            Some((Value::Object(ObjType::List), list)) => Ok(Some(list)),
            _ => Ok(None),
        }
    }

    /// Items of a batch as (object id, snapshot) pairs
    fn batch_item_objs(&self, batch_id: &str) -> SyncResult<Vec<(ObjId, ItemSnapshot)>> {
        let Some(list) = self.batch_items_obj(batch_id)? else {
            return Ok(Vec::new());
        };
        let mut items = Vec::new();
        for index in 0..self.doc.length(&list) {
            let Some((Value::Object(ObjType::Map), obj)) = self.doc.get(&list, index)? else {
                continue;
            };
            if let Some(item) = read_json(&self.doc, &list, index)?
                .as_ref()
                .and_then(ItemSnapshot::from_json)
            {
                items.push((obj, item));
            }
        }
        Ok(items)
    }

    fn find_item_obj(&self, item: &ItemRef) -> SyncResult<Option<ObjId>> {
        Ok(self
            .batch_item_objs(&item.batch_id)?
            .into_iter()
            .find(|(_, snapshot)| snapshot.id == item.item_id)
            .map(|(obj, _)| obj))
    }

    /// Current snapshot of an item; `None` once its batch is gone
    pub fn item(&self, item: &ItemRef) -> SyncResult<Option<ItemSnapshot>> {
        Ok(self
            .batch_item_objs(&item.batch_id)?
            .into_iter()
            .map(|(_, snapshot)| snapshot)
            .find(|snapshot| snapshot.id == item.item_id))
    }

    pub fn item_status(&self, item: &ItemRef) -> SyncResult<Option<ItemStatus>> {
        Ok(self.item(item)?.map(|snapshot| snapshot.status))
    }

    /// Overwrite an item's status; returns false when the item is gone
    pub fn set_item_status(&mut self, item: &ItemRef, status: ItemStatus) -> SyncResult<bool> {
        let Some(obj) = self.find_item_obj(item)? else {
            return Ok(false);
        };
        put_json(&mut self.doc, &obj, fields::STATUS, &status.to_json())?;
        Ok(true)
    }

    pub fn set_item_running(&mut self, item: &ItemRef) -> SyncResult<bool> {
        self.set_item_status(item, ItemStatus::Running)
    }

    /// Mark an item running if it is still waiting to run
    ///
    /// Returns the status found. Only an enqueued or running item is changed,
    /// so an abort requested since the item was last read is kept.
    pub fn claim_item(&mut self, item: &ItemRef) -> SyncResult<Option<ItemStatus>> {
        let status = self.item_status(item)?;
        if matches!(status, Some(ItemStatus::Enqueued | ItemStatus::Running)) {
            self.set_item_running(item)?;
        }
        Ok(status)
    }

    pub fn set_item_aborting(&mut self, item: &ItemRef) -> SyncResult<bool> {
        self.set_item_status(item, ItemStatus::Aborting)
    }

    pub fn set_item_completed(
        &mut self,
        item: &ItemRef,
        outcome: CompletedOutcome,
    ) -> SyncResult<bool> {
        self.set_item_status(item, ItemStatus::completed(outcome))
    }

    /// Request cancellation of every unfinished item in a batch
    pub fn abort_batch(&mut self, batch_id: &str) -> SyncResult<bool> {
        let items = self.batch_item_objs(batch_id)?;
        if items.is_empty() {
            return Ok(false);
        }
        for (obj, item) in items {
            if !item.status.is_terminal() {
                put_json(&mut self.doc, &obj, fields::STATUS, &ItemStatus::Aborting.to_json())?;
            }
        }
        Ok(true)
    }

    /// Remove the first item of a batch that targets `block_id`
    pub fn remove_batch_item(&mut self, batch_id: &str, block_id: &str) -> SyncResult<bool> {
        let Some(list) = self.batch_items_obj(batch_id)? else {
            return Ok(false);
        };
        for index in 0..self.doc.length(&list) {
            let target = read_json(&self.doc, &list, index)?
                .and_then(|item| item.get(fields::BLOCK_ID).cloned());
            if target.as_ref().and_then(Json::as_str) == Some(block_id) {
                self.doc.delete(&list, index)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Block, BlockGroup};
    use folio_core::BlockKind;

    fn notebook() -> NotebookDocument {
        let mut doc = NotebookDocument::new().unwrap();
        doc.upsert_block(&Block::new("sql", BlockKind::Sql)).unwrap();
        doc.upsert_block(&Block::new("py", BlockKind::Python)).unwrap();
        doc.upsert_block(&Block::new("text", BlockKind::RichText)).unwrap();
        doc.upsert_block(&Block::new("input", BlockKind::Input)).unwrap();
        doc.push_block_group(&BlockGroup {
            id: "g1".into(),
            current: Some("sql".into()),
            tabs: vec!["sql".into(), "text".into(), "py".into()],
        })
        .unwrap();
        doc.push_block_group(&BlockGroup::single("g2", "input")).unwrap();
        doc
    }

    #[test]
    fn test_enqueue_block_and_advance() {
        let mut doc = notebook();
        let user = UserId::new("u1");
        let item = doc
            .enqueue_block("py", Some(&user), ItemMetadata::Python { is_suggestion: false })
            .unwrap()
            .unwrap();

        let batch = doc.current_batch().unwrap().unwrap();
        assert_eq!(batch.id, item.batch_id);
        assert!(!batch.is_run_all);
        let current = batch.current().unwrap();
        assert_eq!(current.block_id, "py");
        assert_eq!(current.user_id, Some(user));
        assert_eq!(current.status, ItemStatus::Enqueued);
        assert_eq!(batch.status(), BatchStatus::Enqueued);

        doc.advance_queue().unwrap();
        assert!(doc.current_batch().unwrap().is_none());
        assert_eq!(doc.item_status(&item).unwrap(), None);
    }

    #[test]
    fn test_enqueue_missing_block_is_noop() {
        let mut doc = notebook();
        let item = doc
            .enqueue_block("nope", None, ItemMetadata::Visualization)
            .unwrap();
        assert!(item.is_none());
        assert!(doc.batches().unwrap().is_empty());
    }

    #[test]
    fn test_run_all_maps_block_kinds() {
        let mut doc = notebook();
        let batch_id = doc.enqueue_run_all(RunAllSource::User(None)).unwrap();
        let batch = doc.batch(&batch_id).unwrap().unwrap();

        assert!(batch.is_run_all);
        assert_eq!(batch.schedule_id, None);
        let targets: Vec<_> = batch.items.iter().map(|i| i.block_id.as_str()).collect();
        assert_eq!(targets, vec!["sql", "py", "input"]);
        assert_eq!(batch.items[2].metadata, ItemMetadata::TextInputSaveValue);
        assert_eq!(doc.run_all_batches().unwrap().len(), 1);
    }

    #[test]
    fn test_scheduled_run_all_records_schedule() {
        let mut doc = notebook();
        let batch_id = doc
            .enqueue_run_all(RunAllSource::Schedule {
                schedule_id: "nightly".into(),
            })
            .unwrap();
        let batch = doc.batch(&batch_id).unwrap().unwrap();
        assert_eq!(batch.schedule_id.as_deref(), Some("nightly"));
        assert!(batch.items.iter().all(|item| item.user_id.is_none()));
    }

    #[test]
    fn test_enqueue_block_group_runs_code_tabs() {
        let mut doc = notebook();
        let batch_id = doc.enqueue_block_group("g1", None).unwrap().unwrap();
        let batch = doc.batch(&batch_id).unwrap().unwrap();
        let targets: Vec<_> = batch.items.iter().map(|i| i.block_id.as_str()).collect();
        assert_eq!(targets, vec!["sql", "py"]);

        assert!(doc.enqueue_block_group("g2", None).unwrap().is_none());
        assert!(doc.enqueue_block_group("missing", None).unwrap().is_none());
    }

    #[test]
    fn test_item_status_transitions() {
        let mut doc = notebook();
        let batch_id = doc.enqueue_run_all(RunAllSource::User(None)).unwrap();
        let batch = doc.batch(&batch_id).unwrap().unwrap();
        let first = batch.item_ref(&batch.items[0]);

        assert!(doc.set_item_running(&first).unwrap());
        let batch = doc.batch(&batch_id).unwrap().unwrap();
        assert_eq!(batch.status(), BatchStatus::Running);
        assert_eq!(batch.remaining(), 3);

        doc.set_item_completed(&first, CompletedOutcome::Success).unwrap();
        let batch = doc.batch(&batch_id).unwrap().unwrap();
        assert_eq!(batch.remaining(), 2);
        assert_eq!(batch.current().unwrap().block_id, "py");
        assert_eq!(batch.status(), BatchStatus::Enqueued);
    }

    #[test]
    fn test_abort_batch_skips_completed() {
        let mut doc = notebook();
        let batch_id = doc.enqueue_run_all(RunAllSource::User(None)).unwrap();
        let batch = doc.batch(&batch_id).unwrap().unwrap();
        let first = batch.item_ref(&batch.items[0]);
        doc.set_item_completed(&first, CompletedOutcome::Error).unwrap();

        assert!(doc.abort_batch(&batch_id).unwrap());
        let batch = doc.batch(&batch_id).unwrap().unwrap();
        assert_eq!(
            batch.items[0].complete_status(),
            Some(CompletedOutcome::Error)
        );
        assert!(batch.items[1..]
            .iter()
            .all(|item| item.status == ItemStatus::Aborting));
        assert_eq!(batch.status(), BatchStatus::Aborting);
    }

    #[test]
    fn test_completed_batch_has_no_current() {
        let mut doc = notebook();
        let batch_id = doc.enqueue_block_group("g1", None).unwrap().unwrap();
        let batch = doc.batch(&batch_id).unwrap().unwrap();
        for item in &batch.items {
            doc.set_item_completed(&batch.item_ref(item), CompletedOutcome::Success)
                .unwrap();
        }
        let batch = doc.batch(&batch_id).unwrap().unwrap();
        assert!(batch.current().is_none());
        assert_eq!(batch.status(), BatchStatus::Completed);
        assert_eq!(batch.remaining(), 0);
    }

    #[test]
    fn test_block_executions_filter_by_tag() {
        let mut doc = notebook();
        doc.enqueue_block("sql", None, ItemMetadata::SqlRenameDataframe)
            .unwrap();
        doc.enqueue_run_all(RunAllSource::User(None)).unwrap();

        assert_eq!(doc.block_executions("sql", None).unwrap().len(), 2);
        let renames = doc
            .block_executions("sql", Some(MetadataTag::SqlRenameDataframe))
            .unwrap();
        assert_eq!(renames.len(), 1);
        assert_eq!(
            doc.item_status(&renames[0].item_ref()).unwrap(),
            Some(ItemStatus::Enqueued)
        );
    }

    #[test]
    fn test_remove_batch_item() {
        let mut doc = notebook();
        let batch_id = doc.enqueue_run_all(RunAllSource::User(None)).unwrap();
        assert!(doc.remove_batch_item(&batch_id, "py").unwrap());
        assert!(!doc.remove_batch_item(&batch_id, "py").unwrap());
        assert_eq!(doc.batch(&batch_id).unwrap().unwrap().len(), 2);
    }

    #[test]
    fn test_unparseable_status_reads_unknown() {
        let mut doc = notebook();
        let item = doc
            .enqueue_block("sql", None, ItemMetadata::Visualization)
            .unwrap()
            .unwrap();
        let obj = doc.find_item_obj(&item).unwrap().unwrap();
        doc.doc.put(&obj, fields::STATUS, "garbage").unwrap();
        assert_eq!(doc.item_status(&item).unwrap(), Some(ItemStatus::Unknown));
        assert_eq!(
            doc.current_batch().unwrap().unwrap().status(),
            BatchStatus::Unknown
        );
    }

    #[test]
    fn test_claim_keeps_abort_request() {
        let mut doc = notebook();
        let item = doc
            .enqueue_block("py", None, ItemMetadata::Python { is_suggestion: false })
            .unwrap()
            .unwrap();

        doc.set_item_aborting(&item).unwrap();
        assert_eq!(doc.claim_item(&item).unwrap(), Some(ItemStatus::Aborting));
        assert_eq!(doc.item_status(&item).unwrap(), Some(ItemStatus::Aborting));

        let other = doc
            .enqueue_block("sql", None, ItemMetadata::Visualization)
            .unwrap()
            .unwrap();
        assert_eq!(doc.claim_item(&other).unwrap(), Some(ItemStatus::Enqueued));
        assert_eq!(doc.item_status(&other).unwrap(), Some(ItemStatus::Running));
    }

    #[test]
    fn test_malformed_head_batch_does_not_block_queue() {
        let mut doc = notebook();
        let queue = doc.queue_obj().unwrap();
        let junk = doc.doc.insert_object(&queue, 0, ObjType::Map).unwrap();
        doc.doc.put(&junk, "version", 1i64).unwrap();

        let item = doc
            .enqueue_block("py", None, ItemMetadata::Python { is_suggestion: false })
            .unwrap()
            .unwrap();
        let batch = doc.current_batch().unwrap().unwrap();
        assert_eq!(batch.id, item.batch_id);

        doc.advance_queue().unwrap();
        assert!(doc.current_batch().unwrap().is_none());
        assert_eq!(doc.doc.length(&queue), 0);
    }
}
