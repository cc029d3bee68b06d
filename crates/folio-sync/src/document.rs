//! Automerge document backing one notebook
//!
//! The NotebookDocument stores:
//! - The notebook title
//! - Blocks keyed by id, each a flat map of its attributes
//! - The layout (ordered block groups, each an ordered list of tabs)
//! - The dataframe registry
//! - The execution queue (see [`crate::queue`])

use std::collections::{BTreeMap, BTreeSet};

use automerge::transaction::{CommitOptions, Transactable};
use automerge::{ActorId, AutoCommit, ChangeHash, ObjId, ObjType, ReadDoc, ScalarValue, Value, ROOT};
use folio_core::BlockKind;
use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::json::{map_to_json, put_json, read_json};

/// Keys used in the Automerge document structure
pub(crate) mod keys {
    pub const TITLE: &str = "title";
    pub const BLOCKS: &str = "blocks";
    pub const LAYOUT: &str = "layout";
    pub const DATAFRAMES: &str = "dataframes";
    pub const EXECUTION_QUEUE: &str = "executionQueue";

    pub const ID: &str = "id";
    pub const TYPE: &str = "type";
    pub const CURRENT: &str = "current";
    pub const TABS: &str = "tabs";
    pub const NAME: &str = "name";
    pub const COLUMNS: &str = "columns";
    pub const BLOCK_ID: &str = "blockId";
}

/// Actor that authors the initial schema change.
///
/// Every process creates the root objects with the same actor, timestamp and
/// operations, so independently created documents share one initial change
/// and their root objects never conflict when merged.
const SCHEMA_ACTOR: &[u8; 16] = b"folio-schema-v01";

const ROOT_OBJECTS: [(&str, ObjType); 4] = [
    (keys::BLOCKS, ObjType::Map),
    (keys::LAYOUT, ObjType::List),
    (keys::DATAFRAMES, ObjType::Map),
    (keys::EXECUTION_QUEUE, ObjType::List),
];

/// Raw change hash, as carried on the wire
pub type HeadHash = [u8; 32];

/// Snapshot of one block
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: String,
    /// Stored type tag; may be a tag this build does not know
    pub type_tag: String,
    pub attrs: Map<String, Json>,
}

impl Block {
    pub fn new(id: impl Into<String>, kind: BlockKind) -> Self {
        Self {
            id: id.into(),
            type_tag: kind.as_str().to_string(),
            attrs: Map::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: Json) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    pub fn kind(&self) -> Option<BlockKind> {
        BlockKind::parse(&self.type_tag).ok()
    }

    pub fn attr(&self, key: &str) -> Option<&Json> {
        self.attrs.get(key)
    }

    fn from_json(key: &str, value: Json) -> Self {
        let mut attrs = match value {
            Json::Object(map) => map,
            _ => Map::new(),
        };
        let id = match attrs.remove(keys::ID) {
            Some(Json::String(id)) => id,
            _ => key.to_string(),
        };
        let type_tag = match attrs.remove(keys::TYPE) {
            Some(Json::String(tag)) => tag,
            _ => String::new(),
        };
        Self {
            id,
            type_tag,
            attrs,
        }
    }
}

/// Snapshot of one layout group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGroup {
    pub id: String,
    /// Currently selected tab
    pub current: Option<String>,
    /// Block ids, in tab order
    pub tabs: Vec<String>,
}

impl BlockGroup {
    /// Group holding a single tab
    pub fn single(id: impl Into<String>, block_id: impl Into<String>) -> Self {
        let block_id = block_id.into();
        Self {
            id: id.into(),
            current: Some(block_id.clone()),
            tabs: vec![block_id],
        }
    }

    fn from_json(value: &Json) -> Option<Self> {
        let id = value.get(keys::ID)?.as_str()?.to_string();
        let current = value
            .get(keys::CURRENT)
            .and_then(Json::as_str)
            .map(str::to_string);
        let tabs = value
            .get(keys::TABS)
            .and_then(Json::as_array)
            .map(|tabs| {
                tabs.iter()
                    .filter_map(Json::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self { id, current, tabs })
    }
}

/// Automerge document backing one notebook session
///
/// Document structure:
/// ```json
/// {
///   "title": "...",
///   "blocks": { "<blockId>": { "id": "...", "type": "SQL", ...attrs } },
///   "layout": [ { "id": "...", "current": "<blockId>", "tabs": ["<blockId>"] } ],
///   "dataframes": { "<name>": { "name": "...", "columns": [...], "blockId": "..." } },
///   "executionQueue": [ <batch>, ... ]
/// }
/// ```
pub struct NotebookDocument {
    pub(crate) doc: AutoCommit,
}

impl NotebookDocument {
    // ObjIds are looked up on every access; they go stale after merges.

    pub(crate) fn root_obj(&self, key: &'static str) -> SyncResult<ObjId> {
        match self.doc.get(ROOT, key)? {
            Some((Value::Object(_), id)) => Ok(id),
            _ => Err(SyncError::MissingObject(key.to_string())),
        }
    }

    /// Create a new empty notebook with the shared schema
    pub fn new() -> SyncResult<Self> {
        let mut doc = AutoCommit::new().with_actor(ActorId::from(SCHEMA_ACTOR.to_vec()));
        doc.put(ROOT, keys::TITLE, "")?;
        for (key, obj_type) in ROOT_OBJECTS {
            doc.put_object(ROOT, key, obj_type)?;
        }
        doc.commit_with(CommitOptions::default().with_time(0));
        doc.set_actor(ActorId::random());
        Ok(Self { doc })
    }

    /// Load from stored bytes; empty bytes yield a new notebook
    pub fn load(bytes: &[u8]) -> SyncResult<Self> {
        if bytes.is_empty() {
            return Self::new();
        }
        let doc = AutoCommit::load(bytes).map_err(|e| SyncError::DocumentLoad(e.to_string()))?;
        let mut loaded = Self { doc };
        loaded.ensure_schema()?;
        Ok(loaded)
    }

    fn ensure_schema(&mut self) -> SyncResult<()> {
        if self.doc.get(ROOT, keys::TITLE)?.is_none() {
            self.doc.put(ROOT, keys::TITLE, "")?;
        }
        for (key, obj_type) in ROOT_OBJECTS {
            if self.doc.get(ROOT, key)?.is_none() {
                debug!(key, "creating missing root object");
                self.doc.put_object(ROOT, key, obj_type)?;
            }
        }
        Ok(())
    }

    /// Export the full document state
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Export every change the holder of `heads` is missing
    pub fn save_after(&mut self, heads: &[HeadHash]) -> Vec<u8> {
        let heads: Vec<ChangeHash> = heads.iter().map(|h| ChangeHash(*h)).collect();
        self.doc.save_after(&heads)
    }

    pub fn heads(&mut self) -> Vec<HeadHash> {
        self.doc.get_heads().into_iter().map(|h| h.0).collect()
    }

    /// Apply incremental bytes produced by another replica
    ///
    /// Returns whether the document changed.
    pub fn apply_update(&mut self, bytes: &[u8]) -> SyncResult<bool> {
        let before = self.doc.get_heads();
        self.doc
            .load_incremental(bytes)
            .map_err(|e| SyncError::SyncMerge(e.to_string()))?;
        Ok(self.doc.get_heads() != before)
    }

    /// Run a local transaction and return its incremental encoding
    ///
    /// The returned bytes are empty when `f` changed nothing. A failing `f`
    /// rolls back every operation it made.
    pub fn transact<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> SyncResult<T>,
    ) -> SyncResult<(T, Vec<u8>)> {
        let before = self.doc.get_heads();
        let out = match f(self) {
            Ok(out) => out,
            Err(e) => {
                self.doc.rollback();
                return Err(e);
            }
        };
        let after = self.doc.get_heads();
        let update = if after == before {
            Vec::new()
        } else {
            self.doc.save_after(&before)
        };
        Ok((out, update))
    }

    /// Independent copy with its own actor
    pub fn fork(&mut self) -> Self {
        Self {
            doc: self.doc.fork(),
        }
    }

    /// Merge another notebook into this one
    pub fn merge(&mut self, other: &mut NotebookDocument) -> SyncResult<()> {
        self.doc
            .merge(&mut other.doc)
            .map_err(|e| SyncError::SyncMerge(e.to_string()))?;
        Ok(())
    }

    /// Rebuild the current content into a document with no history
    pub fn without_history(&self) -> SyncResult<Self> {
        let mut fresh = Self::new()?;
        fresh.set_title(&self.title()?)?;

        for (key, value) in self.root_map_entries(keys::BLOCKS)? {
            let target = fresh.root_obj(keys::BLOCKS)?;
            put_json(&mut fresh.doc, &target, &key, &value)?;
        }
        for (key, value) in self.root_map_entries(keys::DATAFRAMES)? {
            let target = fresh.root_obj(keys::DATAFRAMES)?;
            put_json(&mut fresh.doc, &target, &key, &value)?;
        }
        for list_key in [keys::LAYOUT, keys::EXECUTION_QUEUE] {
            let source = self.root_obj(list_key)?;
            let items = crate::json::list_to_json(&self.doc, &source)?;
            let target = fresh.root_obj(list_key)?;
            if let Json::Array(items) = items {
                for (index, item) in items.iter().enumerate() {
                    crate::json::insert_json(&mut fresh.doc, &target, index, item)?;
                }
            }
        }
        Ok(fresh)
    }

    fn root_map_entries(&self, key: &'static str) -> SyncResult<Vec<(String, Json)>> {
        let obj = self.root_obj(key)?;
        match map_to_json(&self.doc, &obj)? {
            Json::Object(map) => Ok(map.into_iter().collect()),
            _ => Ok(Vec::new()),
        }
    }

    /// Whole document as JSON
    pub fn to_json(&self) -> SyncResult<Json> {
        map_to_json(&self.doc, &ROOT)
    }

    // ===== Title =====

    pub fn title(&self) -> SyncResult<String> {
        Ok(match read_json(&self.doc, &ROOT, keys::TITLE)? {
            Some(Json::String(title)) => title,
            _ => String::new(),
        })
    }

    pub fn set_title(&mut self, title: &str) -> SyncResult<()> {
        self.doc.put(ROOT, keys::TITLE, title)?;
        Ok(())
    }

    // ===== Blocks =====

    /// Every block, keyed by id
    pub fn blocks(&self) -> SyncResult<BTreeMap<String, Block>> {
        Ok(self
            .root_map_entries(keys::BLOCKS)?
            .into_iter()
            .map(|(key, value)| {
                let block = Block::from_json(&key, value);
                (key, block)
            })
            .collect())
    }

    pub fn block_ids(&self) -> SyncResult<BTreeSet<String>> {
        let blocks = self.root_obj(keys::BLOCKS)?;
        Ok(self.doc.keys(&blocks).collect())
    }

    pub fn block(&self, id: &str) -> SyncResult<Option<Block>> {
        let blocks = self.root_obj(keys::BLOCKS)?;
        Ok(read_json(&self.doc, &blocks, id)?.map(|value| Block::from_json(id, value)))
    }

    /// Insert a block, replacing any block with the same id
    pub fn upsert_block(&mut self, block: &Block) -> SyncResult<()> {
        let blocks = self.root_obj(keys::BLOCKS)?;
        let obj = self.doc.put_object(&blocks, block.id.as_str(), ObjType::Map)?;
        self.doc.put(&obj, keys::ID, block.id.as_str())?;
        self.doc.put(&obj, keys::TYPE, block.type_tag.as_str())?;
        for (key, value) in &block.attrs {
            put_json(&mut self.doc, &obj, key, value)?;
        }
        Ok(())
    }

    /// Set one attribute of an existing block
    pub fn set_block_attr(&mut self, id: &str, key: &str, value: &Json) -> SyncResult<()> {
        let blocks = self.root_obj(keys::BLOCKS)?;
        let obj = match self.doc.get(&blocks, id)? {
            Some((Value::Object(ObjType::Map), obj)) => obj,
            _ => return Err(SyncError::BlockNotFound(id.to_string())),
        };
        put_json(&mut self.doc, &obj, key, value)
    }

    pub fn remove_block(&mut self, id: &str) -> SyncResult<bool> {
        let blocks = self.root_obj(keys::BLOCKS)?;
        if self.doc.get(&blocks, id)?.is_none() {
            return Ok(false);
        }
        self.doc.delete(&blocks, id)?;
        Ok(true)
    }

    // ===== Layout =====

    /// Layout groups in display order
    pub fn layout(&self) -> SyncResult<Vec<BlockGroup>> {
        let layout = self.root_obj(keys::LAYOUT)?;
        let mut groups = Vec::new();
        for index in 0..self.doc.length(&layout) {
            if let Some(group) = read_json(&self.doc, &layout, index)?
                .as_ref()
                .and_then(BlockGroup::from_json)
            {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    pub fn block_group(&self, id: &str) -> SyncResult<Option<BlockGroup>> {
        Ok(self.layout()?.into_iter().find(|group| group.id == id))
    }

    /// Append a group at the end of the layout
    pub fn push_block_group(&mut self, group: &BlockGroup) -> SyncResult<()> {
        let layout = self.root_obj(keys::LAYOUT)?;
        let index = self.doc.length(&layout);
        let obj = self.doc.insert_object(&layout, index, ObjType::Map)?;
        self.doc.put(&obj, keys::ID, group.id.as_str())?;
        match &group.current {
            Some(current) => self.doc.put(&obj, keys::CURRENT, current.as_str())?,
            None => self.doc.put(&obj, keys::CURRENT, ScalarValue::Null)?,
        }
        let tabs = self.doc.put_object(&obj, keys::TABS, ObjType::List)?;
        for (i, tab) in group.tabs.iter().enumerate() {
            self.doc.insert(&tabs, i, tab.as_str())?;
        }
        Ok(())
    }

    pub fn remove_block_group(&mut self, id: &str) -> SyncResult<bool> {
        let layout = self.root_obj(keys::LAYOUT)?;
        for index in 0..self.doc.length(&layout) {
            let group_id = read_json(&self.doc, &layout, index)?
                .and_then(|group| group.get(keys::ID).cloned());
            if group_id.as_ref().and_then(Json::as_str) == Some(id) {
                self.doc.delete(&layout, index)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Insert a block and give it its own layout group
    pub fn append_block(&mut self, block: &Block) -> SyncResult<String> {
        let group_id = uuid::Uuid::new_v4().to_string();
        self.upsert_block(block)?;
        self.push_block_group(&BlockGroup::single(group_id.clone(), block.id.clone()))?;
        Ok(group_id)
    }

    // ===== Dataframes =====

    /// Registered dataframes keyed by name
    pub fn dataframes(&self) -> SyncResult<BTreeMap<String, Json>> {
        Ok(self.root_map_entries(keys::DATAFRAMES)?.into_iter().collect())
    }

    /// Merge the dataframes a block run produced into the registry
    ///
    /// New frames are tagged with `current_block_id`. Known frames are
    /// rewritten only when their columns changed. Frames missing from `new`
    /// are dropped when their owning block is gone or is the block that just
    /// ran.
    pub fn update_dataframes(&mut self, new: &[Json], current_block_id: &str) -> SyncResult<()> {
        let existing = self.dataframes()?;
        let blocks = self.block_ids()?;
        let registry = self.root_obj(keys::DATAFRAMES)?;

        let mut incoming = BTreeSet::new();
        for frame in new {
            let Some(name) = frame.get(keys::NAME).and_then(Json::as_str) else {
                continue;
            };
            incoming.insert(name.to_string());

            let mut frame = frame.clone();
            match existing.get(name) {
                None => {
                    set_block_id(&mut frame, current_block_id);
                    put_json(&mut self.doc, &registry, name, &frame)?;
                }
                Some(previous) => {
                    if previous.get(keys::COLUMNS) == frame.get(keys::COLUMNS) {
                        continue;
                    }
                    if frame.get(keys::BLOCK_ID).and_then(Json::as_str).is_none() {
                        set_block_id(&mut frame, current_block_id);
                    }
                    put_json(&mut self.doc, &registry, name, &frame)?;
                }
            }
        }

        for (name, frame) in &existing {
            if incoming.contains(name) {
                continue;
            }
            let Some(owner) = frame.get(keys::BLOCK_ID).and_then(Json::as_str) else {
                continue;
            };
            if !blocks.contains(owner) || owner == current_block_id {
                self.doc.delete(&registry, name.as_str())?;
            }
        }
        Ok(())
    }
}

fn set_block_id(frame: &mut Json, block_id: &str) {
    if let Json::Object(map) = frame {
        map.insert(keys::BLOCK_ID.to_string(), Json::String(block_id.to_string()));
    }
}

impl std::fmt::Debug for NotebookDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookDocument").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sql_block(id: &str) -> Block {
        Block::new(id, BlockKind::Sql).with_attr("source", json!("select 1"))
    }

    #[test]
    fn test_new_documents_share_schema() {
        let mut a = NotebookDocument::new().unwrap();
        let mut b = NotebookDocument::new().unwrap();
        assert_eq!(a.heads(), b.heads());

        a.append_block(&sql_block("b1")).unwrap();
        b.append_block(&sql_block("b2")).unwrap();
        a.merge(&mut b).unwrap();

        let ids = a.block_ids().unwrap();
        assert!(ids.contains("b1"));
        assert!(ids.contains("b2"));
        assert_eq!(a.layout().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_bytes_load_new_document() {
        let doc = NotebookDocument::load(&[]).unwrap();
        assert!(doc.blocks().unwrap().is_empty());
        assert_eq!(doc.title().unwrap(), "");
    }

    #[test]
    fn test_save_and_load() {
        let mut doc = NotebookDocument::new().unwrap();
        doc.set_title("Revenue").unwrap();
        doc.append_block(&sql_block("b1")).unwrap();

        let bytes = doc.save();
        let loaded = NotebookDocument::load(&bytes).unwrap();
        assert_eq!(loaded.title().unwrap(), "Revenue");
        let block = loaded.block("b1").unwrap().unwrap();
        assert_eq!(block.kind(), Some(BlockKind::Sql));
        assert_eq!(block.attr("source"), Some(&json!("select 1")));
    }

    #[test]
    fn test_transact_returns_incremental_update() {
        let mut origin = NotebookDocument::new().unwrap();
        let mut replica = NotebookDocument::load(&origin.save()).unwrap();

        let ((), update) = origin
            .transact(|doc| doc.upsert_block(&sql_block("b1")))
            .unwrap();
        assert!(!update.is_empty());

        assert!(replica.apply_update(&update).unwrap());
        assert!(replica.block("b1").unwrap().is_some());
        assert!(!replica.apply_update(&update).unwrap());
    }

    #[test]
    fn test_transact_without_changes_is_empty() {
        let mut doc = NotebookDocument::new().unwrap();
        let (title, update) = doc.transact(|doc| doc.title()).unwrap();
        assert_eq!(title, "");
        assert!(update.is_empty());
    }

    #[test]
    fn test_transact_failure_rolls_back() {
        let mut doc = NotebookDocument::new().unwrap();
        let result = doc.transact(|doc| {
            doc.upsert_block(&sql_block("b1"))?;
            doc.set_block_attr("missing", "x", &json!(1))
        });
        assert!(matches!(result, Err(SyncError::BlockNotFound(_))));
        assert!(doc.block("b1").unwrap().is_none());
    }

    #[test]
    fn test_save_after_heads() {
        let mut a = NotebookDocument::new().unwrap();
        let mut b = NotebookDocument::load(&a.save()).unwrap();
        a.append_block(&sql_block("b1")).unwrap();

        let diff = a.save_after(&b.heads());
        assert!(b.apply_update(&diff).unwrap());
        assert_eq!(a.heads(), b.heads());
    }

    #[test]
    fn test_without_history_keeps_content() {
        let mut doc = NotebookDocument::new().unwrap();
        doc.set_title("t").unwrap();
        for i in 0..5 {
            doc.append_block(&sql_block(&format!("b{i}"))).unwrap();
        }
        for round in 0..10 {
            doc.set_block_attr("b0", "source", &json!(format!("select {round}")))
                .unwrap();
        }
        let compact = doc.without_history().unwrap();
        assert_eq!(compact.to_json().unwrap(), doc.to_json().unwrap());
    }

    #[test]
    fn test_remove_block_group() {
        let mut doc = NotebookDocument::new().unwrap();
        let group = doc.append_block(&sql_block("b1")).unwrap();
        assert!(doc.remove_block_group(&group).unwrap());
        assert!(!doc.remove_block_group(&group).unwrap());
        assert!(doc.layout().unwrap().is_empty());
    }

    #[test]
    fn test_update_dataframes() {
        let mut doc = NotebookDocument::new().unwrap();
        doc.upsert_block(&Block::new("py1", BlockKind::Python)).unwrap();
        doc.upsert_block(&Block::new("py2", BlockKind::Python)).unwrap();

        doc.update_dataframes(
            &[
                json!({"name": "sales", "columns": ["a"]}),
                json!({"name": "users", "columns": ["id"]}),
            ],
            "py1",
        )
        .unwrap();
        let frames = doc.dataframes().unwrap();
        assert_eq!(frames["sales"]["blockId"], json!("py1"));
        assert_eq!(frames.len(), 2);

        // py2 redefines sales with new columns; users is owned by py1 so it stays
        doc.update_dataframes(&[json!({"name": "sales", "columns": ["a", "b"]})], "py2")
            .unwrap();
        let frames = doc.dataframes().unwrap();
        assert_eq!(frames["sales"]["columns"], json!(["a", "b"]));
        assert_eq!(frames["sales"]["blockId"], json!("py2"));
        assert!(frames.contains_key("users"));

        // py1 no longer defines users
        doc.update_dataframes(&[], "py1").unwrap();
        assert!(!doc.dataframes().unwrap().contains_key("users"));

        // owner block deleted
        doc.remove_block("py2").unwrap();
        doc.update_dataframes(&[], "py1").unwrap();
        assert!(doc.dataframes().unwrap().is_empty());
    }
}
