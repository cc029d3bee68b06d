//! What a published-app viewer may change
//!
//! A viewer's copy of a published app keeps the published structure: same
//! layout, same blocks, same kinds. Inside a block only a small per-kind
//! set of attributes may move.

use std::collections::BTreeMap;

use folio_core::BlockKind;
use folio_sync::{Block, BlockGroup};
use serde_json::{Map, Value as Json};

use crate::error::{StorageError, StorageResult};

/// Attributes a viewer may change, per block kind
fn mutable_attrs(kind: BlockKind) -> &'static [&'static str] {
    match kind {
        BlockKind::Input | BlockKind::DropdownInput => &["value"],
        BlockKind::DateInput => &["value", "newValue", "status"],
        BlockKind::PivotTable => &["page", "sort"],
        BlockKind::RichText
        | BlockKind::Sql
        | BlockKind::Python
        | BlockKind::Visualization
        | BlockKind::FileUpload
        | BlockKind::DashboardHeader
        | BlockKind::Writeback => &[],
    }
}

fn attrs_equal_except(prev: &Map<String, Json>, next: &Map<String, Json>, skip: &[&str]) -> bool {
    let keep = |(key, _): &(&String, &Json)| !skip.contains(&key.as_str());
    prev.iter().filter(keep).eq(next.iter().filter(keep))
}

/// Whether two layouts have the same groups, selections and tab order
pub fn layout_equal(prev: &[BlockGroup], next: &[BlockGroup]) -> bool {
    prev.len() == next.len()
        && prev
            .iter()
            .zip(next)
            .all(|(p, n)| p.id == n.id && p.current == n.current && p.tabs == n.tabs)
}

/// Whether a single block change is allowed
pub fn block_acceptable(prev: &Block, next: &Block) -> bool {
    if prev.type_tag != next.type_tag {
        return false;
    }
    let Some(kind) = prev.kind() else {
        // unknown kinds are frozen
        return prev.attrs == next.attrs;
    };

    if kind == BlockKind::DateInput && timezone(prev) != timezone(next) {
        return false;
    }
    attrs_equal_except(&prev.attrs, &next.attrs, mutable_attrs(kind))
}

fn timezone(block: &Block) -> Option<&Json> {
    block.attr("value").and_then(|v| v.get("timezone"))
}

/// Whether every block survived unchanged apart from allowed attributes
pub fn blocks_acceptable(prev: &BTreeMap<String, Block>, next: &BTreeMap<String, Block>) -> bool {
    prev.len() == next.len()
        && prev.iter().all(|(id, prev_block)| {
            next.get(id)
                .is_some_and(|next_block| block_acceptable(prev_block, next_block))
        })
}

/// Whether a viewer's block differs in a way worth keeping over a republish
fn user_changed_block(current: &Block, published: &Block) -> bool {
    let (Some(kind), Some(published_kind)) = (current.kind(), published.kind()) else {
        return current.type_tag != published.type_tag;
    };
    if kind != published_kind {
        return true;
    }
    match kind {
        BlockKind::Input | BlockKind::DropdownInput => {
            current.attr("value") != published.attr("value")
        }
        BlockKind::DateInput => !attrs_equal_except(&current.attrs, &published.attrs, &["status"]),
        BlockKind::RichText
        | BlockKind::Sql
        | BlockKind::Python
        | BlockKind::Visualization
        | BlockKind::FileUpload
        | BlockKind::DashboardHeader
        | BlockKind::Writeback
        | BlockKind::PivotTable => false,
    }
}

/// Whether a viewer interacted with any input of the published app
///
/// Fails when an interactive block of the viewer is missing from the
/// published state.
pub fn user_changed_state(
    current: &BTreeMap<String, Block>,
    published: &BTreeMap<String, Block>,
) -> StorageResult<bool> {
    for block in current.values() {
        if !block.kind().is_some_and(BlockKind::is_interactive) {
            continue;
        }
        let published_block = published.get(&block.id).ok_or_else(|| {
            StorageError::Document(format!("block {} not found in published state", block.id))
        })?;
        if user_changed_block(block, published_block) {
            return Ok(true);
        }
    }
    Ok(false)
}
