//! Execution queue item status and metadata
//!
//! Both types are stored inside the replicated document as JSON maps with a
//! `_tag` discriminant, so every viewer reads queue progress identically.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block::BlockKind;

/// Terminal outcome of an execution item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletedOutcome {
    Success,
    Error,
    Aborted,
}

impl CompletedOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletedOutcome::Success => "success",
            CompletedOutcome::Error => "error",
            CompletedOutcome::Aborted => "aborted",
        }
    }
}

/// Status of an execution item
///
/// `Unknown` is what a reader sees when the stored status is missing or
/// cannot be parsed, typically an item caught mid-flight by a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all = "lowercase")]
pub enum ItemStatus {
    Enqueued,
    Aborting,
    Running,
    Completed { status: CompletedOutcome },
    Unknown,
}

impl ItemStatus {
    /// Shorthand for a completed status
    pub fn completed(outcome: CompletedOutcome) -> Self {
        ItemStatus::Completed { status: outcome }
    }

    /// The terminal outcome, if the item is complete
    pub fn complete_status(&self) -> Option<CompletedOutcome> {
        match self {
            ItemStatus::Completed { status } => Some(*status),
            ItemStatus::Enqueued
            | ItemStatus::Aborting
            | ItemStatus::Running
            | ItemStatus::Unknown => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.complete_status().is_some()
    }

    /// The `_tag` discriminant
    pub fn tag(&self) -> &'static str {
        match self {
            ItemStatus::Enqueued => "enqueued",
            ItemStatus::Aborting => "aborting",
            ItemStatus::Running => "running",
            ItemStatus::Completed { .. } => "completed",
            ItemStatus::Unknown => "unknown",
        }
    }

    /// Read a stored status, falling back to `Unknown`
    pub fn from_json(value: Option<&Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(ItemStatus::Unknown)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Operation an execution item requests on its block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all = "kebab-case")]
pub enum ItemMetadata {
    Python {
        #[serde(rename = "isSuggestion")]
        is_suggestion: bool,
    },
    Sql {
        #[serde(rename = "isSuggestion")]
        is_suggestion: bool,
        #[serde(rename = "selectedCode")]
        selected_code: Option<String>,
    },
    SqlRenameDataframe,
    Visualization,
    TextInputSaveValue,
    TextInputRenameVariable,
    DropdownInputSaveValue,
    DropdownInputRenameVariable,
    DateInput,
    PivotTable,
    PivotTableLoadPage,
    Writeback,
    Noop,
}

/// Fieldless discriminant of [`ItemMetadata`], used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataTag {
    Python,
    Sql,
    SqlRenameDataframe,
    Visualization,
    TextInputSaveValue,
    TextInputRenameVariable,
    DropdownInputSaveValue,
    DropdownInputRenameVariable,
    DateInput,
    PivotTable,
    PivotTableLoadPage,
    Writeback,
    Noop,
}

impl ItemMetadata {
    pub fn tag(&self) -> MetadataTag {
        match self {
            ItemMetadata::Python { .. } => MetadataTag::Python,
            ItemMetadata::Sql { .. } => MetadataTag::Sql,
            ItemMetadata::SqlRenameDataframe => MetadataTag::SqlRenameDataframe,
            ItemMetadata::Visualization => MetadataTag::Visualization,
            ItemMetadata::TextInputSaveValue => MetadataTag::TextInputSaveValue,
            ItemMetadata::TextInputRenameVariable => MetadataTag::TextInputRenameVariable,
            ItemMetadata::DropdownInputSaveValue => MetadataTag::DropdownInputSaveValue,
            ItemMetadata::DropdownInputRenameVariable => MetadataTag::DropdownInputRenameVariable,
            ItemMetadata::DateInput => MetadataTag::DateInput,
            ItemMetadata::PivotTable => MetadataTag::PivotTable,
            ItemMetadata::PivotTableLoadPage => MetadataTag::PivotTableLoadPage,
            ItemMetadata::Writeback => MetadataTag::Writeback,
            ItemMetadata::Noop => MetadataTag::Noop,
        }
    }

    /// Block kind this operation must target, `None` for `Noop`
    pub fn expected_block_kind(&self) -> Option<BlockKind> {
        match self {
            ItemMetadata::Python { .. } => Some(BlockKind::Python),
            ItemMetadata::Sql { .. } | ItemMetadata::SqlRenameDataframe => Some(BlockKind::Sql),
            ItemMetadata::Visualization => Some(BlockKind::Visualization),
            ItemMetadata::TextInputSaveValue | ItemMetadata::TextInputRenameVariable => {
                Some(BlockKind::Input)
            }
            ItemMetadata::DropdownInputSaveValue | ItemMetadata::DropdownInputRenameVariable => {
                Some(BlockKind::DropdownInput)
            }
            ItemMetadata::DateInput => Some(BlockKind::DateInput),
            ItemMetadata::PivotTable | ItemMetadata::PivotTableLoadPage => {
                Some(BlockKind::PivotTable)
            }
            ItemMetadata::Writeback => Some(BlockKind::Writeback),
            ItemMetadata::Noop => None,
        }
    }

    /// Read stored metadata, falling back to `Noop`
    pub fn from_json(value: Option<&Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(ItemMetadata::Noop)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_json_shape() {
        assert_eq!(ItemStatus::Enqueued.to_json(), json!({"_tag": "enqueued"}));
        assert_eq!(
            ItemStatus::completed(CompletedOutcome::Aborted).to_json(),
            json!({"_tag": "completed", "status": "aborted"})
        );
    }

    #[test]
    fn test_status_missing_or_invalid_is_unknown() {
        assert_eq!(ItemStatus::from_json(None), ItemStatus::Unknown);
        assert_eq!(
            ItemStatus::from_json(Some(&json!({"_tag": "exploded"}))),
            ItemStatus::Unknown
        );
        assert_eq!(
            ItemStatus::from_json(Some(&json!({"_tag": "completed"}))),
            ItemStatus::Unknown
        );
    }

    #[test]
    fn test_complete_status() {
        assert_eq!(ItemStatus::Running.complete_status(), None);
        assert_eq!(
            ItemStatus::completed(CompletedOutcome::Error).complete_status(),
            Some(CompletedOutcome::Error)
        );
        assert!(!ItemStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_metadata_json_shape() {
        let sql = ItemMetadata::Sql {
            is_suggestion: false,
            selected_code: None,
        };
        assert_eq!(
            sql.to_json(),
            json!({"_tag": "sql", "isSuggestion": false, "selectedCode": null})
        );
        assert_eq!(
            ItemMetadata::PivotTableLoadPage.to_json(),
            json!({"_tag": "pivot-table-load-page"})
        );
        assert_eq!(
            ItemMetadata::from_json(Some(&json!({"_tag": "text-input-rename-variable"}))),
            ItemMetadata::TextInputRenameVariable
        );
    }

    #[test]
    fn test_metadata_missing_is_noop() {
        assert_eq!(ItemMetadata::from_json(None), ItemMetadata::Noop);
        assert_eq!(ItemMetadata::Noop.expected_block_kind(), None);
    }

    #[test]
    fn test_expected_block_kind() {
        assert_eq!(
            ItemMetadata::SqlRenameDataframe.expected_block_kind(),
            Some(BlockKind::Sql)
        );
        assert_eq!(
            ItemMetadata::DropdownInputRenameVariable.expected_block_kind(),
            Some(BlockKind::DropdownInput)
        );
    }
}
