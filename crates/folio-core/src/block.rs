//! Notebook block kinds

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::execution::ItemMetadata;

/// The closed set of block kinds a notebook can contain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockKind {
    RichText,
    Sql,
    Python,
    Visualization,
    Input,
    DropdownInput,
    DateInput,
    FileUpload,
    DashboardHeader,
    Writeback,
    PivotTable,
}

impl BlockKind {
    /// Every block kind, in declaration order
    pub const ALL: [BlockKind; 11] = [
        BlockKind::RichText,
        BlockKind::Sql,
        BlockKind::Python,
        BlockKind::Visualization,
        BlockKind::Input,
        BlockKind::DropdownInput,
        BlockKind::DateInput,
        BlockKind::FileUpload,
        BlockKind::DashboardHeader,
        BlockKind::Writeback,
        BlockKind::PivotTable,
    ];

    /// The tag stored in the replicated document
    pub fn as_str(self) -> &'static str {
        match self {
            BlockKind::RichText => "RICH_TEXT",
            BlockKind::Sql => "SQL",
            BlockKind::Python => "PYTHON",
            BlockKind::Visualization => "VISUALIZATION",
            BlockKind::Input => "INPUT",
            BlockKind::DropdownInput => "DROPDOWN_INPUT",
            BlockKind::DateInput => "DATE_INPUT",
            BlockKind::FileUpload => "FILE_UPLOAD",
            BlockKind::DashboardHeader => "DASHBOARD_HEADER",
            BlockKind::Writeback => "WRITEBACK",
            BlockKind::PivotTable => "PIVOT_TABLE",
        }
    }

    /// Parse a stored block type tag
    pub fn parse(tag: &str) -> CoreResult<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == tag)
            .ok_or_else(|| CoreError::UnknownBlockKind(tag.to_string()))
    }

    /// Whether a published-app viewer can interact with this block
    pub fn is_interactive(self) -> bool {
        match self {
            BlockKind::Input | BlockKind::DropdownInput | BlockKind::DateInput => true,
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

    /// Metadata used when this block is part of a run-all batch
    ///
    /// Returns `None` for blocks that have nothing to execute.
    pub fn run_metadata(self) -> Option<ItemMetadata> {
        match self {
            BlockKind::Sql => Some(ItemMetadata::Sql {
                is_suggestion: false,
                selected_code: None,
            }),
            BlockKind::Python => Some(ItemMetadata::Python {
                is_suggestion: false,
            }),
            BlockKind::Visualization => Some(ItemMetadata::Visualization),
            BlockKind::Input => Some(ItemMetadata::TextInputSaveValue),
            BlockKind::DropdownInput => Some(ItemMetadata::DropdownInputSaveValue),
            BlockKind::DateInput => Some(ItemMetadata::DateInput),
            BlockKind::Writeback => Some(ItemMetadata::Writeback),
            BlockKind::PivotTable => Some(ItemMetadata::PivotTable),
            BlockKind::RichText | BlockKind::FileUpload | BlockKind::DashboardHeader => None,
        }
    }

    /// Metadata used when this block is run as a tab of a block group
    ///
    /// Only code and visualization tabs are executed as part of a group.
    pub fn group_run_metadata(self) -> Option<ItemMetadata> {
        match self {
            BlockKind::Sql | BlockKind::Python | BlockKind::Visualization => self.run_metadata(),
            BlockKind::Input
            | BlockKind::DropdownInput
            | BlockKind::DateInput
            | BlockKind::Writeback
            | BlockKind::PivotTable
            | BlockKind::RichText
            | BlockKind::FileUpload
            | BlockKind::DashboardHeader => None,
        }
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
