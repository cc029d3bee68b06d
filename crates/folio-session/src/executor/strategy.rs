//! Block execution strategies
//!
//! Running a block is delegated to a [`BlockExecutor`] picked by the item's
//! operation. The executor marks the item running, hands over a
//! [`BlockRun`], and expects the strategy to write its outputs into the
//! block and complete the item before returning.

use std::sync::Arc;

use async_trait::async_trait;
use folio_core::{CompletedOutcome, ItemMetadata, SessionKey};
use folio_sync::{Block, Execution, ItemRef};
use serde_json::Value as Json;
use tokio::sync::watch;
use tracing::warn;

use super::events::ExecutionEvents;
use crate::error::SessionResult;
use crate::session::Session;

/// Runs one kind of block operation
#[async_trait]
pub trait BlockExecutor: Send + Sync + 'static {
    /// Execute `run`, completing its item before returning
    ///
    /// An error marks the item as failed.
    async fn run(&self, run: &BlockRun) -> SessionResult<()>;

    /// Whether no work is outstanding for `key`; a busy strategy keeps
    /// that session alive
    fn is_idle(&self, _key: &SessionKey) -> bool {
        true
    }
}

/// One dispatched execution item
pub struct BlockRun {
    pub session: Arc<Session>,
    pub execution: Execution,
    /// Block as it was when the item was dispatched
    pub block: Block,
    pub metadata: ItemMetadata,
    pub events: ExecutionEvents,
    abort: watch::Receiver<bool>,
}

impl BlockRun {
    pub(crate) fn new(
        session: Arc<Session>,
        execution: Execution,
        block: Block,
        events: ExecutionEvents,
        abort: watch::Receiver<bool>,
    ) -> Self {
        let metadata = execution.item.metadata.clone();
        Self {
            session,
            execution,
            block,
            metadata,
            events,
            abort,
        }
    }

    pub fn item_ref(&self) -> ItemRef {
        self.execution.item_ref()
    }

    /// Whether someone asked for this run to stop
    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Resolves once an abort was requested
    pub async fn aborted(&self) {
        let mut abort = self.abort.clone();
        let _ = abort.wait_for(|aborted| *aborted).await;
    }

    pub async fn set_block_attr(&self, key: &str, value: Json) -> SessionResult<()> {
        let block_id = self.block.id.clone();
        self.session
            .transact(|doc| doc.set_block_attr(&block_id, key, &value))
            .await
    }

    pub async fn complete(&self, outcome: CompletedOutcome) -> SessionResult<bool> {
        let item = self.item_ref();
        self.session
            .transact(|doc| doc.set_item_completed(&item, outcome))
            .await
    }
}

/// Strategy per block operation
#[derive(Clone)]
pub struct ExecutionStrategies {
    pub python: Arc<dyn BlockExecutor>,
    pub sql: Arc<dyn BlockExecutor>,
    pub visualization: Arc<dyn BlockExecutor>,
    pub text_input: Arc<dyn BlockExecutor>,
    pub dropdown_input: Arc<dyn BlockExecutor>,
    pub date_input: Arc<dyn BlockExecutor>,
    pub pivot_table: Arc<dyn BlockExecutor>,
    pub writeback: Arc<dyn BlockExecutor>,
}

impl ExecutionStrategies {
    /// The same strategy for every operation
    pub fn uniform(executor: Arc<dyn BlockExecutor>) -> Self {
        Self {
            python: executor.clone(),
            sql: executor.clone(),
            visualization: executor.clone(),
            text_input: executor.clone(),
            dropdown_input: executor.clone(),
            date_input: executor.clone(),
            pivot_table: executor.clone(),
            writeback: executor,
        }
    }

    pub fn with_python(mut self, executor: Arc<dyn BlockExecutor>) -> Self {
        self.python = executor;
        self
    }

    pub fn with_sql(mut self, executor: Arc<dyn BlockExecutor>) -> Self {
        self.sql = executor;
        self
    }

    pub fn with_visualization(mut self, executor: Arc<dyn BlockExecutor>) -> Self {
        self.visualization = executor;
        self
    }

    /// Strategy for `metadata`; `None` when there is nothing to run
    pub fn for_metadata(&self, metadata: &ItemMetadata) -> Option<&Arc<dyn BlockExecutor>> {
        match metadata {
            ItemMetadata::Python { .. } => Some(&self.python),
            ItemMetadata::Sql { .. } | ItemMetadata::SqlRenameDataframe => Some(&self.sql),
            ItemMetadata::Visualization => Some(&self.visualization),
            ItemMetadata::TextInputSaveValue | ItemMetadata::TextInputRenameVariable => {
                Some(&self.text_input)
            }
            ItemMetadata::DropdownInputSaveValue | ItemMetadata::DropdownInputRenameVariable => {
                Some(&self.dropdown_input)
            }
            ItemMetadata::DateInput => Some(&self.date_input),
            ItemMetadata::PivotTable | ItemMetadata::PivotTableLoadPage => Some(&self.pivot_table),
            ItemMetadata::Writeback => Some(&self.writeback),
            ItemMetadata::Noop => None,
        }
    }

    /// Whether every strategy is done with `key`
    pub fn is_idle(&self, key: &SessionKey) -> bool {
        [
            &self.python,
            &self.sql,
            &self.visualization,
            &self.text_input,
            &self.dropdown_input,
            &self.date_input,
            &self.pivot_table,
            &self.writeback,
        ]
        .iter()
        .all(|executor| executor.is_idle(key))
    }
}

impl Default for ExecutionStrategies {
    fn default() -> Self {
        Self::uniform(Arc::new(UnconfiguredExecutor))
    }
}

/// Fails every run; used when no execution engine is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredExecutor;

#[async_trait]
impl BlockExecutor for UnconfiguredExecutor {
    async fn run(&self, run: &BlockRun) -> SessionResult<()> {
        warn!(
            key = %run.session.key(),
            block_id = %run.block.id,
            operation = ?run.metadata.tag(),
            "No execution engine configured"
        );
        run.set_block_attr("error", Json::String("No execution engine configured".into()))
            .await?;
        run.complete(CompletedOutcome::Error).await?;
        Ok(())
    }
}
