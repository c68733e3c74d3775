//! Sync actions and their shared lifecycle.
//!
//! Every action runs once, reports through an [`ActionLifecycle`], and can be
//! cancelled through its token. Table-scoped actions (pull, purge) implement
//! [`TableAction`] and are driven by [`run_table_action`].

mod batch;
mod cursor;
mod pull;
mod purge;
mod push;
mod strategy;

pub use batch::OperationBatch;
pub use cursor::PullCursor;
pub use pull::{PullAction, PullStats};
pub use purge::PurgeAction;
pub use push::PushAction;
pub use strategy::{IncrementalState, PullStrategy};

use crate::error::{SyncError, SyncResult};
use crate::queue::OperationQueue;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// State of a sync action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    /// Still running.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by its cancellation token.
    Cancelled,
}

impl ActionState {
    /// Returns true for every state but `Running`.
    pub fn is_terminal(self) -> bool {
        self != ActionState::Running
    }
}

/// Completion signal and cancellation token of one action.
#[derive(Debug)]
pub struct ActionLifecycle {
    name: &'static str,
    state: watch::Sender<ActionState>,
    token: CancellationToken,
}

impl ActionLifecycle {
    /// Creates a running lifecycle.
    pub fn new(name: &'static str, token: CancellationToken) -> Self {
        let (state, _) = watch::channel(ActionState::Running);
        Self { name, state, token }
    }

    /// The action's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Current state.
    pub fn state(&self) -> ActionState {
        *self.state.borrow()
    }

    /// A handle that can await the action's end.
    pub fn completion(&self) -> ActionCompletion {
        ActionCompletion {
            state: self.state.subscribe(),
        }
    }

    /// Fails with `Cancelled` if the token fired.
    pub fn check_cancelled(&self) -> SyncResult<()> {
        if self.token.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Moves to the terminal state matching the result.
    pub fn finish<T>(&self, result: &SyncResult<T>) {
        match result {
            Ok(_) => self.complete(),
            Err(error) => self.fail(error),
        }
    }

    /// Marks the action completed.
    pub fn complete(&self) {
        self.transition(ActionState::Completed);
    }

    /// Marks the action failed, or cancelled if the error is a cancellation.
    pub fn fail(&self, error: &SyncError) {
        let state = if error.is_cancellation() {
            ActionState::Cancelled
        } else {
            ActionState::Failed
        };
        debug!(action = self.name, error = %error, "action ended with error");
        self.transition(state);
    }

    fn transition(&self, next: ActionState) {
        // Only the first terminal state sticks.
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = next;
                true
            }
        });
    }
}

/// Awaitable end of an action.
#[derive(Debug, Clone)]
pub struct ActionCompletion {
    state: watch::Receiver<ActionState>,
}

impl ActionCompletion {
    /// Current state.
    pub fn state(&self) -> ActionState {
        *self.state.borrow()
    }

    /// Waits until the action reaches a terminal state.
    ///
    /// An action dropped without finishing counts as cancelled.
    pub async fn wait(&mut self) -> ActionState {
        loop {
            let state = *self.state.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if self.state.changed().await.is_err() {
                let state = *self.state.borrow();
                return if state.is_terminal() {
                    state
                } else {
                    ActionState::Cancelled
                };
            }
        }
    }
}

/// Decision of a table action about a table with pending operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyTable {
    /// Run anyway.
    Proceed,
    /// Give up the table lock so the caller can push first.
    Defer,
    /// End without doing anything.
    Skip,
}

/// How a table action run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableActionOutcome {
    /// The table was processed.
    Processed,
    /// The table was dirty and the action deferred; run it again after a push.
    Deferred,
    /// The table was dirty and the action skipped it.
    Skipped,
}

/// An action scoped to one table.
#[async_trait]
pub trait TableAction: Send {
    /// Table name.
    fn table(&self) -> &str;

    /// Lifecycle of the action.
    fn lifecycle(&self) -> &ActionLifecycle;

    /// Waits for an action this one depends on.
    async fn wait_for_pending(&mut self) -> SyncResult<()> {
        Ok(())
    }

    /// Decides what to do when the table has pending operations.
    async fn handle_dirty_table(&mut self, queue: &OperationQueue) -> SyncResult<DirtyTable>;

    /// Does the table-specific work. Runs with the table lock held.
    async fn process_table(&mut self) -> SyncResult<()>;
}

/// Drives a table action: wait, lock the table, check for pending
/// operations, process.
///
/// The table lock is released before returning. A deferred action is left
/// running so it can be driven again; every other outcome finishes it.
pub async fn run_table_action<A>(
    action: &mut A,
    queue: &OperationQueue,
) -> SyncResult<TableActionOutcome>
where
    A: TableAction + ?Sized,
{
    let result = drive(action, queue).await;
    match &result {
        Ok(TableActionOutcome::Deferred) => {}
        other => action.lifecycle().finish(other),
    }
    result
}

async fn drive<A>(action: &mut A, queue: &OperationQueue) -> SyncResult<TableActionOutcome>
where
    A: TableAction + ?Sized,
{
    action.lifecycle().check_cancelled()?;
    action.wait_for_pending().await?;

    let table = action.table().to_string();
    let _table_lock = queue
        .lock_table_cancellable(&table, action.lifecycle().token())
        .await?;

    let pending = queue.count_pending(&table);
    if pending > 0 {
        match action.handle_dirty_table(queue).await? {
            DirtyTable::Proceed => {}
            DirtyTable::Defer => {
                debug!(table = %table, pending, "table is dirty, deferring");
                return Ok(TableActionOutcome::Deferred);
            }
            DirtyTable::Skip => {
                debug!(table = %table, pending, "table is dirty, skipping");
                return Ok(TableActionOutcome::Skipped);
            }
        }
    }

    action.lifecycle().check_cancelled()?;
    action.process_table().await?;
    Ok(TableActionOutcome::Processed)
}
