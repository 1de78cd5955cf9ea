//! Transactions with nested savepoints.
//!
//! The outermost [`TransactionManager::begin`] opens a transaction; each
//! nested `begin` opens a savepoint named `sp_<depth>`. Every `begin`
//! returns a [`TransactionScope`] that must be closed innermost first with
//! [`TransactionManager::commit`] or [`TransactionManager::rollback`].
//! Committing a nested scope releases its savepoint; rolling it back undoes
//! only the work done since that savepoint.
//!
//! A failed commit rolls its level back before returning the error, so the
//! tracked state always matches the database.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BrainError;

#[async_trait]
pub trait TransactionExecutor: Send + Sync {
    async fn begin(&self) -> Result<(), BrainError>;
    async fn commit(&self) -> Result<(), BrainError>;
    async fn rollback(&self) -> Result<(), BrainError>;
    async fn create_savepoint(&self, name: &str) -> Result<(), BrainError>;
    async fn release_savepoint(&self, name: &str) -> Result<(), BrainError>;
    async fn rollback_to_savepoint(&self, name: &str) -> Result<(), BrainError>;
    /// Run one statement; returns rows affected.
    async fn execute(&self, sql: &str) -> Result<u64, BrainError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionState {
    pub active: bool,
    pub depth: usize,
    pub savepoints: Vec<String>,
}

/// Handle for one open level. Not `Clone`: each level closes exactly once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a transaction scope must be committed or rolled back"]
pub struct TransactionScope {
    depth: usize,
}

impl TransactionScope {
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_nested(&self) -> bool {
        self.depth > 1
    }
}

pub struct TransactionManager<'a> {
    executor: &'a dyn TransactionExecutor,
    state: TransactionState,
}

impl<'a> TransactionManager<'a> {
    pub fn new(executor: &'a dyn TransactionExecutor) -> Self {
        Self {
            executor,
            state: TransactionState::default(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state.clone()
    }

    pub async fn begin(&mut self) -> Result<TransactionScope, BrainError> {
        if self.state.active {
            let name = format!("sp_{}", self.state.depth + 1);
            self.executor.create_savepoint(&name).await?;
            self.state.depth += 1;
            self.state.savepoints.push(name);
        } else {
            self.executor.begin().await?;
            self.state.active = true;
            self.state.depth = 1;
        }
        Ok(TransactionScope {
            depth: self.state.depth,
        })
    }

    pub async fn commit(&mut self, scope: TransactionScope) -> Result<(), BrainError> {
        self.check_innermost(&scope)?;
        if scope.is_nested() {
            let name = self.innermost_savepoint();
            if let Err(release_error) = self.executor.release_savepoint(&name).await {
                self.executor.rollback_to_savepoint(&name).await?;
                self.pop_savepoint();
                return Err(release_error);
            }
            self.pop_savepoint();
        } else if let Err(commit_error) = self.executor.commit().await {
            self.reset();
            self.executor.rollback().await?;
            return Err(commit_error);
        } else {
            self.reset();
        }
        Ok(())
    }

    pub async fn rollback(&mut self, scope: TransactionScope) -> Result<(), BrainError> {
        self.check_innermost(&scope)?;
        if scope.is_nested() {
            let name = self.innermost_savepoint();
            let result = self.executor.rollback_to_savepoint(&name).await;
            self.pop_savepoint();
            result
        } else {
            let result = self.executor.rollback().await;
            self.reset();
            result
        }
    }

    /// Run `sql` inside the open transaction.
    pub async fn execute(&self, sql: &str) -> Result<u64, BrainError> {
        if !self.state.active {
            return Err(BrainError::transaction("cannot execute outside an active transaction")
                .with_context("depth", self.state.depth));
        }
        self.executor.execute(sql).await
    }

    fn check_innermost(&self, scope: &TransactionScope) -> Result<(), BrainError> {
        if !self.state.active || scope.depth != self.state.depth {
            return Err(BrainError::transaction("scope is not the innermost open level")
                .with_context("scope_depth", scope.depth)
                .with_context("depth", self.state.depth));
        }
        Ok(())
    }

    fn innermost_savepoint(&self) -> String {
        self.state.savepoints.last().cloned().unwrap_or_default()
    }

    fn pop_savepoint(&mut self) {
        self.state.savepoints.pop();
        self.state.depth -= 1;
    }

    fn reset(&mut self) {
        self.state = TransactionState::default();
    }
}
