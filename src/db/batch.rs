//! Batch splitting.
//!
//! A large multi-row write is partitioned into contiguous groups so that no
//! physical statement exceeds the provider's rows-per-statement or
//! bind-parameters-per-statement limit. Groups follow input order, cover every
//! row exactly once, and are greedy: a group closes when it reaches the row
//! limit or when the next row would push it over the parameter limit. A single
//! row that alone exceeds the parameter limit forms its own group and is
//! flagged `oversized`.
//!
//! The execution helpers come in a closure-based sync flavor and an async
//! flavor with identical aggregation:
//! - affrows: the sum over groups; the first error aborts and is returned as-is.
//! - identity: every group but the last executes as affrows, the last group
//!   returns the identity.
//! - inserted: every group executes as affrows and the input rows come back.

use crate::error::DbResult;
use crate::models::DatabaseType;
use std::future::Future;
use std::ops::Range;

/// Caller-facing per-statement limits; `None` falls back to the provider default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_rows: Option<usize>,
    pub max_params: Option<usize>,
}

impl BatchLimits {
    pub fn new(max_rows: Option<usize>, max_params: Option<usize>) -> Self {
        Self {
            max_rows,
            max_params,
        }
    }

    /// No limits at all; every batch is a single statement.
    pub fn unbounded() -> Self {
        Self::new(Some(usize::MAX), Some(usize::MAX))
    }

    /// The provider's safe defaults.
    pub fn for_database(db_type: DatabaseType) -> Self {
        Self::new(
            Some(db_type.default_batch_rows()),
            Some(db_type.default_batch_params()),
        )
    }

    /// Fill unset (or zero) limits from `fallback`.
    pub fn or(self, fallback: BatchLimits) -> Self {
        let pick = |own: Option<usize>, other: Option<usize>| own.filter(|&n| n > 0).or(other);
        Self {
            max_rows: pick(self.max_rows, fallback.max_rows),
            max_params: pick(self.max_params, fallback.max_params),
        }
    }

    /// Effective `(rows, params)` limits, unset meaning unbounded.
    pub fn resolve(&self) -> (usize, usize) {
        (
            self.max_rows.filter(|&n| n > 0).unwrap_or(usize::MAX),
            self.max_params.filter(|&n| n > 0).unwrap_or(usize::MAX),
        )
    }
}

/// One contiguous group of rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchGroup {
    pub start: usize,
    pub len: usize,
    /// Bind parameters the group's statement will carry
    pub params: usize,
    /// A single row whose own parameters exceed the parameter limit
    pub oversized: bool,
}

impl BatchGroup {
    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.len
    }
}

/// A complete partition of a row sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    groups: Vec<BatchGroup>,
    total_rows: usize,
}

impl BatchPlan {
    /// Rows per group for uniform rows: `min(max_rows, max_params / params_per_row)`,
    /// never less than one.
    pub fn group_size(params_per_row: usize, max_rows: usize, max_params: usize) -> usize {
        let by_params = if params_per_row == 0 {
            usize::MAX
        } else {
            max_params / params_per_row
        };
        max_rows.min(by_params).max(1)
    }

    /// Partition rows that all carry `params_per_row` parameters.
    pub fn uniform(total_rows: usize, params_per_row: usize, limits: BatchLimits) -> Self {
        Self::from_counts(std::iter::repeat_n(params_per_row, total_rows), limits)
    }

    /// Partition rows by their parameter counts.
    pub fn for_rows<R>(rows: &[R], params_of: impl Fn(&R) -> usize, limits: BatchLimits) -> Self {
        Self::from_counts(rows.iter().map(params_of), limits)
    }

    /// Greedy partition over per-row parameter counts.
    pub fn from_counts(counts: impl IntoIterator<Item = usize>, limits: BatchLimits) -> Self {
        let (max_rows, max_params) = limits.resolve();
        let mut groups = Vec::new();
        let mut current: Option<BatchGroup> = None;
        let mut total_rows = 0;

        for (index, params) in counts.into_iter().enumerate() {
            total_rows += 1;
            if params > max_params {
                groups.extend(current.take());
                groups.push(BatchGroup {
                    start: index,
                    len: 1,
                    params,
                    oversized: true,
                });
                continue;
            }
            match current.as_mut() {
                Some(group) if group.len < max_rows && group.params + params <= max_params => {
                    group.len += 1;
                    group.params += params;
                }
                _ => {
                    groups.extend(current.replace(BatchGroup {
                        start: index,
                        len: 1,
                        params,
                        oversized: false,
                    }));
                }
            }
        }
        groups.extend(current);

        Self { groups, total_rows }
    }

    pub fn groups(&self) -> &[BatchGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn oversized(&self) -> impl Iterator<Item = &BatchGroup> {
        self.groups.iter().filter(|g| g.oversized)
    }

    /// Slice `rows` by the plan. `rows` must be the sequence the plan was built from.
    pub fn split<'a, R>(&'a self, rows: &'a [R]) -> impl Iterator<Item = &'a [R]> + 'a {
        self.groups.iter().map(move |g| &rows[g.range()])
    }

    /// Sync affrows: sum of `exec` over every group.
    pub fn execute_affrows<R>(
        &self,
        rows: &[R],
        mut exec: impl FnMut(&[R]) -> DbResult<u64>,
    ) -> DbResult<u64> {
        let mut total = 0;
        for chunk in self.split(rows) {
            total += exec(chunk)?;
        }
        Ok(total)
    }

    /// Sync identity: affrows for all but the last group, identity for the last.
    pub fn execute_identity<R>(
        &self,
        rows: &[R],
        mut affrows: impl FnMut(&[R]) -> DbResult<u64>,
        identity: impl FnOnce(&[R]) -> DbResult<i64>,
    ) -> DbResult<i64> {
        let Some((last, head)) = self.groups.split_last() else {
            return Ok(0);
        };
        for group in head {
            affrows(&rows[group.range()])?;
        }
        identity(&rows[last.range()])
    }

    /// Sync inserted: affrows for every group, then the input rows.
    pub fn execute_inserted<R: Clone>(
        &self,
        rows: &[R],
        exec: impl FnMut(&[R]) -> DbResult<u64>,
    ) -> DbResult<Vec<R>> {
        self.execute_affrows(rows, exec)?;
        Ok(rows.to_vec())
    }

    /// Async affrows.
    pub async fn execute_affrows_async<'a, R, F, Fut>(
        &self,
        rows: &'a [R],
        mut exec: F,
    ) -> DbResult<u64>
    where
        F: FnMut(&'a [R]) -> Fut,
        Fut: Future<Output = DbResult<u64>>,
    {
        let mut total = 0;
        for group in &self.groups {
            total += exec(&rows[group.range()]).await?;
        }
        Ok(total)
    }

    /// Async identity.
    pub async fn execute_identity_async<'a, R, A, AFut, I, IFut>(
        &self,
        rows: &'a [R],
        mut affrows: A,
        identity: I,
    ) -> DbResult<i64>
    where
        A: FnMut(&'a [R]) -> AFut,
        AFut: Future<Output = DbResult<u64>>,
        I: FnOnce(&'a [R]) -> IFut,
        IFut: Future<Output = DbResult<i64>>,
    {
        let Some((last, head)) = self.groups.split_last() else {
            return Ok(0);
        };
        for group in head {
            affrows(&rows[group.range()]).await?;
        }
        identity(&rows[last.range()]).await
    }

    /// Async inserted.
    pub async fn execute_inserted_async<'a, R, F, Fut>(
        &self,
        rows: &'a [R],
        exec: F,
    ) -> DbResult<Vec<R>>
    where
        R: Clone,
        F: FnMut(&'a [R]) -> Fut,
        Fut: Future<Output = DbResult<u64>>,
    {
        self.execute_affrows_async(rows, exec).await?;
        Ok(rows.to_vec())
    }
}
