//! Batched relation presets.
//!
//! Each preset issues one IN-clause query per batching window and assembles
//! the flat result back onto the parents, in parents order. Parents with no
//! match get an empty list (or None for the singular presets) rather than
//! being dropped.

use std::collections::HashMap;

use super::{BatchItem, BatchKey, LoadError, Loader};
use crate::db::{Database, HasForeignKey, Model, SelectQuery, SqlValue};

/// One-to-many: children carry a foreign key pointing at the parent.
pub struct HasMany<P, C> {
    fk_column: &'static str,
    _phantom: std::marker::PhantomData<(P, C)>,
}

impl<P, C> HasMany<P, C>
where
    P: Model + BatchItem + 'static,
    C: Model + HasForeignKey + 'static,
{
    pub fn new(fk_column: &'static str) -> Self {
        Self {
            fk_column,
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn key() -> BatchKey {
        format!("{}-{}", P::TABLE, C::TABLE)
    }

    /// Load this parent's children through the request's loader.
    pub async fn load(
        &self,
        loader: &Loader,
        db: &Database,
        parent: &P,
    ) -> Result<Vec<C>, LoadError> {
        let fk_column = self.fk_column;
        let db = db.clone();

        let handle = loader.acquire(Self::key(), move |parents: Vec<P>| {
            let db = db.clone();
            async move {
                let rows = fetch_children::<P, C>(&db, fk_column, &parents).await?;
                Ok(assemble(rows, &parents, fk_column))
            }
        });

        handle.load(parent.clone()).await
    }
}

/// One-to-one: like `HasMany`, but each parent gets at most one child.
pub struct HasOne<P, C> {
    fk_column: &'static str,
    _phantom: std::marker::PhantomData<(P, C)>,
}

impl<P, C> HasOne<P, C>
where
    P: Model + BatchItem + 'static,
    C: Model + HasForeignKey + 'static,
{
    pub fn new(fk_column: &'static str) -> Self {
        Self {
            fk_column,
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn key() -> BatchKey {
        format!("{}-{}-one", P::TABLE, C::TABLE)
    }

    pub async fn load(
        &self,
        loader: &Loader,
        db: &Database,
        parent: &P,
    ) -> Result<Option<C>, LoadError> {
        let fk_column = self.fk_column;
        let db = db.clone();

        let handle = loader.acquire(Self::key(), move |parents: Vec<P>| {
            let db = db.clone();
            async move {
                let rows = fetch_children::<P, C>(&db, fk_column, &parents).await?;
                let singles = assemble(rows, &parents, fk_column)
                    .into_iter()
                    .map(|children| children.into_iter().next())
                    .collect();
                Ok(singles)
            }
        });

        handle.load(parent.clone()).await
    }
}

/// Many-to-one: the loaded entity carries the foreign key itself.
pub struct BelongsTo<P, C> {
    fk_column: &'static str,
    _phantom: std::marker::PhantomData<(P, C)>,
}

impl<P, C> BelongsTo<P, C>
where
    P: Model + HasForeignKey + BatchItem + 'static,
    C: Model + 'static,
{
    pub fn new(fk_column: &'static str) -> Self {
        Self {
            fk_column,
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn key() -> BatchKey {
        format!("{}-{}-of", P::TABLE, C::TABLE)
    }

    pub async fn load(
        &self,
        loader: &Loader,
        db: &Database,
        item: &P,
    ) -> Result<Option<C>, LoadError> {
        let fk_column = self.fk_column;
        let db = db.clone();

        let handle = loader.acquire(Self::key(), move |items: Vec<P>| {
            let db = db.clone();
            async move {
                let mut seen = Vec::new();
                let mut fk_values = Vec::new();
                for item in &items {
                    if let Some(value) = item.fk_value(fk_column) {
                        if !seen.contains(&value.key()) {
                            seen.push(value.key());
                            fk_values.push(value);
                        }
                    }
                }

                let rows = SelectQuery::<C>::new()
                    .where_in(C::ID_COLUMN, fk_values)
                    .fetch_all(db.pool())
                    .await?;

                let by_id: HashMap<String, C> = rows
                    .into_iter()
                    .map(|row| (row.id_value().key(), row))
                    .collect();

                let resolved = items
                    .iter()
                    .map(|item| {
                        item.fk_value(fk_column)
                            .and_then(|value| by_id.get(&value.key()).cloned())
                    })
                    .collect();
                Ok(resolved)
            }
        });

        handle.load(item.clone()).await
    }
}

/// One query for all parents' children, ordered by the child's default sort.
async fn fetch_children<P, C>(
    db: &Database,
    fk_column: &'static str,
    parents: &[P],
) -> anyhow::Result<Vec<C>>
where
    P: Model,
    C: Model + HasForeignKey,
{
    let ids: Vec<SqlValue> = parents.iter().map(|p| p.id_value()).collect();

    tracing::debug!(
        entity = C::TABLE,
        fk_column = fk_column,
        parent_count = ids.len(),
        "Batch loading {} for {} parents",
        C::TABLE,
        ids.len()
    );

    let rows = SelectQuery::<C>::new()
        .where_in(fk_column, ids)
        .default_order()
        .fetch_all(db.pool())
        .await?;

    Ok(rows)
}

/// Partition child rows back onto their parents, preserving parents order.
fn assemble<P, C>(rows: Vec<C>, parents: &[P], fk_column: &str) -> Vec<Vec<C>>
where
    P: Model,
    C: Model + HasForeignKey,
{
    // Pre-seed so parents with no children still get an entry
    let mut grouped: HashMap<String, Vec<C>> = parents
        .iter()
        .map(|p| (p.id_value().key(), Vec::new()))
        .collect();

    for row in rows {
        if let Some(fk) = row.fk_value(fk_column) {
            if let Some(children) = grouped.get_mut(&fk.key()) {
                children.push(row);
            }
        }
    }

    parents
        .iter()
        .map(|p| grouped.remove(&p.id_value().key()).unwrap_or_default())
        .collect()
}
