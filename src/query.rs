//! Composable queries over mapper contents.
//!
//! A query is a pipeline over an id stream drawn from a mapper scan or an
//! index lookup. Streams are id-ordered, which makes intersection and union
//! single-pass sorted merges.

use itertools::{EitherOrBoth, Itertools};

use crate::error::{IndexError, QueryError};
use crate::index::{Constraint, MapperIndex};
use crate::mapper::{Mapper, UnitRef};
use crate::storage::{Storage, StoreId};

pub struct Query<'a, S: Storage> {
    mapper: &'a Mapper<S>,
    ids: Box<dyn Iterator<Item = StoreId> + 'a>,
}

impl<'a, S: Storage> Query<'a, S> {
    /// All mapped units from `start` upward.
    pub fn scan(mapper: &'a Mapper<S>, start: StoreId) -> Self {
        Query {
            mapper,
            ids: Box::new(mapper.iter_units(start).map(|u| u.store_id())),
        }
    }

    /// Units matching `constraints` against `index`.
    pub fn index(
        mapper: &'a Mapper<S>,
        index: &'a MapperIndex<S>,
        constraints: &[(&'static str, Constraint)],
    ) -> Result<Self, IndexError> {
        debug_assert_eq!(mapper.token(), index.token(), "foreign mapper");
        Ok(Query {
            mapper,
            ids: index.iter_with_constraints(constraints)?,
        })
    }

    /// Keep only ids passing `f`.
    pub fn filter_ids(self, mut f: impl FnMut(StoreId) -> bool + 'a) -> Self {
        Query {
            mapper: self.mapper,
            ids: Box::new(self.ids.filter(move |id| f(*id))),
        }
    }

    /// Sorted-merge intersection with another query.
    pub fn join(self, other: Query<'a, S>) -> Self {
        debug_assert_eq!(self.mapper.token(), other.mapper.token());
        let ids = self
            .ids
            .merge_join_by(other.ids, |a, b| a.cmp(b))
            .filter_map(|pair| match pair {
                EitherOrBoth::Both(id, _) => Some(id),
                _ => None,
            });
        Query {
            mapper: self.mapper,
            ids: Box::new(ids),
        }
    }

    /// Sorted-merge union with de-duplication.
    pub fn merge(self, others: impl IntoIterator<Item = Query<'a, S>>) -> Self {
        let mapper = self.mapper;
        let mut streams = vec![self.ids];
        for other in others {
            debug_assert_eq!(mapper.token(), other.mapper.token());
            streams.push(other.ids);
        }
        Query {
            mapper,
            ids: Box::new(streams.into_iter().kmerge().dedup()),
        }
    }

    /// The single resulting unit; fails unless exactly one matches.
    pub fn one(self) -> Result<UnitRef<'a, S>, QueryError> {
        let mut it = self;
        let first = it.next().ok_or(QueryError::NoResult)?;
        let extra = it.count();
        if extra > 0 {
            return Err(QueryError::Multiple(extra + 1));
        }
        Ok(first)
    }

    pub fn exists(mut self) -> bool {
        self.next().is_some()
    }

    pub fn count(self) -> usize {
        Iterator::count(self)
    }

    /// The raw id stream, discarding the mapper binding.
    pub fn ids(self) -> impl Iterator<Item = StoreId> + 'a {
        let mapper = self.mapper;
        self.ids.filter(move |id| mapper.contains(*id))
    }
}

impl<'a, S: Storage> Iterator for Query<'a, S> {
    type Item = UnitRef<'a, S>;

    fn next(&mut self) -> Option<Self::Item> {
        // Ids whose units expired between stream production and lookup are
        // skipped, like any other perishable observation.
        loop {
            let id = self.ids.next()?;
            if let Some(unit) = self.mapper.get(id) {
                return Some(unit);
            }
        }
    }
}
