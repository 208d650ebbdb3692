//! The composite indexing façade and transaction lifecycle.
//!
//! An [`Indexer`] subscribes to its mapper's feed and routes every new unit:
//! global units into the `globals` index, transaction units into the open
//! index, and scope finalizations into a commit (merge into the committed
//! content) or a release (discard of the scope's records).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::debug;
use rand::Rng;

use crate::content::{Content, OcclusionRegistry};
use crate::error::{ComposeError, IndexerError};
use crate::index::{Constraint, KeyDef, MapperIndex};
use crate::mapper::{Feed, FeedEvent, Mapper, UnitInfo};
use crate::storage::{Memory, Storage, StoreId};
use crate::strand::{StrandCompositeSelection, StrandGroup};
use crate::unit::{builtin, TxScopeId, Unit};
use crate::Options;

pub struct Indexer<S: Storage> {
    mapper: Mapper<S>,
    feed: Feed,
    occlusion: Arc<OcclusionRegistry>,
    opts: Options,
    globals: MapperIndex<S>,
    open_txs: MapperIndex<S>,
    committed: Content<S>,
    active_scopes: HashMap<TxScopeId, StrandCompositeSelection>,
    open_set: BTreeSet<TxScopeId>,
}

impl<S: Storage> Indexer<S> {
    pub fn new(storage: S) -> Self {
        Self::with_occlusions(
            storage,
            Arc::new(OcclusionRegistry::builtin()),
            Options::default(),
        )
    }

    pub fn with_occlusions(
        storage: S,
        occlusion: Arc<OcclusionRegistry>,
        opts: Options,
    ) -> Self {
        let mut mapper = Mapper::new(storage);
        let feed = mapper.feed();
        let globals = MapperIndex::new(
            &mapper,
            vec![KeyDef::hashed("type")],
            false,
            Some(Box::new(|info: &UnitInfo| info.txs.is_none())),
        );
        let open_txs = MapperIndex::new(
            &mapper,
            vec![KeyDef::hashed("txs"), KeyDef::hashed("type")],
            false,
            Some(Box::new(|info: &UnitInfo| info.txs.is_some())),
        );
        let committed = Content::empty(&mapper, occlusion.clone());
        Indexer {
            mapper,
            feed,
            occlusion,
            opts,
            globals,
            open_txs,
            committed,
            active_scopes: HashMap::new(),
            open_set: BTreeSet::new(),
        }
    }

    pub fn mapper(&self) -> &Mapper<S> {
        &self.mapper
    }

    pub fn storage(&self) -> &S {
        self.mapper.storage()
    }

    /// The merged content of every committed transaction.
    pub fn committed(&self) -> &Content<S> {
        &self.committed
    }

    /// Index of units belonging to not-yet-finalized scopes, keyed
    /// `(txs, type)`.
    pub fn open_transactions(&self) -> &MapperIndex<S> {
        &self.open_txs
    }

    /// Index of global (non-transaction) units, keyed by type.
    pub fn globals(&self) -> &MapperIndex<S> {
        &self.globals
    }

    /// Scopes opened by a marker and not yet finalized.
    pub fn open_scopes(&self) -> &BTreeSet<TxScopeId> {
        &self.open_set
    }

    /// Strands selected so far within an open scope.
    pub fn active_selection(&self, txs: TxScopeId) -> Option<&StrandCompositeSelection> {
        self.active_scopes.get(&txs)
    }

    pub fn occlusion(&self) -> &Arc<OcclusionRegistry> {
        &self.occlusion
    }

    /// Drive the mapper over newly appended records and fold the resulting
    /// units into the indexes, committing or releasing scopes as their
    /// finalizations appear.
    pub fn sync(&mut self) -> Result<(), IndexerError> {
        self.mapper.sync()?;
        while let Some(event) = self.feed.poll() {
            match event {
                FeedEvent::Extend(ids) => {
                    for id in ids {
                        self.on_unit(id)?;
                    }
                }
                // Indexes drop discarded ids lazily on observation.
                FeedEvent::Delete(_) => {}
            }
        }
        Ok(())
    }

    fn on_unit(&mut self, id: StoreId) -> Result<(), IndexerError> {
        // The unit may have been discarded by an earlier commit in this same
        // drain; nothing to index then.
        let Some(unit) = self.mapper.get(id) else {
            return Ok(());
        };
        let typeid = unit.typeid();
        let Some(txs) = unit.txs() else {
            self.globals.maybe_add_unit(unit)?;
            if typeid == builtin::TX_SCOPE_MARKER {
                let next = unit.piece_int("next_txs")? as TxScopeId;
                self.open_set.insert(next);
            }
            return Ok(());
        };

        if typeid == builtin::TX_SCOPE_FINALIZE {
            let is_commit = unit.piece("is_commit")?.as_bool().unwrap_or(false);
            return self.finalize_scope(txs, id, is_commit);
        }

        self.open_txs.maybe_add_unit(unit)?;
        match typeid {
            builtin::STRAND_SELECT => {
                let strand = unit.piece_int("strand_id")?;
                self.active_scopes.entry(txs).or_default().add_point(strand);
            }
            builtin::STRAND_GROUP_SELECT => {
                let group = unit.piece_int("group")?;
                let magnitude = unit.piece_int("magnitude")? as u8;
                self.active_scopes
                    .entry(txs)
                    .or_default()
                    .add_group(StrandGroup::new(group, magnitude));
            }
            _ => {}
        }
        Ok(())
    }

    fn finalize_scope(
        &mut self,
        txs: TxScopeId,
        finalize_id: StoreId,
        is_commit: bool,
    ) -> Result<(), IndexerError> {
        let mut ids: Vec<StoreId> = self
            .open_txs
            .iter_with_constraints(&[("txs", Constraint::Eq(txs as u64))])?
            .collect();
        for &id in &ids {
            if let Some(unit) = self.mapper.get(id) {
                self.open_txs.discard_unit(unit)?;
            }
        }
        ids.push(finalize_id);
        self.active_scopes.remove(&txs);
        self.open_set.remove(&txs);

        if is_commit {
            debug!("committing scope {txs} ({} units)", ids.len());
            let content = Content::new(&self.mapper, self.occlusion.clone(), ids)?;
            self.committed.merge_in(&mut self.mapper, &content)?;
        } else {
            debug!("releasing scope {txs} ({} units)", ids.len());
            for id in ids {
                self.mapper.discard(id)?;
            }
        }
        Ok(())
    }
}

/// Composes a transaction off-storage: an unused scope id plus the supplied
/// units staged in a transient memory log, materialized as a provisional
/// content and its occlusion set against the committed content.
///
/// The caller remains responsible for writing the composed units (and a
/// finalize) to the real log.
#[derive(Debug)]
pub struct TransactionComposer {
    txs: TxScopeId,
    mapper: Mapper<Memory>,
}

impl TransactionComposer {
    /// Obtain an unused scope id from `indexer`'s current state and stage a
    /// scope marker. At most half the id space may be open at once.
    pub fn new<S: Storage>(indexer: &Indexer<S>) -> Result<Self, ComposeError> {
        if indexer.open_scopes().len() >= indexer.opts.max_open_txscopes as usize {
            return Err(ComposeError::ResourceExhausted);
        }
        let mut in_use = indexer.open_scopes().clone();
        in_use.extend(indexer.committed().txs_set().iter().copied());

        let mut rng = rand::rng();
        let mut picked = None;
        for _ in 0..=u16::MAX as u32 {
            let candidate: TxScopeId = rng.random();
            if candidate != 0 && !in_use.contains(&candidate) {
                picked = Some(candidate);
                break;
            }
        }
        let txs = picked.ok_or(ComposeError::ResourceExhausted)?;
        debug!("composing transaction in scope {txs}");

        let storage = Memory::new(indexer.storage().spec().clone());
        storage.append(&builtin::tx_scope_marker(0, txs))?;
        let mut mapper = Mapper::new(storage);
        mapper.sync()?;
        Ok(TransactionComposer { txs, mapper })
    }

    pub fn txs(&self) -> TxScopeId {
        self.txs
    }

    pub fn mapper(&self) -> &Mapper<Memory> {
        &self.mapper
    }

    /// Stage one transaction-scoped unit.
    pub fn push(&mut self, unit: &Unit) -> Result<StoreId, ComposeError> {
        let is_tx = self
            .mapper
            .spec()
            .lookup(unit.typeid())
            .is_some_and(|ut| ut.is_tx());
        if !is_tx {
            return Err(ComposeError::NotTxUnit(unit.typeid()));
        }
        let id = self.mapper.storage().append(unit)?;
        self.mapper.sync()?;
        Ok(id)
    }

    /// Materialize the provisional content and the set of committed subject
    /// ids it would occlude.
    pub fn compose<S: Storage>(
        &mut self,
        indexer: &Indexer<S>,
    ) -> Result<(Content<Memory>, BTreeSet<StoreId>), ComposeError> {
        self.mapper.sync()?;
        let ids: Vec<StoreId> = self
            .mapper
            .iter_units(0)
            .filter(|u| u.txs().is_some())
            .map(|u| u.store_id())
            .collect();
        let content = Content::new(&self.mapper, indexer.occlusion.clone(), ids)?;
        let occlusions =
            indexer
                .committed()
                .calc_occlusions(indexer.mapper(), &content, &self.mapper)?;
        Ok((content, occlusions))
    }
}
