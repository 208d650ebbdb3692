//! Transactional content groups and the occlusion calculus.
//!
//! A [`Content`] is an indexed view over a set of transaction units: the
//! subjects of one or more committed (or proposed) transactions together
//! with their associated modifiers. Contents are immutable aside from
//! [`Content::merge_in`], which applies another content on top and discards
//! the records it supersedes.

use std::collections::BTreeSet;
use std::sync::Arc;

use itertools::Itertools;
use log::debug;
use smallvec::SmallVec;

use crate::datadef::Value;
use crate::error::{AccessError, ContentError, StorageError};
use crate::index::{Constraint, KeyDef, MapperIndex};
use crate::mapper::{Mapper, MapperToken, UnitRef};
use crate::storage::{Storage, StoreId};
use crate::strand::{StrandGroup, StrandId};
use crate::unit::{builtin, TxScopeId, UnitTypeId};

/// Position of a subject in content order: commit time first, stream order
/// second. Unfinalized subjects order by stream position alone; the two
/// kinds never mix within one content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContentOrder {
    Unfinalized(StoreId),
    Finalized(StoreId, StoreId),
}

/// A transaction subject bound to its exact modifiers: same scope, and for
/// every modifier type the id recorded in the subject's associativity
/// snapshot.
#[derive(Debug)]
pub struct SubjectWithContext<'a, S: Storage> {
    subject: UnitRef<'a, S>,
    modifiers: SmallVec<[UnitRef<'a, S>; 3]>,
    finalize: Option<UnitRef<'a, S>>,
}

impl<'a, S: Storage> SubjectWithContext<'a, S> {
    /// Bind a subject to the supplied modifiers, validating that every one
    /// actually targets the subject. A release-finalized scope refuses to
    /// form a context.
    pub fn bind(
        subject: UnitRef<'a, S>,
        modifiers: impl IntoIterator<Item = UnitRef<'a, S>>,
    ) -> Result<Self, ContentError> {
        let ut = subject.unit_type();
        if !ut.is_tx() || !ut.is_subject() {
            return Err(AccessError::NotSubject(subject.store_id()).into());
        }
        let mut bound = SmallVec::new();
        let mut finalize = None;
        for modifier in modifiers {
            let expected = subject.associated_mod_id(modifier.typeid())?;
            let targets =
                modifier.txs() == subject.txs() && expected == Some(modifier.mod_id()?);
            if !targets {
                return Err(ContentError::ForeignModifier {
                    modifier: modifier.store_id(),
                    subject: subject.store_id(),
                });
            }
            if modifier.typeid() == builtin::TX_SCOPE_FINALIZE {
                if !modifier.piece("is_commit")?.as_bool().unwrap_or(false) {
                    return Err(ContentError::Released(
                        modifier.txs().unwrap_or_default(),
                    ));
                }
                finalize = Some(modifier);
            } else {
                bound.push(modifier);
            }
        }
        Ok(SubjectWithContext {
            subject,
            modifiers: bound,
            finalize,
        })
    }

    pub fn subject(&self) -> UnitRef<'a, S> {
        self.subject
    }

    pub fn store_id(&self) -> StoreId {
        self.subject.store_id()
    }

    pub fn txs(&self) -> TxScopeId {
        self.subject.txs().expect("subjects are transaction units")
    }

    /// The bound modifier of the given type, if any.
    pub fn modifier(&self, typeid: UnitTypeId) -> Option<UnitRef<'a, S>> {
        if typeid == builtin::TX_SCOPE_FINALIZE {
            return self.finalize;
        }
        self.modifiers
            .iter()
            .find(|m| m.typeid() == typeid)
            .copied()
    }

    pub fn content_order(&self) -> ContentOrder {
        match self.finalize {
            Some(fin) => ContentOrder::Finalized(fin.store_id(), self.subject.store_id()),
            None => ContentOrder::Unfinalized(self.subject.store_id()),
        }
    }

    /// The selected strand, for subjects qualified by a strand select.
    pub fn strand(&self) -> Result<Option<StrandId>, ContentError> {
        if self.subject.unit_type().selector() != Some(builtin::STRAND_SELECT) {
            return Ok(None);
        }
        match self.modifier(builtin::STRAND_SELECT) {
            Some(select) => Ok(Some(select.piece_int("strand_id")?)),
            None => Ok(None),
        }
    }

    /// The strand span being discarded, from the associated group select.
    pub fn discard_strands(&self) -> Result<Option<StrandGroup>, ContentError> {
        if self.subject.unit_type().selector() != Some(builtin::STRAND_GROUP_SELECT) {
            return Ok(None);
        }
        match self.modifier(builtin::STRAND_GROUP_SELECT) {
            Some(group) => Ok(Some(StrandGroup::new(
                group.piece_int("group")?,
                group.piece_int("magnitude")? as u8,
            ))),
            None => Ok(None),
        }
    }

    /// A monomorphic digest of the subject for occlusion dispatch.
    pub fn facts(&self) -> Result<SubjectFacts, ContentError> {
        Ok(SubjectFacts {
            store_id: self.store_id(),
            typeid: self.subject.typeid(),
            txs: self.txs(),
            order: self.content_order(),
            strand: self.strand()?,
            discard_strands: self.discard_strands()?,
            cached: self.subject.info().cached().into(),
        })
    }
}

/// What occlusion tests see of a subject: identity, ordering, strand
/// bindings, and the subject's cached piece values.
#[derive(Clone, Debug)]
pub struct SubjectFacts {
    pub store_id: StoreId,
    pub typeid: UnitTypeId,
    pub txs: TxScopeId,
    pub order: ContentOrder,
    pub strand: Option<StrandId>,
    pub discard_strands: Option<StrandGroup>,
    cached: SmallVec<[(usize, Value); 2]>,
}

impl SubjectFacts {
    pub fn cached_piece(&self, index: usize) -> Option<&Value> {
        self.cached
            .iter()
            .find(|(idx, _)| *idx == index)
            .map(|(_, v)| v)
    }

    pub fn cached_int(&self, index: usize) -> Option<u64> {
        self.cached_piece(index).and_then(Value::as_int)
    }
}

type OcclusionTestFn = Box<dyn Fn(&SubjectFacts, &SubjectFacts) -> bool + Send + Sync>;

struct OcclusionTest {
    rear: Option<UnitTypeId>,
    fore: Option<UnitTypeId>,
    test: OcclusionTestFn,
}

impl std::fmt::Debug for OcclusionTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcclusionTest")
            .field("rear", &self.rear)
            .field("fore", &self.fore)
            .field("test", &"<fn>")
            .finish()
    }
}

/// Registry of occlusion predicates over ordered `(rear, fore)` subject
/// pairs, dispatched by type: a `None` entry matches any type. A pair is
/// occluding as soon as any applicable test passes.
#[derive(Debug)]
pub struct OcclusionRegistry {
    tests: Vec<OcclusionTest>,
}

impl OcclusionRegistry {
    pub fn empty() -> Self {
        OcclusionRegistry { tests: Vec::new() }
    }

    /// The built-in strand calculus.
    pub fn builtin() -> Self {
        use builtin::{STRAND_CREATE, STRAND_DISCARD, STRAND_WRITE};
        let mut registry = Self::empty();
        // A discard subject elapses: anything committed after it supersedes it.
        registry.register(Some(STRAND_DISCARD), None, |_, _| true);
        registry.register(Some(STRAND_CREATE), Some(STRAND_DISCARD), strand_in_discard);
        registry.register(Some(STRAND_WRITE), Some(STRAND_DISCARD), strand_in_discard);
        registry.register(Some(STRAND_WRITE), Some(STRAND_WRITE), |rear, fore| {
            same_strand(rear, fore) && write_offset(rear) == write_offset(fore)
        });
        registry.register(Some(STRAND_CREATE), Some(STRAND_CREATE), same_strand);
        registry.register(Some(STRAND_WRITE), Some(STRAND_CREATE), |rear, fore| {
            same_strand(rear, fore)
                && matches!(
                    (write_offset(rear), create_size(fore)),
                    (Some(offset), Some(size)) if offset <= size
                )
        });
        registry
    }

    /// Add a test; `None` matches any rear or fore type.
    pub fn register(
        &mut self,
        rear: Option<UnitTypeId>,
        fore: Option<UnitTypeId>,
        test: impl Fn(&SubjectFacts, &SubjectFacts) -> bool + Send + Sync + 'static,
    ) {
        self.tests.push(OcclusionTest {
            rear,
            fore,
            test: Box::new(test),
        });
    }

    /// Whether `fore` supersedes `rear` under any applicable test.
    pub fn occludes(&self, rear: &SubjectFacts, fore: &SubjectFacts) -> bool {
        self.tests.iter().any(|t| {
            t.rear.is_none_or(|id| id == rear.typeid)
                && t.fore.is_none_or(|id| id == fore.typeid)
                && (t.test)(rear, fore)
        })
    }
}

fn same_strand(rear: &SubjectFacts, fore: &SubjectFacts) -> bool {
    matches!((rear.strand, fore.strand), (Some(a), Some(b)) if a == b)
}

fn strand_in_discard(rear: &SubjectFacts, fore: &SubjectFacts) -> bool {
    matches!(
        (rear.strand, fore.discard_strands),
        (Some(id), Some(group)) if group.contains(id)
    )
}

/// The written block's offset; piece 1 of a strand write.
fn write_offset(facts: &SubjectFacts) -> Option<u64> {
    (facts.typeid == builtin::STRAND_WRITE)
        .then(|| facts.cached_int(1))
        .flatten()
}

/// The created strand's size; piece 1 of a strand create.
fn create_size(facts: &SubjectFacts) -> Option<u64> {
    (facts.typeid == builtin::STRAND_CREATE)
        .then(|| facts.cached_int(1))
        .flatten()
}

/// An indexed transactional group: subjects keyed by `(txs, type)` and
/// modifiers keyed uniquely by `(txs, type, mod_id)`.
#[derive(Debug)]
pub struct Content<S: Storage> {
    token: MapperToken,
    occlusion: Arc<OcclusionRegistry>,
    subjects: MapperIndex<S>,
    modifiers: MapperIndex<S>,
    txs_set: BTreeSet<TxScopeId>,
    finalized: Option<bool>,
}

impl<S: Storage> Content<S> {
    /// An empty content bound to `mapper`.
    pub fn empty(mapper: &Mapper<S>, occlusion: Arc<OcclusionRegistry>) -> Self {
        let subjects = MapperIndex::new(
            mapper,
            vec![KeyDef::hashed("txs"), KeyDef::hashed("type")],
            false,
            None,
        );
        let modifiers = MapperIndex::new(
            mapper,
            vec![
                KeyDef::hashed("txs"),
                KeyDef::hashed("type"),
                KeyDef::hashed("mod_id"),
            ],
            true,
            None,
        );
        Content {
            token: mapper.token(),
            occlusion,
            subjects,
            modifiers,
            txs_set: BTreeSet::new(),
            finalized: None,
        }
    }

    /// Build a content from transaction units and test it for internal
    /// occlusions: a conflict between member subjects aborts construction.
    pub fn new(
        mapper: &Mapper<S>,
        occlusion: Arc<OcclusionRegistry>,
        ids: impl IntoIterator<Item = StoreId>,
    ) -> Result<Self, ContentError> {
        let mut content = Self::empty(mapper, occlusion);
        for id in ids {
            content.add_unit(mapper, id)?;
        }
        content.check_internal(mapper)?;
        Ok(content)
    }

    pub fn token(&self) -> MapperToken {
        self.token
    }

    /// Scopes with member units, ascending.
    pub fn txs_set(&self) -> &BTreeSet<TxScopeId> {
        &self.txs_set
    }

    /// Whether member subjects are commit-finalized; `None` while empty.
    pub fn finalized(&self) -> Option<bool> {
        self.finalized
    }

    pub fn subjects(&self) -> &MapperIndex<S> {
        &self.subjects
    }

    pub fn modifiers(&self) -> &MapperIndex<S> {
        &self.modifiers
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty() && self.modifiers.is_empty()
    }

    fn add_unit(&mut self, mapper: &Mapper<S>, id: StoreId) -> Result<(), ContentError> {
        debug_assert_eq!(self.token, mapper.token(), "foreign mapper");
        let unit = mapper.get(id).ok_or(StorageError::NotFound(id))?;
        let ut = unit.unit_type();
        if !ut.is_tx() {
            return Err(ContentError::NotTx(id));
        }
        let txs = unit.txs().expect("tx units carry their scope");
        if ut.is_subject() {
            self.subjects.maybe_add_unit(unit)?;
        } else if ut.is_modifier() {
            self.modifiers.maybe_add_unit(unit)?;
        } else {
            return Err(ContentError::NotTx(id));
        }
        self.txs_set.insert(txs);
        Ok(())
    }

    /// Resolve one member subject against this content's modifier index.
    fn resolve<'a>(
        &'a self,
        mapper: &'a Mapper<S>,
        id: StoreId,
    ) -> Result<SubjectWithContext<'a, S>, ContentError> {
        let subject = mapper.get(id).ok_or(StorageError::NotFound(id))?;
        let txs = subject.txs().ok_or(ContentError::NotTx(id))? as u64;
        let mut modifiers: SmallVec<[UnitRef<'a, S>; 3]> = SmallVec::new();
        for &mtype in mapper.spec().tx_modifiers() {
            let Some(mod_id) = subject.associated_mod_id(mtype)? else {
                continue;
            };
            let found = self
                .modifiers
                .iter_with_constraints(&[
                    ("txs", Constraint::Eq(txs)),
                    ("type", Constraint::Eq(mtype.0 as u64)),
                    ("mod_id", Constraint::Eq(mod_id)),
                ])?
                .next();
            if let Some(modifier_id) = found {
                if let Some(modifier) = mapper.get(modifier_id) {
                    modifiers.push(modifier);
                }
            }
        }
        SubjectWithContext::bind(subject, modifiers)
    }

    /// Member subjects in content order: commit time first, stream order
    /// within each scope, merged across scopes.
    pub fn iter<'a>(
        &'a self,
        mapper: &'a Mapper<S>,
    ) -> Result<Vec<SubjectWithContext<'a, S>>, ContentError> {
        let mut streams = Vec::with_capacity(self.txs_set.len());
        for &txs in &self.txs_set {
            let ids: Vec<StoreId> = self
                .subjects
                .iter_with_constraints(&[("txs", Constraint::Eq(txs as u64))])?
                .collect();
            let mut group = Vec::with_capacity(ids.len());
            for id in ids {
                group.push(self.resolve(mapper, id)?);
            }
            group.sort_by_key(SubjectWithContext::content_order);
            streams.push(group);
        }
        Ok(streams
            .into_iter()
            .kmerge_by(|a, b| a.content_order() <= b.content_order())
            .collect())
    }

    /// Member subjects in store-id order.
    pub fn iter_stream_order<'a>(
        &'a self,
        mapper: &'a Mapper<S>,
    ) -> Result<Vec<SubjectWithContext<'a, S>>, ContentError> {
        let ids: Vec<StoreId> = self.subjects.iter_with_constraints(&[])?.collect();
        ids.into_iter()
            .map(|id| self.resolve(mapper, id))
            .collect()
    }

    fn member_facts(&self, mapper: &Mapper<S>) -> Result<Vec<SubjectFacts>, ContentError> {
        self.iter_stream_order(mapper)?
            .iter()
            .map(SubjectWithContext::facts)
            .collect()
    }

    /// Verify members do not occlude each other, and settle the finalization
    /// flag. A subject is occluded by any member strictly after it in
    /// content order that passes an applicable test.
    fn check_internal(&mut self, mapper: &Mapper<S>) -> Result<(), ContentError> {
        let mut facts = self.member_facts(mapper)?;
        let finalized = facts
            .iter()
            .filter(|f| matches!(f.order, ContentOrder::Finalized(..)))
            .count();
        if finalized != 0 && finalized != facts.len() {
            return Err(ContentError::MixedFinalization);
        }
        self.finalized = (!facts.is_empty()).then_some(finalized != 0);

        facts.sort_by_key(|f| f.order);
        for (i, rear) in facts.iter().enumerate() {
            for fore in &facts[i + 1..] {
                if rear.order < fore.order && self.occlusion.occludes(rear, fore) {
                    return Err(ContentError::Conflicting {
                        rear: rear.store_id,
                        fore: fore.store_id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Subject ids in `self` superseded by any subject in `other`.
    ///
    /// Cross-content occlusion is unconditional on order. A unit never
    /// occludes itself, which keeps merging idempotent.
    pub fn calc_occlusions<S2: Storage>(
        &self,
        mapper: &Mapper<S>,
        other: &Content<S2>,
        other_mapper: &Mapper<S2>,
    ) -> Result<BTreeSet<StoreId>, ContentError> {
        let rears = self.member_facts(mapper)?;
        let fores = other.member_facts(other_mapper)?;
        let same_mapper = self.token == other.token;
        let mut occluded = BTreeSet::new();
        for rear in &rears {
            let superseded = fores.iter().any(|fore| {
                (!same_mapper || fore.store_id != rear.store_id)
                    && self.occlusion.occludes(rear, fore)
            });
            if superseded {
                occluded.insert(rear.store_id);
            }
        }
        Ok(occluded)
    }

    /// Modifier ids not referenced by any remaining member subject of their
    /// scope.
    pub fn calc_unused_mods(&self, mapper: &Mapper<S>) -> Result<BTreeSet<StoreId>, ContentError> {
        let mut referenced: BTreeSet<(TxScopeId, UnitTypeId, u64)> = BTreeSet::new();
        for subject_id in self.subjects.iter_with_constraints(&[])? {
            let Some(subject) = mapper.get(subject_id) else {
                continue;
            };
            let txs = subject.txs().expect("subjects are transaction units");
            for &mtype in mapper.spec().tx_modifiers() {
                if let Some(mod_id) = subject.associated_mod_id(mtype)? {
                    referenced.insert((txs, mtype, mod_id));
                }
            }
        }
        let mut unused = BTreeSet::new();
        for modifier_id in self.modifiers.iter_with_constraints(&[])? {
            let Some(modifier) = mapper.get(modifier_id) else {
                continue;
            };
            let txs = modifier.txs().expect("modifiers are transaction units");
            let key = (txs, modifier.typeid(), modifier.mod_id()?);
            if !referenced.contains(&key) {
                unused.insert(modifier_id);
            }
        }
        Ok(unused)
    }

    /// Apply `other` on top of `self`: discard the subjects it occludes and
    /// the modifiers they strand, then absorb `other`'s units.
    ///
    /// Both contents must be bound to `mapper`.
    pub fn merge_in(
        &mut self,
        mapper: &mut Mapper<S>,
        other: &Content<S>,
    ) -> Result<(), ContentError> {
        if self.token != mapper.token() || other.token != self.token {
            return Err(ContentError::MapperMismatch);
        }
        let occluded = self.calc_occlusions(mapper, other, mapper)?;
        for &id in &occluded {
            if let Some(unit) = mapper.get(id) {
                self.subjects.discard_unit(unit)?;
            }
            mapper.discard(id)?;
            debug!("occluded subject {id} discarded");
        }
        let unused = self.calc_unused_mods(mapper)?;
        for &id in &unused {
            if let Some(unit) = mapper.get(id) {
                self.modifiers.discard_unit(unit)?;
            }
            mapper.discard(id)?;
            debug!("unreferenced modifier {id} discarded");
        }

        let incoming: Vec<StoreId> = other
            .subjects
            .iter_with_constraints(&[])?
            .chain(other.modifiers.iter_with_constraints(&[])?)
            .collect();
        for id in incoming {
            self.add_unit(mapper, id)?;
        }
        if self.finalized.is_none() {
            self.finalized = other.finalized;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::{Memory, Storage as _};
    use crate::unit::{ArfSpec, Unit};

    fn mapper_over(units: &[Unit]) -> Mapper<Memory> {
        let storage = Memory::new(Arc::new(ArfSpec::base()));
        for unit in units {
            storage.append(unit).unwrap();
        }
        let mut mapper = Mapper::new(storage);
        mapper.sync().unwrap();
        mapper
    }

    fn registry() -> Arc<OcclusionRegistry> {
        Arc::new(OcclusionRegistry::builtin())
    }

    #[test]
    fn subject_binds_its_exact_modifiers() {
        let mapper = mapper_over(&[
            builtin::tx_scope_marker(0, 1),          // 1
            builtin::strand_select(5),               // 2
            builtin::strand_create(1024),            // 3
            builtin::strand_select(6),               // 4
            builtin::strand_write(0, b"z".to_vec()), // 5
            builtin::tx_scope_finalize(true),        // 6
        ]);
        let content = Content::new(&mapper, registry(), 2..=6).unwrap();
        assert_eq!(content.finalized(), Some(true));

        let subjects = content.iter(&mapper).unwrap();
        assert_eq!(subjects.len(), 2);
        let create = &subjects[0];
        assert_eq!(create.store_id(), 3);
        assert_eq!(create.strand().unwrap(), Some(5));
        assert_eq!(create.content_order(), ContentOrder::Finalized(6, 3));
        let write = &subjects[1];
        assert_eq!(write.strand().unwrap(), Some(6));
    }

    #[test]
    fn foreign_modifier_is_rejected() {
        let mapper = mapper_over(&[
            builtin::tx_scope_marker(0, 1),
            builtin::strand_select(5), // 2: mod 0
            builtin::strand_create(8), // 3: binds select 0
            builtin::strand_select(6), // 4: mod 1, not the create's select
        ]);
        let subject = mapper.get(3).unwrap();
        let stray = mapper.get(4).unwrap();
        let err = SubjectWithContext::bind(subject, [stray]).unwrap_err();
        assert!(matches!(
            err,
            ContentError::ForeignModifier {
                modifier: 4,
                subject: 3
            }
        ));
    }

    #[test]
    fn released_scope_forms_no_context() {
        let mapper = mapper_over(&[
            builtin::tx_scope_marker(0, 1),
            builtin::strand_select(5),
            builtin::strand_create(8),
            builtin::tx_scope_finalize(false),
        ]);
        let err = Content::new(&mapper, registry(), 2..=4).unwrap_err();
        assert!(matches!(err, ContentError::Released(1)));
    }

    #[test]
    fn internal_occlusion_aborts_construction() {
        let mapper = mapper_over(&[
            builtin::tx_scope_marker(0, 1),
            builtin::strand_select(5),
            builtin::strand_write(16, b"a".to_vec()), // 3
            builtin::strand_write(16, b"b".to_vec()), // 4: same strand, same offset
            builtin::tx_scope_finalize(true),
        ]);
        let err = Content::new(&mapper, registry(), 2..=5).unwrap_err();
        assert!(matches!(
            err,
            ContentError::Conflicting { rear: 3, fore: 4 }
        ));
    }

    #[test]
    fn merge_discards_occluded_and_stranded_records() {
        let mapper_units = [
            // First transaction: create strand 5.
            builtin::tx_scope_marker(0, 1),   // 1
            builtin::strand_select(5),        // 2
            builtin::strand_create(1024),     // 3
            builtin::tx_scope_finalize(true), // 4
            // Second transaction: recreate strand 5.
            builtin::tx_scope_marker(1, 2),   // 5
            builtin::strand_select(5),        // 6
            builtin::strand_create(2048),     // 7
            builtin::tx_scope_finalize(true), // 8
        ];
        let mut mapper = mapper_over(&mapper_units);
        let registry = registry();
        let mut committed = Content::new(&mapper, registry.clone(), 2..=4).unwrap();
        let incoming = Content::new(&mapper, registry.clone(), 6..=8).unwrap();

        let occluded = committed
            .calc_occlusions(&mapper, &incoming, &mapper)
            .unwrap();
        assert_eq!(occluded, BTreeSet::from([3]));

        committed.merge_in(&mut mapper, &incoming).unwrap();
        // The superseded create, its select, and the stranded finalize of the
        // first transaction are gone from storage.
        for id in [2, 3, 4] {
            assert!(!mapper.storage().contains(id));
        }
        {
            let subjects = committed.iter(&mapper).unwrap();
            assert_eq!(subjects.len(), 1);
            assert_eq!(subjects[0].store_id(), 7);
            assert_eq!(subjects[0].strand().unwrap(), Some(5));
        }

        // Idempotent when the other content is already contained.
        let again = Content::new(&mapper, registry, [6, 7, 8]).unwrap();
        committed.merge_in(&mut mapper, &again).unwrap();
        assert_eq!(committed.iter(&mapper).unwrap().len(), 1);
        assert!(mapper.storage().contains(7));
    }

    #[test]
    fn discard_subject_occludes_and_elapses() {
        let units = [
            builtin::tx_scope_marker(0, 1),           // 1
            builtin::strand_select(20),               // 2
            builtin::strand_create(64),               // 3
            builtin::strand_write(0, b"x".to_vec()),  // 4
            builtin::tx_scope_finalize(true),         // 5
            builtin::tx_scope_marker(1, 2),           // 6
            builtin::strand_group_select(16, 3),      // 7: covers 16..24
            builtin::strand_discard(),                // 8
            builtin::tx_scope_finalize(true),         // 9
        ];
        let mut mapper = mapper_over(&units);
        let registry = registry();
        let mut committed = Content::new(&mapper, registry.clone(), 2..=5).unwrap();
        let incoming = Content::new(&mapper, registry.clone(), 7..=9).unwrap();

        let occluded = committed
            .calc_occlusions(&mapper, &incoming, &mapper)
            .unwrap();
        // Both the create and the write on strand 20 fall into the group.
        assert_eq!(occluded, BTreeSet::from([3, 4]));
        committed.merge_in(&mut mapper, &incoming).unwrap();

        // A later transaction occludes the discard subject itself.
        let next = mapper.storage().clone();
        next.append(&builtin::tx_scope_marker(2, 3)).unwrap(); // 10
        next.append(&builtin::strand_select(99)).unwrap(); // 11
        next.append(&builtin::strand_create(1)).unwrap(); // 12
        next.append(&builtin::tx_scope_finalize(true)).unwrap(); // 13
        mapper.sync().unwrap();
        let newest = Content::new(&mapper, registry, [11, 12, 13]).unwrap();
        let occluded = committed.calc_occlusions(&mapper, &newest, &mapper).unwrap();
        assert_eq!(occluded, BTreeSet::from([8]));
    }
}
