//! Keyed indexes over mapper contents.
//!
//! An index maps a fixed sequence of key levels to ids. Each level is either
//! a hash map or, when declared sliceable, an ordered map supporting
//! half-open interval constraints. Terminals are perishable: ids expire the
//! moment their record is discarded from storage, and are dropped lazily.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

use itertools::Itertools;
use smallvec::SmallVec;

use crate::containers::perishable::{PerishableSet, PerishableSlot};
use crate::error::{AccessError, IndexError};
use crate::mapper::{Mapper, MapperToken, ModAssoc, UnitInfo, UnitRef};
use crate::storage::{Storage, StoreId};

/// One key level: the key name and whether interval constraints apply.
///
/// Key names resolve against a unit's metadata (`txs`, `type`, `mod_id`) or
/// any piece name of its type.
#[derive(Clone, Copy, Debug)]
pub struct KeyDef {
    pub name: &'static str,
    pub sliceable: bool,
}

impl KeyDef {
    pub fn hashed(name: &'static str) -> Self {
        KeyDef {
            name,
            sliceable: false,
        }
    }

    pub fn sliceable(name: &'static str) -> Self {
        KeyDef {
            name,
            sliceable: true,
        }
    }
}

/// Per-level query constraint.
#[derive(Clone, Debug)]
pub enum Constraint {
    /// Exactly this key.
    Eq(u64),
    /// Any of these keys.
    In(BTreeSet<u64>),
    /// A half-open key interval; only valid on sliceable levels.
    Range(Range<u64>),
    /// No constraint.
    Any,
}

#[derive(Clone, Copy, Debug)]
enum NodeKind {
    Hash,
    Sorted,
    Slot,
    Set,
}

#[derive(Debug)]
enum Node {
    Hash(HashMap<u64, Node>),
    Sorted(BTreeMap<u64, Node>),
    Slot(PerishableSlot),
    Set(PerishableSet),
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Hash => Node::Hash(HashMap::new()),
            NodeKind::Sorted => Node::Sorted(BTreeMap::new()),
            NodeKind::Slot => Node::Slot(PerishableSlot::default()),
            NodeKind::Set => Node::Set(PerishableSet::new()),
        }
    }

    fn child_entry(&mut self, key: u64, child_kind: NodeKind) -> &mut Node {
        match self {
            Node::Hash(m) => m.entry(key).or_insert_with(|| Node::new(child_kind)),
            Node::Sorted(m) => m.entry(key).or_insert_with(|| Node::new(child_kind)),
            _ => unreachable!("terminals have no children"),
        }
    }

    fn raw_is_empty(&self) -> bool {
        match self {
            Node::Hash(m) => m.is_empty(),
            Node::Sorted(m) => m.is_empty(),
            Node::Slot(slot) => slot.raw_is_empty(),
            Node::Set(set) => set.raw_len() == 0,
        }
    }
}

/// A keyed, lazily self-cleaning index over one mapper's units.
pub struct MapperIndex<S: Storage> {
    storage: S,
    token: MapperToken,
    keydefs: Vec<KeyDef>,
    unique: bool,
    selector: Option<Box<dyn Fn(&UnitInfo) -> bool>>,
    root: Node,
    well_sorted: bool,
    last_insert: StoreId,
}

impl<S: Storage + std::fmt::Debug> std::fmt::Debug for MapperIndex<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapperIndex")
            .field("storage", &self.storage)
            .field("token", &self.token)
            .field("keydefs", &self.keydefs)
            .field("unique", &self.unique)
            .field("selector", &self.selector.as_ref().map(|_| "<fn>"))
            .field("root", &self.root)
            .field("well_sorted", &self.well_sorted)
            .field("last_insert", &self.last_insert)
            .finish()
    }
}

impl<S: Storage> MapperIndex<S> {
    pub fn new(
        mapper: &Mapper<S>,
        keydefs: Vec<KeyDef>,
        unique: bool,
        selector: Option<Box<dyn Fn(&UnitInfo) -> bool>>,
    ) -> Self {
        assert!(!keydefs.is_empty(), "an index needs at least one key level");
        let root_kind = Self::level_kind(&keydefs, unique, 0);
        MapperIndex {
            storage: mapper.storage().clone(),
            token: mapper.token(),
            keydefs,
            unique,
            selector,
            root: Node::new(root_kind),
            well_sorted: true,
            last_insert: 0,
        }
    }

    fn level_kind(keydefs: &[KeyDef], unique: bool, level: usize) -> NodeKind {
        if level == keydefs.len() {
            if unique { NodeKind::Slot } else { NodeKind::Set }
        } else if keydefs[level].sliceable {
            NodeKind::Sorted
        } else {
            NodeKind::Hash
        }
    }

    pub fn token(&self) -> MapperToken {
        self.token
    }

    /// Index `unit` if it passes the selector and yields a full key path.
    /// Returns whether it was added.
    pub fn maybe_add_unit(&mut self, unit: UnitRef<'_, S>) -> Result<bool, IndexError> {
        debug_assert_eq!(unit.mapper_token(), self.token, "foreign mapper");
        if let Some(selector) = &self.selector {
            if !selector(unit.info()) {
                return Ok(false);
            }
        }
        let Some(keys) = self.keys_for(&unit)? else {
            return Ok(false);
        };

        let mut node = &mut self.root;
        for (level, key) in keys.iter().enumerate() {
            let child_kind = Self::level_kind(&self.keydefs, self.unique, level + 1);
            node = node.child_entry(*key, child_kind);
        }
        let id = unit.store_id();
        match node {
            Node::Slot(slot) => slot.set(id),
            Node::Set(set) => {
                set.insert(id);
            }
            _ => unreachable!("descended through every level"),
        }
        if id < self.last_insert {
            self.well_sorted = false;
        } else {
            self.last_insert = id;
        }
        Ok(true)
    }

    /// Remove `unit` from the index, pruning emptied levels. Removing a unit
    /// that was never indexed is a no-op.
    pub fn discard_unit(&mut self, unit: UnitRef<'_, S>) -> Result<bool, IndexError> {
        debug_assert_eq!(unit.mapper_token(), self.token, "foreign mapper");
        let Some(keys) = self.keys_for(&unit)? else {
            return Ok(false);
        };
        Ok(remove_rec(&mut self.root, &keys, unit.store_id()))
    }

    fn keys_for(&self, unit: &UnitRef<'_, S>) -> Result<Option<SmallVec<[u64; 3]>>, IndexError> {
        let mut keys = SmallVec::new();
        for keydef in &self.keydefs {
            match key_for(unit, keydef.name)? {
                Some(k) => keys.push(k),
                None => return Ok(None),
            }
        }
        Ok(Some(keys))
    }

    /// Ids matching the constraints, in ascending id order.
    ///
    /// Unconstrained levels iterate all children; interval constraints
    /// traverse the level's ordered map and are rejected on non-sliceable
    /// levels. Expired ids are skipped and recorded for removal.
    pub fn iter_with_constraints<'a>(
        &'a self,
        constraints: &[(&'static str, Constraint)],
    ) -> Result<Box<dyn Iterator<Item = StoreId> + 'a>, IndexError> {
        for &(name, _) in constraints {
            if !self.keydefs.iter().any(|kd| kd.name == name) {
                return Err(IndexError::UnknownKey(name));
            }
        }
        let mut per_level = Vec::with_capacity(self.keydefs.len());
        for keydef in &self.keydefs {
            let constraint = constraints
                .iter()
                .find(|(name, _)| *name == keydef.name)
                .map(|(_, c)| c.clone())
                .unwrap_or(Constraint::Any);
            if matches!(constraint, Constraint::Range(_)) && !keydef.sliceable {
                return Err(IndexError::NotSliceable(keydef.name));
            }
            per_level.push(constraint);
        }

        let mut streams: Vec<Box<dyn Iterator<Item = StoreId> + 'a>> = Vec::new();
        self.collect_streams(&self.root, &per_level, &mut streams);

        Ok(if streams.len() <= 1 {
            streams
                .pop()
                .unwrap_or_else(|| Box::new(std::iter::empty()))
        } else if self.well_sorted {
            Box::new(streams.into_iter().kmerge())
        } else {
            let mut all: Vec<StoreId> = streams.into_iter().flatten().collect();
            all.sort_unstable();
            all.dedup();
            Box::new(all.into_iter())
        })
    }

    fn collect_streams<'a>(
        &'a self,
        node: &'a Node,
        constraints: &[Constraint],
        out: &mut Vec<Box<dyn Iterator<Item = StoreId> + 'a>>,
    ) {
        let valid = |id: StoreId| self.storage.contains(id);
        match node {
            Node::Slot(slot) => out.push(Box::new(slot.get(valid).into_iter())),
            Node::Set(set) => out.push(Box::new(set.iter(valid))),
            Node::Hash(m) => {
                let rest = &constraints[1..];
                match &constraints[0] {
                    Constraint::Eq(k) => {
                        if let Some(child) = m.get(k) {
                            self.collect_streams(child, rest, out);
                        }
                    }
                    Constraint::In(keys) => {
                        for k in keys {
                            if let Some(child) = m.get(k) {
                                self.collect_streams(child, rest, out);
                            }
                        }
                    }
                    Constraint::Range(_) => unreachable!("rejected above"),
                    Constraint::Any => {
                        for child in m.values() {
                            self.collect_streams(child, rest, out);
                        }
                    }
                }
            }
            Node::Sorted(m) => {
                let rest = &constraints[1..];
                match &constraints[0] {
                    Constraint::Eq(k) => {
                        if let Some(child) = m.get(k) {
                            self.collect_streams(child, rest, out);
                        }
                    }
                    Constraint::In(keys) => {
                        for k in keys {
                            if let Some(child) = m.get(k) {
                                self.collect_streams(child, rest, out);
                            }
                        }
                    }
                    Constraint::Range(range) => {
                        for (_, child) in m.range(range.clone()) {
                            self.collect_streams(child, rest, out);
                        }
                    }
                    Constraint::Any => {
                        for child in m.values() {
                            self.collect_streams(child, rest, out);
                        }
                    }
                }
            }
        }
    }

    /// Number of currently valid indexed ids.
    pub fn len(&self) -> usize {
        self.iter_with_constraints(&[])
            .map(Iterator::count)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physically remove every id observed expired and prune emptied levels.
    pub fn flush_expired(&mut self) {
        flush_rec(&mut self.root);
    }
}

fn key_for<S: Storage>(unit: &UnitRef<'_, S>, name: &str) -> Result<Option<u64>, AccessError> {
    match name {
        "txs" => Ok(unit.txs().map(u64::from)),
        "type" => Ok(Some(unit.typeid().0 as u64)),
        "mod_id" => Ok(match unit.info().mod_assoc {
            ModAssoc::Modifier(id) => Some(id),
            _ => None,
        }),
        piece => {
            if unit.unit_type().piece_index(piece).is_none() {
                return Ok(None);
            }
            Ok(unit.piece(piece)?.as_int())
        }
    }
}

fn remove_rec(node: &mut Node, keys: &[u64], id: StoreId) -> bool {
    match node {
        Node::Slot(slot) => slot.remove(id),
        Node::Set(set) => set.remove(id),
        Node::Hash(m) => {
            let Some(child) = m.get_mut(&keys[0]) else {
                return false;
            };
            let removed = remove_rec(child, &keys[1..], id);
            if child.raw_is_empty() {
                m.remove(&keys[0]);
            }
            removed
        }
        Node::Sorted(m) => {
            let Some(child) = m.get_mut(&keys[0]) else {
                return false;
            };
            let removed = remove_rec(child, &keys[1..], id);
            if child.raw_is_empty() {
                m.remove(&keys[0]);
            }
            removed
        }
    }
}

fn flush_rec(node: &mut Node) {
    match node {
        Node::Slot(_) => {}
        Node::Set(set) => set.flush(),
        Node::Hash(m) => {
            m.retain(|_, child| {
                flush_rec(child);
                !child.raw_is_empty()
            });
        }
        Node::Sorted(m) => {
            m.retain(|_, child| {
                flush_rec(child);
                !child.raw_is_empty()
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Memory;
    use crate::unit::{builtin, ArfSpec};
    use std::sync::Arc;

    fn synced_mapper(units: &[crate::unit::Unit]) -> Mapper<Memory> {
        let storage = Memory::new(Arc::new(ArfSpec::base()));
        for unit in units {
            storage.append(unit).unwrap();
        }
        let mut mapper = Mapper::new(storage);
        mapper.sync().unwrap();
        mapper
    }

    fn tx_units() -> Vec<crate::unit::Unit> {
        vec![
            builtin::tx_scope_marker(0, 1),           // 1
            builtin::strand_select(10),               // 2
            builtin::strand_create(100),              // 3
            builtin::strand_select(11),               // 4
            builtin::strand_write(0, b"a".to_vec()),  // 5
            builtin::strand_write(64, b"b".to_vec()), // 6
        ]
    }

    fn by_txs_and_type(mapper: &Mapper<Memory>) -> MapperIndex<Memory> {
        let mut index = MapperIndex::new(
            mapper,
            vec![KeyDef::hashed("txs"), KeyDef::hashed("type")],
            false,
            Some(Box::new(|info: &UnitInfo| info.txs.is_some())),
        );
        for unit in mapper.iter_units(0) {
            index.maybe_add_unit(unit).unwrap();
        }
        index
    }

    #[test]
    fn constraints_narrow_level_by_level() {
        let mapper = synced_mapper(&tx_units());
        let index = by_txs_and_type(&mapper);

        let all: Vec<StoreId> = index.iter_with_constraints(&[]).unwrap().collect();
        assert_eq!(all, vec![2, 3, 4, 5, 6]);

        let selects: Vec<StoreId> = index
            .iter_with_constraints(&[
                ("txs", Constraint::Eq(1)),
                ("type", Constraint::Eq(builtin::STRAND_SELECT.0 as u64)),
            ])
            .unwrap()
            .collect();
        assert_eq!(selects, vec![2, 4]);

        let subjects: Vec<StoreId> = index
            .iter_with_constraints(&[(
                "type",
                Constraint::In(BTreeSet::from([
                    builtin::STRAND_CREATE.0 as u64,
                    builtin::STRAND_WRITE.0 as u64,
                ])),
            )])
            .unwrap()
            .collect();
        assert_eq!(subjects, vec![3, 5, 6]);
    }

    #[test]
    fn range_constraints_need_sliceable_levels() {
        let mapper = synced_mapper(&tx_units());
        let index = by_txs_and_type(&mapper);
        let err = match index.iter_with_constraints(&[("type", Constraint::Range(4..7))]) {
            Err(e) => e,
            Ok(_) => panic!("expected IndexError::NotSliceable"),
        };
        assert!(matches!(err, IndexError::NotSliceable("type")));

        let mut sliced = MapperIndex::new(
            &mapper,
            vec![KeyDef::sliceable("strand_id")],
            false,
            None,
        );
        for unit in mapper.iter_units(0) {
            sliced.maybe_add_unit(unit).unwrap();
        }
        let ids: Vec<StoreId> = sliced
            .iter_with_constraints(&[("strand_id", Constraint::Range(10..11))])
            .unwrap()
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn unique_index_holds_single_ids() {
        let mapper = synced_mapper(&tx_units());
        let mut index = MapperIndex::new(
            &mapper,
            vec![
                KeyDef::hashed("txs"),
                KeyDef::hashed("type"),
                KeyDef::hashed("mod_id"),
            ],
            true,
            Some(Box::new(|info: &UnitInfo| {
                matches!(info.mod_assoc, ModAssoc::Modifier(_))
            })),
        );
        for unit in mapper.iter_units(0) {
            index.maybe_add_unit(unit).unwrap();
        }
        let ids: Vec<StoreId> = index
            .iter_with_constraints(&[
                ("type", Constraint::Eq(builtin::STRAND_SELECT.0 as u64)),
                ("mod_id", Constraint::Eq(1)),
            ])
            .unwrap()
            .collect();
        assert_eq!(ids, vec![4]);
    }

    #[test]
    fn discarded_ids_expire_lazily() {
        let mapper = synced_mapper(&tx_units());
        let index = by_txs_and_type(&mapper);

        mapper.storage().discard(4).unwrap();
        let ids: Vec<StoreId> = index.iter_with_constraints(&[]).unwrap().collect();
        assert_eq!(ids, vec![2, 3, 5, 6]);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn discard_unit_prunes_emptied_levels() {
        let mapper = synced_mapper(&tx_units());
        let mut index = by_txs_and_type(&mapper);

        let create = mapper.get(3).unwrap();
        assert!(index.discard_unit(create).unwrap());
        assert!(!index.discard_unit(create).unwrap());
        let ids: Vec<StoreId> = index.iter_with_constraints(&[]).unwrap().collect();
        assert_eq!(ids, vec![2, 4, 5, 6]);
    }
}
