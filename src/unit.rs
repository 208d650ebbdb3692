//! Unit types and the [`ArfSpec`] catalog.
//!
//! A unit's binary form is the concatenation of its pieces' wire encodings in
//! declaration order, the first piece always being the 8-bit type id. The
//! catalog maps type ids to their declarative piece tables and grammar roles,
//! and fixes the modifier-id layout for transaction-scoped modifier types.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use smallvec::SmallVec;

use crate::datadef::{defs, DataDef, Value};
use crate::error::{InvalidValue, RegisterError};

/// Identifies a unit type on the wire. A type id, once registered, names its
/// codec forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitTypeId(pub u8);

impl UnitTypeId {
    /// First id of the application-defined range; everything below is
    /// reserved for deleted-record markers (0..2) and built-in types (2..128).
    pub const APP_DEFINED_START: u8 = 128;

    pub fn is_deleted_marker(self) -> bool {
        self.0 < 2
    }

    pub fn is_builtin(self) -> bool {
        (2..Self::APP_DEFINED_START).contains(&self.0)
    }

    pub fn is_app_defined(self) -> bool {
        self.0 >= Self::APP_DEFINED_START
    }
}

impl fmt::Display for UnitTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 16-bit transaction scope identifier.
pub type TxScopeId = u16;

/// Grammar role of a unit type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Grammar {
    ScopeController,
    Subject,
    Modifier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Global,
    Tx,
}

/// Whether a unit type is rewritten by subsequent transactions (refreshing)
/// or consumed once (elapsing).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Persistence {
    Elapsing,
    Refreshing,
}

#[derive(Clone, Debug)]
pub struct PieceDef {
    pub name: &'static str,
    pub def: DataDef,
}

/// Declarative table describing one unit type: ordered pieces, grammar and
/// scope roles, which pieces the mapper keeps in memory, and (for subjects)
/// which modifier type qualifies the subject.
#[derive(Clone, Debug)]
pub struct UnitType {
    name: &'static str,
    pieces: Vec<PieceDef>,
    by_name: HashMap<&'static str, usize>,
    grammar: Option<Grammar>,
    scope: Scope,
    persistence: Persistence,
    cached: SmallVec<[usize; 2]>,
    strand_selector: Option<UnitTypeId>,
}

impl UnitType {
    pub fn new(name: &'static str) -> Self {
        let typeid = PieceDef {
            name: "typeid",
            def: defs::unit_type_id(),
        };
        UnitType {
            name,
            pieces: vec![typeid],
            by_name: HashMap::from([("typeid", 0)]),
            grammar: None,
            scope: Scope::Global,
            persistence: Persistence::Refreshing,
            cached: SmallVec::new(),
            strand_selector: None,
        }
    }

    /// Append a piece. Pieces are wire-encoded in declaration order.
    pub fn piece(mut self, name: &'static str, def: DataDef) -> Self {
        assert!(
            !self.by_name.contains_key(name),
            "duplicate piece name {name:?}"
        );
        self.by_name.insert(name, self.pieces.len());
        self.pieces.push(PieceDef { name, def });
        self
    }

    /// Declare pieces the mapper retains in memory per occurrence. Must be
    /// called after the named pieces were declared.
    pub fn cached(mut self, names: &[&str]) -> Self {
        for name in names {
            let idx = *self
                .by_name
                .get(name)
                .unwrap_or_else(|| panic!("unknown cached piece {name:?}"));
            self.cached.push(idx);
        }
        self.cached.sort_unstable();
        self
    }

    pub fn scope_controller(mut self) -> Self {
        self.grammar = Some(Grammar::ScopeController);
        self
    }

    pub fn subject(mut self) -> Self {
        self.grammar = Some(Grammar::Subject);
        self
    }

    pub fn modifier(mut self) -> Self {
        self.grammar = Some(Grammar::Modifier);
        self
    }

    pub fn tx(mut self) -> Self {
        self.scope = Scope::Tx;
        self
    }

    pub fn elapsing(mut self) -> Self {
        self.persistence = Persistence::Elapsing;
        self
    }

    /// The modifier type that qualifies this subject.
    pub fn strand_selector(mut self, selector: UnitTypeId) -> Self {
        self.strand_selector = Some(selector);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn grammar(&self) -> Option<Grammar> {
        self.grammar
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_def(&self, index: usize) -> Option<&PieceDef> {
        self.pieces.get(index)
    }

    pub fn piece_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Indices of the pieces the mapper caches, in ascending order.
    pub fn cached_pieces(&self) -> &[usize] {
        &self.cached
    }

    pub fn selector(&self) -> Option<UnitTypeId> {
        self.strand_selector
    }

    pub fn is_tx(&self) -> bool {
        self.scope == Scope::Tx
    }

    pub fn is_subject(&self) -> bool {
        self.grammar == Some(Grammar::Subject)
    }

    pub fn is_modifier(&self) -> bool {
        self.grammar == Some(Grammar::Modifier)
    }

    pub fn is_scope_controller(&self) -> bool {
        self.grammar == Some(Grammar::ScopeController)
    }
}

/// One typed record: decoded piece values, piece 0 being the type id.
#[derive(Clone, Debug, PartialEq)]
pub struct Unit {
    pieces: SmallVec<[Value; 4]>,
}

impl Unit {
    pub(crate) fn from_pieces(pieces: SmallVec<[Value; 4]>) -> Self {
        debug_assert!(matches!(pieces.first(), Some(Value::Int(_))));
        Unit { pieces }
    }

    pub fn typeid(&self) -> UnitTypeId {
        match self.pieces[0] {
            Value::Int(id) => UnitTypeId(id as u8),
            _ => unreachable!("piece 0 is always the type id"),
        }
    }

    pub fn pieces(&self) -> &[Value] {
        &self.pieces
    }

    pub fn piece(&self, index: usize) -> Option<&Value> {
        self.pieces.get(index)
    }
}

/// Indexed catalog of unit types: type id to [`UnitType`] and back.
///
/// The catalog additionally records transaction-scoped modifier types in
/// registration order; that order fixes the layout of the mapper's
/// modifier-id vectors.
#[derive(Clone, Debug, Default)]
pub struct ArfSpec {
    types: BTreeMap<UnitTypeId, UnitType>,
    by_name: HashMap<&'static str, UnitTypeId>,
    tx_modifiers: Vec<UnitTypeId>,
}

impl ArfSpec {
    /// An empty catalog, without even the built-in types. Most callers want
    /// [`ArfSpec::base`].
    pub fn new() -> Self {
        ArfSpec::default()
    }

    /// The catalog of built-in unit types (ids 2..=8).
    pub fn base() -> Self {
        let mut spec = ArfSpec::new();
        builtin::register_all(&mut spec);
        spec
    }

    /// A catalog carrying all of `parent`'s entries, open for extension.
    pub fn extending(parent: &ArfSpec) -> Self {
        parent.clone()
    }

    /// Register an application-defined unit type.
    pub fn register(&mut self, id: UnitTypeId, ut: UnitType) -> Result<(), RegisterError> {
        if !id.is_app_defined() {
            return Err(RegisterError::ReservedTypeId(id));
        }
        self.insert(id, ut)
    }

    pub(crate) fn register_builtin(
        &mut self,
        id: UnitTypeId,
        ut: UnitType,
    ) -> Result<(), RegisterError> {
        debug_assert!(id.is_builtin());
        self.insert(id, ut)
    }

    fn insert(&mut self, id: UnitTypeId, ut: UnitType) -> Result<(), RegisterError> {
        if self.types.contains_key(&id) {
            return Err(RegisterError::Duplicate(id));
        }
        if self.by_name.contains_key(ut.name) {
            return Err(RegisterError::DuplicateName(ut.name));
        }
        // The IO layer locates record starts through the type id byte.
        match ut.pieces.first() {
            Some(first) if first.def == defs::unit_type_id() => {}
            _ => return Err(RegisterError::MissingTypeIdPiece(ut.name)),
        }
        if ut.is_tx() && ut.is_modifier() {
            self.tx_modifiers.push(id);
        }
        self.by_name.insert(ut.name, id);
        self.types.insert(id, ut);
        Ok(())
    }

    pub fn lookup(&self, id: UnitTypeId) -> Option<&UnitType> {
        self.types.get(&id)
    }

    pub fn reverse_lookup(&self, name: &str) -> Option<UnitTypeId> {
        self.by_name.get(name).copied()
    }

    /// Registered type ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (UnitTypeId, &UnitType)> {
        self.types.iter().map(|(id, ut)| (*id, ut))
    }

    /// Transaction-scoped modifier types in registration order.
    pub fn tx_modifiers(&self) -> &[UnitTypeId] {
        &self.tx_modifiers
    }

    /// Position of a modifier type within the modifier-id vector layout.
    pub fn modifier_position(&self, id: UnitTypeId) -> Option<usize> {
        self.tx_modifiers.iter().position(|m| *m == id)
    }

    /// Build a unit of the given type from its payload pieces (everything
    /// after the type id), validating each against its def.
    ///
    /// # Panics
    ///
    /// If `id` is not registered in this catalog.
    pub fn new_unit(&self, id: UnitTypeId, payload: &[Value]) -> Result<Unit, InvalidValue> {
        let ut = self
            .lookup(id)
            .unwrap_or_else(|| panic!("unit type {id} is not registered"));
        if payload.len() != ut.piece_count() - 1 {
            return Err(InvalidValue::PieceCount {
                typeid: id,
                expected: ut.piece_count() - 1,
                got: payload.len(),
            });
        }
        let mut pieces = SmallVec::with_capacity(payload.len() + 1);
        pieces.push(Value::Int(id.0 as u64));
        for (value, def) in payload.iter().zip(ut.pieces.iter().skip(1)) {
            def.def.validate(value)?;
            pieces.push(value.clone());
        }
        Ok(Unit::from_pieces(pieces))
    }
}

/// Built-in unit types: ids, catalog registration, and unit constructors.
pub mod builtin {
    use super::*;

    pub const TX_SCOPE_MARKER: UnitTypeId = UnitTypeId(2);
    pub const TX_SCOPE_FINALIZE: UnitTypeId = UnitTypeId(3);
    pub const STRAND_SELECT: UnitTypeId = UnitTypeId(4);
    pub const STRAND_GROUP_SELECT: UnitTypeId = UnitTypeId(5);
    pub const STRAND_WRITE: UnitTypeId = UnitTypeId(6);
    pub const STRAND_CREATE: UnitTypeId = UnitTypeId(7);
    pub const STRAND_DISCARD: UnitTypeId = UnitTypeId(8);

    pub(super) fn register_all(spec: &mut ArfSpec) {
        let entries = [
            (
                TX_SCOPE_MARKER,
                UnitType::new("tx_scope_marker")
                    .piece("prev_txs", defs::tx_scope_id())
                    .piece("next_txs", defs::tx_scope_id())
                    .scope_controller()
                    .elapsing()
                    .cached(&["prev_txs", "next_txs"]),
            ),
            (
                TX_SCOPE_FINALIZE,
                UnitType::new("tx_scope_finalize")
                    .piece("is_commit", DataDef::Bool)
                    .modifier()
                    .tx()
                    .elapsing()
                    .cached(&["is_commit"]),
            ),
            (
                STRAND_SELECT,
                UnitType::new("strand_select")
                    .piece("strand_id", defs::strand_id())
                    .modifier()
                    .tx()
                    .cached(&["strand_id"]),
            ),
            (
                STRAND_GROUP_SELECT,
                UnitType::new("strand_group_select")
                    .piece("group", defs::strand_id())
                    .piece("magnitude", defs::strand_group_magnitude())
                    .modifier()
                    .tx()
                    .cached(&["group", "magnitude"]),
            ),
            (
                STRAND_WRITE,
                UnitType::new("strand_write_data_block")
                    .piece("offset", defs::strand_size())
                    .piece("data", defs::strand_data())
                    .subject()
                    .tx()
                    .cached(&["offset"])
                    .strand_selector(STRAND_SELECT),
            ),
            (
                STRAND_CREATE,
                UnitType::new("strand_create")
                    .piece("size_bytes", defs::strand_size())
                    .subject()
                    .tx()
                    .cached(&["size_bytes"])
                    .strand_selector(STRAND_SELECT),
            ),
            (
                STRAND_DISCARD,
                UnitType::new("strand_discard")
                    .subject()
                    .tx()
                    .elapsing()
                    .strand_selector(STRAND_GROUP_SELECT),
            ),
        ];
        for (id, ut) in entries {
            spec.register_builtin(id, ut)
                .expect("built-in catalog registers once");
        }
    }

    fn unit(typeid: UnitTypeId, payload: impl IntoIterator<Item = Value>) -> Unit {
        let mut pieces = SmallVec::new();
        pieces.push(Value::Int(typeid.0 as u64));
        pieces.extend(payload);
        Unit::from_pieces(pieces)
    }

    pub fn tx_scope_marker(prev: TxScopeId, next: TxScopeId) -> Unit {
        unit(
            TX_SCOPE_MARKER,
            [Value::Int(prev as u64), Value::Int(next as u64)],
        )
    }

    pub fn tx_scope_finalize(is_commit: bool) -> Unit {
        unit(TX_SCOPE_FINALIZE, [Value::Bool(is_commit)])
    }

    pub fn strand_select(strand_id: u64) -> Unit {
        unit(STRAND_SELECT, [Value::Int(strand_id)])
    }

    pub fn strand_group_select(group: u64, magnitude: u8) -> Unit {
        unit(
            STRAND_GROUP_SELECT,
            [Value::Int(group), Value::Int(magnitude as u64)],
        )
    }

    pub fn strand_write(offset: u64, data: Vec<u8>) -> Unit {
        unit(STRAND_WRITE, [Value::Int(offset), Value::Bytes(data)])
    }

    pub fn strand_create(size_bytes: u64) -> Unit {
        unit(STRAND_CREATE, [Value::Int(size_bytes)])
    }

    pub fn strand_discard() -> Unit {
        unit(STRAND_DISCARD, [])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_catalog_is_complete() {
        let spec = ArfSpec::base();
        let ids: Vec<u8> = spec.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            spec.reverse_lookup("strand_create"),
            Some(builtin::STRAND_CREATE)
        );
    }

    #[test]
    fn modifier_layout_follows_registration_order() {
        let spec = ArfSpec::base();
        assert_eq!(
            spec.tx_modifiers(),
            &[
                builtin::TX_SCOPE_FINALIZE,
                builtin::STRAND_SELECT,
                builtin::STRAND_GROUP_SELECT
            ]
        );
        assert_eq!(spec.modifier_position(builtin::STRAND_SELECT), Some(1));
        assert_eq!(spec.modifier_position(builtin::STRAND_WRITE), None);
    }

    #[test]
    fn register_enforces_app_range() {
        let mut spec = ArfSpec::base();
        let ut = || UnitType::new("app_thing").piece("v", DataDef::uint(32));
        assert_eq!(
            spec.register(UnitTypeId(9), ut()),
            Err(RegisterError::ReservedTypeId(UnitTypeId(9)))
        );
        spec.register(UnitTypeId(130), ut()).unwrap();
        assert_eq!(
            spec.register(UnitTypeId(130), UnitType::new("other")),
            Err(RegisterError::Duplicate(UnitTypeId(130)))
        );
    }

    #[test]
    fn extending_carries_parent_entries() {
        let base = ArfSpec::base();
        let mut child = ArfSpec::extending(&base);
        child
            .register(
                UnitTypeId(200),
                UnitType::new("app_note").piece("v", DataDef::uint(8)),
            )
            .unwrap();
        assert!(child.lookup(builtin::STRAND_WRITE).is_some());
        assert!(child.lookup(UnitTypeId(200)).is_some());
        assert!(base.lookup(UnitTypeId(200)).is_none());
    }

    #[test]
    fn new_unit_validates_pieces() {
        let spec = ArfSpec::base();
        let unit = spec
            .new_unit(builtin::STRAND_CREATE, &[Value::Int(1024)])
            .unwrap();
        assert_eq!(unit.typeid(), builtin::STRAND_CREATE);

        let err = spec
            .new_unit(builtin::STRAND_CREATE, &[])
            .unwrap_err();
        assert_eq!(
            err,
            InvalidValue::PieceCount {
                typeid: builtin::STRAND_CREATE,
                expected: 1,
                got: 0
            }
        );
        assert!(
            spec.new_unit(builtin::TX_SCOPE_FINALIZE, &[Value::Int(1)])
                .is_err()
        );
    }
}
