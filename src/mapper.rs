//! Incremental log scanning, per-unit metadata, and change feeds.
//!
//! The mapper scans storage forward exactly once, never rewinding, and keeps
//! one [`UnitInfo`] per live unit: its owning transaction scope, the piece
//! values its type declares as cached, and modifier associativity. Modifier
//! ids assigned within a transaction scope are stable: once assigned they
//! never change and never repeat within that scope.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, trace};
use smallvec::{smallvec, SmallVec};

use crate::datadef::Value;
use crate::error::{AccessError, StorageError, SyncError, UnitDataFormat};
use crate::storage::{Storage, StoreId};
use crate::unit::{builtin, ArfSpec, Persistence, TxScopeId, Unit, UnitType, UnitTypeId};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identity of one mapper instance. Contents and indexes remember the token
/// of the mapper they were built against, so mixing mappers is caught.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapperToken(u64);

impl MapperToken {
    fn fresh() -> Self {
        MapperToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

/// Modifier associativity recorded at mapping time.
#[derive(Clone, Debug, PartialEq)]
pub enum ModAssoc {
    None,
    /// A transaction modifier's own id: the per-scope, per-type counter value
    /// at the moment the modifier was mapped.
    Modifier(u64),
    /// A transaction subject's snapshot of the next-id vector, one entry per
    /// registered modifier type in catalog order.
    Subject(SmallVec<[u64; 4]>),
}

/// Mapper-owned metadata for one live unit.
#[derive(Clone, Debug)]
pub struct UnitInfo {
    pub store_id: StoreId,
    /// Owning transaction scope; `None` for global units.
    pub txs: Option<TxScopeId>,
    pub typeid: UnitTypeId,
    pub mod_assoc: ModAssoc,
    cached: SmallVec<[(usize, Value); 2]>,
}

impl UnitInfo {
    /// All cached `(piece index, value)` pairs.
    pub fn cached(&self) -> &[(usize, Value)] {
        &self.cached
    }

    /// The cached value of the piece at `index`, if its type declares it.
    pub fn cached_piece(&self, index: usize) -> Option<&Value> {
        self.cached
            .iter()
            .find(|(idx, _)| *idx == index)
            .map(|(_, v)| v)
    }
}

/// One change delivered to a [`Feed`].
#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent {
    /// Ids newly mapped by one `sync` growth, ascending.
    Extend(Vec<StoreId>),
    /// A previously delivered id was discarded.
    Delete(StoreId),
}

#[derive(Debug, Default)]
struct FeedShared {
    queue: Mutex<VecDeque<FeedEvent>>,
    last_sync: AtomicU64,
}

/// Subscription to mapper growth and deletion events.
///
/// The mapper holds the subscription weakly: dropping the `Feed` ends it.
/// Deletions are only delivered for ids the feed has already seen in an
/// [`FeedEvent::Extend`].
#[derive(Debug)]
pub struct Feed {
    shared: Arc<FeedShared>,
}

impl Feed {
    pub fn poll(&self) -> Option<FeedEvent> {
        self.shared.queue.lock().unwrap().pop_front()
    }

    /// Largest id this feed has been notified of, 0 if none yet.
    pub fn last_sync_id(&self) -> StoreId {
        self.shared.last_sync.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ScanPhase {
    /// Mapping plain global units until scope machinery appears.
    GlobalPrefix,
    /// Skimming type ids until the first scope marker.
    SeekMarker,
    /// Every record is mapped.
    Steady,
}

/// Incremental scanner over a [`Storage`].
#[derive(Debug)]
pub struct Mapper<S: Storage> {
    storage: S,
    token: MapperToken,
    units: BTreeMap<StoreId, UnitInfo>,
    expired: Mutex<Vec<StoreId>>,
    last_mapped: StoreId,
    next_scan: StoreId,
    phase: ScanPhase,
    cur_txscope: Option<TxScopeId>,
    mod_next_ids: HashMap<TxScopeId, Vec<u64>>,
    feeds: Vec<Weak<FeedShared>>,
}

impl<S: Storage> Mapper<S> {
    pub fn new(storage: S) -> Self {
        Mapper {
            storage,
            token: MapperToken::fresh(),
            units: BTreeMap::new(),
            expired: Mutex::new(Vec::new()),
            last_mapped: 0,
            next_scan: 1,
            phase: ScanPhase::GlobalPrefix,
            cur_txscope: None,
            mod_next_ids: HashMap::new(),
            feeds: Vec::new(),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn spec(&self) -> &Arc<ArfSpec> {
        self.storage.spec()
    }

    pub fn token(&self) -> MapperToken {
        self.token
    }

    /// The currently open transaction scope: the `next_txs` of the most
    /// recent scope marker, or `None` before the first marker.
    pub fn cur_txscope(&self) -> Option<TxScopeId> {
        self.cur_txscope
    }

    /// Map every record appended since the last call. Idempotent; the scan
    /// cursor never rewinds.
    ///
    /// A decode failure aborts the sync; units mapped before the failure
    /// remain valid and are still announced to feeds.
    pub fn sync(&mut self) -> Result<(), SyncError> {
        self.flush_expired();
        let mut newly = Vec::new();
        let end = self.storage.next_id();
        while self.next_scan < end {
            let id = self.next_scan;
            match self.scan_one(id) {
                Ok(mapped) => {
                    if mapped {
                        newly.push(id);
                    }
                    self.next_scan = id + 1;
                }
                Err(e) => {
                    self.notify_extend(&newly);
                    return Err(e);
                }
            }
        }
        self.notify_extend(&newly);
        Ok(())
    }

    fn scan_one(&mut self, id: StoreId) -> Result<bool, SyncError> {
        let typeid = match self.storage.read(id, Some(&[0])) {
            Err(StorageError::Deleted(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
            Ok(pieces) => UnitTypeId(pieces[0].as_int().unwrap_or_default() as u8),
        };
        let spec = self.storage.spec().clone();
        let ut = spec
            .lookup(typeid)
            .ok_or(StorageError::Format(UnitDataFormat::UnknownTypeId(
                typeid.0,
            )))?;

        match self.phase {
            ScanPhase::GlobalPrefix => {
                if ut.is_tx() || ut.is_scope_controller() {
                    self.phase = ScanPhase::SeekMarker;
                    self.seek_marker(&spec, id, typeid)
                } else {
                    self.map_unit(&spec, id, typeid).map(|()| true)
                }
            }
            ScanPhase::SeekMarker => self.seek_marker(&spec, id, typeid),
            ScanPhase::Steady => self.map_unit(&spec, id, typeid).map(|()| true),
        }
    }

    /// Phase B: skim type ids until a scope marker appears, then adopt its
    /// declared previous scope and enter steady state.
    fn seek_marker(
        &mut self,
        spec: &ArfSpec,
        id: StoreId,
        typeid: UnitTypeId,
    ) -> Result<bool, SyncError> {
        if typeid != builtin::TX_SCOPE_MARKER {
            trace!("skimming record {id} (type {typeid}) before first scope marker");
            return Ok(false);
        }
        let pieces = self.storage.read(id, Some(&[1]))?;
        let prev = pieces[0].as_int().unwrap_or_default() as TxScopeId;
        debug!("adopting transaction scope {prev} at record {id}");
        self.cur_txscope = Some(prev);
        self.phase = ScanPhase::Steady;
        self.map_unit(spec, id, typeid).map(|()| true)
    }

    fn map_unit(&mut self, spec: &ArfSpec, id: StoreId, typeid: UnitTypeId) -> Result<(), SyncError> {
        if id <= self.last_mapped {
            return Err(SyncError::OutOfOrder {
                id,
                last: self.last_mapped,
            });
        }
        let ut = spec.lookup(typeid).expect("resolved by caller");

        let mut cached: SmallVec<[(usize, Value); 2]> = SmallVec::new();
        if !ut.cached_pieces().is_empty() {
            let values = self.storage.read(id, Some(ut.cached_pieces()))?;
            cached = ut.cached_pieces().iter().copied().zip(values).collect();
        }
        let mut info = UnitInfo {
            store_id: id,
            txs: None,
            typeid,
            mod_assoc: ModAssoc::None,
            cached,
        };

        if typeid == builtin::TX_SCOPE_MARKER {
            let prev = cached_int(&info, 1) as TxScopeId;
            let next = cached_int(&info, 2) as TxScopeId;
            if self.cur_txscope != Some(prev) {
                return Err(SyncError::ScopeMismatch {
                    id,
                    declared: prev,
                    current: self.cur_txscope,
                });
            }
            debug!("scope marker {id}: {prev} -> {next}");
            self.cur_txscope = Some(next);
            self.mod_next_ids
                .entry(next)
                .or_insert_with(|| vec![0; spec.tx_modifiers().len()]);
        } else if ut.is_tx() {
            let txs = self.cur_txscope.expect("steady state implies an adopted scope");
            info.txs = Some(txs);
            let next_ids = self
                .mod_next_ids
                .entry(txs)
                .or_insert_with(|| vec![0; spec.tx_modifiers().len()]);
            if ut.is_modifier() {
                let pos = spec
                    .modifier_position(typeid)
                    .expect("tx modifiers are listed at registration");
                info.mod_assoc = ModAssoc::Modifier(next_ids[pos]);
                if typeid == builtin::TX_SCOPE_FINALIZE {
                    // The scope ends here; every association line advances so
                    // nothing written later can bind to this scope's past.
                    for n in next_ids.iter_mut() {
                        *n += 1;
                    }
                    debug!("scope {txs} finalized by record {id}");
                } else {
                    next_ids[pos] += 1;
                }
            } else if ut.is_subject() {
                info.mod_assoc = ModAssoc::Subject(SmallVec::from_slice(next_ids));
            }
        }

        trace!("mapped record {id} as {}", ut.name());
        self.units.insert(id, info);
        self.last_mapped = id;
        Ok(())
    }

    /// The unit at `id`, if mapped and still live in storage.
    pub fn get(&self, id: StoreId) -> Option<UnitRef<'_, S>> {
        let info = self.units.get(&id)?;
        if !self.storage.contains(id) {
            self.expired.lock().unwrap().push(id);
            return None;
        }
        Some(UnitRef { mapper: self, info })
    }

    /// Live mapped units in id order, starting at `start`.
    pub fn iter_units(&self, start: StoreId) -> impl Iterator<Item = UnitRef<'_, S>> {
        self.units.range(start..).filter_map(move |(id, info)| {
            if self.storage.contains(*id) {
                Some(UnitRef { mapper: self, info })
            } else {
                self.expired.lock().unwrap().push(*id);
                None
            }
        })
    }

    pub fn contains(&self, id: StoreId) -> bool {
        self.units.contains_key(&id) && self.storage.contains(id)
    }

    /// Number of mapped units (stale entries included until flushed).
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Subscribe to growth and deletion events.
    pub fn feed(&mut self) -> Feed {
        let shared = Arc::new(FeedShared::default());
        self.feeds.push(Arc::downgrade(&shared));
        Feed { shared }
    }

    /// Discard a record through the mapper: the storage record is logically
    /// deleted, the unit is unmapped, and feeds are notified.
    pub fn discard(&mut self, id: StoreId) -> Result<(), StorageError> {
        self.storage.discard(id)?;
        if self.units.remove(&id).is_some() {
            self.notify_delete(id);
        }
        Ok(())
    }

    /// Drop mapped entries whose records were observed to be discarded
    /// behind the mapper's back.
    fn flush_expired(&mut self) {
        let expired: Vec<StoreId> = self.expired.get_mut().unwrap().drain(..).collect();
        for id in expired {
            if self.units.remove(&id).is_some() {
                self.notify_delete(id);
            }
        }
    }

    fn notify_extend(&mut self, ids: &[StoreId]) {
        if ids.is_empty() {
            return;
        }
        let last = *ids.last().expect("non-empty");
        self.feeds.retain(|weak| match weak.upgrade() {
            Some(shared) => {
                shared
                    .queue
                    .lock()
                    .unwrap()
                    .push_back(FeedEvent::Extend(ids.to_vec()));
                shared.last_sync.fetch_max(last, Ordering::Relaxed);
                true
            }
            None => false,
        });
    }

    fn notify_delete(&mut self, id: StoreId) {
        self.feeds.retain(|weak| match weak.upgrade() {
            Some(shared) => {
                if shared.last_sync.load(Ordering::Relaxed) >= id {
                    shared
                        .queue
                        .lock()
                        .unwrap()
                        .push_back(FeedEvent::Delete(id));
                }
                true
            }
            None => false,
        });
    }
}

fn cached_int(info: &UnitInfo, index: usize) -> u64 {
    info.cached_piece(index)
        .and_then(Value::as_int)
        .expect("piece is cached and integral")
}

/// A mapped unit bound to its mapper: piece access resolves against the
/// cached values first and falls back to a storage read.
#[derive(Debug)]
pub struct UnitRef<'a, S: Storage> {
    mapper: &'a Mapper<S>,
    info: &'a UnitInfo,
}

impl<S: Storage> Clone for UnitRef<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: Storage> Copy for UnitRef<'_, S> {}

impl<'a, S: Storage> UnitRef<'a, S> {
    pub fn store_id(&self) -> StoreId {
        self.info.store_id
    }

    pub fn txs(&self) -> Option<TxScopeId> {
        self.info.txs
    }

    pub fn typeid(&self) -> UnitTypeId {
        self.info.typeid
    }

    pub fn info(&self) -> &'a UnitInfo {
        self.info
    }

    pub fn mapper_token(&self) -> MapperToken {
        self.mapper.token
    }

    pub fn unit_type(&self) -> &'a UnitType {
        self.mapper
            .storage
            .spec()
            .lookup(self.info.typeid)
            .expect("mapped units have registered types")
    }

    /// A transaction modifier's assigned id.
    pub fn mod_id(&self) -> Result<u64, AccessError> {
        match self.info.mod_assoc {
            ModAssoc::Modifier(id) => Ok(id),
            _ => Err(AccessError::NotModifier(self.info.store_id)),
        }
    }

    /// For a transaction subject: the id of the associated modifier of the
    /// given type, or `None` when none applies.
    ///
    /// A refreshing modifier is the one most recently written before the
    /// subject; the elapsing scope finalize is the next one written after it.
    pub fn associated_mod_id(&self, modifier: UnitTypeId) -> Result<Option<u64>, AccessError> {
        let ModAssoc::Subject(snapshot) = &self.info.mod_assoc else {
            return Err(AccessError::NotSubject(self.info.store_id));
        };
        let spec = self.mapper.storage.spec();
        let Some(pos) = spec.modifier_position(modifier) else {
            return Ok(None);
        };
        let next = snapshot[pos];
        let ut = spec
            .lookup(modifier)
            .expect("modifier position implies registration");
        Ok(match ut.persistence() {
            Persistence::Elapsing => Some(next),
            Persistence::Refreshing => next.checked_sub(1),
        })
    }

    pub fn piece(&self, name: &str) -> Result<Value, AccessError> {
        let index = self
            .unit_type()
            .piece_index(name)
            .ok_or_else(|| AccessError::NoSuchPiece {
                id: self.info.store_id,
                name: name.to_owned(),
            })?;
        self.piece_at(index)
    }

    /// Shorthand for integer pieces; the catalog guarantees the decoded kind.
    pub fn piece_int(&self, name: &str) -> Result<u64, AccessError> {
        Ok(self
            .piece(name)?
            .as_int()
            .expect("piece declared as an integer"))
    }

    pub fn piece_at(&self, index: usize) -> Result<Value, AccessError> {
        if index >= self.unit_type().piece_count() {
            return Err(AccessError::NoSuchIndex {
                id: self.info.store_id,
                index,
            });
        }
        if let Some(v) = self.info.cached_piece(index) {
            return Ok(v.clone());
        }
        let pieces = self
            .mapper
            .storage
            .read(self.info.store_id, Some(&[index]))?;
        pieces
            .into_iter()
            .next()
            .ok_or(AccessError::NoSuchIndex {
                id: self.info.store_id,
                index,
            })
    }

    /// Batched piece access: cached values are served from memory, and all
    /// uncached pieces are fetched with a single selective storage read.
    pub fn pieces(&self, names: &[&str]) -> Result<SmallVec<[Value; 4]>, AccessError> {
        let ut = self.unit_type();
        let mut out: SmallVec<[Option<Value>; 4]> = smallvec![None; names.len()];
        let mut missing: SmallVec<[(usize, usize); 4]> = SmallVec::new();
        for (slot, name) in names.iter().enumerate() {
            let index = ut.piece_index(name).ok_or_else(|| AccessError::NoSuchPiece {
                id: self.info.store_id,
                name: (*name).to_owned(),
            })?;
            match self.info.cached_piece(index) {
                Some(v) => out[slot] = Some(v.clone()),
                None => missing.push((slot, index)),
            }
        }
        if !missing.is_empty() {
            let select: SmallVec<[usize; 4]> = missing.iter().map(|(_, index)| *index).collect();
            let values = self
                .mapper
                .storage
                .read(self.info.store_id, Some(&select))?;
            for ((slot, _), v) in missing.into_iter().zip(values) {
                out[slot] = Some(v);
            }
        }
        Ok(out.into_iter().map(|v| v.expect("filled above")).collect())
    }

    /// The full reconstructed unit; reads every piece.
    pub fn unit(&self) -> Result<Unit, StorageError> {
        self.mapper.storage.read_unit(self.info.store_id)
    }
}
