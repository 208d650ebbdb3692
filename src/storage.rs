//! Append-only unit storage.
//!
//! A storage is an ordered mapping from monotonically increasing store ids
//! (starting at 1) to records. Ids are never reused; records never change
//! size once appended, and are only ever mutated by logical deletion in
//! place. Two backends are provided: [`Memory`] and the file-backed [`Fs`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, Cursor, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};

use log::debug;
use smallvec::SmallVec;

use crate::error::StorageError;
use crate::io::{Pieces, UnitIo};
use crate::unit::{ArfSpec, Unit};
use crate::Options;

/// Monotonically assigned record identifier. The first append receives 1.
pub type StoreId = u64;

/// An append-only record container.
///
/// Implementations are cheaply cloneable handles sharing one underlying
/// store, so a mapper and an indexer can read the same log.
pub trait Storage: Clone {
    fn spec(&self) -> &Arc<ArfSpec>;

    /// Serialize `unit`, assign the next store id, and return it.
    fn append(&self, unit: &Unit) -> Result<StoreId, StorageError>;

    /// Decode the record at `id`, or only the pieces selected by index.
    ///
    /// Fails with [`StorageError::Deleted`] for logically deleted records
    /// and [`StorageError::NotFound`] for ids never appended.
    fn read(&self, id: StoreId, select: Option<&[usize]>) -> Result<Pieces, StorageError>;

    /// Locate the record at `id` and logically delete it in place.
    ///
    /// Discarding an already-deleted id is a no-op.
    fn discard(&self, id: StoreId) -> Result<(), StorageError>;

    /// `true` iff `id` was ever appended and is not deleted.
    fn contains(&self, id: StoreId) -> bool;

    /// The id the next append will receive.
    fn next_id(&self) -> StoreId;

    /// Snapshot of all appended ids from `start` upward, deleted ones
    /// included, in ascending order.
    fn ids_from(&self, start: StoreId) -> Vec<StoreId>;

    /// Number of live (non-deleted) records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_unit(&self, id: StoreId) -> Result<Unit, StorageError> {
        self.read(id, None).map(Unit::from_pieces)
    }

    /// Lazy iterator over `(id, pieces)` in id order starting at `start`,
    /// skipping logically deleted records.
    fn multi_read_iter(
        &self,
        start: StoreId,
        select: Option<&[usize]>,
    ) -> impl Iterator<Item = Result<(StoreId, Pieces), StorageError>> + '_ {
        let select: Option<SmallVec<[usize; 4]>> = select.map(SmallVec::from_slice);
        self.ids_from(start)
            .into_iter()
            .filter_map(move |id| match self.read(id, select.as_deref()) {
                Err(StorageError::Deleted(_)) => None,
                r => Some(r.map(|pieces| (id, pieces))),
            })
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: BTreeMap<StoreId, Vec<u8>>,
    next: StoreId,
    live: usize,
}

/// Memory-only storage: an ordered map from id to record buffer.
///
/// Logical deletion rewrites the buffer in place with the deletion pattern,
/// so a memory log round-trips through the same wire format as a file.
#[derive(Clone, Debug)]
pub struct Memory {
    spec: Arc<ArfSpec>,
    inner: Arc<RwLock<MemoryInner>>,
}

impl Memory {
    pub fn new(spec: Arc<ArfSpec>) -> Self {
        Memory {
            spec,
            inner: Arc::new(RwLock::new(MemoryInner {
                records: BTreeMap::new(),
                next: 1,
                live: 0,
            })),
        }
    }
}

impl Storage for Memory {
    fn spec(&self) -> &Arc<ArfSpec> {
        &self.spec
    }

    fn append(&self, unit: &Unit) -> Result<StoreId, StorageError> {
        let mut buf = Vec::new();
        UnitIo::new(&self.spec).write_unit(&mut buf, unit)?;
        let mut inner = self.inner.write().unwrap();
        let id = inner.next;
        inner.records.insert(id, buf);
        inner.next += 1;
        inner.live += 1;
        Ok(id)
    }

    fn read(&self, id: StoreId, select: Option<&[usize]>) -> Result<Pieces, StorageError> {
        let inner = self.inner.read().unwrap();
        let record = inner.records.get(&id).ok_or(StorageError::NotFound(id))?;
        let mut cursor = Cursor::new(record.as_slice());
        UnitIo::new(&self.spec)
            .read_next(&mut cursor, select)?
            .ok_or(StorageError::Deleted(id))
    }

    fn discard(&self, id: StoreId) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(StorageError::NotFound(id))?;
        let was_live = !is_deleted_record(record);
        let mut cursor = Cursor::new(record);
        UnitIo::new(&self.spec).delete_next(&mut cursor)?;
        if was_live {
            inner.live -= 1;
        }
        Ok(())
    }

    fn contains(&self, id: StoreId) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .records
            .get(&id)
            .is_some_and(|record| !is_deleted_record(record))
    }

    fn next_id(&self) -> StoreId {
        self.inner.read().unwrap().next
    }

    fn ids_from(&self, start: StoreId) -> Vec<StoreId> {
        let inner = self.inner.read().unwrap();
        inner.records.range(start..).map(|(id, _)| *id).collect()
    }

    fn len(&self) -> usize {
        self.inner.read().unwrap().live
    }
}

fn is_deleted_record(record: &[u8]) -> bool {
    record.first().is_some_and(|b| *b < 2)
}

#[derive(Debug)]
struct FsInner {
    file: File,
    offsets: BTreeMap<StoreId, u64>,
    dead: BTreeSet<StoreId>,
    next: StoreId,
    end: u64,
}

/// File-backed storage: one append-only file of concatenated records plus a
/// side index from id to byte offset, rebuilt by a full scan at open time.
#[derive(Clone, Debug)]
pub struct Fs {
    spec: Arc<ArfSpec>,
    inner: Arc<RwLock<FsInner>>,
}

impl Fs {
    /// Open (or create) the log file at `path` and rebuild the offset index.
    ///
    /// Ids are reassigned 1.. in record order, which reproduces the original
    /// assignment because records are never reordered or resized.
    pub fn open(
        path: impl AsRef<Path>,
        spec: Arc<ArfSpec>,
        opts: Options,
    ) -> Result<Self, StorageError> {
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let file_len = file.metadata()?.len();

        let mut offsets = BTreeMap::new();
        let mut dead = BTreeSet::new();
        let mut next: StoreId = 1;

        file.seek(SeekFrom::Start(0))?;
        let io = UnitIo::new(&spec);
        let mut reader = BufReader::with_capacity(opts.rebuild_read_buffer, &mut file);
        let mut pos = 0u64;
        while pos < file_len {
            let live = io.skip_next(&mut reader)?;
            offsets.insert(next, pos);
            if live.is_none() {
                dead.insert(next);
            }
            next += 1;
            pos = reader.stream_position()?;
        }
        drop(reader);
        debug!(
            "opened log {}: {} records ({} dead), {} bytes",
            path.as_ref().display(),
            offsets.len(),
            dead.len(),
            file_len
        );

        Ok(Fs {
            spec,
            inner: Arc::new(RwLock::new(FsInner {
                file,
                offsets,
                dead,
                next,
                end: file_len,
            })),
        })
    }
}

impl Storage for Fs {
    fn spec(&self) -> &Arc<ArfSpec> {
        &self.spec
    }

    fn append(&self, unit: &Unit) -> Result<StoreId, StorageError> {
        let mut buf = Vec::new();
        UnitIo::new(&self.spec).write_unit(&mut buf, unit)?;
        let mut inner = self.inner.write().unwrap();
        let pos = inner.end;
        inner.file.seek(SeekFrom::Start(pos))?;
        inner.file.write_all(&buf)?;
        let id = inner.next;
        inner.offsets.insert(id, pos);
        inner.next += 1;
        inner.end = pos + buf.len() as u64;
        Ok(id)
    }

    fn read(&self, id: StoreId, select: Option<&[usize]>) -> Result<Pieces, StorageError> {
        let mut inner = self.inner.write().unwrap();
        let pos = *inner.offsets.get(&id).ok_or(StorageError::NotFound(id))?;
        inner.file.seek(SeekFrom::Start(pos))?;
        UnitIo::new(&self.spec)
            .read_next(&mut inner.file, select)?
            .ok_or(StorageError::Deleted(id))
    }

    fn discard(&self, id: StoreId) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let pos = *inner.offsets.get(&id).ok_or(StorageError::NotFound(id))?;
        inner.file.seek(SeekFrom::Start(pos))?;
        UnitIo::new(&self.spec).delete_next(&mut inner.file)?;
        inner.dead.insert(id);
        Ok(())
    }

    fn contains(&self, id: StoreId) -> bool {
        let inner = self.inner.read().unwrap();
        inner.offsets.contains_key(&id) && !inner.dead.contains(&id)
    }

    fn next_id(&self) -> StoreId {
        self.inner.read().unwrap().next
    }

    fn ids_from(&self, start: StoreId) -> Vec<StoreId> {
        let inner = self.inner.read().unwrap();
        inner.offsets.range(start..).map(|(id, _)| *id).collect()
    }

    fn len(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.offsets.len() - inner.dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::builtin;

    fn mem() -> Memory {
        Memory::new(Arc::new(ArfSpec::base()))
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let storage = mem();
        let a = storage.append(&builtin::strand_create(10)).unwrap();
        let b = storage.append(&builtin::strand_select(1)).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(storage.next_id(), 3);
    }

    #[test]
    fn multi_read_skips_deleted() {
        let storage = mem();
        for i in 0..4u64 {
            storage.append(&builtin::strand_select(i)).unwrap();
        }
        storage.discard(2).unwrap();
        let ids: Vec<StoreId> = storage
            .multi_read_iter(0, Some(&[0]))
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert_eq!(storage.len(), 3);
    }

    #[test]
    fn discard_in_place_keeps_neighbors_readable() {
        let storage = mem();
        storage.append(&builtin::strand_create(10)).unwrap();
        storage
            .append(&builtin::strand_write(0, b"abc".to_vec()))
            .unwrap();
        storage.discard(1).unwrap();

        assert!(matches!(
            storage.read(1, None),
            Err(StorageError::Deleted(1))
        ));
        assert!(!storage.contains(1));
        let unit = storage.read_unit(2).unwrap();
        assert_eq!(unit.typeid(), builtin::STRAND_WRITE);

        // Idempotent.
        storage.discard(1).unwrap();
        assert!(matches!(
            storage.read(3, None),
            Err(StorageError::NotFound(3))
        ));
    }

    #[test]
    fn file_backend_reopens_with_same_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arf.log");
        let spec = Arc::new(ArfSpec::base());

        {
            let storage = Fs::open(&path, spec.clone(), Options::default()).unwrap();
            storage.append(&builtin::strand_create(64)).unwrap();
            storage
                .append(&builtin::strand_write(8, b"xy".to_vec()))
                .unwrap();
            storage.append(&builtin::strand_select(5)).unwrap();
            storage.discard(2).unwrap();
        }

        let storage = Fs::open(&path, spec, Options::default()).unwrap();
        assert_eq!(storage.next_id(), 4);
        assert_eq!(storage.len(), 2);
        assert!(storage.contains(1));
        assert!(!storage.contains(2));
        let unit = storage.read_unit(3).unwrap();
        assert_eq!(unit.typeid(), builtin::STRAND_SELECT);

        let id = storage.append(&builtin::strand_create(128)).unwrap();
        assert_eq!(id, 4);
    }

    #[test]
    fn file_and_memory_agree_on_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arf.log");
        let spec = Arc::new(ArfSpec::base());

        let m = Memory::new(spec.clone());
        let f = Fs::open(&path, spec, Options::default()).unwrap();
        for unit in [
            builtin::strand_create(4096),
            builtin::strand_select(17),
            builtin::strand_write(512, vec![7; 42]),
        ] {
            m.append(&unit).unwrap();
            f.append(&unit).unwrap();
        }
        for id in 1..=3 {
            assert_eq!(m.read(id, None).unwrap(), f.read(id, None).unwrap());
        }
    }
}
