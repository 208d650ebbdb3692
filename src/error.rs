use std::io;

use thiserror::Error;

use crate::storage::StoreId;
use crate::unit::{TxScopeId, UnitTypeId};

/// A value rejected by a piece codec's validator at encode time.
///
/// Encoding never writes partial bytes: validation runs before any output is
/// produced.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidValue {
    #[error("expected a {expected} value, got {got}")]
    WrongKind { expected: &'static str, got: &'static str },
    #[error("integer {value} does not fit in {bits} bits")]
    IntWidth { value: u64, bits: u8 },
    #[error("integer {value} outside permitted range {lo}..{hi}")]
    OutOfRange { value: u64, lo: u64, hi: u64 },
    #[error("byte data has length {len}, expected exactly {expected}")]
    ByteLength { len: usize, expected: usize },
    #[error("byte data length {len} not expressible by its length prefix")]
    PrefixRange { len: usize },
    #[error("unit type {typeid} takes {expected} pieces, got {got}")]
    PieceCount {
        typeid: UnitTypeId,
        expected: usize,
        got: usize,
    },
}

/// A wire-format violation found while decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitDataFormat {
    #[error("record truncated: wanted {wanted} more bytes")]
    Truncated { wanted: usize },
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("decoded value failed validation: {0}")]
    Invalid(#[from] InvalidValue),
    #[error("unknown unit type id {0}")]
    UnknownTypeId(u8),
}

/// Errors surfaced by the IO and storage layers.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record {0} is logically deleted")]
    Deleted(StoreId),
    #[error("no record with store id {0}")]
    NotFound(StoreId),
    #[error(transparent)]
    Value(#[from] InvalidValue),
    #[error(transparent)]
    Format(#[from] UnitDataFormat),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Rejected [`crate::ArfSpec`] registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("unit type id {0} is already registered")]
    Duplicate(UnitTypeId),
    #[error("unit type name {0:?} is already registered")]
    DuplicateName(&'static str),
    #[error("unit type id {0} is outside the application-defined range")]
    ReservedTypeId(UnitTypeId),
    #[error("unit type {0:?} must declare the type id as piece 0")]
    MissingTypeIdPiece(&'static str),
}

/// Failed access through a [`crate::mapper::UnitRef`].
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("unit {0} is not a modifier")]
    NotModifier(StoreId),
    #[error("unit {0} is not a transaction subject")]
    NotSubject(StoreId),
    #[error("unit {id} has no piece named {name:?}")]
    NoSuchPiece { id: StoreId, name: String },
    #[error("unit {id} has no piece at index {index}")]
    NoSuchIndex { id: StoreId, index: usize },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failed mapper scan. Units mapped before the failure remain valid.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("scope marker {id} declares previous scope {declared}, mapper is at {current:?}")]
    ScopeMismatch {
        id: StoreId,
        declared: TxScopeId,
        current: Option<TxScopeId>,
    },
    #[error("store id {id} arrived out of order (last mapped was {last})")]
    OutOfOrder { id: StoreId, last: StoreId },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Malformed index query or update.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("key {0:?} is not sliceable; interval constraints are not supported")]
    NotSliceable(&'static str),
    #[error("index has no key named {0:?}")]
    UnknownKey(&'static str),
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// Failed terminal query operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("query returned no result")]
    NoResult,
    #[error("query returned {0} results, expected exactly one")]
    Multiple(usize),
}

/// Failed [`crate::content::Content`] construction or merge.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("subject {rear} is occluded by subject {fore} in the same content")]
    Conflicting { rear: StoreId, fore: StoreId },
    #[error("contents belong to different mappers")]
    MapperMismatch,
    #[error("unit {0} is not a transaction-scope unit")]
    NotTx(StoreId),
    #[error("content mixes finalized and unfinalized subjects")]
    MixedFinalization,
    #[error("transaction scope {0} was released, not committed")]
    Released(TxScopeId),
    #[error("modifier {modifier} does not target subject {subject}")]
    ForeignModifier { modifier: StoreId, subject: StoreId },
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failed transaction composition.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("no unused transaction scope id available")]
    ResourceExhausted,
    #[error("unit type {0} is not transaction-scoped")]
    NotTxUnit(UnitTypeId),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Any error an [`crate::indexer::Indexer`] can surface from `sync`.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
