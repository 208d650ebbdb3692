//! ARF: an append-only record framework.
//!
//! A library for building transactional, log-structured object stores. The
//! layers, bottom up:
//!
//! - [`datadef`] — declarative binary codecs for typed record pieces.
//! - [`unit`] — the unit-type catalog ([`ArfSpec`]): piece layouts plus
//!   grammar and scope roles.
//! - [`io`] / [`storage`] — a self-delimited append-only log with monotonic
//!   store ids and in-place logical deletion.
//! - [`mapper`] — incremental scanning, per-unit metadata with stable
//!   modifier ids per transaction scope, and change feeds.
//! - [`index`], [`query`], [`content`], [`indexer`] — keyed indexes,
//!   composable queries, and transactional semantics: open-scope tracking,
//!   commit and release, and merge-into-committed with occlusion of
//!   superseded records.
//!
//! Everything is single-threaded cooperative: one task drives appends,
//! `sync`, and merges per instance; storage handles are cloneable so a
//! mapper and its indexer share a log.

pub mod containers;
pub mod datadef;
pub mod error;
pub mod index;
pub mod indexer;
pub mod io;
pub mod mapper;
pub mod query;
pub mod storage;
pub mod strand;
pub mod unit;

mod content;

pub use crate::content::{
    Content, ContentOrder, OcclusionRegistry, SubjectFacts, SubjectWithContext,
};
pub use crate::datadef::{DataDef, Value};
pub use crate::index::{Constraint, KeyDef, MapperIndex};
pub use crate::indexer::{Indexer, TransactionComposer};
pub use crate::io::UnitIo;
pub use crate::mapper::{Feed, FeedEvent, Mapper, ModAssoc, UnitInfo, UnitRef};
pub use crate::query::Query;
pub use crate::storage::{Fs, Memory, Storage, StoreId};
pub use crate::strand::{StrandCompositeSelection, StrandGroup, StrandId};
pub use crate::unit::{builtin, ArfSpec, Grammar, Persistence, Scope, TxScopeId, Unit, UnitType, UnitTypeId};

/// Tunables shared by the storage and transaction layers.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Upper bound on simultaneously open transaction scopes. The composer
    /// refuses to open more; at most half the 16-bit id space is permitted.
    ///
    /// Default: 32,768
    pub max_open_txscopes: u16,
    /// Read-buffer capacity used while rebuilding a file-backed storage's
    /// offset index at open time.
    ///
    /// Default: 64 KiB
    pub rebuild_read_buffer: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_open_txscopes: 1 << 15,
            rebuild_read_buffer: 64 * 1024,
        }
    }
}
