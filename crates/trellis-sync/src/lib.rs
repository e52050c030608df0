//! Trellis Sync - persistence boundary for trellis entities
//!
//! This crate connects [`trellis_core`] entities and sets to an
//! application-supplied transport:
//! - `Transport` - the pluggable wire, completion-callback based
//! - `EntitySync` - `fetch_from` / `save_to` / `destroy_on` for entities
//! - `SetSync` - `fetch_from` / `create_on` for entity sets
//! - `MemoryTransport` - in-memory double for tests and demos
//!
//! Server data always re-enters through the core's own mutation paths
//! (`Entity::set`, `EntitySet::set`/`reset`), so observers see the same
//! minimal event stream regardless of where a change originated. Success
//! emits `sync`, failure emits `error` and leaves in-memory state intact.

mod error;
mod sync;
mod transport;

pub use error::{Error, Result};
pub use sync::{
    entity_url, set_url, DestroyOptions, Done, EntitySync, FetchOptions, SaveOptions,
    SetFetchOptions, SetSync,
};
pub use transport::{Completion, MemoryTransport, SyncMethod, SyncRequest, Transport};
