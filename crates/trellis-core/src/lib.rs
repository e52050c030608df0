//! Trellis Core - observable entity store
//!
//! This crate provides the reactive data core for client-side applications:
//! - Dynamic attribute values (`Value`, `ValueMap`)
//! - Publish/subscribe capability with listening bookkeeping (`EventHub`)
//! - Single observable entities with batched change tracking (`Entity`)
//! - Ordered, deduplicated, reconciling sets of entities (`EntitySet`)
//!
//! ## Reconciliation
//!
//! [`EntitySet::set`] is the central algorithm: given a batch of incoming
//! items it decides, per item, whether it is new, a duplicate, or a merge
//! target, preserving entity identity and ordering while emitting a
//! minimal event stream, including under re-entrant mutation, where an
//! event handler mutates the entity or set it is reacting to.
//!
//! ## Single-threaded by design
//!
//! Entities and sets are cheap `Rc`-backed handles sharing state through
//! interior mutability; dispatch is synchronous and never holds internal
//! borrows across handler invocation. Persistence lives in a separate
//! crate behind a transport trait.

mod entity;
mod events;
mod set;
mod value;

pub use entity::{ClientId, Entity, ParseEntity, Schema, SetOptions, Validator};
pub use events::{Callback, Event, EventData, EventHub, HandlerId};
pub use set::{
    Comparator, EntitySet, Incoming, Iteratee, ParseSet, ReconcileOptions, SetConfig,
};
pub use value::{attrs, Value, ValueMap};
