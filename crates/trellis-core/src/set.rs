//! Reconciling entity sets
//!
//! An [`EntitySet`] is an ordered, deduplicated collection of entities with
//! an id/client-id index and an optional sort order. All membership changes
//! flow through [`EntitySet::set`], the reconciliation operation: given a
//! batch of incoming items it decides which existing members to keep or
//! merge, which payloads become new members, and which members to remove,
//! while reusing entity identity and emitting a minimal event stream.
//!
//! The set listens to every member's events: membership events from other
//! sets are filtered out, a member `destroy` removes it, an id change
//! re-keys the index, and everything else is re-emitted from the set so
//! observers can watch one object instead of every member.

use crate::entity::{ClientId, Entity, Schema, SetOptions};
use crate::events::{Event, EventData, EventHub, HandlerId};
use crate::value::{Value, ValueMap};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::debug;

/// Ordering rule for a sorted set
#[derive(Clone)]
pub enum Comparator {
    /// Sort ascending by an attribute's value
    Attribute(String),
    /// Stable sort by an extracted key
    Key(Rc<dyn Fn(&Entity) -> Value>),
    /// Direct two-entity ordering
    Ordering(Rc<dyn Fn(&Entity, &Entity) -> Ordering>),
}

impl Comparator {
    /// Sort ascending by `name`
    pub fn attribute(name: impl Into<String>) -> Self {
        Comparator::Attribute(name.into())
    }

    /// Stable sort by the key `extract` returns
    pub fn key(extract: impl Fn(&Entity) -> Value + 'static) -> Self {
        Comparator::Key(Rc::new(extract))
    }

    /// Order entities directly
    pub fn ordering(compare: impl Fn(&Entity, &Entity) -> Ordering + 'static) -> Self {
        Comparator::Ordering(Rc::new(compare))
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparator::Attribute(name) => f.debug_tuple("Attribute").field(name).finish(),
            Comparator::Key(_) => f.write_str("Key(..)"),
            Comparator::Ordering(_) => f.write_str("Ordering(..)"),
        }
    }
}

/// One incoming item for reconciliation: an entity handle or raw attributes
#[derive(Debug, Clone)]
pub enum Incoming {
    Entity(Entity),
    Attrs(ValueMap),
}

impl From<Entity> for Incoming {
    fn from(entity: Entity) -> Self {
        Incoming::Entity(entity)
    }
}

impl From<ValueMap> for Incoming {
    fn from(attributes: ValueMap) -> Self {
        Incoming::Attrs(attributes)
    }
}

/// Filtering rule resolved into a predicate at the call boundary
#[derive(Clone)]
pub enum Iteratee {
    /// Arbitrary predicate
    Predicate(Rc<dyn Fn(&Entity) -> bool>),
    /// All listed attributes must match exactly
    AttributeMatch(ValueMap),
    /// The named attribute must be truthy
    AttributeName(String),
}

impl Iteratee {
    /// Whether `entity` satisfies this rule
    pub fn test(&self, entity: &Entity) -> bool {
        match self {
            Iteratee::Predicate(pred) => pred(entity),
            Iteratee::AttributeMatch(expected) => expected
                .iter()
                .all(|(name, value)| entity.get(name).as_ref() == Some(value)),
            Iteratee::AttributeName(name) => {
                entity.get(name).map(|v| v.is_truthy()).unwrap_or(false)
            }
        }
    }
}

/// Options for [`EntitySet::set`] and the membership operations built on it
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Allow new members to be created from unmatched items
    pub add: bool,
    /// Remove current members absent from the incoming batch
    pub remove: bool,
    /// Merge incoming attributes onto matched members
    pub merge: bool,
    /// Allow comparator resorting (disable to keep splice order)
    pub sort: bool,
    /// Explicit insertion position; negative counts from the end
    pub at: Option<isize>,
    /// Suppress all events
    pub silent: bool,
    /// Validate merged attributes on matched members
    pub validate: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            add: true,
            remove: true,
            merge: true,
            sort: true,
            at: None,
            silent: false,
            validate: false,
        }
    }
}

impl ReconcileOptions {
    /// Default reconciliation with all events suppressed
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Default::default()
        }
    }
}

/// Parse hook mapping a raw server response to attribute batches
pub type ParseSet = Rc<dyn Fn(&Value) -> Vec<ValueMap>>;

/// Construction-time configuration for an [`EntitySet`]
#[derive(Clone, Default)]
pub struct SetConfig {
    schema: Option<Rc<Schema>>,
    comparator: Option<Comparator>,
    url: Option<String>,
    parse: Option<ParseSet>,
}

impl SetConfig {
    /// Start from defaults: plain schema, no comparator, no url
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema used to build members from attribute payloads
    pub fn with_schema(mut self, schema: Rc<Schema>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Keep members ordered by `comparator`
    pub fn with_comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    /// Collection URL consumed by persistence layers
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Parse hook for server responses
    pub fn with_parse(mut self, parse: impl Fn(&Value) -> Vec<ValueMap> + 'static) -> Self {
        self.parse = Some(Rc::new(parse));
        self
    }
}

struct SetState {
    members: Vec<Entity>,
    by_id: IndexMap<String, Entity>,
    by_cid: IndexMap<ClientId, Entity>,
}

pub(crate) struct SetInner {
    schema: Rc<Schema>,
    comparator: RefCell<Option<Comparator>>,
    url: Option<String>,
    parse: Option<ParseSet>,
    hub: EventHub,
    state: RefCell<SetState>,
}

/// Weak back-reference from an entity to its owning set
pub(crate) struct WeakEntitySet(Weak<SetInner>);

impl WeakEntitySet {
    pub(crate) fn upgrade(&self) -> Option<EntitySet> {
        self.0.upgrade().map(|inner| EntitySet { inner })
    }
}

/// An ordered, deduplicated, reconciling set of entities
///
/// Cheap to clone; clones share the same members and event hub.
#[derive(Clone)]
pub struct EntitySet {
    inner: Rc<SetInner>,
}

impl EntitySet {
    /// Create an empty set with default configuration
    pub fn new() -> Self {
        Self::with_config(SetConfig::default())
    }

    /// Create an empty set from `config`
    pub fn with_config(config: SetConfig) -> Self {
        Self {
            inner: Rc::new(SetInner {
                schema: config.schema.unwrap_or_default(),
                comparator: RefCell::new(config.comparator),
                url: config.url,
                parse: config.parse,
                hub: EventHub::new(),
                state: RefCell::new(SetState {
                    members: Vec::new(),
                    by_id: IndexMap::new(),
                    by_cid: IndexMap::new(),
                }),
            }),
        }
    }

    /// Whether two handles refer to the same set
    pub fn ptr_eq(a: &EntitySet, b: &EntitySet) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// This set's event hub
    pub fn events(&self) -> &EventHub {
        &self.inner.hub
    }

    /// Register a handler; see [`EventHub::on`]
    pub fn on(&self, names: &str, callback: impl Fn(&Event) + 'static) -> HandlerId {
        self.inner.hub.on(names, callback)
    }

    /// Register a one-shot handler; see [`EventHub::once`]
    pub fn once(&self, names: &str, callback: impl Fn(&Event) + 'static) -> HandlerId {
        self.inner.hub.once(names, callback)
    }

    /// Remove handlers; see [`EventHub::off`]
    pub fn off(&self, name: &str) {
        self.inner.hub.off(name)
    }

    /// Emit an event from this set
    pub fn trigger(&self, name: &str, data: EventData) {
        self.inner.hub.trigger(name, data)
    }

    /// The schema members are built with
    pub fn schema(&self) -> &Rc<Schema> {
        &self.inner.schema
    }

    /// The collection URL, if configured
    pub fn url(&self) -> Option<String> {
        self.inner.url.clone()
    }

    /// The parse hook, if configured
    pub fn parse(&self) -> Option<&ParseSet> {
        self.inner.parse.as_ref()
    }

    /// The current comparator, if any
    pub fn comparator(&self) -> Option<Comparator> {
        self.inner.comparator.borrow().clone()
    }

    /// Install or clear the comparator (does not resort by itself)
    pub fn set_comparator(&self, comparator: Option<Comparator>) {
        *self.inner.comparator.borrow_mut() = comparator;
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.inner.state.borrow().members.len()
    }

    /// Whether the set has no members
    pub fn is_empty(&self) -> bool {
        self.inner.state.borrow().members.is_empty()
    }

    /// Snapshot of the members in order
    pub fn members(&self) -> Vec<Entity> {
        self.inner.state.borrow().members.clone()
    }

    /// Ids of every member that has one, in member order
    pub fn ids(&self) -> Vec<Value> {
        self.inner
            .state
            .borrow()
            .members
            .iter()
            .filter_map(|m| m.id())
            .collect()
    }

    /// Member at `index`; negative indices count from the end
    pub fn at(&self, index: isize) -> Option<Entity> {
        let st = self.inner.state.borrow();
        let len = st.members.len() as isize;
        let index = if index < 0 { index + len } else { index };
        if index < 0 || index >= len {
            return None;
        }
        st.members.get(index as usize).cloned()
    }

    /// First member
    pub fn first(&self) -> Option<Entity> {
        self.at(0)
    }

    /// Last member
    pub fn last(&self) -> Option<Entity> {
        self.at(-1)
    }

    /// Look up a member by its external id
    pub fn get(&self, id: &Value) -> Option<Entity> {
        self.inner.state.borrow().by_id.get(&id.to_key()).cloned()
    }

    /// Look up a member by its client id
    pub fn get_by_cid(&self, cid: ClientId) -> Option<Entity> {
        self.inner.state.borrow().by_cid.get(&cid).cloned()
    }

    /// Resolve an incoming item against the index: by id, then client id
    pub fn resolve(&self, item: &Incoming) -> Option<Entity> {
        let st = self.inner.state.borrow();
        match item {
            Incoming::Entity(entity) => {
                if let Some(id) = self.model_id(&entity.attributes()) {
                    if let Some(found) = st.by_id.get(&id.to_key()) {
                        return Some(found.clone());
                    }
                }
                st.by_cid.get(&entity.cid()).cloned()
            }
            Incoming::Attrs(map) => self
                .model_id(map)
                .and_then(|id| st.by_id.get(&id.to_key()).cloned()),
        }
    }

    /// Extract the external identity from raw attributes
    ///
    /// Reads the schema's id attribute; `Null` counts as absent.
    pub fn model_id(&self, attributes: &ValueMap) -> Option<Value> {
        attributes
            .get(self.inner.schema.id_attribute())
            .filter(|v| !v.is_null())
            .cloned()
    }

    /// Reconcile the incoming batch against the current members
    ///
    /// For each item, a member matching by id (or client id) is merged in
    /// place (identity is reused, no `add` fires), while unmatched items
    /// become new members when `add` is enabled. With `remove`, members
    /// absent from the batch are excised, index entries first, so a
    /// `remove` handler never observes a stale lookup. A configured
    /// comparator resorts the set when additions or comparator-relevant
    /// merges occurred, emitting a single `sort`. One aggregate `update`
    /// summarizes added/removed/merged members.
    ///
    /// Returns the resolved entity for each incoming item that was kept.
    pub fn set(&self, items: Vec<Incoming>, options: &ReconcileOptions) -> Vec<Entity> {
        let at = options.at.map(|at| {
            let len = self.len() as isize;
            let at = if at < 0 { at + len + 1 } else { at };
            at.clamp(0, len) as usize
        });

        let comparator = self.inner.comparator.borrow().clone();
        let sortable = comparator.is_some() && at.is_none() && options.sort;
        let sort_attr = match &comparator {
            Some(Comparator::Attribute(name)) => Some(name.clone()),
            _ => None,
        };
        let mut sort_needed = false;

        let entity_options = SetOptions {
            silent: options.silent,
            validate: options.validate,
        };

        let mut seen: HashSet<ClientId> = HashSet::new();
        let mut kept: Vec<Entity> = Vec::new();
        let mut to_add: Vec<Entity> = Vec::new();
        let mut merged_members: Vec<Entity> = Vec::new();
        let mut resolved: Vec<Entity> = Vec::new();

        for item in items {
            if let Some(existing) = self.resolve(&item) {
                let same_object =
                    matches!(&item, Incoming::Entity(e) if Entity::ptr_eq(e, &existing));
                if options.merge && !same_object {
                    let attributes = match &item {
                        Incoming::Entity(e) => e.attributes(),
                        Incoming::Attrs(map) => map.clone(),
                    };
                    let _ = existing.set(attributes, &entity_options);
                    merged_members.push(existing.clone());
                    if sortable && !sort_needed {
                        sort_needed = match &sort_attr {
                            Some(attr) => existing.has_changed_attr(attr),
                            None => existing.has_changed(),
                        };
                    }
                }
                if seen.insert(existing.cid()) {
                    kept.push(existing.clone());
                }
                resolved.push(existing);
            } else if options.add {
                let Some(entity) = self.prepare(&item, options.silent) else {
                    continue;
                };
                to_add.push(entity.clone());
                self.add_reference(&entity);
                seen.insert(entity.cid());
                kept.push(entity.clone());
                resolved.push(entity);
            }
        }

        let mut removed_members: Vec<Entity> = Vec::new();
        if options.remove {
            let stale: Vec<Entity> = self
                .members()
                .into_iter()
                .filter(|m| !seen.contains(&m.cid()))
                .collect();
            if !stale.is_empty() {
                removed_members = self.excise(&stale, options.silent);
            }
        }

        let mut order_changed = false;
        let replace = !sortable && options.add && options.remove;
        {
            let mut st = self.inner.state.borrow_mut();
            if replace && !kept.is_empty() {
                order_changed = st.members.len() != kept.len()
                    || st
                        .members
                        .iter()
                        .zip(kept.iter())
                        .any(|(a, b)| !Entity::ptr_eq(a, b));
                st.members = kept.clone();
            } else if !to_add.is_empty() {
                if sortable {
                    sort_needed = true;
                }
                let index = at.unwrap_or(st.members.len());
                st.members.splice(index..index, to_add.iter().cloned());
            }
        }

        if sort_needed {
            self.sort_internal(true);
        }

        debug!(
            added = to_add.len(),
            removed = removed_members.len(),
            merged = merged_members.len(),
            "reconciled entity set"
        );

        if !options.silent {
            for (i, entity) in to_add.iter().enumerate() {
                entity.trigger(
                    "add",
                    EventData::Add {
                        entity: entity.clone(),
                        set: self.clone(),
                        index: at.map(|a| a + i),
                    },
                );
            }
            if sort_needed || order_changed {
                self.inner
                    .hub
                    .trigger("sort", EventData::Sort { set: self.clone() });
            }
            if !to_add.is_empty() || !removed_members.is_empty() || !merged_members.is_empty() {
                self.inner.hub.trigger(
                    "update",
                    EventData::Update {
                        set: self.clone(),
                        added: to_add,
                        removed: removed_members,
                        merged: merged_members,
                    },
                );
            }
        }

        resolved
    }

    /// Reconcile a single item; see [`set`](Self::set)
    pub fn set_one(
        &self,
        item: impl Into<Incoming>,
        options: &ReconcileOptions,
    ) -> Option<Entity> {
        self.set(vec![item.into()], options).into_iter().next()
    }

    /// Add items without merging or removing
    pub fn add(&self, items: Vec<Incoming>) -> Vec<Entity> {
        self.set(
            items,
            &ReconcileOptions {
                remove: false,
                merge: false,
                ..Default::default()
            },
        )
    }

    /// Add items at an explicit position
    pub fn add_at(&self, items: Vec<Incoming>, at: isize) -> Vec<Entity> {
        self.set(
            items,
            &ReconcileOptions {
                remove: false,
                merge: false,
                at: Some(at),
                ..Default::default()
            },
        )
    }

    /// Add with explicit options; `add` is forced on, `remove` off
    pub fn add_with(&self, items: Vec<Incoming>, options: &ReconcileOptions) -> Vec<Entity> {
        self.set(
            items,
            &ReconcileOptions {
                add: true,
                remove: false,
                ..options.clone()
            },
        )
    }

    /// Remove the given members
    ///
    /// Items are resolved by identity; a `remove` fires per member (index
    /// entries already excised) and one `update` if anything was removed.
    pub fn remove(&self, items: Vec<Incoming>, options: &ReconcileOptions) -> Vec<Entity> {
        let targets: Vec<Entity> = items.iter().filter_map(|i| self.resolve(i)).collect();
        let removed = self.excise(&targets, options.silent);
        if !options.silent && !removed.is_empty() {
            self.inner.hub.trigger(
                "update",
                EventData::Update {
                    set: self.clone(),
                    added: Vec::new(),
                    removed: removed.clone(),
                    merged: Vec::new(),
                },
            );
        }
        removed
    }

    /// Replace the entire membership, emitting a single `reset`
    ///
    /// Current members are detached without `remove` events, incoming items
    /// are added silently, and the `reset` event carries the previous
    /// member list.
    pub fn reset(&self, items: Vec<Incoming>, options: &ReconcileOptions) -> Vec<Entity> {
        let previous = self.members();
        for entity in &previous {
            self.remove_reference(entity);
        }
        {
            let mut st = self.inner.state.borrow_mut();
            st.members.clear();
            st.by_id.clear();
            st.by_cid.clear();
        }
        let added = self.set(
            items,
            &ReconcileOptions {
                add: true,
                remove: false,
                merge: false,
                silent: true,
                ..options.clone()
            },
        );
        if !options.silent {
            self.inner.hub.trigger(
                "reset",
                EventData::Reset {
                    set: self.clone(),
                    previous,
                },
            );
        }
        added
    }

    /// Add one item at the end
    pub fn push(&self, item: impl Into<Incoming>) -> Option<Entity> {
        self.add(vec![item.into()]).into_iter().next()
    }

    /// Remove and return the last member
    pub fn pop(&self) -> Option<Entity> {
        let last = self.at(-1)?;
        self.remove(vec![last.clone().into()], &ReconcileOptions::default());
        Some(last)
    }

    /// Add one item at the front
    pub fn unshift(&self, item: impl Into<Incoming>) -> Option<Entity> {
        self.add_at(vec![item.into()], 0).into_iter().next()
    }

    /// Remove and return the first member
    pub fn shift(&self) -> Option<Entity> {
        let first = self.at(0)?;
        self.remove(vec![first.clone().into()], &ReconcileOptions::default());
        Some(first)
    }

    /// Re-sort the members by the configured comparator
    ///
    /// Emits `sort` when done.
    ///
    /// # Panics
    ///
    /// Panics if no comparator is configured; sorting an unordered set is a
    /// programming error, not a runtime condition.
    pub fn sort(&self) {
        self.sort_internal(false);
    }

    /// Build an entity from `attributes` using this set's schema
    ///
    /// The owning back-reference is assigned, and when the schema carries a
    /// validator the candidate is vetted: on failure the set emits
    /// `invalid` and no entity is returned.
    pub fn build(&self, attributes: ValueMap) -> Option<Entity> {
        self.build_checked(attributes, false)
    }

    /// Values of `attr` across the members, `Null` where absent
    pub fn pluck(&self, attr: &str) -> Vec<Value> {
        self.members()
            .iter()
            .map(|m| m.get(attr).unwrap_or(Value::Null))
            .collect()
    }

    /// Members whose attributes match `expected` exactly
    pub fn where_match(&self, expected: &ValueMap) -> Vec<Entity> {
        self.filter_by(&Iteratee::AttributeMatch(expected.clone()))
    }

    /// First member whose attributes match `expected` exactly
    pub fn find_where(&self, expected: &ValueMap) -> Option<Entity> {
        let rule = Iteratee::AttributeMatch(expected.clone());
        self.members().into_iter().find(|m| rule.test(m))
    }

    /// Members satisfying the iteratee
    pub fn filter_by(&self, rule: &Iteratee) -> Vec<Entity> {
        self.members()
            .into_iter()
            .filter(|m| rule.test(m))
            .collect()
    }

    /// Member attributes as a `Value::List` of maps, in member order
    pub fn to_value(&self) -> Value {
        Value::List(self.members().iter().map(|m| m.to_value()).collect())
    }

    pub(crate) fn downgrade(&self) -> WeakEntitySet {
        WeakEntitySet(Rc::downgrade(&self.inner))
    }

    fn prepare(&self, item: &Incoming, silent: bool) -> Option<Entity> {
        match item {
            Incoming::Entity(entity) => Some(entity.clone()),
            Incoming::Attrs(map) => self.build_checked(map.clone(), silent),
        }
    }

    fn build_checked(&self, attributes: ValueMap, silent: bool) -> Option<Entity> {
        let entity = Entity::with_schema(attributes, self.inner.schema.clone());
        entity.set_owner_if_unset(self.downgrade());
        if self.inner.schema.validator().is_some() {
            if let Err(error) = entity.validate_candidate(&ValueMap::new(), true) {
                if !silent {
                    self.inner.hub.trigger(
                        "invalid",
                        EventData::Invalid {
                            entity: entity.clone(),
                            error,
                        },
                    );
                }
                return None;
            }
        }
        Some(entity)
    }

    fn add_reference(&self, entity: &Entity) {
        {
            let mut st = self.inner.state.borrow_mut();
            st.by_cid.insert(entity.cid(), entity.clone());
            if let Some(id) = self.model_id(&entity.attributes()) {
                st.by_id.insert(id.to_key(), entity.clone());
            }
        }
        entity.set_owner_if_unset(self.downgrade());
        let weak = self.downgrade();
        self.inner
            .hub
            .listen_to(entity.events(), "all", move |event| {
                if let Some(set) = weak.upgrade() {
                    set.on_member_event(event);
                }
            });
    }

    fn remove_reference(&self, entity: &Entity) {
        entity.clear_owner_if(self);
        self.inner.hub.stop_listening(Some(entity.events()), None);
    }

    /// Remove `items` from the index and member list, then notify
    ///
    /// Index entries go first so a `remove` handler looking up the departed
    /// id sees absence, never the stale member.
    fn excise(&self, items: &[Entity], silent: bool) -> Vec<Entity> {
        let mut removed = Vec::new();
        for entity in items {
            let index = {
                let mut st = self.inner.state.borrow_mut();
                let Some(pos) = st
                    .members
                    .iter()
                    .position(|m| Entity::ptr_eq(m, entity))
                else {
                    continue;
                };
                st.by_cid.shift_remove(&entity.cid());
                if let Some(id) = self.model_id(&entity.attributes()) {
                    st.by_id.shift_remove(&id.to_key());
                }
                st.members.remove(pos);
                pos
            };
            if !silent {
                entity.trigger(
                    "remove",
                    EventData::Remove {
                        entity: entity.clone(),
                        set: self.clone(),
                        index,
                    },
                );
            }
            removed.push(entity.clone());
            self.remove_reference(entity);
        }
        removed
    }

    fn rekey(&self, entity: &Entity, old_id: Option<Value>, new_id: Option<Value>) {
        let mut st = self.inner.state.borrow_mut();
        if let Some(old) = old_id {
            st.by_id.shift_remove(&old.to_key());
        }
        if let Some(new) = new_id {
            st.by_id.insert(new.to_key(), entity.clone());
        }
    }

    fn sort_internal(&self, silent: bool) {
        let comparator = self.inner.comparator.borrow().clone();
        let Some(comparator) = comparator else {
            panic!("cannot sort an entity set without a comparator");
        };
        let mut members = std::mem::take(&mut self.inner.state.borrow_mut().members);
        match &comparator {
            Comparator::Attribute(name) => {
                members.sort_by(|a, b| {
                    let ka = a.get(name).unwrap_or(Value::Null);
                    let kb = b.get(name).unwrap_or(Value::Null);
                    ka.total_cmp(&kb)
                });
            }
            Comparator::Key(extract) => {
                let mut keyed: Vec<(Value, Entity)> =
                    members.drain(..).map(|e| (extract(&e), e)).collect();
                keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
                members = keyed.into_iter().map(|(_, e)| e).collect();
            }
            Comparator::Ordering(compare) => {
                members.sort_by(|a, b| compare(a, b));
            }
        }
        self.inner.state.borrow_mut().members = members;
        if !silent {
            self.inner
                .hub
                .trigger("sort", EventData::Sort { set: self.clone() });
        }
    }

    /// React to a member's event: filter, maintain the index, re-emit
    fn on_member_event(&self, event: &Event) {
        match &event.data {
            EventData::Add { set, .. } | EventData::Remove { set, .. } => {
                // Membership traffic from a different set is not ours.
                if !EntitySet::ptr_eq(set, self) {
                    return;
                }
            }
            EventData::Destroy { entity } => {
                self.remove(
                    vec![entity.clone().into()],
                    &ReconcileOptions::default(),
                );
            }
            EventData::Change { entity } => {
                let old_id = self.model_id(&entity.previous_attributes());
                let new_id = self.model_id(&entity.attributes());
                if old_id != new_id {
                    self.rekey(entity, old_id, new_id);
                }
            }
            _ => {}
        }
        self.inner.hub.trigger(&event.name, event.data.clone());
    }
}

impl Default for EntitySet {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for EntitySet {
    /// Identity equality: two handles are equal iff they are the same set
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EntitySet {}

impl fmt::Debug for EntitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("EntitySet")
            .field("members", &st.members.len())
            .field("comparator", &self.inner.comparator.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::attrs;

    fn event_log(set: &EntitySet) -> Rc<RefCell<Vec<String>>> {
        let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        set.on("all", move |event| {
            l.borrow_mut().push(event.name.clone());
        });
        log
    }

    fn count(log: &Rc<RefCell<Vec<String>>>, name: &str) -> usize {
        log.borrow().iter().filter(|n| n.as_str() == name).count()
    }

    #[test]
    fn test_add_builds_and_indexes() {
        let set = EntitySet::new();
        let log = event_log(&set);

        let added = set.add(vec![attrs([("id", 1.into()), ("name", "ada".into())]).into()]);
        assert_eq!(added.len(), 1);
        assert_eq!(set.len(), 1);

        let member = set.get(&1.into()).expect("indexed by id");
        assert_eq!(member.get("name"), Some("ada".into()));
        assert_eq!(set.get_by_cid(member.cid()), Some(member.clone()));
        assert_eq!(*log.borrow(), vec!["add", "update"]);
    }

    #[test]
    fn test_duplicate_id_in_one_call_yields_one_member() {
        let set = EntitySet::new();

        set.set(
            vec![
                attrs([("id", 1.into()), ("name", "first".into())]).into(),
                attrs([("id", 1.into()), ("name", "second".into())]).into(),
            ],
            &ReconcileOptions::default(),
        );
        assert_eq!(set.len(), 1);
        // The second occurrence merged onto the first.
        assert_eq!(
            set.get(&1.into()).unwrap().get("name"),
            Some("second".into())
        );
    }

    #[test]
    fn test_merge_reuses_identity_without_add() {
        let set = EntitySet::new();
        set.add(vec![attrs([("id", 1.into()), ("name", "x".into())]).into()]);
        let before = set.get(&1.into()).unwrap();
        let cid = before.cid();
        let log = event_log(&set);

        set.set(
            vec![attrs([("id", 1.into()), ("name", "y".into())]).into()],
            &ReconcileOptions::default(),
        );

        let after = set.get(&1.into()).unwrap();
        assert_eq!(after.cid(), cid);
        assert_eq!(after.get("name"), Some("y".into()));
        assert_eq!(count(&log, "add"), 0);
        assert_eq!(count(&log, "change:name"), 1);
        assert_eq!(count(&log, "update"), 1);
    }

    #[test]
    fn test_sorted_insertion_single_sort_event() {
        let set = EntitySet::with_config(
            SetConfig::new().with_comparator(Comparator::attribute("rank")),
        );
        let log = event_log(&set);

        set.add(vec![
            attrs([("rank", 3.into())]).into(),
            attrs([("rank", 1.into())]).into(),
            attrs([("rank", 2.into())]).into(),
        ]);

        assert_eq!(set.pluck("rank"), vec![1.into(), 2.into(), 3.into()]);
        assert_eq!(count(&log, "sort"), 1);
    }

    #[test]
    fn test_removal_before_notify() {
        let set = EntitySet::new();
        set.add(vec![attrs([("id", 1.into())]).into()]);
        let observed: Rc<RefCell<Option<Entity>>> = Rc::new(RefCell::new(None));
        let o = observed.clone();
        let set2 = set.clone();
        set.on("remove", move |_| {
            *o.borrow_mut() = set2.get(&1.into());
        });

        let member = set.get(&1.into()).unwrap();
        set.remove(vec![member.into()], &ReconcileOptions::default());
        // The handler ran, and the index was already clean.
        assert_eq!(set.len(), 0);
        assert!(observed.borrow().is_none());
    }

    #[test]
    fn test_full_replace_removes_the_absent() {
        let set = EntitySet::new();
        set.add(vec![
            attrs([("id", 1.into())]).into(),
            attrs([("id", 2.into())]).into(),
        ]);
        let log = event_log(&set);

        set.set(
            vec![attrs([("id", 2.into())]).into(), attrs([("id", 3.into())]).into()],
            &ReconcileOptions::default(),
        );

        assert_eq!(set.ids(), vec![2.into(), 3.into()]);
        assert!(set.get(&1.into()).is_none());
        assert_eq!(count(&log, "remove"), 1);
        assert_eq!(count(&log, "add"), 1);
        assert_eq!(count(&log, "update"), 1);
    }

    #[test]
    fn test_replace_order_change_emits_sort() {
        let set = EntitySet::new();
        set.add(vec![
            attrs([("id", 1.into())]).into(),
            attrs([("id", 2.into())]).into(),
        ]);
        let log = event_log(&set);

        set.set(
            vec![attrs([("id", 2.into())]).into(), attrs([("id", 1.into())]).into()],
            &ReconcileOptions::default(),
        );
        assert_eq!(set.ids(), vec![2.into(), 1.into()]);
        assert_eq!(count(&log, "sort"), 1);
    }

    #[test]
    fn test_add_at_splices_and_reports_index() {
        let set = EntitySet::new();
        set.add(vec![
            attrs([("id", 1.into())]).into(),
            attrs([("id", 2.into())]).into(),
        ]);
        let indices: Rc<RefCell<Vec<Option<usize>>>> = Rc::new(RefCell::new(Vec::new()));
        let ix = indices.clone();
        set.on("add", move |event| {
            if let EventData::Add { index, .. } = &event.data {
                ix.borrow_mut().push(*index);
            }
        });

        set.add_at(
            vec![attrs([("id", 3.into())]).into(), attrs([("id", 4.into())]).into()],
            1,
        );
        assert_eq!(set.ids(), vec![1.into(), 3.into(), 4.into(), 2.into()]);
        assert_eq!(*indices.borrow(), vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_at_supports_negative_indices() {
        let set = EntitySet::new();
        set.add(vec![
            attrs([("id", 1.into())]).into(),
            attrs([("id", 2.into())]).into(),
        ]);
        assert_eq!(set.at(-1).unwrap().id(), Some(2.into()));
        assert_eq!(set.at(-2).unwrap().id(), Some(1.into()));
        assert!(set.at(-3).is_none());
        assert!(set.at(2).is_none());
    }

    #[test]
    fn test_reset_emits_single_event_with_previous() {
        let set = EntitySet::new();
        set.add(vec![attrs([("id", 1.into())]).into()]);
        let log = event_log(&set);
        let previous: Rc<RefCell<Vec<Entity>>> = Rc::new(RefCell::new(Vec::new()));
        let p = previous.clone();
        set.on("reset", move |event| {
            if let EventData::Reset { previous, .. } = &event.data {
                *p.borrow_mut() = previous.clone();
            }
        });

        set.reset(
            vec![attrs([("id", 2.into())]).into()],
            &ReconcileOptions::default(),
        );
        assert_eq!(set.ids(), vec![2.into()]);
        assert_eq!(previous.borrow().len(), 1);
        assert_eq!(previous.borrow()[0].id(), Some(1.into()));
        assert_eq!(*log.borrow(), vec!["reset"]);
    }

    #[test]
    fn test_member_destroy_removes_it() {
        let set = EntitySet::new();
        set.add(vec![attrs([("id", 1.into())]).into()]);
        let log = event_log(&set);

        let member = set.get(&1.into()).unwrap();
        member.destroy();
        assert_eq!(set.len(), 0);
        assert_eq!(count(&log, "remove"), 1);
        assert_eq!(count(&log, "destroy"), 1);
    }

    #[test]
    fn test_member_events_bubble_with_origin() {
        let set = EntitySet::new();
        set.add(vec![attrs([("id", 1.into())]).into()]);
        let origin: Rc<RefCell<Option<Entity>>> = Rc::new(RefCell::new(None));
        let o = origin.clone();
        set.on("change:name", move |event| {
            *o.borrow_mut() = event.data.entity().cloned();
        });

        let member = set.get(&1.into()).unwrap();
        member.set_attr("name", "ada").unwrap();
        assert_eq!(origin.borrow().as_ref(), Some(&member));
    }

    #[test]
    fn test_id_change_rekeys_index() {
        let set = EntitySet::new();
        set.add(vec![attrs([("id", 1.into())]).into()]);
        let member = set.get(&1.into()).unwrap();

        member.set_attr("id", 9).unwrap();
        assert!(set.get(&1.into()).is_none());
        assert_eq!(set.get(&9.into()), Some(member));
    }

    #[test]
    fn test_silent_add_suppresses_events_but_indexes() {
        let set = EntitySet::new();
        let log = event_log(&set);

        set.set(
            vec![attrs([("id", 1.into())]).into()],
            &ReconcileOptions::silent(),
        );
        assert!(log.borrow().is_empty());
        assert_eq!(set.len(), 1);
        assert!(set.get(&1.into()).is_some());
    }

    #[test]
    fn test_invalid_member_is_skipped() {
        let schema = Schema::new()
            .with_validator(|a| {
                if a.contains_key("name") {
                    None
                } else {
                    Some("name required".into())
                }
            })
            .shared();
        let set = EntitySet::with_config(SetConfig::new().with_schema(schema));
        let log = event_log(&set);

        let added = set.add(vec![
            attrs([("id", 1.into()), ("name", "ok".into())]).into(),
            attrs([("id", 2.into())]).into(),
        ]);
        assert_eq!(added.len(), 1);
        assert_eq!(set.len(), 1);
        assert_eq!(count(&log, "invalid"), 1);
        assert!(set.get(&2.into()).is_none());
    }

    #[test]
    fn test_add_existing_entity_handle_is_kept_once() {
        let set = EntitySet::new();
        let entity = Entity::new(attrs([("id", 1.into())]));
        set.add(vec![entity.clone().into()]);
        set.add(vec![entity.clone().into()]);
        assert_eq!(set.len(), 1);
        assert_eq!(entity.owner(), Some(set.clone()));
    }

    #[test]
    fn test_membership_events_from_other_sets_do_not_bubble() {
        let a = EntitySet::new();
        let b = EntitySet::new();
        let entity = Entity::new(attrs([("id", 1.into())]));
        a.add(vec![entity.clone().into()]);
        let log = event_log(&a);

        b.add(vec![entity.clone().into()]);
        assert_eq!(count(&log, "add"), 0);

        b.remove(vec![entity.into()], &ReconcileOptions::default());
        assert_eq!(count(&log, "remove"), 0);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_key_and_ordering_comparators() {
        let by_key = EntitySet::with_config(SetConfig::new().with_comparator(
            Comparator::key(|e| e.get("rank").unwrap_or(Value::Null)),
        ));
        by_key.add(vec![
            attrs([("rank", 2.into())]).into(),
            attrs([("rank", 1.into())]).into(),
        ]);
        assert_eq!(by_key.pluck("rank"), vec![1.into(), 2.into()]);

        let descending = EntitySet::with_config(SetConfig::new().with_comparator(
            Comparator::ordering(|a, b| {
                let ka = a.get("rank").unwrap_or(Value::Null);
                let kb = b.get("rank").unwrap_or(Value::Null);
                kb.total_cmp(&ka)
            }),
        ));
        descending.add(vec![
            attrs([("rank", 1.into())]).into(),
            attrs([("rank", 3.into())]).into(),
            attrs([("rank", 2.into())]).into(),
        ]);
        assert_eq!(
            descending.pluck("rank"),
            vec![3.into(), 2.into(), 1.into()]
        );
    }

    #[test]
    #[should_panic(expected = "without a comparator")]
    fn test_sort_without_comparator_panics() {
        let set = EntitySet::new();
        set.sort();
    }

    #[test]
    fn test_iteratee_filters() {
        let set = EntitySet::new();
        set.add(vec![
            attrs([("id", 1.into()), ("done", true.into())]).into(),
            attrs([("id", 2.into()), ("done", false.into())]).into(),
            attrs([("id", 3.into()), ("done", true.into())]).into(),
        ]);

        let done = set.filter_by(&Iteratee::AttributeName("done".into()));
        assert_eq!(done.len(), 2);

        let matched = set.where_match(&attrs([("done", false.into())]));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id(), Some(2.into()));

        let found = set.find_where(&attrs([("done", true.into())]));
        assert_eq!(found.unwrap().id(), Some(1.into()));

        let odd = set.filter_by(&Iteratee::Predicate(Rc::new(|e| {
            e.id().and_then(|v| v.as_int()).map(|i| i % 2 == 1).unwrap_or(false)
        })));
        assert_eq!(odd.len(), 2);
    }

    #[test]
    fn test_push_pop_shift_unshift() {
        let set = EntitySet::new();
        set.push(attrs([("id", 1.into())]));
        set.push(attrs([("id", 2.into())]));
        set.unshift(attrs([("id", 0.into())]));
        assert_eq!(set.ids(), vec![0.into(), 1.into(), 2.into()]);

        let popped = set.pop().unwrap();
        assert_eq!(popped.id(), Some(2.into()));
        let shifted = set.shift().unwrap();
        assert_eq!(shifted.id(), Some(0.into()));
        assert_eq!(set.ids(), vec![1.into()]);
    }

    #[test]
    fn test_end_to_end_rank_scenario() {
        let set = EntitySet::with_config(
            SetConfig::new().with_comparator(Comparator::attribute("rank")),
        );
        let log = event_log(&set);

        set.add(vec![attrs([("id", 1.into()), ("rank", 5.into())]).into()]);
        set.add(vec![attrs([("id", 2.into()), ("rank", 1.into())]).into()]);
        assert_eq!(set.ids(), vec![2.into(), 1.into()]);
        assert_eq!(count(&log, "sort"), 2);

        log.borrow_mut().clear();
        set.set(
            vec![attrs([("id", 1.into()), ("rank", 0.into())]).into()],
            &ReconcileOptions {
                remove: false,
                ..Default::default()
            },
        );
        assert_eq!(set.ids(), vec![1.into(), 2.into()]);
        assert_eq!(count(&log, "sort"), 1);
        assert_eq!(count(&log, "add"), 0);
        assert_eq!(count(&log, "remove"), 0);
    }

    #[test]
    fn test_merge_without_comparator_change_does_not_resort() {
        let set = EntitySet::with_config(
            SetConfig::new().with_comparator(Comparator::attribute("rank")),
        );
        set.add(vec![
            attrs([("id", 1.into()), ("rank", 1.into()), ("name", "a".into())]).into(),
            attrs([("id", 2.into()), ("rank", 2.into()), ("name", "b".into())]).into(),
        ]);
        let log = event_log(&set);

        set.set(
            vec![attrs([("id", 1.into()), ("rank", 1.into()), ("name", "z".into())]).into()],
            &ReconcileOptions {
                remove: false,
                ..Default::default()
            },
        );
        assert_eq!(count(&log, "sort"), 0);
        assert_eq!(count(&log, "change:name"), 1);
    }
}
