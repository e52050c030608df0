//! Observable entities
//!
//! An [`Entity`] is a single record: a map of named attributes with change
//! tracking against both the current state and the snapshot taken when the
//! current mutation batch began. Every mutation goes through [`Entity::set`]
//! (or its `unset`/`clear` forms), which emits one `change:<name>` event per
//! changed attribute and a single aggregate `change` event per batch,
//! correct under re-entrant mutation from inside handlers.

use crate::events::{EventData, EventHub, HandlerId};
use crate::set::{EntitySet, WeakEntitySet};
use crate::value::{Value, ValueMap};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Process-local identifier assigned to every entity at construction
///
/// Stable for the entity's lifetime and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

impl ClientId {
    fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Validation hook: `Some(error)` rejects the prospective attributes
pub type Validator = Rc<dyn Fn(&ValueMap) -> Option<Value>>;

/// Parse hook: maps a raw server response to attributes
pub type ParseEntity = Rc<dyn Fn(&Value) -> ValueMap>;

/// Per-kind entity configuration
///
/// What a subclass would carry in a prototype-based rendition: the id
/// attribute name, default attributes, and the validation/parse/url hooks.
/// Shared between the entities of one kind via `Rc`.
#[derive(Clone, Default)]
pub struct Schema {
    id_attribute: String,
    defaults: ValueMap,
    validator: Option<Validator>,
    parse: Option<ParseEntity>,
    url_root: Option<String>,
}

impl Schema {
    /// Create a schema with the default `"id"` identity attribute
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `name` as the identity attribute
    pub fn with_id_attribute(mut self, name: impl Into<String>) -> Self {
        self.id_attribute = name.into();
        self
    }

    /// Attributes applied to every new entity before explicit ones
    pub fn with_defaults(mut self, defaults: ValueMap) -> Self {
        self.defaults = defaults;
        self
    }

    /// Install a validation hook
    pub fn with_validator(mut self, validator: impl Fn(&ValueMap) -> Option<Value> + 'static) -> Self {
        self.validator = Some(Rc::new(validator));
        self
    }

    /// Install a parse hook for server responses
    pub fn with_parse(mut self, parse: impl Fn(&Value) -> ValueMap + 'static) -> Self {
        self.parse = Some(Rc::new(parse));
        self
    }

    /// Root URL for entities of this kind
    pub fn with_url_root(mut self, url_root: impl Into<String>) -> Self {
        self.url_root = Some(url_root.into());
        self
    }

    /// Wrap in an `Rc` for sharing with sets and entities
    pub fn shared(self) -> Rc<Schema> {
        Rc::new(self)
    }

    /// The identity attribute name (default `"id"`)
    pub fn id_attribute(&self) -> &str {
        if self.id_attribute.is_empty() {
            "id"
        } else {
            &self.id_attribute
        }
    }

    /// Default attributes for new entities
    pub fn defaults(&self) -> &ValueMap {
        &self.defaults
    }

    /// The validation hook, if any
    pub fn validator(&self) -> Option<&Validator> {
        self.validator.as_ref()
    }

    /// The parse hook, if any
    pub fn parse(&self) -> Option<&ParseEntity> {
        self.parse.as_ref()
    }

    /// The root URL, if any
    pub fn url_root(&self) -> Option<&str> {
        self.url_root.as_deref()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("id_attribute", &self.id_attribute())
            .field("defaults", &self.defaults)
            .field("validator", &self.validator.is_some())
            .field("url_root", &self.url_root)
            .finish()
    }
}

/// Options for attribute mutation
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Suppress all events for this mutation
    pub silent: bool,
    /// Run the schema validator before applying; rejection aborts
    pub validate: bool,
}

impl SetOptions {
    /// Options with `silent: true`
    pub fn silent() -> Self {
        Self {
            silent: true,
            validate: false,
        }
    }

    /// Options with `validate: true`
    pub fn validated() -> Self {
        Self {
            silent: false,
            validate: true,
        }
    }
}

/// Batch state for the mutation machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchPhase {
    Idle,
    Batching,
}

struct EntityState {
    id: Option<Value>,
    attributes: ValueMap,
    /// Attributes differing from `previous`; `None` records an unset
    changed: IndexMap<String, Option<Value>>,
    /// Snapshot taken when the current batch began
    previous: ValueMap,
    validation_error: Option<Value>,
    phase: BatchPhase,
    /// Aggregate-change marker, drained by the batch-opening call
    pending: Option<SetOptions>,
    owner: Option<WeakEntitySet>,
}

struct EntityInner {
    cid: ClientId,
    schema: Rc<Schema>,
    hub: EventHub,
    state: RefCell<EntityState>,
}

/// A single observable record
///
/// Cheap to clone; clones share the same state and event hub.
#[derive(Clone)]
pub struct Entity {
    inner: Rc<EntityInner>,
}

impl Entity {
    /// Create an entity with the default schema
    pub fn new(attributes: ValueMap) -> Self {
        Self::with_schema(attributes, Rc::new(Schema::default()))
    }

    /// Create an entity governed by `schema`
    ///
    /// Defaults are applied first, explicit attributes override them, and
    /// no change events fire during construction.
    pub fn with_schema(attributes: ValueMap, schema: Rc<Schema>) -> Self {
        let mut merged = schema.defaults().clone();
        for (name, value) in attributes {
            merged.insert(name, value);
        }
        let id = merged
            .get(schema.id_attribute())
            .filter(|v| !v.is_null())
            .cloned();
        Self {
            inner: Rc::new(EntityInner {
                cid: ClientId::next(),
                schema,
                hub: EventHub::new(),
                state: RefCell::new(EntityState {
                    id,
                    previous: merged.clone(),
                    attributes: merged,
                    changed: IndexMap::new(),
                    validation_error: None,
                    phase: BatchPhase::Idle,
                    pending: None,
                    owner: None,
                }),
            }),
        }
    }

    /// Whether two handles refer to the same entity
    pub fn ptr_eq(a: &Entity, b: &Entity) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// The process-local client id
    pub fn cid(&self) -> ClientId {
        self.inner.cid
    }

    /// The external identity, once present
    pub fn id(&self) -> Option<Value> {
        self.inner.state.borrow().id.clone()
    }

    /// Whether the entity has no external identity yet
    pub fn is_new(&self) -> bool {
        self.inner.state.borrow().id.is_none()
    }

    /// The governing schema
    pub fn schema(&self) -> &Rc<Schema> {
        &self.inner.schema
    }

    /// This entity's event hub
    pub fn events(&self) -> &EventHub {
        &self.inner.hub
    }

    /// Register a handler; see [`EventHub::on`]
    pub fn on(&self, names: &str, callback: impl Fn(&crate::events::Event) + 'static) -> HandlerId {
        self.inner.hub.on(names, callback)
    }

    /// Register a one-shot handler; see [`EventHub::once`]
    pub fn once(&self, names: &str, callback: impl Fn(&crate::events::Event) + 'static) -> HandlerId {
        self.inner.hub.once(names, callback)
    }

    /// Remove handlers; see [`EventHub::off`]
    pub fn off(&self, name: &str) {
        self.inner.hub.off(name)
    }

    /// Emit an event from this entity
    pub fn trigger(&self, name: &str, data: EventData) {
        self.inner.hub.trigger(name, data)
    }

    /// Read an attribute
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.state.borrow().attributes.get(name).cloned()
    }

    /// Whether `name` holds a non-null value
    pub fn has(&self, name: &str) -> bool {
        self.inner
            .state
            .borrow()
            .attributes
            .get(name)
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }

    /// Snapshot of the current attributes
    pub fn attributes(&self) -> ValueMap {
        self.inner.state.borrow().attributes.clone()
    }

    /// Current attributes as a `Value::Map`
    pub fn to_value(&self) -> Value {
        Value::Map(self.attributes())
    }

    /// Apply a batch of attribute assignments
    ///
    /// Emits `change:<name>` for every attribute whose value actually
    /// changed (deep equality), in encounter order, then one aggregate
    /// `change` for the whole batch. Nested calls made from handlers fold
    /// into the outermost batch. With `validate`, a rejection stores the
    /// error, emits `invalid` (unless silent), and leaves state untouched.
    pub fn set(&self, attributes: ValueMap, options: &SetOptions) -> Result<(), Value> {
        let entries = attributes
            .into_iter()
            .map(|(name, value)| (name, Some(value)))
            .collect();
        self.apply(entries, options)
    }

    /// Assign a single attribute with default options
    pub fn set_attr(&self, name: impl Into<String>, value: impl Into<Value>) -> Result<(), Value> {
        self.apply(
            vec![(name.into(), Some(value.into()))],
            &SetOptions::default(),
        )
    }

    /// Delete an attribute
    pub fn unset(&self, name: &str, options: &SetOptions) -> Result<(), Value> {
        self.apply(vec![(name.to_string(), None)], options)
    }

    /// Delete every attribute in one batch
    pub fn clear(&self, options: &SetOptions) -> Result<(), Value> {
        let names: Vec<String> = self.inner.state.borrow().attributes.keys().cloned().collect();
        self.apply(names.into_iter().map(|n| (n, None)).collect(), options)
    }

    /// Whether anything changed since the current batch began
    pub fn has_changed(&self) -> bool {
        !self.inner.state.borrow().changed.is_empty()
    }

    /// Whether `name` changed since the current batch began
    pub fn has_changed_attr(&self, name: &str) -> bool {
        self.inner.state.borrow().changed.contains_key(name)
    }

    /// The changed attributes, or `None` if nothing changed
    ///
    /// Entries hold the new value, or `None` where the attribute was unset.
    pub fn changed_attributes(&self) -> Option<IndexMap<String, Option<Value>>> {
        let st = self.inner.state.borrow();
        if st.changed.is_empty() {
            None
        } else {
            Some(st.changed.clone())
        }
    }

    /// The entries of `candidate` that differ from the pre-change baseline
    ///
    /// Returns `None` when no entry differs. Mid-batch the baseline is the
    /// batch-start snapshot, otherwise the current attributes.
    pub fn changed_from(&self, candidate: &ValueMap) -> Option<ValueMap> {
        let st = self.inner.state.borrow();
        let baseline = if st.phase == BatchPhase::Batching {
            &st.previous
        } else {
            &st.attributes
        };
        let mut out = ValueMap::new();
        for (name, value) in candidate {
            if baseline.get(name) != Some(value) {
                out.insert(name.clone(), value.clone());
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// An attribute's value at the start of the current batch
    pub fn previous(&self, name: &str) -> Option<Value> {
        self.inner.state.borrow().previous.get(name).cloned()
    }

    /// Snapshot of all attributes at the start of the current batch
    pub fn previous_attributes(&self) -> ValueMap {
        self.inner.state.borrow().previous.clone()
    }

    /// The last validation failure, if any
    pub fn validation_error(&self) -> Option<Value> {
        self.inner.state.borrow().validation_error.clone()
    }

    /// Run validation against the current attributes without mutating
    ///
    /// A failure is recorded and emitted as `invalid`, like a rejected set.
    pub fn is_valid(&self) -> bool {
        self.validate_entries(&[], false).is_ok()
    }

    /// Validate the current attributes extended with `candidate`
    ///
    /// Used by persistence layers to vet a deferred mutation. Stores the
    /// error and emits `invalid` (unless `silent`) on failure.
    pub fn validate_candidate(&self, candidate: &ValueMap, silent: bool) -> Result<(), Value> {
        let entries: Vec<(String, Option<Value>)> = candidate
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        self.validate_entries(&entries, silent)
    }

    /// Signal the end of this entity's life
    ///
    /// Releases every subscription this entity holds on other hubs, then
    /// emits `destroy`; an owning set reacts by removing the entity.
    pub fn destroy(&self) {
        self.inner.hub.stop_listening(None, None);
        self.inner.hub.trigger(
            "destroy",
            EventData::Destroy {
                entity: self.clone(),
            },
        );
    }

    /// The set holding the owning back-reference, if alive
    pub fn owner(&self) -> Option<EntitySet> {
        self.inner
            .state
            .borrow()
            .owner
            .as_ref()
            .and_then(|w| w.upgrade())
    }

    pub(crate) fn set_owner_if_unset(&self, owner: WeakEntitySet) {
        let mut st = self.inner.state.borrow_mut();
        if st.owner.as_ref().and_then(|w| w.upgrade()).is_none() {
            st.owner = Some(owner);
        }
    }

    pub(crate) fn clear_owner_if(&self, set: &EntitySet) {
        let mut st = self.inner.state.borrow_mut();
        let owned_by_set = st
            .owner
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(|s| EntitySet::ptr_eq(&s, set))
            .unwrap_or(false);
        if owned_by_set {
            st.owner = None;
        }
    }

    fn validate_entries(
        &self,
        entries: &[(String, Option<Value>)],
        silent: bool,
    ) -> Result<(), Value> {
        let Some(validator) = self.inner.schema.validator().cloned() else {
            return Ok(());
        };
        let merged = {
            let st = self.inner.state.borrow();
            let mut m = st.attributes.clone();
            for (name, value) in entries {
                match value {
                    Some(v) => {
                        m.insert(name.clone(), v.clone());
                    }
                    None => {
                        m.shift_remove(name);
                    }
                }
            }
            m
        };
        match validator(&merged) {
            None => {
                self.inner.state.borrow_mut().validation_error = None;
                Ok(())
            }
            Some(error) => {
                self.inner.state.borrow_mut().validation_error = Some(error.clone());
                if !silent {
                    self.inner.hub.trigger(
                        "invalid",
                        EventData::Invalid {
                            entity: self.clone(),
                            error: error.clone(),
                        },
                    );
                }
                Err(error)
            }
        }
    }

    fn apply(
        &self,
        entries: Vec<(String, Option<Value>)>,
        options: &SetOptions,
    ) -> Result<(), Value> {
        if options.validate {
            self.validate_entries(&entries, options.silent)?;
        }

        let mut fired: Vec<(String, Option<Value>)> = Vec::new();
        let was_batching;
        {
            let mut st = self.inner.state.borrow_mut();
            was_batching = st.phase == BatchPhase::Batching;
            st.phase = BatchPhase::Batching;
            if !was_batching {
                st.previous = st.attributes.clone();
                st.changed.clear();
            }
            for (name, value) in entries {
                if st.attributes.get(&name) != value.as_ref() {
                    fired.push((name.clone(), value.clone()));
                }
                if st.previous.get(&name) != value.as_ref() {
                    st.changed.insert(name.clone(), value.clone());
                } else {
                    st.changed.shift_remove(&name);
                }
                match value {
                    Some(v) => {
                        st.attributes.insert(name, v);
                    }
                    None => {
                        st.attributes.shift_remove(&name);
                    }
                }
            }
            st.id = st
                .attributes
                .get(self.inner.schema.id_attribute())
                .filter(|v| !v.is_null())
                .cloned();
            if !options.silent && !fired.is_empty() {
                st.pending = Some(options.clone());
            }
        }

        if !options.silent {
            for (name, value) in &fired {
                trace!(entity = %self.inner.cid, attr = %name, "attribute changed");
                self.inner.hub.trigger(
                    &format!("change:{}", name),
                    EventData::Attr {
                        entity: self.clone(),
                        attr: name.clone(),
                        value: value.clone(),
                    },
                );
            }
        }

        // Nested call: the batch-opening caller emits the aggregate event.
        if was_batching {
            return Ok(());
        }

        if !options.silent {
            // Drain aggregate notifications, including any queued by
            // handlers of the per-attribute events above. Bounded by the
            // pending marker: once no handler queues more work, it stays
            // empty and the loop ends.
            loop {
                let pending = self.inner.state.borrow_mut().pending.take();
                if pending.is_none() {
                    break;
                }
                self.inner.hub.trigger(
                    "change",
                    EventData::Change {
                        entity: self.clone(),
                    },
                );
            }
        }

        let mut st = self.inner.state.borrow_mut();
        st.phase = BatchPhase::Idle;
        st.pending = None;
        Ok(())
    }
}

impl PartialEq for Entity {
    /// Identity equality: two handles are equal iff they are the same entity
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("Entity")
            .field("cid", &self.inner.cid)
            .field("id", &st.id)
            .field("attributes", &st.attributes)
            .finish()
    }
}
