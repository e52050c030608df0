//! Publish/subscribe capability
//!
//! `EventHub` gives any owning object named events with registration-order
//! dispatch, a `"all"` wildcard channel, one-shot handlers, and an
//! inversion-of-control `listen_to` mode whose bookkeeping allows bulk
//! removal by source (`stop_listening`) without remembering callbacks.
//!
//! Dispatch is synchronous and re-entrancy safe: the handlers visible when
//! `trigger` starts are the ones considered, a handler removed mid-dispatch
//! before its turn does not run, and a handler added mid-dispatch waits for
//! the next trigger. Handler panics propagate to the triggering caller; the
//! registry is only mutated between invocations, so an unwinding handler
//! leaves the bookkeeping intact.

use crate::entity::Entity;
use crate::set::EntitySet;
use crate::value::{Value, ValueMap};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier for one `on`/`once`/`listen_to` registration
///
/// A single registration may cover several whitespace-separated event
/// names; removing by id removes all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Callback invoked with the event payload
pub type Callback = Rc<dyn Fn(&Event)>;

/// An event delivered to handlers
///
/// `name` is the channel the event was triggered on; handlers bound to
/// `"all"` receive every event and read the channel from here.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event name, e.g. `"change:rank"` or `"remove"`
    pub name: String,
    /// Typed payload
    pub data: EventData,
}

/// Typed event payloads
///
/// The closed set of payloads the core emits. `Custom` carries free-form
/// parameters for application events.
#[derive(Debug, Clone)]
pub enum EventData {
    /// No payload
    None,
    /// One attribute changed (`change:<name>`)
    Attr {
        entity: Entity,
        attr: String,
        /// New value, `None` when the attribute was unset
        value: Option<Value>,
    },
    /// Aggregate change at the end of a mutation batch (`change`)
    Change { entity: Entity },
    /// Validation rejected a mutation (`invalid`)
    Invalid { entity: Entity, error: Value },
    /// Entity joined a set (`add`)
    Add {
        entity: Entity,
        set: EntitySet,
        /// Position, present when an explicit insertion index was requested
        index: Option<usize>,
    },
    /// Entity left a set (`remove`)
    Remove {
        entity: Entity,
        set: EntitySet,
        /// Position the entity occupied before removal
        index: usize,
    },
    /// Aggregate membership summary after a reconciliation (`update`)
    Update {
        set: EntitySet,
        added: Vec<Entity>,
        removed: Vec<Entity>,
        merged: Vec<Entity>,
    },
    /// Member order changed (`sort`)
    Sort { set: EntitySet },
    /// Bulk replacement (`reset`)
    Reset {
        set: EntitySet,
        /// Members before the reset
        previous: Vec<Entity>,
    },
    /// Entity destroyed (`destroy`)
    Destroy { entity: Entity },
    /// A persistence request is leaving (`request`)
    Request { method: String },
    /// A persistence request completed (`sync`)
    Sync { response: Value },
    /// A persistence request failed (`error`)
    SyncError { message: String },
    /// Application-defined payload
    Custom(ValueMap),
}

impl EventData {
    /// The entity an event originated from, if any
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            EventData::Attr { entity, .. }
            | EventData::Change { entity }
            | EventData::Invalid { entity, .. }
            | EventData::Add { entity, .. }
            | EventData::Remove { entity, .. }
            | EventData::Destroy { entity } => Some(entity),
            _ => None,
        }
    }
}

struct Handler {
    id: HandlerId,
    callback: Callback,
    once: bool,
    /// Hub id of the listener that installed this handler via `listen_to`
    listener: Option<u64>,
}

/// Bookkeeping for one listener→source link
struct Listening {
    source: Weak<HubInner>,
    /// Number of handler registrations backing this link
    count: usize,
}

#[derive(Default)]
struct HubState {
    handlers: IndexMap<String, Vec<Handler>>,
    next_handler: u64,
    /// Sources this hub's owner listens to, keyed by source hub id
    listening_to: IndexMap<u64, Listening>,
    /// Hubs listening to this one, keyed by listener hub id
    listeners: IndexMap<u64, Weak<HubInner>>,
}

struct HubInner {
    id: u64,
    state: RefCell<HubState>,
}

static NEXT_HUB_ID: AtomicU64 = AtomicU64::new(1);

/// Named-event registry with wildcard and listening bookkeeping
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct EventHub {
    inner: Rc<HubInner>,
}

impl EventHub {
    /// Create a new hub with no handlers
    pub fn new() -> Self {
        Self {
            inner: Rc::new(HubInner {
                id: NEXT_HUB_ID.fetch_add(1, Ordering::Relaxed),
                state: RefCell::new(HubState::default()),
            }),
        }
    }

    /// Process-unique identity of this hub
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether two handles refer to the same hub
    pub fn ptr_eq(a: &EventHub, b: &EventHub) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// Register `callback` for each whitespace-separated name in `names`
    ///
    /// Handlers fire in registration order. The returned id removes every
    /// name bound by this call.
    pub fn on(&self, names: &str, callback: impl Fn(&Event) + 'static) -> HandlerId {
        self.register(names, Rc::new(callback), false, None)
    }

    /// Like [`on`](Self::on), but each bound name fires at most once
    pub fn once(&self, names: &str, callback: impl Fn(&Event) + 'static) -> HandlerId {
        self.register(names, Rc::new(callback), true, None)
    }

    /// Remove every handler bound to `name`
    pub fn off(&self, name: &str) {
        let removed = {
            let mut st = self.inner.state.borrow_mut();
            st.handlers.shift_remove(name).unwrap_or_default()
        };
        self.settle_removed(&removed);
    }

    /// Remove every handler installed by the registration `id`
    pub fn off_handler(&self, id: HandlerId) {
        let removed = {
            let mut st = self.inner.state.borrow_mut();
            let mut removed = Vec::new();
            st.handlers.retain(|_, list| {
                let mut i = 0;
                while i < list.len() {
                    if list[i].id == id {
                        removed.push(list.remove(i));
                    } else {
                        i += 1;
                    }
                }
                !list.is_empty()
            });
            removed
        };
        self.settle_removed(&removed);
    }

    /// Remove every handler for every event
    ///
    /// Listening links backed by the removed handlers are released in both
    /// directions, so hubs that were listening to this one forget it.
    pub fn off_all(&self) {
        let removed: Vec<Handler> = {
            let mut st = self.inner.state.borrow_mut();
            std::mem::take(&mut st.handlers)
                .into_values()
                .flatten()
                .collect()
        };
        self.settle_removed(&removed);
    }

    /// Synchronously invoke handlers for `name`, then `"all"` handlers
    ///
    /// No registered handlers means a no-op.
    pub fn trigger(&self, name: &str, data: EventData) {
        let event = Event {
            name: name.to_string(),
            data,
        };
        self.dispatch(name, &event);
        if name != "all" {
            self.dispatch("all", &event);
        }
    }

    /// Subscribe this hub's owner to events on `source`
    ///
    /// The subscription is recorded against `source`'s identity so
    /// [`stop_listening`](Self::stop_listening) can remove it without the
    /// caller remembering the callback.
    pub fn listen_to(
        &self,
        source: &EventHub,
        names: &str,
        callback: impl Fn(&Event) + 'static,
    ) -> HandlerId {
        self.listen_impl(source, names, Rc::new(callback), false)
    }

    /// Like [`listen_to`](Self::listen_to), firing at most once per name
    pub fn listen_to_once(
        &self,
        source: &EventHub,
        names: &str,
        callback: impl Fn(&Event) + 'static,
    ) -> HandlerId {
        self.listen_impl(source, names, Rc::new(callback), true)
    }

    /// Remove subscriptions made through `listen_to`
    ///
    /// `source = None` releases every source; `names` optionally restricts
    /// removal to specific event names. A link whose registration count
    /// reaches zero is deleted from both sides.
    pub fn stop_listening(&self, source: Option<&EventHub>, names: Option<&str>) {
        let targets: Vec<(u64, Weak<HubInner>)> = {
            let st = self.inner.state.borrow();
            match source {
                Some(s) => st
                    .listening_to
                    .get(&s.id())
                    .map(|l| vec![(s.id(), l.source.clone())])
                    .unwrap_or_default(),
                None => st
                    .listening_to
                    .iter()
                    .map(|(id, l)| (*id, l.source.clone()))
                    .collect(),
            }
        };

        for (source_id, weak) in targets {
            let Some(source_inner) = weak.upgrade() else {
                self.inner
                    .state
                    .borrow_mut()
                    .listening_to
                    .shift_remove(&source_id);
                continue;
            };

            let name_filter: Option<Vec<&str>> = names.map(|n| n.split_whitespace().collect());
            let removed = {
                let mut st = source_inner.state.borrow_mut();
                let mut n = 0;
                st.handlers.retain(|name, list| {
                    let name_matches = name_filter
                        .as_ref()
                        .map(|f| f.iter().any(|x| *x == name.as_str()))
                        .unwrap_or(true);
                    if name_matches {
                        let before = list.len();
                        list.retain(|h| h.listener != Some(self.inner.id));
                        n += before - list.len();
                    }
                    !list.is_empty()
                });
                n
            };

            let link_dropped = {
                let mut st = self.inner.state.borrow_mut();
                match st.listening_to.get_mut(&source_id) {
                    Some(link) => {
                        link.count = link.count.saturating_sub(removed);
                        if link.count == 0 {
                            st.listening_to.shift_remove(&source_id);
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                }
            };
            if link_dropped {
                source_inner
                    .state
                    .borrow_mut()
                    .listeners
                    .shift_remove(&self.inner.id);
            }
        }
    }

    /// Number of handlers currently bound to `name`
    pub fn handler_count(&self, name: &str) -> usize {
        self.inner
            .state
            .borrow()
            .handlers
            .get(name)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Number of distinct sources this hub's owner is listening to
    pub fn listening_count(&self) -> usize {
        self.inner.state.borrow().listening_to.len()
    }

    fn register(
        &self,
        names: &str,
        callback: Callback,
        once: bool,
        listener: Option<u64>,
    ) -> HandlerId {
        let mut st = self.inner.state.borrow_mut();
        st.next_handler += 1;
        let id = HandlerId(st.next_handler);
        for name in names.split_whitespace() {
            st.handlers
                .entry(name.to_string())
                .or_default()
                .push(Handler {
                    id,
                    callback: callback.clone(),
                    once,
                    listener,
                });
        }
        id
    }

    fn listen_impl(
        &self,
        source: &EventHub,
        names: &str,
        callback: Callback,
        once: bool,
    ) -> HandlerId {
        let bound = names.split_whitespace().count();
        let id = source.register(names, callback, once, Some(self.inner.id));
        {
            let mut st = self.inner.state.borrow_mut();
            let link = st.listening_to.entry(source.id()).or_insert(Listening {
                source: Rc::downgrade(&source.inner),
                count: 0,
            });
            link.count += bound;
        }
        {
            let mut st = source.inner.state.borrow_mut();
            st.listeners
                .insert(self.inner.id, Rc::downgrade(&self.inner));
        }
        id
    }

    fn dispatch(&self, key: &str, event: &Event) {
        let snapshot: Vec<(HandlerId, Callback, bool)> = {
            let st = self.inner.state.borrow();
            match st.handlers.get(key) {
                Some(list) => list
                    .iter()
                    .map(|h| (h.id, h.callback.clone(), h.once))
                    .collect(),
                None => return,
            }
        };

        for (id, callback, once) in snapshot {
            // Re-check liveness: the handler may have been removed by an
            // earlier handler in this same dispatch.
            let removed_once = {
                let mut st = self.inner.state.borrow_mut();
                let Some(list) = st.handlers.get_mut(key) else {
                    continue;
                };
                let Some(pos) = list.iter().position(|h| h.id == id) else {
                    continue;
                };
                if once {
                    let handler = list.remove(pos);
                    if list.is_empty() {
                        st.handlers.shift_remove(key);
                    }
                    Some(handler)
                } else {
                    None
                }
            };
            if let Some(handler) = &removed_once {
                self.settle_removed(std::slice::from_ref(handler));
            }
            callback(event);
        }
    }

    /// Release listener-side bookkeeping for handlers removed from this hub
    fn settle_removed(&self, removed: &[Handler]) {
        for handler in removed {
            let Some(listener_id) = handler.listener else {
                continue;
            };
            let weak = {
                let st = self.inner.state.borrow();
                st.listeners.get(&listener_id).cloned()
            };
            let Some(weak) = weak else { continue };
            let link_dropped = match weak.upgrade() {
                Some(listener) => {
                    let mut st = listener.state.borrow_mut();
                    match st.listening_to.get_mut(&self.inner.id) {
                        Some(link) => {
                            link.count = link.count.saturating_sub(1);
                            if link.count == 0 {
                                st.listening_to.shift_remove(&self.inner.id);
                                true
                            } else {
                                false
                            }
                        }
                        None => false,
                    }
                }
                None => true,
            };
            if link_dropped {
                self.inner
                    .state
                    .borrow_mut()
                    .listeners
                    .shift_remove(&listener_id);
            }
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("EventHub")
            .field("id", &self.inner.id)
            .field("events", &st.handlers.len())
            .field("listening_to", &st.listening_to.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> Callback) {
        let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let make = move |tag: &str| -> Callback {
            let log = log2.clone();
            let tag = tag.to_string();
            Rc::new(move |event: &Event| {
                log.borrow_mut().push(format!("{}:{}", tag, event.name));
            })
        };
        (log, make)
    }

    #[test]
    fn test_trigger_runs_handlers_in_registration_order() {
        let hub = EventHub::new();
        let (log, make) = counter();
        let a = make("a");
        let b = make("b");
        hub.on("ping", move |e| a(e));
        hub.on("ping", move |e| b(e));

        hub.trigger("ping", EventData::None);
        assert_eq!(*log.borrow(), vec!["a:ping", "b:ping"]);
    }

    #[test]
    fn test_trigger_without_handlers_is_noop() {
        let hub = EventHub::new();
        hub.trigger("nothing", EventData::None);
    }

    #[test]
    fn test_multi_name_registration() {
        let hub = EventHub::new();
        let (log, make) = counter();
        let a = make("a");
        hub.on("ping pong", move |e| a(e));

        hub.trigger("ping", EventData::None);
        hub.trigger("pong", EventData::None);
        assert_eq!(*log.borrow(), vec!["a:ping", "a:pong"]);
    }

    #[test]
    fn test_all_wildcard_observes_event_name() {
        let hub = EventHub::new();
        let (log, make) = counter();
        let a = make("all");
        hub.on("all", move |e| a(e));

        hub.trigger("ping", EventData::None);
        hub.trigger("pong", EventData::None);
        assert_eq!(*log.borrow(), vec!["all:ping", "all:pong"]);
    }

    #[test]
    fn test_off_by_name_and_by_handler() {
        let hub = EventHub::new();
        let (log, make) = counter();
        let a = make("a");
        let b = make("b");
        let id = hub.on("ping pong", move |e| a(e));
        hub.on("ping", move |e| b(e));

        hub.off_handler(id);
        hub.trigger("ping", EventData::None);
        hub.trigger("pong", EventData::None);
        assert_eq!(*log.borrow(), vec!["b:ping"]);

        hub.off("ping");
        hub.trigger("ping", EventData::None);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_once_fires_at_most_once() {
        let hub = EventHub::new();
        let (log, make) = counter();
        let a = make("a");
        hub.once("ping", move |e| a(e));

        hub.trigger("ping", EventData::None);
        hub.trigger("ping", EventData::None);
        assert_eq!(*log.borrow(), vec!["a:ping"]);
        assert_eq!(hub.handler_count("ping"), 0);
    }

    #[test]
    fn test_once_survives_reentrant_trigger() {
        let hub = EventHub::new();
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        let hub2 = hub.clone();
        hub.once("ping", move |_| {
            *c.borrow_mut() += 1;
            // Re-entrant trigger must not run the handler again.
            hub2.trigger("ping", EventData::None);
        });

        hub.trigger("ping", EventData::None);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_handler_removed_mid_dispatch_does_not_run() {
        let hub = EventHub::new();
        let (log, make) = counter();
        let victim: Rc<RefCell<Option<HandlerId>>> = Rc::new(RefCell::new(None));
        let v = victim.clone();
        let hub2 = hub.clone();
        // The remover runs first and removes the victim before its turn.
        hub.on("ping", move |_| {
            if let Some(id) = v.borrow_mut().take() {
                hub2.off_handler(id);
            }
        });
        let b = make("b");
        let id = hub.on("ping", move |e| b(e));
        *victim.borrow_mut() = Some(id);

        hub.trigger("ping", EventData::None);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_handler_added_mid_dispatch_waits_for_next_pass() {
        let hub = EventHub::new();
        let (log, make) = counter();
        let late = make("late");
        let hub2 = hub.clone();
        let registered = Rc::new(RefCell::new(false));
        let r = registered.clone();
        hub.on("ping", move |_| {
            if !*r.borrow() {
                *r.borrow_mut() = true;
                let late = late.clone();
                hub2.on("ping", move |e| late(e));
            }
        });

        hub.trigger("ping", EventData::None);
        assert!(log.borrow().is_empty());
        hub.trigger("ping", EventData::None);
        assert_eq!(*log.borrow(), vec!["late:ping"]);
    }

    #[test]
    fn test_listen_to_and_stop_listening() {
        let listener = EventHub::new();
        let source = EventHub::new();
        let (log, make) = counter();
        let a = make("a");
        listener.listen_to(&source, "ping", move |e| a(e));
        assert_eq!(listener.listening_count(), 1);

        source.trigger("ping", EventData::None);
        assert_eq!(log.borrow().len(), 1);

        listener.stop_listening(Some(&source), None);
        assert_eq!(listener.listening_count(), 0);
        source.trigger("ping", EventData::None);
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(source.handler_count("ping"), 0);
    }

    #[test]
    fn test_stop_listening_all_sources() {
        let listener = EventHub::new();
        let s1 = EventHub::new();
        let s2 = EventHub::new();
        let (log, make) = counter();
        let a = make("a");
        let b = make("b");
        listener.listen_to(&s1, "ping", move |e| a(e));
        listener.listen_to(&s2, "ping", move |e| b(e));
        assert_eq!(listener.listening_count(), 2);

        listener.stop_listening(None, None);
        assert_eq!(listener.listening_count(), 0);
        s1.trigger("ping", EventData::None);
        s2.trigger("ping", EventData::None);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_stop_listening_name_filter_keeps_link_alive() {
        let listener = EventHub::new();
        let source = EventHub::new();
        let (log, make) = counter();
        let a = make("a");
        let b = make("b");
        listener.listen_to(&source, "ping", move |e| a(e));
        listener.listen_to(&source, "pong", move |e| b(e));

        listener.stop_listening(Some(&source), Some("ping"));
        assert_eq!(listener.listening_count(), 1);

        source.trigger("ping", EventData::None);
        source.trigger("pong", EventData::None);
        assert_eq!(*log.borrow(), vec!["b:pong"]);
    }

    #[test]
    fn test_source_off_all_releases_listener_bookkeeping() {
        let listener = EventHub::new();
        let source = EventHub::new();
        listener.listen_to(&source, "ping", |_| {});
        assert_eq!(listener.listening_count(), 1);

        source.off_all();
        assert_eq!(listener.listening_count(), 0);
    }

    #[test]
    fn test_listen_to_once_releases_link_after_firing() {
        let listener = EventHub::new();
        let source = EventHub::new();
        let (log, make) = counter();
        let a = make("a");
        listener.listen_to_once(&source, "ping", move |e| a(e));

        source.trigger("ping", EventData::None);
        source.trigger("ping", EventData::None);
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(listener.listening_count(), 0);
    }
}
