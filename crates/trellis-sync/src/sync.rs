//! Fetch/save/destroy orchestration
//!
//! [`EntitySync`] and [`SetSync`] drive a [`Transport`] and feed results
//! back through the same mutation paths everything else uses: fetched and
//! saved attributes merge via `Entity::set`, collection responses
//! reconcile via `EntitySet::set` or `reset`. Success emits `sync`,
//! failure emits `error` and leaves in-memory state intact.

use crate::error::{Error, Result};
use crate::transport::{SyncMethod, SyncRequest, Transport};
use tracing::debug;
use trellis_core::{
    Entity, EntitySet, EventData, Incoming, ReconcileOptions, SetOptions, Value, ValueMap,
};

/// Caller-supplied completion callback
pub type Done = Box<dyn FnOnce(Result<Value>)>;

/// Options for [`EntitySync::fetch_from`]
#[derive(Default)]
pub struct FetchOptions {
    /// Suppress events while merging the response
    pub silent: bool,
    /// Validate the merged attributes
    pub validate: bool,
    /// Completion callback
    pub on_done: Option<Done>,
}

/// Options for [`EntitySync::save_to`] and [`SetSync::create_on`]
pub struct SaveOptions {
    /// Suppress events while applying attributes
    pub silent: bool,
    /// Validate before sending (default true)
    pub validate: bool,
    /// Defer local mutation until the server confirms
    pub wait: bool,
    /// Send only the changed attributes as a patch
    pub patch: bool,
    /// Completion callback
    pub on_done: Option<Done>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            silent: false,
            validate: true,
            wait: false,
            patch: false,
            on_done: None,
        }
    }
}

/// Options for [`EntitySync::destroy_on`]
#[derive(Default)]
pub struct DestroyOptions {
    /// Defer the local destroy until the server confirms
    pub wait: bool,
    /// Completion callback
    pub on_done: Option<Done>,
}

/// Options for [`SetSync::fetch_from`]
#[derive(Default)]
pub struct SetFetchOptions {
    /// Replace membership via `reset` instead of reconciling via `set`
    pub reset: bool,
    /// Suppress events while applying the response
    pub silent: bool,
    /// Completion callback
    pub on_done: Option<Done>,
}

/// Derive an entity's resource URL
///
/// The base comes from the schema's `url_root`, falling back to the owning
/// set's `url`; persisted entities get their percent-encoded id appended.
///
/// # Panics
///
/// Panics when neither a `url_root` nor an owning set URL is available;
/// syncing such an entity is a programming error.
pub fn entity_url(entity: &Entity) -> String {
    let base = entity
        .schema()
        .url_root()
        .map(str::to_string)
        .or_else(|| entity.owner().and_then(|set| set.url()))
        .unwrap_or_else(|| {
            panic!("cannot derive a url: no schema url_root and no owning set url")
        });
    match entity.id() {
        None => base,
        Some(id) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            urlencoding::encode(&id.to_key())
        ),
    }
}

/// The collection URL of a set
///
/// # Panics
///
/// Panics when the set was configured without a URL.
pub fn set_url(set: &EntitySet) -> String {
    set.url()
        .unwrap_or_else(|| panic!("cannot derive a url: the entity set has no url configured"))
}

fn parse_entity_response(entity: &Entity, body: &Value) -> Result<ValueMap> {
    if let Some(parse) = entity.schema().parse() {
        return Ok(parse(body));
    }
    match body {
        Value::Null => Ok(ValueMap::new()),
        Value::Map(map) => Ok(map.clone()),
        other => Err(Error::BadResponse(format!(
            "expected a map of attributes, got {}",
            other.type_name()
        ))),
    }
}

fn parse_set_response(set: &EntitySet, body: &Value) -> Result<Vec<ValueMap>> {
    if let Some(parse) = set.parse() {
        return Ok(parse(body));
    }
    match body {
        Value::Null => Ok(Vec::new()),
        Value::List(items) => items
            .iter()
            .map(|item| match item {
                Value::Map(map) => Ok(map.clone()),
                other => Err(Error::BadResponse(format!(
                    "expected a list of maps, found a {} item",
                    other.type_name()
                ))),
            })
            .collect(),
        other => Err(Error::BadResponse(format!(
            "expected a list of maps, got {}",
            other.type_name()
        ))),
    }
}

/// Run the caller's completion, then announce the outcome as an event
fn finish_entity(entity: &Entity, outcome: Result<Value>, on_done: Option<Done>) {
    let announced = outcome.clone();
    if let Some(done) = on_done {
        done(outcome);
    }
    match announced {
        Ok(response) => {
            entity.trigger("sync", EventData::Sync { response });
        }
        Err(error) => {
            debug!(%error, "entity sync failed");
            entity.trigger(
                "error",
                EventData::SyncError {
                    message: error.to_string(),
                },
            );
        }
    }
}

/// Persistence operations for a single entity
pub trait EntitySync {
    /// Read the server state and merge it into the entity
    fn fetch_from(&self, transport: &dyn Transport, options: FetchOptions);

    /// Persist the entity, optionally applying `attrs` first
    ///
    /// New entities create, persisted ones update (or patch). Returns an
    /// error without sending when validation rejects the mutation.
    fn save_to(
        &self,
        attrs: Option<ValueMap>,
        transport: &dyn Transport,
        options: SaveOptions,
    ) -> Result<()>;

    /// Delete the server copy and destroy the entity locally
    ///
    /// Never-persisted entities destroy immediately without a request.
    fn destroy_on(&self, transport: &dyn Transport, options: DestroyOptions);
}

impl EntitySync for Entity {
    fn fetch_from(&self, transport: &dyn Transport, options: FetchOptions) {
        let FetchOptions {
            silent,
            validate,
            on_done,
        } = options;
        let url = entity_url(self);
        self.trigger(
            "request",
            EventData::Request {
                method: SyncMethod::Read.name().to_string(),
            },
        );
        let entity = self.clone();
        transport.send(
            SyncRequest {
                method: SyncMethod::Read,
                url,
                body: None,
            },
            Box::new(move |result| {
                let outcome = result.and_then(|body| {
                    let attributes = parse_entity_response(&entity, &body)?;
                    entity
                        .set(attributes, &SetOptions { silent, validate })
                        .map_err(Error::Rejected)?;
                    Ok(body)
                });
                finish_entity(&entity, outcome, on_done);
            }),
        );
    }

    fn save_to(
        &self,
        attrs: Option<ValueMap>,
        transport: &dyn Transport,
        options: SaveOptions,
    ) -> Result<()> {
        let SaveOptions {
            silent,
            validate,
            wait,
            patch,
            on_done,
        } = options;
        let set_options = SetOptions { silent, validate };

        if let Some(candidate) = &attrs {
            if !wait {
                self.set(candidate.clone(), &set_options)
                    .map_err(Error::Rejected)?;
            } else if validate {
                self.validate_candidate(candidate, silent)
                    .map_err(Error::Rejected)?;
            }
        } else if validate {
            self.validate_candidate(&ValueMap::new(), silent)
                .map_err(Error::Rejected)?;
        }

        let method = if self.is_new() {
            SyncMethod::Create
        } else if patch {
            SyncMethod::Patch
        } else {
            SyncMethod::Update
        };
        let body = if patch {
            Value::Map(attrs.clone().unwrap_or_default())
        } else {
            // With wait, the deferred attributes still travel in the body.
            let mut merged = self.attributes();
            if wait {
                if let Some(candidate) = &attrs {
                    for (name, value) in candidate {
                        merged.insert(name.clone(), value.clone());
                    }
                }
            }
            Value::Map(merged)
        };
        let url = entity_url(self);
        self.trigger(
            "request",
            EventData::Request {
                method: method.name().to_string(),
            },
        );
        let entity = self.clone();
        transport.send(
            SyncRequest {
                method,
                url,
                body: Some(body),
            },
            Box::new(move |result| {
                let outcome = result.and_then(|body| {
                    let mut server = parse_entity_response(&entity, &body)?;
                    if wait {
                        if let Some(candidate) = attrs {
                            // Deferred attributes apply now; server wins on
                            // conflicts.
                            let mut merged = candidate;
                            merged.extend(server);
                            server = merged;
                        }
                    }
                    if !server.is_empty() {
                        entity.set(server, &set_options).map_err(Error::Rejected)?;
                    }
                    Ok(body)
                });
                finish_entity(&entity, outcome, on_done);
            }),
        );
        Ok(())
    }

    fn destroy_on(&self, transport: &dyn Transport, options: DestroyOptions) {
        let DestroyOptions { wait, on_done } = options;
        if self.is_new() {
            self.destroy();
            if let Some(done) = on_done {
                done(Ok(Value::Null));
            }
            return;
        }
        let url = entity_url(self);
        self.trigger(
            "request",
            EventData::Request {
                method: SyncMethod::Delete.name().to_string(),
            },
        );
        let entity = self.clone();
        transport.send(
            SyncRequest {
                method: SyncMethod::Delete,
                url,
                body: None,
            },
            Box::new(move |result| {
                if result.is_ok() && wait {
                    entity.destroy();
                }
                finish_entity(&entity, result, on_done);
            }),
        );
        if !wait {
            self.destroy();
        }
    }
}

/// Persistence operations for an entity set
pub trait SetSync {
    /// Read the server collection and reconcile (or reset) the members
    fn fetch_from(&self, transport: &dyn Transport, options: SetFetchOptions);

    /// Build an entity from `attributes`, add it, and save it
    ///
    /// With `wait`, membership is deferred until the save succeeds.
    /// Returns `None` when validation rejects the new entity.
    fn create_on(
        &self,
        attributes: ValueMap,
        transport: &dyn Transport,
        options: SaveOptions,
    ) -> Option<Entity>;
}

impl SetSync for EntitySet {
    fn fetch_from(&self, transport: &dyn Transport, options: SetFetchOptions) {
        let SetFetchOptions {
            reset,
            silent,
            on_done,
        } = options;
        let url = set_url(self);
        self.trigger(
            "request",
            EventData::Request {
                method: SyncMethod::Read.name().to_string(),
            },
        );
        let set = self.clone();
        transport.send(
            SyncRequest {
                method: SyncMethod::Read,
                url,
                body: None,
            },
            Box::new(move |result| {
                let outcome = result.and_then(|body| {
                    let batches = parse_set_response(&set, &body)?;
                    let incoming: Vec<Incoming> =
                        batches.into_iter().map(Incoming::Attrs).collect();
                    let reconcile = ReconcileOptions {
                        silent,
                        ..Default::default()
                    };
                    if reset {
                        set.reset(incoming, &reconcile);
                    } else {
                        set.set(incoming, &reconcile);
                    }
                    Ok(body)
                });
                let announced = outcome.clone();
                if let Some(done) = on_done {
                    done(outcome);
                }
                match announced {
                    Ok(response) => {
                        set.trigger("sync", EventData::Sync { response });
                    }
                    Err(error) => {
                        debug!(%error, "set sync failed");
                        set.trigger(
                            "error",
                            EventData::SyncError {
                                message: error.to_string(),
                            },
                        );
                    }
                }
            }),
        );
    }

    fn create_on(
        &self,
        attributes: ValueMap,
        transport: &dyn Transport,
        options: SaveOptions,
    ) -> Option<Entity> {
        let SaveOptions {
            silent,
            validate,
            wait,
            patch,
            on_done,
        } = options;
        let entity = self.build(attributes)?;
        if !wait {
            self.add(vec![entity.clone().into()]);
        }
        let set = self.clone();
        let added = entity.clone();
        let wrapped: Done = Box::new(move |result| {
            if result.is_ok() && wait {
                set.add(vec![added.into()]);
            }
            if let Some(done) = on_done {
                done(result);
            }
        });
        let _ = entity.save_to(
            None,
            transport,
            SaveOptions {
                silent,
                validate,
                wait,
                patch,
                on_done: Some(wrapped),
            },
        );
        Some(entity)
    }
}
