//! Roster Demo
//!
//! Demonstrates trellis with a small team roster: a schema with defaults
//! and validation, a rank-sorted entity set, reconciliation against a
//! server snapshot, and persistence through an in-memory transport.

use trellis_core::{attrs, Comparator, EntitySet, ReconcileOptions, Schema, SetConfig, Value};
use trellis_sync::{EntitySync, MemoryTransport, SaveOptions, SetFetchOptions, SetSync};

fn main() {
    println!("=== Trellis Roster Demo ===\n");

    // Schema: every member needs a name; rookies start at rank 99.
    let schema = Schema::new()
        .with_defaults(attrs([("rank", 99.into())]))
        .with_validator(|a| {
            if a.get("name").map(|v| v.is_truthy()).unwrap_or(false) {
                None
            } else {
                Some("a roster member needs a name".into())
            }
        })
        .shared();

    let roster = EntitySet::with_config(
        SetConfig::new()
            .with_schema(schema)
            .with_comparator(Comparator::attribute("rank"))
            .with_url("/api/roster"),
    );

    // Watch everything the roster does.
    roster.on("all", |event| match event.name.as_str() {
        "add" | "remove" | "destroy" => {
            if let Some(entity) = event.data.entity() {
                println!("  [{}] {}", event.name, describe(entity.get("name")));
            }
        }
        "sort" | "update" | "reset" | "sync" | "invalid" => {
            println!("  [{}]", event.name);
        }
        _ => {}
    });

    println!("Seeding three members (one invalid):");
    roster.add(vec![
        attrs([("id", 1.into()), ("name", "ada".into()), ("rank", 3.into())]).into(),
        attrs([("id", 2.into()), ("name", "grace".into()), ("rank", 1.into())]).into(),
        attrs([("id", 3.into())]).into(), // rejected: no name
    ]);
    println!(
        "Roster order: {:?}\n",
        roster.pluck("name").iter().map(Value::to_string).collect::<Vec<_>>()
    );

    println!("Reconciling against a server snapshot (grace promoted, ada gone):");
    roster.set(
        vec![
            attrs([("id", 2.into()), ("name", "grace".into()), ("rank", 0.into())]).into(),
            attrs([("id", 4.into()), ("name", "alan".into()), ("rank", 2.into())]).into(),
        ],
        &ReconcileOptions::default(),
    );
    println!(
        "Roster order: {:?}\n",
        roster.pluck("name").iter().map(Value::to_string).collect::<Vec<_>>()
    );

    // Persistence goes through a transport; here an in-memory one that
    // lets us play the server.
    let transport = MemoryTransport::new();

    println!("Creating a new member through the transport:");
    let rookie = roster
        .create_on(
            attrs([("name", "edsger".into())]),
            &transport,
            SaveOptions::default(),
        )
        .expect("valid member");
    println!(
        "  request: {} {}",
        transport.last_request().unwrap().method.verb(),
        transport.last_request().unwrap().url
    );
    transport.respond(Ok(Value::Map(attrs([("id", 7.into())]))));
    println!("  server assigned id: {}\n", describe(rookie.id()));

    println!("Fetching the authoritative roster (reset):");
    roster.fetch_from(
        &transport,
        SetFetchOptions {
            reset: true,
            ..Default::default()
        },
    );
    transport.respond(Ok(Value::List(vec![
        Value::Map(attrs([("id", 2.into()), ("name", "grace".into()), ("rank", 0.into())])),
        Value::Map(attrs([("id", 7.into()), ("name", "edsger".into()), ("rank", 5.into())])),
    ])));
    println!(
        "Final roster: {:?}",
        roster.pluck("name").iter().map(Value::to_string).collect::<Vec<_>>()
    );

    println!("\nDestroying a member (optimistic delete):");
    let grace = roster.get(&2.into()).expect("grace is present");
    grace.destroy_on(&transport, Default::default());
    transport.respond(Ok(Value::Null));
    println!("Members left: {}", roster.len());
}

fn describe(value: Option<Value>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}
