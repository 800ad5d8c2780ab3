//! Two editors on one document against an in-memory server.
//!
//! Alice edits and syncs in the background; Bob edits the same key offline
//! from her, gets rejected as stale, refetches, and lands his edits on top.
//! Run with `RUST_LOG=debug` to watch the engine.

use cms_collab::{
    CollabStore, EntityId, LifecycleEvent, MemoryServer, Operation, Projection,
    SpliceToggleOperator, SyncConfig, Transaction,
};
use log::info;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

fn add_block(index: usize, id: &str) -> Transaction {
    Transaction::single("", Operation::insert(index, vec![json!({ "id": id })]))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let server = MemoryServer::new();
    let config = SyncConfig::default();
    let document = EntityId::from("landing-page");

    let alice = CollabStore::new(Uuid::new_v4(), server.clone(), config.clone());
    let bob = CollabStore::new(Uuid::new_v4(), server.clone(), config);

    let alice_doc = alice.timeline(document.clone());
    let bob_doc = bob.timeline(document.clone());
    alice_doc.initialize(server.fetch(&document));
    bob_doc.initialize(server.fetch(&document));

    // Bob's data layer: refetch whenever his timeline reports staleness.
    let (refetch_tx, mut refetch_rx) = tokio::sync::mpsc::unbounded_channel();
    let _stale = bob_doc.register_stale_listener(move |event| {
        if let Err(err) = refetch_tx.send(event.document.clone()) {
            log::debug!("Refetch request for {} dropped: {err}", event.document);
        }
    });

    let alice_view = Projection::new(
        alice_doc.get_queue("config"),
        SpliceToggleOperator::new(json!([])),
    );
    let bob_view = Projection::new(
        bob_doc.get_queue("config"),
        SpliceToggleOperator::new(json!([])),
    );
    let _printer = bob_view.subscribe(|state| info!("Bob sees {state}"));

    let driver = alice.sync_on_interval();

    // Alice adds a hero block and types its title.
    let queue = alice_doc.get_queue("config");
    queue.push(add_block(0, "hero"));
    for ch in "Welcome".chars() {
        let title = Operation::toggle("title", ch.to_string());
        queue.push_mergeable(Transaction::single("hero", title));
    }
    driver.notify(LifecycleEvent::Publish);
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("alice: {}", alice_view.state());

    // Bob, not yet aware of Alice's publish, adds a footer and then undoes a
    // mistaken label.
    let mut mutator = bob_doc.bound_mutate("config", json!([]));
    mutator.push(add_block(0, "footer"));
    mutator.push(Transaction::single("footer", Operation::toggle("label", "oops")));
    mutator.undo();
    println!("bob (local): {}", bob_view.state());

    let report = bob.sync(true).await?;
    println!("bob sync: {report:?}, stale = {}", bob_doc.is_stale());

    if let Some(id) = refetch_rx.recv().await {
        let init = bob_doc.initialize(server.fetch(&id));
        println!("bob refetched: {init:?}");
    }
    let report = bob.sync(true).await?;
    println!("bob sync: {report:?}");
    println!("bob: {}", bob_view.state());

    let final_report = driver.shutdown().await?;
    info!("Alice's driver stopped: {final_report:?}");

    let reader = CollabStore::new(Uuid::new_v4(), server.clone(), SyncConfig::default());
    let fresh = reader.timeline(document.clone());
    fresh.initialize(server.fetch(&document));
    let view = Projection::new(fresh.get_queue("config"), SpliceToggleOperator::new(json!([])));
    println!("server: {} (version {})", view.state(), fresh.total_version());

    Ok(())
}
