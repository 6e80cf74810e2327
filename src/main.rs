//! Demo: build a range index from a hash chain of keys, read every key
//! back, then tear it down.

use converge::tree::Store;
use tracing_subscriber::EnvFilter;

const ITEMS: usize = 5000;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Each key is the blake3 hex digest of the previous one, which gives a
    // deterministic but uniformly scattered key population.
    let mut data = Vec::with_capacity(ITEMS);
    let mut finger = String::from("seed");
    for _ in 0..ITEMS {
        let next = blake3::hash(finger.as_bytes()).to_hex().to_string();
        data.push((finger.clone(), next.clone()));
        finger = next;
    }

    let mut store: Store = Store::new();
    store.init_root();
    for (count, (key, value)) in data.iter().enumerate() {
        store.add_leaf_item(key, value);
        if count % 20 == 0 {
            store.run_checks();
        }
    }
    store.run_checks();

    let mut misses = 0;
    for (key, value) in &data {
        if store.query_leaf_item(key).as_deref() != Some(value.as_str()) {
            misses += 1;
        }
    }

    println!(
        "{} items, {} misses, {} nodes, {} splits, {} merges",
        data.len(),
        misses,
        store.node_count(),
        store.split_count,
        store.merge_count,
    );
}
