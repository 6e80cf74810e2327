//! Integration tests for the replicated range index: tree shape under
//! splits and merges, overlap repair, the async query path, and replica
//! exchange between two stores.

use converge::set::NaiveOrSet;
use converge::sync::Reassembler;
use converge::tree::query_leaf_item;
use converge::tree::Item;
use converge::tree::Node;
use converge::tree::NodeId;
use converge::tree::NodeSource;
use converge::tree::RangeEntry;
use converge::tree::Store;

fn small_tree() -> Store {
    let mut store: Store = Store::with_threshold_ranges(2..=2, 0..=0);
    for (key, value) in [("a", "1"), ("b", "2"), ("m", "3")] {
        store.add_leaf_item(key, value);
    }
    store.run_checks();
    return store;
}

#[test]
fn round_trip_with_forced_split() {
    let mut store = small_tree();
    assert!(store.split_count >= 1, "three keys over threshold 2 must split");

    assert_eq!(store.query_leaf_item("a"), Some("1".to_string()));
    assert_eq!(store.query_leaf_item("b"), Some("2".to_string()));
    assert_eq!(store.query_leaf_item("m"), Some("3".to_string()));

    store.del_leaf_item("m");
    store.run_checks();
    assert_eq!(store.query_leaf_item("m"), None);
    assert_eq!(store.query_leaf_item("a"), Some("1".to_string()));
}

#[test]
fn all_items_enumerates_the_tree() {
    let store = small_tree();
    let mut items = store.all_items();
    items.sort();
    assert_eq!(
        items,
        vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
            ("m".to_string(), "3".to_string()),
        ]
    );
}

#[test]
fn underflow_merge_detaches_the_node_and_promotes_the_root() {
    let mut store: Store = Store::with_threshold_ranges(2..=2, 1..=1);
    for (key, value) in [("a", "1"), ("b", "2"), ("m", "3")] {
        store.add_leaf_item(key, value);
    }
    store.run_checks();

    let parent = store.root().expect("tree has a root");
    let sibling = store
        .node(parent)
        .expect("root resolves")
        .entries()
        .find(|entry| entry.contains("m"))
        .and_then(RangeEntry::child_id)
        .expect("m lives under a child");

    // Deleting m drops the sibling to one entry, under its join threshold:
    // it merges away, and the emptied root promotes its last child.
    store.del_leaf_item("m");
    store.run_checks();

    assert!(store.merge_count >= 1);
    let root = store.root().expect("tree has a root");
    assert_ne!(root, parent, "old parent collapsed");
    assert_ne!(root, sibling);
    let reachable: Vec<NodeId> = store.node(root).expect("root resolves").children();
    assert!(!reachable.contains(&sibling), "merged node must be unreachable");

    assert_eq!(store.query_leaf_item("a"), Some("1".to_string()));
    assert_eq!(store.query_leaf_item("b"), Some("2".to_string()));
    assert_eq!(store.query_leaf_item("m"), None);
}

#[test]
fn overlap_repair_converges_to_disjoint_children() {
    let mut store: Store = Store::with_threshold_ranges(10..=10, 0..=0);

    let parent: Node = Node::with_thresholds(10, 0);
    let parent_id = parent.id;
    store.register(parent);
    store.set_root(parent_id);

    let mut left: Node = Node::with_thresholds(10, 0);
    left.add_parent(parent_id);
    left.add_entry(RangeEntry::leaf("a", "1"));
    left.add_entry(RangeEntry::leaf("m", "2"));
    let left_id = store.register(left);

    let mut right: Node = Node::with_thresholds(10, 0);
    right.add_parent(parent_id);
    right.add_entry(RangeEntry::leaf("f", "3"));
    right.add_entry(RangeEntry::leaf("z", "4"));
    let right_id = store.register(right);

    // The overlapping ranges a concurrent split-merge would leave behind.
    if let Some(node) = store.node_mut(parent_id) {
        node.add_entry(RangeEntry::child(Some("a".into()), Some("m".into()), left_id));
        node.add_entry(RangeEntry::child(Some("f".into()), Some("z".into()), right_id));
    }

    store.do_check(parent_id);

    let parent = store.node(parent_id).expect("parent resolves");
    let children = parent.children();
    assert_eq!(children, vec![left_id], "the pair folded into one child");
    let right = store.node(right_id).expect("absorbed node still cached");
    assert_eq!(right.parents().count(), 0, "absorbed node is detached");

    for (key, value) in [("a", "1"), ("m", "2"), ("f", "3"), ("z", "4")] {
        assert_eq!(store.query_leaf_item(key), Some(value.to_string()));
    }
}

#[test]
fn tree_composes_with_another_set_design() {
    let mut store: Store<NaiveOrSet<Item>> = Store::with_threshold_ranges(2..=2, 0..=0);
    for (key, value) in [("a", "1"), ("b", "2"), ("m", "3")] {
        store.add_leaf_item(key, value);
    }
    store.run_checks();
    assert!(store.split_count >= 1);
    assert_eq!(store.query_leaf_item("m"), Some("3".to_string()));
    store.del_leaf_item("b");
    assert_eq!(store.query_leaf_item("b"), None);
}

/// Resolves locally when possible and falls back to a "remote" store,
/// standing in for a peer fetch.
struct TwoTierSource {
    local: Store,
    remote: Store,
}

#[async_trait::async_trait]
impl NodeSource for TwoTierSource {
    fn resolve(&self, id: NodeId) -> Option<Node> {
        return self.local.resolve(id);
    }

    async fn resolve_async(&self, id: NodeId) -> Option<Node> {
        return self.local.resolve(id).or_else(|| self.remote.resolve(id));
    }
}

#[tokio::test]
async fn async_query_resolves_remote_nodes_lazily() {
    let remote = small_tree();
    let root = remote.root().expect("tree has a root");
    let source = TwoTierSource { local: Store::new(), remote };

    // Nothing is cached locally, so the synchronous read misses...
    assert_eq!(source.local.query_leaf_item("m"), None);
    // ...while the async walk pulls each hop from the remote side.
    assert_eq!(query_leaf_item(&source, root, "m").await, Some("3".to_string()));
    assert_eq!(query_leaf_item(&source, root, "nope").await, None);
}

#[tokio::test]
async fn abandoned_resolution_leaves_no_trace() {
    let remote = small_tree();
    let root = remote.root().expect("tree has a root");
    let before = remote.all_items();
    let source = TwoTierSource { local: Store::new(), remote };

    let pending = query_leaf_item(&source, root, "m");
    drop(pending);

    assert_eq!(source.remote.all_items(), before);
}

#[test]
fn replicas_converge_through_the_wire() {
    let mut a = small_tree();
    let mut b: Store = Store::new();
    let mut reassembler = Reassembler::new();

    for message in a.broadcast_all().expect("encode state") {
        if let Some((replica, buffer)) = reassembler.accept(message).expect("well-formed fragment") {
            b.apply_state(&replica, &buffer).expect("apply state");
        }
    }

    assert_eq!(b.root(), a.root());
    for (key, value) in [("a", "1"), ("b", "2"), ("m", "3")] {
        assert_eq!(b.query_leaf_item(key), Some(value.to_string()));
    }

    // Everything was broadcast, so the second sweep has nothing to say.
    assert!(a.broadcast_all().expect("encode state").is_empty());

    // New local writes dirty only the touched replicas.
    a.add_leaf_item("q", "9");
    let followup = a.broadcast_all().expect("encode state");
    assert!(!followup.is_empty());
    for message in followup {
        if let Some((replica, buffer)) = reassembler.accept(message).expect("well-formed fragment") {
            b.apply_state(&replica, &buffer).expect("apply state");
        }
    }
    assert_eq!(b.query_leaf_item("q"), Some("9".to_string()));
}

#[test]
fn pull_requests_answer_only_when_dirty() {
    use converge::sync::StateRequest;

    let mut store = small_tree();
    let root_name = store.root().expect("tree has a root").to_string();

    let first = store
        .handle_request(&StateRequest { replica: root_name.clone() })
        .expect("known replica");
    assert!(first.is_some());
    let second = store
        .handle_request(&StateRequest { replica: root_name })
        .expect("known replica");
    assert!(second.is_none(), "clean replica must not answer");
}
