//! Node resolution and the asynchronous query path.
//!
//! A query over a partially local tree resolves children lazily through a
//! [`NodeSource`]: the synchronous form answers only from what is cached,
//! while the asynchronous form may round-trip the network per hop. Queries
//! never mutate, so a caller that abandons a pending resolution leaves no
//! replicated state behind.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::set::FilteredOrSet;
use crate::set::OrSet;

use super::Item;
use super::Node;
use super::NodeId;
use super::RangeEntry;
use super::Store;
use super::Target;

/// The node resolution capability consumed by reads over non-local trees.
///
/// `resolve` answers from the local cache only; `resolve_async` may fetch a
/// remote node's replica and materialize it. Both return nothing for an
/// unknown id, which readers treat as "not found" and rebalancing treats as
/// "link no longer valid".
#[async_trait]
pub trait NodeSource<S = FilteredOrSet<Item>> {
    /// Resolve a node from local state.
    fn resolve(&self, id: NodeId) -> Option<Node<S>>;

    /// Resolve a node, possibly fetching it from a peer.
    async fn resolve_async(&self, id: NodeId) -> Option<Node<S>>;
}

#[async_trait]
impl<S: OrSet<Item> + Clone + Default + Send + Sync> NodeSource<S> for Store<S> {
    fn resolve(&self, id: NodeId) -> Option<Node<S>> {
        return self.node(id).cloned();
    }

    async fn resolve_async(&self, id: NodeId) -> Option<Node<S>> {
        return self.resolve(id);
    }
}

/// Look up the payload stored under `key`, starting from `root` and
/// resolving every hop through `source`.
pub async fn query_leaf_item<'a, S, R>(source: &'a R, root: NodeId, key: &'a str) -> Option<String>
where
    S: OrSet<Item> + Send + 'a,
    R: NodeSource<S> + Sync + ?Sized,
{
    let node = source.resolve_async(root).await?;
    return query_node(source, node, key).await;
}

/// Recursive step, boxed because async recursion has no static size.
fn query_node<'a, S, R>(
    source: &'a R,
    node: Node<S>,
    key: &'a str,
) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>
where
    S: OrSet<Item> + Send + 'a,
    R: NodeSource<S> + Sync + ?Sized,
{
    return Box::pin(async move {
        if node.is_leaf_node() {
            return node.entries().find(|entry| entry.matches_point(key)).and_then(|entry| {
                match &entry.target {
                    Target::Payload(value) => Some(value.clone()),
                    Target::Child(_) => None,
                }
            });
        }
        let entries: Vec<&RangeEntry> = node.entries().collect();
        for entry in entries {
            if !entry.contains(key) {
                continue;
            }
            match &entry.target {
                Target::Payload(value) if entry.matches_point(key) => {
                    return Some(value.clone());
                }
                Target::Payload(_) => {}
                Target::Child(child) => {
                    let Some(target) = source.resolve_async(*child).await else {
                        // Unresolvable mid-query is a miss on this branch,
                        // not a failure.
                        continue;
                    };
                    if let Some(found) = query_node(source, target, key).await {
                        return Some(found);
                    }
                }
            }
        }
        return None;
    });
}
