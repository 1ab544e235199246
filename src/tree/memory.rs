//! In-memory mutable tree.
//!
//! `MemoryTree` is the reference provider: an arena of element nodes with
//! tags and attributes that answers selector queries and notifies connected
//! observers after every mutation. Mutations release the arena lock before
//! observers run, so an observer may query the tree synchronously.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::sync::notify::{ChangeNotifier, ChangeSource, ObserverId};

use super::selector::{ElementView, SelectorList};
use super::{Selector, Tree, TreeError};

const SELECTOR_CACHE_MAX: usize = 256;

/// Stable handle to a node of a [`MemoryTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Raw arena index.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct NodeData {
    tag: String,
    attributes: BTreeMap<String, String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl NodeData {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            parent: None,
            children: Vec::new(),
        }
    }
}

impl ElementView for NodeData {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

#[derive(Debug)]
struct Arena {
    nodes: HashMap<NodeId, NodeData>,
    root: NodeId,
    next_id: u64,
}

impl Arena {
    fn get(&self, id: NodeId) -> Result<&NodeData, TreeError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| TreeError::UnknownNode(id.to_string()))
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut NodeData, TreeError> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| TreeError::UnknownNode(id.to_string()))
    }

    fn alloc(&mut self, tag: &str) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, NodeData::new(tag));
        id
    }

    fn is_ancestor_or_self(&self, candidate: NodeId, mut node: NodeId) -> bool {
        loop {
            if node == candidate {
                return true;
            }
            match self.nodes.get(&node).and_then(|n| n.parent) {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    fn unlink(&mut self, id: NodeId) -> Result<(), TreeError> {
        let parent = self.get(id)?.parent;
        if let Some(parent) = parent {
            self.get_mut(parent)?.children.retain(|c| *c != id);
        }
        self.get_mut(id)?.parent = None;
        Ok(())
    }

    /// `id` followed by its ancestors, nearest first.
    fn lineage(&self, id: NodeId) -> Vec<&NodeData> {
        let mut out = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(data) = self.nodes.get(&current) else {
                break;
            };
            out.push(data);
            cursor = data.parent;
        }
        out
    }
}

/// Mutable element tree held in memory.
pub struct MemoryTree {
    arena: RwLock<Arena>,
    observers: Mutex<Vec<ChangeNotifier>>,
    selector_cache: Mutex<HashMap<String, SelectorList>>,
}

impl fmt::Debug for MemoryTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = self.arena.read();
        f.debug_struct("MemoryTree")
            .field("root", &arena.root)
            .field("nodes", &arena.nodes.len())
            .field("observers", &self.observers.lock().len())
            .finish()
    }
}

impl MemoryTree {
    /// Creates a tree containing only a root element.
    #[must_use]
    pub fn new(root_tag: &str) -> Self {
        let mut arena = Arena {
            nodes: HashMap::new(),
            root: NodeId(0),
            next_id: 0,
        };
        arena.root = arena.alloc(root_tag);

        Self {
            arena: RwLock::new(arena),
            observers: Mutex::new(Vec::new()),
            selector_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a detached element. Detached nodes are invisible to queries.
    pub fn create_element(&self, tag: &str) -> NodeId {
        self.arena.write().alloc(tag)
    }

    /// Moves `child` to the end of `parent`'s children.
    pub fn append_child(&self, parent: NodeId, child: NodeId) -> Result<(), TreeError> {
        {
            let mut arena = self.arena.write();
            arena.get(parent)?;
            arena.get(child)?;
            if arena.is_ancestor_or_self(child, parent) {
                return Err(TreeError::HierarchyViolation(format!(
                    "{child} cannot be appended to its own descendant {parent}"
                )));
            }
            arena.unlink(child)?;
            arena.get_mut(child)?.parent = Some(parent);
            arena.get_mut(parent)?.children.push(child);
        }
        self.notify_observers();
        Ok(())
    }

    /// Creates an element with attributes and appends it to `parent`.
    pub fn append_element(
        &self,
        parent: NodeId,
        tag: &str,
        attributes: &[(&str, &str)],
    ) -> Result<NodeId, TreeError> {
        let id = {
            let mut arena = self.arena.write();
            arena.get(parent)?;
            let id = arena.alloc(tag);
            let data = arena.get_mut(id)?;
            for (name, value) in attributes {
                data.attributes.insert((*name).to_string(), (*value).to_string());
            }
            data.parent = Some(parent);
            arena.get_mut(parent)?.children.push(id);
            id
        };
        self.notify_observers();
        Ok(id)
    }

    /// Detaches `node` (and its subtree) from its parent.
    pub fn detach(&self, node: NodeId) -> Result<(), TreeError> {
        {
            let mut arena = self.arena.write();
            if node == arena.root {
                return Err(TreeError::HierarchyViolation("the root cannot be detached".to_string()));
            }
            arena.unlink(node)?;
        }
        self.notify_observers();
        Ok(())
    }

    /// Sets an attribute, notifying observers even if the value is unchanged.
    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), TreeError> {
        self.arena
            .write()
            .get_mut(node)?
            .attributes
            .insert(name.to_string(), value.to_string());
        self.notify_observers();
        Ok(())
    }

    /// Removes an attribute, returning its previous value.
    pub fn remove_attribute(&self, node: NodeId, name: &str) -> Result<Option<String>, TreeError> {
        let previous = self.arena.write().get_mut(node)?.attributes.remove(name);
        self.notify_observers();
        Ok(previous)
    }

    /// Adds a class token to the `class` attribute.
    pub fn add_class(&self, node: NodeId, class: &str) -> Result<(), TreeError> {
        {
            let mut arena = self.arena.write();
            let attrs = &mut arena.get_mut(node)?.attributes;
            let current = attrs.get("class").map(String::as_str).unwrap_or("");
            if !current.split_whitespace().any(|c| c == class) {
                let updated = if current.trim().is_empty() {
                    class.to_string()
                } else {
                    format!("{} {class}", current.trim())
                };
                attrs.insert("class".to_string(), updated);
            }
        }
        self.notify_observers();
        Ok(())
    }

    /// Removes a class token from the `class` attribute.
    pub fn remove_class(&self, node: NodeId, class: &str) -> Result<(), TreeError> {
        {
            let mut arena = self.arena.write();
            let attrs = &mut arena.get_mut(node)?.attributes;
            if let Some(current) = attrs.get("class") {
                let updated = current
                    .split_whitespace()
                    .filter(|c| *c != class)
                    .collect::<Vec<_>>()
                    .join(" ");
                attrs.insert("class".to_string(), updated);
            }
        }
        self.notify_observers();
        Ok(())
    }

    /// Returns an attribute value.
    #[must_use]
    pub fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.arena
            .read()
            .nodes
            .get(&node)
            .and_then(|n| n.attributes.get(name).cloned())
    }

    /// Returns true if the node's `class` attribute contains `class`.
    #[must_use]
    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.attribute(node, "class")
            .is_some_and(|c| c.split_whitespace().any(|t| t == class))
    }

    /// Returns the node's tag.
    #[must_use]
    pub fn tag(&self, node: NodeId) -> Option<String> {
        self.arena.read().nodes.get(&node).map(|n| n.tag.clone())
    }

    /// Returns the node's parent.
    #[must_use]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.arena.read().nodes.get(&node).and_then(|n| n.parent)
    }

    /// Returns true if `node` is reachable from the root.
    #[must_use]
    pub fn is_attached(&self, node: NodeId) -> bool {
        let arena = self.arena.read();
        arena.nodes.contains_key(&node) && arena.is_ancestor_or_self(arena.root, node)
    }

    /// Number of connected observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    fn parsed(&self, selector: &Selector) -> Result<SelectorList, TreeError> {
        let mut cache = self.selector_cache.lock();
        if let Some(list) = cache.get(selector.as_str()) {
            return Ok(list.clone());
        }

        let list = SelectorList::parse(selector.as_str())?;
        if cache.len() >= SELECTOR_CACHE_MAX {
            cache.clear();
        }
        cache.insert(selector.as_str().to_string(), list.clone());
        Ok(list)
    }

    fn notify_observers(&self) {
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer.notify();
        }
    }
}

impl Tree for MemoryTree {
    type Node = NodeId;

    fn root(&self) -> NodeId {
        self.arena.read().root
    }

    fn children(&self, node: &NodeId) -> Vec<NodeId> {
        self.arena
            .read()
            .nodes
            .get(node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn contains(&self, node: &NodeId) -> bool {
        self.is_attached(*node)
    }

    fn query_all(
        &self,
        scope: &NodeId,
        selector: &Selector,
        include_scope: bool,
    ) -> Result<Vec<NodeId>, TreeError> {
        let list = self.parsed(selector)?;
        let arena = self.arena.read();
        arena.get(*scope)?;

        let mut out = Vec::new();
        let mut stack = vec![*scope];
        while let Some(id) = stack.pop() {
            let Some(data) = arena.nodes.get(&id) else {
                continue;
            };
            let lineage = arena.lineage(id);
            if (id != *scope || include_scope) && list.matches(lineage.as_slice()) {
                out.push(id);
            }
            stack.extend(data.children.iter().rev().copied());
        }
        Ok(out)
    }
}

impl ChangeSource for MemoryTree {
    fn connect(&self, notifier: ChangeNotifier) {
        let mut observers = self.observers.lock();
        if !observers.iter().any(|o| o.id() == notifier.id()) {
            observers.push(notifier);
        }
    }

    fn disconnect(&self, observer: ObserverId) {
        self.observers.lock().retain(|o| o.id() != observer);
    }
}
