use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::topic::{MULTIPLE_WILDCARD, SINGLE_WILDCARD, TOPIC_SEPARATOR};
use crate::types::{HashMap, QoS};

/// A subscription that can be stored in a [`Trie`].
///
/// Identity inside the trie is `(id, topic)`.
pub trait SinkSubscription: Send + Sync {
    fn id(&self) -> &str;
    fn topic(&self) -> &str;
    fn qos(&self) -> QoS;
    fn target_qos(&self) -> QoS;
    fn target_topic(&self) -> &str;
}

struct Node<V> {
    values: HashMap<String, Arc<V>>,
    branches: HashMap<String, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { values: HashMap::default(), branches: HashMap::default() }
    }
}

impl<V> Node<V> {
    #[inline]
    fn is_empty(&self) -> bool {
        self.values.is_empty() && self.branches.is_empty()
    }

    fn insert(&mut self, path: &[&str], value: Arc<V>, id: String) {
        match path.split_first() {
            Some((first, rest)) => self.branches.entry((*first).to_owned()).or_default().insert(rest, value, id),
            None => {
                self.values.insert(id, value);
            }
        }
    }

    fn remove(&mut self, path: &[&str], id: &str) -> bool {
        match path.split_first() {
            None => self.values.remove(id).is_some(),
            Some((first, rest)) => {
                if let Some(n) = self.branches.get_mut(*first) {
                    let res = n.remove(rest, id);
                    if n.is_empty() {
                        self.branches.remove(*first);
                    }
                    res
                } else {
                    false
                }
            }
        }
    }

    fn remove_all(&mut self, id: &str) {
        self.values.remove(id);
        self.branches.retain(|_, n| {
            n.remove_all(id);
            !n.is_empty()
        });
    }

    fn matches<'a>(&'a self, path: &[&str], out: &mut Vec<&'a Node<V>>) {
        //`#` matches zero or more trailing levels, collect it before going deeper
        if let Some(n) = self.branches.get(MULTIPLE_WILDCARD) {
            out.push(n);
        }
        let (first, rest) = match path.split_first() {
            Some(p) => p,
            None => {
                out.push(self);
                return;
            }
        };
        if *first == MULTIPLE_WILDCARD {
            return;
        }
        if let Some(n) = self.branches.get(*first) {
            n.matches(rest, out);
        }
        if *first != SINGLE_WILDCARD {
            if let Some(n) = self.branches.get(SINGLE_WILDCARD) {
                n.matches(rest, out);
            }
        }
    }

    fn collect(&self, out: &mut Vec<Arc<V>>) {
        out.extend(self.values.values().cloned());
        for n in self.branches.values() {
            n.collect(out);
        }
    }

    fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }
}

/// Topic tree mapping subscription filters to sinks.
///
/// Filters are split on `/`; `+` and `#` are plain child keys handled specially
/// while matching. Levels of a published topic are always literal.
pub struct Trie<V> {
    root: RwLock<Node<V>>,
}

impl<V> Default for Trie<V> {
    fn default() -> Self {
        Self { root: RwLock::new(Node::default()) }
    }
}

impl<V> Trie<V>
where
    V: SinkSubscription,
{
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `sub`, replacing any sink with the same id under the same filter.
    pub fn add(&self, sub: Arc<V>) {
        let topic = sub.topic().to_owned();
        let id = sub.id().to_owned();
        let path: Vec<&str> = topic.split(TOPIC_SEPARATOR).collect();
        self.root.write().insert(&path, sub, id);
    }

    /// Removes the sink `id` registered under `topic`, pruning emptied nodes.
    pub fn remove(&self, id: &str, topic: &str) -> bool {
        let path: Vec<&str> = topic.split(TOPIC_SEPARATOR).collect();
        self.root.write().remove(&path, id)
    }

    /// Removes every sink registered with `id`, pruning emptied nodes.
    pub fn remove_all(&self, id: &str) {
        self.root.write().remove_all(id)
    }

    /// Returns every sink whose filter matches `topic`.
    pub fn matches(&self, topic: &str) -> Vec<Arc<V>> {
        let path: Vec<&str> = topic.split(TOPIC_SEPARATOR).collect();
        let root = self.root.read();
        let mut nodes = Vec::new();
        root.matches(&path, &mut nodes);
        nodes.into_iter().flat_map(|n| n.values.values().cloned()).collect()
    }

    /// Like [`Trie::matches`], merged by sink id. For duplicates the sink with the
    /// higher source QoS wins, then the one with the higher target QoS.
    pub fn match_unique(&self, topic: &str) -> HashMap<String, Arc<V>> {
        let mut subs: HashMap<String, Arc<V>> = HashMap::default();
        for sub in self.matches(topic) {
            match subs.get(sub.id()) {
                None => {
                    subs.insert(sub.id().to_owned(), sub);
                }
                Some(dup) => {
                    if sub.qos() > dup.qos() || (sub.qos() == dup.qos() && sub.target_qos() > dup.target_qos())
                    {
                        subs.insert(sub.id().to_owned(), sub);
                    }
                }
            }
        }
        subs
    }

    /// Whether any sink matches `topic`, and the highest source QoS among them.
    pub fn is_match(&self, topic: &str) -> (bool, QoS) {
        let subs = self.matches(topic);
        let qos = subs.iter().map(|s| s.qos()).max().unwrap_or_default();
        (!subs.is_empty(), qos)
    }

    /// All sinks currently stored.
    pub fn values(&self) -> Vec<Arc<V>> {
        let mut out = Vec::new();
        self.root.read().collect(&mut out);
        out
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.read().is_empty()
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        self.root.read().nodes_size()
    }
}

impl<V> Debug for Trie<V>
where
    V: SinkSubscription,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Trie {{ nodes: {}, values: {} }}", self.nodes_size(), self.len())
    }
}
