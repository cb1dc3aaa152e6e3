//! Per-document revision trees.
//!
//! A `RevTree` is a flat vector of revision nodes linked by parent indexes.
//! After sorting, node 0 is the current (winning) revision. The encoded form
//! is a sequence of variable-length node records terminated by a 32-bit zero
//! size, and is bit-exact across implementations.

use crate::error::{Result, RivetError};
use crate::revid;

/// `parent` value meaning "no parent" (a root node).
pub const NO_PARENT: u16 = u16::MAX;

/// Sequence value marking a node that hasn't been saved yet. On decode it is
/// replaced by the enclosing record's sequence.
pub const SEQ_NOT_YET: u64 = 0;

// Node flags. The low bits are stored; `NEW` is in-memory only, and
// `HAS_DATA` appears only in the encoded form.
const FLAG_DELETED: u8 = 0x01;
const FLAG_LEAF: u8 = 0x02;
const FLAG_NEW: u8 = 0x04;
const FLAG_HAS_DATA: u8 = 0x80;
const PUBLIC_FLAGS: u8 = FLAG_DELETED | FLAG_LEAF;

// Encoded node header: size u32, parent u16, flags u8, sequence u64,
// revID length u8.
const NODE_HEADER_SIZE: usize = 16;

/// One revision's metadata within a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevNode {
    /// Revision ID in compact binary form.
    pub rev_id: Vec<u8>,
    /// Revision body, or `None` if not stored in this tree.
    pub body: Option<Vec<u8>>,
    /// Sequence number of the record that saved this revision.
    pub sequence: u64,
    /// Index of the parent node, or `NO_PARENT`.
    pub parent: u16,
    flags: u8,
}

impl RevNode {
    pub fn is_leaf(&self) -> bool {
        self.flags & FLAG_LEAF != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    /// Has this node been inserted since the tree was decoded?
    pub fn is_new(&self) -> bool {
        self.flags & FLAG_NEW != 0
    }

    /// A live leaf: the candidates for the current revision.
    pub fn is_active(&self) -> bool {
        self.is_leaf() && !self.is_deleted()
    }

    pub fn generation(&self) -> u32 {
        revid::generation(&self.rev_id)
    }

    pub fn expanded_rev_id(&self) -> String {
        String::from_utf8_lossy(&revid::expand(&self.rev_id)).into_owned()
    }
}

fn compare_nodes(a: &RevNode, b: &RevNode) -> std::cmp::Ordering {
    // Leaves first, then non-deleted, then higher revision IDs.
    b.is_leaf()
        .cmp(&a.is_leaf())
        .then_with(|| a.is_deleted().cmp(&b.is_deleted()))
        .then_with(|| revid::compare(&b.rev_id, &a.rev_id))
}

/// In-memory revision tree for one document.
#[derive(Debug, Clone, Default)]
pub struct RevTree {
    nodes: Vec<RevNode>,
    sorted: bool,
    changed: bool,
}

impl RevTree {
    pub fn new() -> Self {
        RevTree {
            nodes: Vec::new(),
            sorted: true,
            changed: false,
        }
    }

    // -----------------------------------------------------------------------
    // Encoding
    // -----------------------------------------------------------------------

    /// Decodes a serialized tree. Nodes whose stored sequence is
    /// `SEQ_NOT_YET` get `default_sequence` substituted.
    pub fn decode(raw: &[u8], default_sequence: u64) -> Result<Self> {
        let corrupt =
            |what: &str| RivetError::CorruptRevisionData(format!("revision tree: {what}"));

        let mut nodes = Vec::new();
        let mut pos = 0usize;
        loop {
            if pos + 4 > raw.len() {
                return Err(corrupt("missing terminator"));
            }
            let size = u32::from_be_bytes(raw[pos..pos + 4].try_into().unwrap()) as usize;
            if size == 0 {
                if pos + 4 != raw.len() {
                    return Err(corrupt("trailing garbage"));
                }
                break;
            }
            if size < NODE_HEADER_SIZE || pos + size > raw.len() {
                return Err(corrupt("node size out of range"));
            }
            if nodes.len() >= 0xFFFF {
                return Err(corrupt("too many nodes"));
            }
            let node = &raw[pos..pos + size];
            let parent = u16::from_be_bytes(node[4..6].try_into().unwrap());
            let flags = node[6];
            let mut sequence = u64::from_be_bytes(node[7..15].try_into().unwrap());
            if sequence == SEQ_NOT_YET {
                sequence = default_sequence;
            }
            let rev_id_len = node[15] as usize;
            if NODE_HEADER_SIZE + rev_id_len > size {
                return Err(corrupt("revision ID overruns node"));
            }
            let rev_id = node[NODE_HEADER_SIZE..NODE_HEADER_SIZE + rev_id_len].to_vec();
            let body = if flags & FLAG_HAS_DATA != 0 {
                Some(node[NODE_HEADER_SIZE + rev_id_len..].to_vec())
            } else {
                None
            };
            nodes.push(RevNode {
                rev_id,
                body,
                sequence,
                parent,
                flags: flags & PUBLIC_FLAGS,
            });
            pos += size;
        }

        let count = nodes.len();
        for node in &nodes {
            if node.parent != NO_PARENT && node.parent as usize >= count {
                return Err(corrupt("parent index out of range"));
            }
        }
        Ok(RevTree {
            nodes,
            sorted: true,
            changed: false,
        })
    }

    /// Serializes the tree, sorting it first.
    pub fn encode(&mut self) -> Vec<u8> {
        self.sort();
        let mut out = Vec::new();
        for node in &self.nodes {
            let body_len = node.body.as_ref().map_or(0, Vec::len);
            let size = NODE_HEADER_SIZE + node.rev_id.len() + body_len;
            out.extend_from_slice(&(size as u32).to_be_bytes());
            out.extend_from_slice(&node.parent.to_be_bytes());
            let mut flags = node.flags & PUBLIC_FLAGS;
            if node.body.is_some() {
                flags |= FLAG_HAS_DATA;
            }
            out.push(flags);
            out.extend_from_slice(&node.sequence.to_be_bytes());
            out.push(node.rev_id.len() as u8);
            out.extend_from_slice(&node.rev_id);
            if let Some(body) = &node.body {
                out.extend_from_slice(body);
            }
        }
        out.extend_from_slice(&0u32.to_be_bytes());
        out
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Has the tree been modified since it was decoded?
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn get(&self, index: usize) -> Option<&RevNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[RevNode] {
        &self.nodes
    }

    /// Finds a node by its (compact-form) revision ID.
    pub fn find(&self, rev_id: &[u8]) -> Option<usize> {
        self.nodes.iter().position(|n| n.rev_id == rev_id)
    }

    pub fn parent_of(&self, index: usize) -> Option<usize> {
        let parent = self.nodes.get(index)?.parent;
        if parent == NO_PARENT {
            None
        } else {
            Some(parent as usize)
        }
    }

    /// The current (winning) node: first after sorting, or a linear scan if
    /// the tree is unsorted.
    pub fn current_index(&self) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        if self.sorted {
            return Some(0);
        }
        let mut best = 0;
        for i in 1..self.nodes.len() {
            if compare_nodes(&self.nodes[i], &self.nodes[best]).is_lt() {
                best = i;
            }
        }
        Some(best)
    }

    pub fn current(&self) -> Option<&RevNode> {
        self.current_index().map(|i| &self.nodes[i])
    }

    pub fn leaves(&self) -> impl Iterator<Item = &RevNode> {
        self.nodes.iter().filter(|n| n.is_leaf())
    }

    /// True iff the tree has two or more non-deleted leaves.
    pub fn has_conflict(&self) -> bool {
        if self.nodes.len() < 2 {
            false
        } else if self.sorted {
            self.nodes[1].is_active()
        } else {
            self.nodes.iter().filter(|n| n.is_active()).count() > 1
        }
    }

    // -----------------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------------

    /// Inserts a revision. The parent, if given, must exist and be exactly
    /// one generation older. Fails if the revision is already present, or if
    /// it would create a conflict and `allow_conflict` is false.
    pub fn insert(
        &mut self,
        rev_id: Vec<u8>,
        body: Option<Vec<u8>>,
        deleted: bool,
        parent_rev_id: Option<&[u8]>,
        allow_conflict: bool,
    ) -> Result<usize> {
        let generation = self.validate_new_rev(&rev_id)?;

        let parent = match parent_rev_id {
            Some(parent_id) => Some(self.find(parent_id).ok_or_else(|| {
                RivetError::NotFound(format!(
                    "parent revision {}",
                    String::from_utf8_lossy(&revid::expand(parent_id))
                ))
            })?),
            None => None,
        };
        let parent_generation = parent.map_or(0, |i| self.nodes[i].generation());
        if generation != parent_generation + 1 {
            return Err(RivetError::InvalidParameter(
                "revision generation must be one more than its parent's".into(),
            ));
        }
        if !allow_conflict {
            let conflicts = match parent {
                Some(i) => !self.nodes[i].is_leaf(),
                None => self.nodes.iter().any(RevNode::is_active),
            };
            if conflicts {
                return Err(RivetError::Conflict);
            }
        }

        Ok(self.insert_unchecked(rev_id, body, deleted, parent))
    }

    /// Inserts a revision along with its ancestry. `history[0]` is the new
    /// revision, later entries are progressively older ancestors. Returns the
    /// index of the first entry that was already present (the common
    /// ancestor), or `history.len() - 1` if every entry was inserted.
    pub fn insert_history(
        &mut self,
        history: &[&[u8]],
        body: Option<Vec<u8>>,
        deleted: bool,
    ) -> Result<usize> {
        if history.is_empty() {
            return Err(RivetError::InvalidParameter("empty revision history".into()));
        }
        for pair in history.windows(2) {
            let child = revid::generation(pair[0]);
            let parent = revid::generation(pair[1]);
            if child != parent + 1 {
                return Err(RivetError::InvalidParameter(
                    "revision history generations must be consecutive".into(),
                ));
            }
        }

        let common = history
            .iter()
            .position(|id| self.find(id).is_some())
            .unwrap_or(history.len());
        if common == 0 {
            return Ok(0); // new revision already known
        }

        // Insert the missing ancestors root-first, then the new revision.
        let mut parent = if common < history.len() {
            Some(self.find(history[common]).unwrap())
        } else {
            None
        };
        for i in (0..common).rev() {
            self.validate_new_rev(history[i])?;
            let node_body = if i == 0 { body.clone() } else { None };
            let node_deleted = deleted && i == 0;
            let index =
                self.insert_unchecked(history[i].to_vec(), node_body, node_deleted, parent);
            parent = Some(index);
        }
        Ok(common.min(history.len() - 1))
    }

    fn validate_new_rev(&self, rev_id: &[u8]) -> Result<u32> {
        if self.nodes.len() >= NO_PARENT as usize - 1 {
            return Err(RivetError::CorruptRevisionData(
                "revision tree is full".into(),
            ));
        }
        if rev_id.is_empty() || rev_id.len() > 255 {
            return Err(RivetError::InvalidParameter("bad revision ID length".into()));
        }
        let (generation, _) = revid::parse_compacted(rev_id).ok_or_else(|| {
            RivetError::InvalidParameter("malformed revision ID".into())
        })?;
        if self.find(rev_id).is_some() {
            return Err(RivetError::Conflict);
        }
        Ok(generation)
    }

    fn insert_unchecked(
        &mut self,
        rev_id: Vec<u8>,
        body: Option<Vec<u8>>,
        deleted: bool,
        parent: Option<usize>,
    ) -> usize {
        let mut flags = FLAG_LEAF | FLAG_NEW;
        if deleted {
            flags |= FLAG_DELETED;
        }
        let parent_index = match parent {
            Some(i) => {
                self.nodes[i].flags &= !FLAG_LEAF;
                i as u16
            }
            None => NO_PARENT,
        };
        self.nodes.push(RevNode {
            rev_id,
            body,
            sequence: SEQ_NOT_YET,
            parent: parent_index,
            flags,
        });
        if self.nodes.len() > 1 {
            self.sorted = false;
        }
        self.changed = true;
        self.nodes.len() - 1
    }

    /// Stamps the given sequence on newly inserted nodes after a save.
    pub fn mark_saved(&mut self, sequence: u64) {
        for node in &mut self.nodes {
            if node.is_new() {
                node.sequence = sequence;
                node.flags &= !FLAG_NEW;
            }
        }
        self.changed = false;
    }

    // -----------------------------------------------------------------------
    // Pruning & purging
    // -----------------------------------------------------------------------

    /// Removes ancestors so that no leaf has more than `max_depth` ancestors
    /// in its chain. Stops at branch points, so the tree stays connected.
    /// Returns the number of nodes removed.
    pub fn prune(&mut self, max_depth: usize) -> usize {
        if max_depth == 0 || self.nodes.len() <= max_depth {
            return 0;
        }
        let mut removed = 0;
        loop {
            // Depth of the deepest leaf below each root.
            let mut max_chain = 0;
            for (i, node) in self.nodes.iter().enumerate() {
                if node.is_leaf() {
                    let mut depth = 1;
                    let mut anc = i;
                    while let Some(parent) = self.parent_of(anc) {
                        depth += 1;
                        anc = parent;
                    }
                    max_chain = max_chain.max(depth);
                }
            }
            if max_chain <= max_depth {
                break;
            }
            // Find a root with exactly one child; it can be removed without
            // disconnecting anything.
            let root = self
                .nodes
                .iter()
                .position(|n| n.parent == NO_PARENT)
                .expect("tree has a root");
            let children: Vec<usize> = (0..self.nodes.len())
                .filter(|&i| self.nodes[i].parent as usize == root && self.nodes[i].parent != NO_PARENT)
                .collect();
            if children.len() != 1 {
                break; // can't prune past a branch point
            }
            let mut marked = vec![false; self.nodes.len()];
            marked[root] = true;
            self.remove_marked(&marked);
            removed += 1;
        }
        if removed > 0 {
            self.changed = true;
        }
        removed
    }

    /// Removes the given revisions plus any descendants orphaned by their
    /// removal. Returns the number of nodes removed.
    pub fn purge(&mut self, rev_ids: &[&[u8]]) -> usize {
        let mut marked = vec![false; self.nodes.len()];
        for id in rev_ids {
            if let Some(i) = self.find(id) {
                marked[i] = true;
            }
        }
        // Cascade to descendants of removed nodes.
        loop {
            let mut grew = false;
            for i in 0..self.nodes.len() {
                if !marked[i]
                    && self.nodes[i].parent != NO_PARENT
                    && marked[self.nodes[i].parent as usize]
                {
                    marked[i] = true;
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        let removed = marked.iter().filter(|&&m| m).count();
        if removed > 0 {
            self.remove_marked(&marked);
            self.changed = true;
        }
        removed
    }

    // Removes marked nodes, remapping parent indexes and restoring leaf
    // flags on nodes that lost all their children.
    fn remove_marked(&mut self, marked: &[bool]) {
        let mut new_index = vec![NO_PARENT; self.nodes.len()];
        let mut next = 0u16;
        for (i, &m) in marked.iter().enumerate() {
            if !m {
                new_index[i] = next;
                next += 1;
            }
        }
        let mut i = 0;
        self.nodes.retain(|_| {
            let keep = !marked[i];
            i += 1;
            keep
        });
        for node in &mut self.nodes {
            if node.parent != NO_PARENT {
                node.parent = new_index[node.parent as usize]; // NO_PARENT if removed
            }
        }
        // Restore leaf flags.
        let mut has_child = vec![false; self.nodes.len()];
        for node in &self.nodes {
            if node.parent != NO_PARENT {
                has_child[node.parent as usize] = true;
            }
        }
        for (node, has_child) in self.nodes.iter_mut().zip(has_child) {
            if has_child {
                node.flags &= !FLAG_LEAF;
            } else {
                node.flags |= FLAG_LEAF;
            }
        }
        self.sorted = false;
    }

    // -----------------------------------------------------------------------
    // Sorting
    // -----------------------------------------------------------------------

    /// Sorts nodes so the current revision comes first, rewriting parent
    /// indexes to match the new order.
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }
        let count = self.nodes.len();
        // Remember each node's parent, and temporarily use the parent field
        // to track where the sort moves each node.
        let mut old_parents = Vec::with_capacity(count);
        for (i, node) in self.nodes.iter_mut().enumerate() {
            old_parents.push(node.parent);
            node.parent = i as u16;
        }
        self.nodes.sort_by(compare_nodes);
        let mut old_to_new = vec![0u16; count];
        for (new, node) in self.nodes.iter().enumerate() {
            old_to_new[node.parent as usize] = new as u16;
        }
        for node in &mut self.nodes {
            let parent = old_parents[node.parent as usize];
            node.parent = if parent == NO_PARENT {
                NO_PARENT
            } else {
                old_to_new[parent as usize]
            };
        }
        self.sorted = true;
    }
}
