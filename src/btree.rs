//! On-disk B+Tree index. Each node is serialized directly into a
//! page's 4072-byte data area: `is_leaf u8, key_count u16, next u32, prev
//! u32`, then length-prefixed keys, then (leaf) length-prefixed values or
//! (internal) `key_count + 1` child page ids.
//!
//! Leaves form a doubly-linked chain (`next` and `prev`) for range scans in
//! either direction; inserts split on byte-size overflow and deletes borrow
//! from or merge with a sibling rather than rebuilding the node.

use crate::config::{BTREE_MAX_KEY_LEN, BTREE_MAX_VALUE_LEN, BTREE_ORDER, BTREE_SPLIT_THRESHOLD};
use crate::error::{Error, Result};
use crate::page::{Page, PageType};
use crate::pager::Pager;

#[derive(Debug, Clone, PartialEq)]
struct Node {
    is_leaf: bool,
    next: u32,
    prev: u32,
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
    children: Vec<u32>,
}

impl Node {
    fn new_leaf() -> Self {
        Self {
            is_leaf: true,
            next: 0,
            prev: 0,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    fn new_internal() -> Self {
        Self {
            is_leaf: false,
            next: 0,
            prev: 0,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.push(self.is_leaf as u8);
        out.extend_from_slice(&(self.keys.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.next.to_le_bytes());
        out.extend_from_slice(&self.prev.to_le_bytes());
        for key in &self.keys {
            out.extend_from_slice(&(key.len() as u16).to_le_bytes());
            out.extend_from_slice(key);
        }
        if self.is_leaf {
            for value in &self.values {
                out.extend_from_slice(&(value.len() as u16).to_le_bytes());
                out.extend_from_slice(value);
            }
        } else {
            for child in &self.children {
                out.extend_from_slice(&child.to_le_bytes());
            }
        }
        out
    }

    fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 {
            return Err(Error::corrupt_page(0, "btree node shorter than header"));
        }
        let is_leaf = buf[0] != 0;
        let key_count = u16::from_le_bytes(buf[1..3].try_into().unwrap()) as usize;
        let next = u32::from_le_bytes(buf[3..7].try_into().unwrap());
        let prev = u32::from_le_bytes(buf[7..11].try_into().unwrap());

        let mut pos = 11;
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            if pos + 2 > buf.len() {
                return Err(Error::corrupt_page(0, "truncated btree key"));
            }
            let len = u16::from_le_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
            pos += 2;
            if pos + len > buf.len() {
                return Err(Error::corrupt_page(0, "truncated btree key body"));
            }
            keys.push(buf[pos..pos + len].to_vec());
            pos += len;
        }

        let mut values = Vec::new();
        let mut children = Vec::new();
        if is_leaf {
            for _ in 0..key_count {
                if pos + 2 > buf.len() {
                    return Err(Error::corrupt_page(0, "truncated btree value"));
                }
                let len = u16::from_le_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
                pos += 2;
                if pos + len > buf.len() {
                    return Err(Error::corrupt_page(0, "truncated btree value body"));
                }
                values.push(buf[pos..pos + len].to_vec());
                pos += len;
            }
        } else {
            for _ in 0..(key_count + 1) {
                if pos + 4 > buf.len() {
                    return Err(Error::corrupt_page(0, "truncated btree child pointer"));
                }
                children.push(u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()));
                pos += 4;
            }
        }

        Ok(Self {
            is_leaf,
            next,
            prev,
            keys,
            values,
            children,
        })
    }

    fn byte_size(&self) -> usize {
        self.serialize().len()
    }
}

fn min_keys() -> usize {
    (BTREE_ORDER - 1) / 2
}

/// Find the byte-driven split index: the first position whose cumulative
/// item size reaches half the total, clamped away from the ends so both
/// halves stay non-empty.
fn byte_driven_midpoint(item_sizes: &[usize]) -> usize {
    let total: usize = item_sizes.iter().sum();
    let half = total / 2;
    let mut running = 0;
    let mut split_at = item_sizes.len() / 2;
    for (i, size) in item_sizes.iter().enumerate() {
        running += size;
        if running >= half {
            split_at = i + 1;
            break;
        }
    }
    split_at.clamp(1, item_sizes.len().saturating_sub(1).max(1))
}

fn leaf_item_sizes(node: &Node) -> Vec<usize> {
    node.keys
        .iter()
        .zip(&node.values)
        .map(|(k, v)| 2 + k.len() + 2 + v.len())
        .collect()
}

fn internal_item_sizes(node: &Node) -> Vec<usize> {
    node.keys.iter().map(|k| 2 + k.len() + 4).collect()
}

/// A handle onto one persistent B+Tree, rooted at a known page id. Mutating
/// operations may change which page is the root (on a root split, or on
/// shrinking the root after cascading merges); callers must persist
/// `root_page_id()` back into the owning index/catalog entry after any
/// mutation.
pub struct BTree<'a> {
    pager: &'a mut Pager,
    root: u32,
}

impl<'a> BTree<'a> {
    pub fn create(pager: &'a mut Pager) -> Result<Self> {
        let page = pager.allocate_page(PageType::Index)?;
        let root = page.id;
        let mut tree = Self { pager, root };
        tree.write_node(root, &Node::new_leaf())?;
        Ok(tree)
    }

    pub fn open(pager: &'a mut Pager, root: u32) -> Self {
        Self { pager, root }
    }

    pub fn root_page_id(&self) -> u32 {
        self.root
    }

    fn load_node(&mut self, id: u32) -> Result<Node> {
        let page = self.pager.read_page(id)?;
        Node::deserialize(&page.data[..])
    }

    fn write_node(&mut self, id: u32, node: &Node) -> Result<()> {
        let body = node.serialize();
        if body.len() > crate::config::BTREE_MAX_NODE_SIZE {
            return Err(Error::page_full(id, body.len(), crate::config::BTREE_MAX_NODE_SIZE));
        }
        let mut page = Page::new(id, PageType::Index);
        page.data[..body.len()].copy_from_slice(&body);
        page.item_count = node.keys.len() as u16;
        page.next_page_id = node.next;
        page.prev_page_id = node.prev;
        self.pager.write_page(page)
    }

    fn free_node(&mut self, id: u32) -> Result<()> {
        self.pager.free_page(id)
    }

    fn validate_key_value(key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > BTREE_MAX_KEY_LEN {
            return Err(Error::invalid_argument("index key exceeds maximum length"));
        }
        if value.len() > BTREE_MAX_VALUE_LEN {
            return Err(Error::invalid_argument("index value exceeds maximum length"));
        }
        Ok(())
    }

    /// Descend to the leaf that would contain `key`, returning the page-id
    /// path from root to leaf and, for each internal level, the child index
    /// used to continue the descent.
    fn descend(&mut self, key: &[u8]) -> Result<(Vec<u32>, Vec<usize>)> {
        let mut path = vec![self.root];
        let mut indices = Vec::new();
        let mut current = self.root;
        loop {
            let node = self.load_node(current)?;
            if node.is_leaf {
                break;
            }
            let idx = node.keys.partition_point(|k| k.as_slice() <= key);
            indices.push(idx);
            current = node.children[idx];
            path.push(current);
        }
        Ok((path, indices))
    }

    pub fn search(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (path, _) = self.descend(key)?;
        let leaf = self.load_node(*path.last().unwrap())?;
        Ok(leaf
            .keys
            .binary_search_by(|k| k.as_slice().cmp(key))
            .ok()
            .map(|pos| leaf.values[pos].clone()))
    }

    /// Insert a key/value pair. Errors with `DuplicateKey` if the key is
    /// already present; the tree itself doesn't know an index's name, so
    /// callers in `index_manager` remap the error to name the offending
    /// index before it reaches API consumers.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        Self::validate_key_value(&key, &value)?;
        let (path, indices) = self.descend(&key)?;
        let leaf_id = *path.last().unwrap();
        let mut leaf = self.load_node(leaf_id)?;

        match leaf.keys.binary_search_by(|k| k.as_slice().cmp(&key)) {
            Ok(_) => return Err(Error::duplicate_key("<unnamed>")),
            Err(pos) => {
                leaf.keys.insert(pos, key);
                leaf.values.insert(pos, value);
            }
        }

        let mut promote = None;
        if leaf.byte_size() > BTREE_SPLIT_THRESHOLD || leaf.keys.len() > BTREE_ORDER {
            let split_at = byte_driven_midpoint(&leaf_item_sizes(&leaf));
            let right_keys = leaf.keys.split_off(split_at);
            let right_values = leaf.values.split_off(split_at);

            let new_id = self.pager.allocate_page(PageType::Index)?.id;
            let mut right = Node::new_leaf();
            right.keys = right_keys;
            right.values = right_values;
            right.next = leaf.next;
            right.prev = leaf_id;
            let old_next = leaf.next;
            leaf.next = new_id;

            self.write_node(leaf_id, &leaf)?;
            self.write_node(new_id, &right)?;
            if old_next != 0 {
                let mut after = self.load_node(old_next)?;
                after.prev = new_id;
                self.write_node(old_next, &after)?;
            }
            promote = Some((right.keys[0].clone(), new_id));
        } else {
            self.write_node(leaf_id, &leaf)?;
        }

        self.propagate_insert(&path, &indices, promote)
    }

    fn propagate_insert(
        &mut self,
        path: &[u32],
        indices: &[usize],
        mut promote: Option<(Vec<u8>, u32)>,
    ) -> Result<()> {
        let mut level = indices.len();
        while let Some((sep_key, new_child_id)) = promote.take() {
            if level == 0 {
                let mut new_root = Node::new_internal();
                new_root.keys.push(sep_key);
                new_root.children.push(self.root);
                new_root.children.push(new_child_id);
                let new_root_id = self.pager.allocate_page(PageType::Index)?.id;
                self.write_node(new_root_id, &new_root)?;
                self.root = new_root_id;
                return Ok(());
            }

            level -= 1;
            let node_id = path[level];
            let mut node = self.load_node(node_id)?;
            let child_idx = indices[level];
            node.keys.insert(child_idx, sep_key);
            node.children.insert(child_idx + 1, new_child_id);

            if node.keys.len() > BTREE_ORDER || node.byte_size() > BTREE_SPLIT_THRESHOLD {
                let split_at = byte_driven_midpoint(&internal_item_sizes(&node));
                let sep = node.keys[split_at].clone();
                let right_keys = node.keys.split_off(split_at + 1);
                let right_children = node.children.split_off(split_at + 1);
                node.keys.pop(); // remove the promoted separator from the left half

                let mut right = Node::new_internal();
                right.keys = right_keys;
                right.children = right_children;

                let right_id = self.pager.allocate_page(PageType::Index)?.id;
                self.write_node(node_id, &node)?;
                self.write_node(right_id, &right)?;
                promote = Some((sep, right_id));
            } else {
                self.write_node(node_id, &node)?;
            }
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let (path, indices) = self.descend(key)?;
        let leaf_id = *path.last().unwrap();
        let mut leaf = self.load_node(leaf_id)?;

        let pos = match leaf.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(p) => p,
            Err(_) => return Ok(false),
        };
        leaf.keys.remove(pos);
        leaf.values.remove(pos);

        if path.len() == 1 {
            self.write_node(leaf_id, &leaf)?;
            return Ok(true);
        }

        if leaf.keys.len() >= min_keys() {
            self.write_node(leaf_id, &leaf)?;
            self.update_ancestor_separator(&path, &indices)?;
            return Ok(true);
        }

        self.fix_underflow_leaf(&path, &indices, leaf_id, leaf)?;
        Ok(true)
    }

    fn update_ancestor_separator(&mut self, path: &[u32], indices: &[usize]) -> Result<()> {
        let leaf = self.load_node(*path.last().unwrap())?;
        let Some(new_first) = leaf.keys.first().cloned() else {
            return Ok(());
        };
        for level in (0..indices.len()).rev() {
            if indices[level] > 0 {
                let mut node = self.load_node(path[level])?;
                node.keys[indices[level] - 1] = new_first;
                self.write_node(path[level], &node)?;
                return Ok(());
            }
        }
        Ok(())
    }

    fn fix_underflow_leaf(
        &mut self,
        path: &[u32],
        indices: &[usize],
        leaf_id: u32,
        mut leaf: Node,
    ) -> Result<()> {
        let parent_level = indices.len() - 1;
        let parent_id = path[parent_level];
        let child_idx = indices[parent_level];
        let mut parent = self.load_node(parent_id)?;
        let min = min_keys();

        if child_idx > 0 {
            let left_id = parent.children[child_idx - 1];
            let mut left = self.load_node(left_id)?;
            if left.keys.len() > min {
                let k = left.keys.pop().unwrap();
                let v = left.values.pop().unwrap();
                leaf.keys.insert(0, k);
                leaf.values.insert(0, v);
                parent.keys[child_idx - 1] = leaf.keys[0].clone();
                self.write_node(left_id, &left)?;
                self.write_node(leaf_id, &leaf)?;
                self.write_node(parent_id, &parent)?;
                return Ok(());
            }
        }
        if child_idx + 1 < parent.children.len() {
            let right_id = parent.children[child_idx + 1];
            let mut right = self.load_node(right_id)?;
            if right.keys.len() > min {
                let k = right.keys.remove(0);
                let v = right.values.remove(0);
                leaf.keys.push(k);
                leaf.values.push(v);
                self.write_node(leaf_id, &leaf)?;
                parent.keys[child_idx] = right.keys[0].clone();
                self.write_node(right_id, &right)?;
                self.write_node(parent_id, &parent)?;
                return Ok(());
            }
        }

        if child_idx > 0 {
            let left_id = parent.children[child_idx - 1];
            let mut left = self.load_node(left_id)?;
            left.keys.extend(leaf.keys.clone());
            left.values.extend(leaf.values.clone());
            left.next = leaf.next;
            let leaf_next = leaf.next;
            self.write_node(left_id, &left)?;
            if leaf_next != 0 {
                let mut after = self.load_node(leaf_next)?;
                after.prev = left_id;
                self.write_node(leaf_next, &after)?;
            }
            self.free_node(leaf_id)?;
            parent.keys.remove(child_idx - 1);
            parent.children.remove(child_idx);
        } else {
            let right_id = parent.children[child_idx + 1];
            let right = self.load_node(right_id)?;
            leaf.keys.extend(right.keys.clone());
            leaf.values.extend(right.values.clone());
            leaf.next = right.next;
            let right_next = right.next;
            self.write_node(leaf_id, &leaf)?;
            if right_next != 0 {
                let mut after = self.load_node(right_next)?;
                after.prev = leaf_id;
                self.write_node(right_next, &after)?;
            }
            self.free_node(right_id)?;
            parent.keys.remove(child_idx);
            parent.children.remove(child_idx + 1);
        }

        self.fix_internal_chain(path, indices, parent_level, parent)
    }

    fn fix_internal_chain(
        &mut self,
        path: &[u32],
        indices: &[usize],
        mut level: usize,
        mut node: Node,
    ) -> Result<()> {
        let min = min_keys();
        loop {
            if level == 0 {
                if node.keys.is_empty() && node.children.len() == 1 {
                    let new_root = node.children[0];
                    self.free_node(path[0])?;
                    self.root = new_root;
                } else {
                    self.write_node(path[0], &node)?;
                }
                return Ok(());
            }

            if node.keys.len() >= min {
                self.write_node(path[level], &node)?;
                return Ok(());
            }

            let parent_level = level - 1;
            let parent_id = path[parent_level];
            let child_idx = indices[parent_level];
            let mut parent = self.load_node(parent_id)?;

            if child_idx > 0 {
                let left_id = parent.children[child_idx - 1];
                let mut left = self.load_node(left_id)?;
                if left.keys.len() > min {
                    let moved_child = left.children.pop().unwrap();
                    let moved_key = left.keys.pop().unwrap();
                    let sep = parent.keys[child_idx - 1].clone();
                    node.keys.insert(0, sep);
                    node.children.insert(0, moved_child);
                    parent.keys[child_idx - 1] = moved_key;
                    self.write_node(left_id, &left)?;
                    self.write_node(path[level], &node)?;
                    self.write_node(parent_id, &parent)?;
                    return Ok(());
                }
            }
            if child_idx + 1 < parent.children.len() {
                let right_id = parent.children[child_idx + 1];
                let mut right = self.load_node(right_id)?;
                if right.keys.len() > min {
                    let moved_child = right.children.remove(0);
                    let moved_key = right.keys.remove(0);
                    let sep = parent.keys[child_idx].clone();
                    node.keys.push(sep);
                    node.children.push(moved_child);
                    parent.keys[child_idx] = moved_key;
                    self.write_node(right_id, &right)?;
                    self.write_node(path[level], &node)?;
                    self.write_node(parent_id, &parent)?;
                    return Ok(());
                }
            }

            if child_idx > 0 {
                let left_id = parent.children[child_idx - 1];
                let mut left = self.load_node(left_id)?;
                let sep = parent.keys[child_idx - 1].clone();
                left.keys.push(sep);
                left.keys.extend(node.keys.clone());
                left.children.extend(node.children.clone());
                self.write_node(left_id, &left)?;
                self.free_node(path[level])?;
                parent.keys.remove(child_idx - 1);
                parent.children.remove(child_idx);
            } else {
                let right_id = parent.children[child_idx + 1];
                let right = self.load_node(right_id)?;
                let sep = parent.keys[child_idx].clone();
                node.keys.push(sep);
                node.keys.extend(right.keys.clone());
                node.children.extend(right.children.clone());
                self.write_node(path[level], &node)?;
                self.free_node(right_id)?;
                parent.keys.remove(child_idx);
                parent.children.remove(child_idx + 1);
            }

            level = parent_level;
            node = parent;
        }
    }

    /// Inclusive/exclusive range scan over the leaf chain, honoring an
    /// optional result limit.
    pub fn range(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut leaf_id = match start {
            Some(key) => {
                let (path, _) = self.descend(key)?;
                *path.last().unwrap()
            }
            None => self.leftmost_leaf()?,
        };

        let mut out = Vec::new();
        loop {
            if leaf_id == 0 {
                break;
            }
            let leaf = self.load_node(leaf_id)?;
            for (k, v) in leaf.keys.iter().zip(&leaf.values) {
                if let Some(s) = start {
                    if k.as_slice() < s {
                        continue;
                    }
                }
                if let Some(e) = end {
                    if k.as_slice() >= e {
                        return Ok(out);
                    }
                }
                out.push((k.clone(), v.clone()));
                if let Some(limit) = limit {
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
            leaf_id = leaf.next;
        }
        Ok(out)
    }

    fn leftmost_leaf(&mut self) -> Result<u32> {
        let mut current = self.root;
        loop {
            let node = self.load_node(current)?;
            if node.is_leaf {
                return Ok(current);
            }
            current = node.children[0];
        }
    }

    /// Test/diagnostic hook: verifies strict key ordering within and across
    /// leaves, `children.len() == keys.len() + 1` for internal nodes, and
    /// leaf-chain `next`/`prev` symmetry.
    pub fn verify(&mut self) -> Result<()> {
        self.verify_subtree(self.root, None, None)?;

        let mut leaf_id = self.leftmost_leaf()?;
        let mut prev_id = 0u32;
        let mut last_key: Option<Vec<u8>> = None;
        while leaf_id != 0 {
            let leaf = self.load_node(leaf_id)?;
            if leaf.prev != prev_id {
                return Err(Error::invalid_argument("leaf chain prev pointer mismatch"));
            }
            for key in &leaf.keys {
                if let Some(last) = &last_key {
                    if key <= last {
                        return Err(Error::invalid_argument("leaf chain keys not strictly ascending"));
                    }
                }
                last_key = Some(key.clone());
            }
            prev_id = leaf_id;
            leaf_id = leaf.next;
        }
        Ok(())
    }

    fn verify_subtree(&mut self, id: u32, lower: Option<&[u8]>, upper: Option<&[u8]>) -> Result<()> {
        let node = self.load_node(id)?;
        for w in node.keys.windows(2) {
            if w[0] >= w[1] {
                return Err(Error::invalid_argument("keys not strictly ascending"));
            }
        }
        if let (Some(lower), Some(first)) = (lower, node.keys.first()) {
            if first.as_slice() < lower {
                return Err(Error::invalid_argument("key below node's lower bound"));
            }
        }
        if let (Some(upper), Some(last)) = (upper, node.keys.last()) {
            if last.as_slice() >= upper {
                return Err(Error::invalid_argument("key at or above node's upper bound"));
            }
        }
        if !node.is_leaf {
            if node.children.len() != node.keys.len() + 1 {
                return Err(Error::invalid_argument("children.len() != key_count + 1"));
            }
            for (i, &child) in node.children.iter().enumerate() {
                let lo = if i == 0 { lower } else { Some(node.keys[i - 1].as_slice()) };
                let hi = if i == node.keys.len() { upper } else { Some(node.keys[i].as_slice()) };
                self.verify_subtree(child, lo, hi)?;
            }
        }
        Ok(())
    }
}
