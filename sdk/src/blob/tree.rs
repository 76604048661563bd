use {
    super::node::{Node, NodeData, NodeStore},
    crate::{Error, Result},
    blockvault_protocol::BlockId,
    std::{cmp::min, ops::Range, sync::Arc},
    tracing::debug,
};

/// Variable-length byte stream stored as a left-filled tree of blocks.
///
/// The id of the root block is the id of the blob and never changes. Leaves
/// (depth 0) hold data, inner nodes hold child ids. All leaves except the last
/// one are full, so the byte range covered by a child follows from its position.
pub struct Blob {
    nodes: Arc<NodeStore>,
    root: BlockId,
    depth: u8,
    size: u64,
}

fn to_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::InvalidArgument(format!("{value} is too large")))
}

fn overflow() -> Error {
    Error::InvalidArgument("blob size overflow".into())
}

/// Sizes of the leaves of a tree being grown to `size` bytes.
struct GrowPlan {
    total_leaves: u64,
    size: u64,
    leaf_len: u64,
}

impl GrowPlan {
    fn leaf_len(&self, index: u64) -> Result<usize> {
        if index.saturating_add(1) == self.total_leaves {
            let start = index.checked_mul(self.leaf_len).ok_or_else(overflow)?;
            to_usize(self.size.saturating_sub(start))
        } else {
            to_usize(self.leaf_len)
        }
    }
}

impl Blob {
    /// Creates an empty blob.
    #[inline]
    pub fn create(nodes: Arc<NodeStore>) -> Result<Self> {
        let root = nodes.create(0, NodeData::Leaf(Vec::new()))?;
        debug!(blob = %root.id, "created blob");
        Ok(Self {
            nodes,
            root: root.id,
            depth: 0,
            size: 0,
        })
    }

    /// Loads a blob. `None` if its root block doesn't exist.
    #[inline]
    pub fn load(nodes: Arc<NodeStore>, id: &BlockId) -> Result<Option<Self>> {
        let Some(root) = nodes.try_load(id)? else {
            return Ok(None);
        };
        let mut blob = Self {
            nodes,
            root: *id,
            depth: root.depth,
            size: 0,
        };
        blob.size = blob.compute_size(root)?;
        Ok(Some(blob))
    }

    #[must_use]
    #[inline]
    pub fn id(&self) -> BlockId {
        self.root
    }

    #[must_use]
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    #[inline]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    fn leaf_len(&self) -> u64 {
        to_u64(self.nodes.max_bytes_per_leaf())
    }

    fn leaves_per_child(&self, depth: u8) -> u64 {
        let exp = u32::from(depth.saturating_sub(1));
        to_u64(self.nodes.max_children())
            .checked_pow(exp)
            .unwrap_or(u64::MAX)
    }

    fn capacity_leaves(&self, depth: u8) -> u64 {
        to_u64(self.nodes.max_children())
            .checked_pow(u32::from(depth))
            .unwrap_or(u64::MAX)
    }

    fn num_leaves(&self, size: u64) -> u64 {
        size.div_ceil(self.leaf_len()).max(1)
    }

    fn check_child(&self, parent: &Node, child: &Node) -> Result<()> {
        if child.depth.saturating_add(1) != parent.depth {
            return Err(Error::invalid(format!(
                "node {} at depth {} has child {} at depth {}",
                parent.id, parent.depth, child.id, child.depth
            )));
        }
        Ok(())
    }

    fn load_child(&self, parent: &Node, id: &BlockId) -> Result<Node> {
        let child = self.nodes.load(id)?;
        self.check_child(parent, &child)?;
        Ok(child)
    }

    fn compute_size(&self, root: Node) -> Result<u64> {
        let mut node = root;
        let mut leaves_before = 0u64;
        loop {
            match &node.data {
                NodeData::Leaf(bytes) => {
                    return leaves_before
                        .checked_mul(self.leaf_len())
                        .and_then(|size| size.checked_add(to_u64(bytes.len())))
                        .ok_or_else(overflow);
                }
                NodeData::Inner(children) => {
                    let last = children
                        .last()
                        .ok_or_else(|| Error::invalid("inner node without children"))?;
                    let full = to_u64(children.len().saturating_sub(1))
                        .checked_mul(self.leaves_per_child(node.depth))
                        .ok_or_else(overflow)?;
                    leaves_before = leaves_before.checked_add(full).ok_or_else(overflow)?;
                    let child = self.load_child(&node, last)?;
                    node = child;
                }
            }
        }
    }

    /// Ids of the leaves whose indices intersect `range`, in order.
    fn collect_leaves(
        &self,
        node: &Node,
        first_leaf: u64,
        range: &Range<u64>,
        out: &mut Vec<(u64, BlockId)>,
    ) -> Result<()> {
        match &node.data {
            NodeData::Leaf(_) => out.push((first_leaf, node.id)),
            NodeData::Inner(children) => {
                let per_child = self.leaves_per_child(node.depth);
                for (index, child) in children.iter().enumerate() {
                    let start = to_u64(index)
                        .checked_mul(per_child)
                        .and_then(|offset| offset.checked_add(first_leaf))
                        .ok_or_else(overflow)?;
                    let end = start.saturating_add(per_child);
                    if end <= range.start || start >= range.end {
                        continue;
                    }
                    if node.depth == 1 {
                        out.push((start, *child));
                    } else {
                        let child = self.load_child(node, child)?;
                        self.collect_leaves(&child, start, range, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn leaves(&self, range: Range<u64>) -> Result<Vec<(u64, BlockId)>> {
        let root = self.nodes.load(&self.root)?;
        let mut out = Vec::new();
        self.collect_leaves(&root, 0, &range, &mut out)?;
        Ok(out)
    }

    fn load_leaf(&self, id: &BlockId) -> Result<Vec<u8>> {
        match self.nodes.load(id)? {
            Node {
                data: NodeData::Leaf(bytes),
                ..
            } => Ok(bytes),
            node => Err(Error::invalid(format!(
                "expected leaf at {id}, found node of depth {}",
                node.depth
            ))),
        }
    }

    /// Reads up to `len` bytes at `offset`, stopping at the end of the blob.
    #[inline]
    pub fn try_read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = min(offset.saturating_add(to_u64(len)), self.size);
        if offset >= end {
            return Ok(Vec::new());
        }
        let leaf_len = self.leaf_len();
        let first = offset / leaf_len;
        let last = end.saturating_sub(1) / leaf_len;
        let mut out = Vec::with_capacity(to_usize(end.saturating_sub(offset))?);
        for (index, id) in self.leaves(first..last.saturating_add(1))? {
            let bytes = self.load_leaf(&id)?;
            let leaf_start = index.saturating_mul(leaf_len);
            let from = to_usize(offset.max(leaf_start).saturating_sub(leaf_start))?;
            let to = to_usize(end.min(leaf_start.saturating_add(leaf_len)).saturating_sub(leaf_start))?;
            let chunk = bytes
                .get(from..to)
                .ok_or_else(|| Error::invalid(format!("leaf {id} is shorter than expected")))?;
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }

    /// Reads exactly `len` bytes at `offset`. Reading beyond the end is an error.
    #[inline]
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset.checked_add(to_u64(len)).ok_or_else(overflow)?;
        if end > self.size {
            return Err(Error::InvalidArgument(format!(
                "read of {len} bytes at {offset} exceeds blob size {}",
                self.size
            )));
        }
        self.try_read(offset, len)
    }

    /// Writes `data` at `offset`, growing the blob if needed.
    #[inline]
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset.checked_add(to_u64(data.len())).ok_or_else(overflow)?;
        if end > self.size {
            self.resize(end)?;
        }
        let leaf_len = self.leaf_len();
        let last_leaf = self.num_leaves(self.size).saturating_sub(1);
        let first = offset / leaf_len;
        let last = end.saturating_sub(1) / leaf_len;
        for (index, id) in self.leaves(first..last.saturating_add(1))? {
            let leaf_start = index.saturating_mul(leaf_len);
            let leaf_size = if index == last_leaf {
                self.size.saturating_sub(leaf_start)
            } else {
                leaf_len
            };
            let from = offset.max(leaf_start);
            let to = end.min(leaf_start.saturating_add(leaf_size));
            let src = data
                .get(to_usize(from.saturating_sub(offset))?..to_usize(to.saturating_sub(offset))?)
                .ok_or_else(overflow)?;
            let bytes = if from == leaf_start && to == leaf_start.saturating_add(leaf_size) {
                src.to_vec()
            } else {
                let mut bytes = self.load_leaf(&id)?;
                let target = bytes
                    .get_mut(
                        to_usize(from.saturating_sub(leaf_start))?
                            ..to_usize(to.saturating_sub(leaf_start))?,
                    )
                    .ok_or_else(|| Error::invalid(format!("leaf {id} is shorter than expected")))?;
                target.copy_from_slice(src);
                bytes
            };
            self.nodes.store(&Node {
                id,
                depth: 0,
                data: NodeData::Leaf(bytes),
            })?;
        }
        Ok(())
    }

    /// Changes the size of the blob. New bytes are zero.
    #[inline]
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        if new_size > self.size {
            self.grow(new_size)
        } else if new_size < self.size {
            self.shrink(new_size)
        } else {
            Ok(())
        }
    }

    fn last_leaf(&self) -> Result<(BlockId, Vec<u8>)> {
        let last = self.num_leaves(self.size).saturating_sub(1);
        let (_, id) = self
            .leaves(last..last.saturating_add(1))?
            .pop()
            .ok_or_else(|| Error::invalid(format!("blob {} has no leaves", self.root)))?;
        let bytes = self.load_leaf(&id)?;
        Ok((id, bytes))
    }

    fn store_leaf(&self, id: BlockId, bytes: Vec<u8>) -> Result<()> {
        self.nodes.store(&Node {
            id,
            depth: 0,
            data: NodeData::Leaf(bytes),
        })
    }

    fn grow(&mut self, new_size: u64) -> Result<()> {
        let leaf_len = self.leaf_len();
        let old_leaves = self.num_leaves(self.size);
        let new_leaves = self.num_leaves(new_size);
        let plan = GrowPlan {
            total_leaves: new_leaves,
            size: new_size,
            leaf_len,
        };

        // Fill up the current last leaf first.
        let (last_id, mut bytes) = self.last_leaf()?;
        let last_len = plan.leaf_len(old_leaves.saturating_sub(1))?;
        if bytes.len() < last_len {
            bytes.resize(last_len, 0);
            self.store_leaf(last_id, bytes)?;
        }

        // Add levels above the root until the tree can hold all leaves.
        while self.capacity_leaves(self.depth) < new_leaves {
            let root = self.nodes.load(&self.root)?;
            let copy = self.nodes.create(root.depth, root.data)?;
            let depth = self.depth.checked_add(1).ok_or_else(overflow)?;
            self.nodes.store(&Node {
                id: self.root,
                depth,
                data: NodeData::Inner(vec![copy.id]),
            })?;
            self.depth = depth;
            debug!(blob = %self.root, depth, "increased tree depth");
        }

        if new_leaves > old_leaves {
            let mut root = self.nodes.load(&self.root)?;
            self.grow_node(&mut root, 0, old_leaves, new_leaves, &plan)?;
        }
        self.size = new_size;
        Ok(())
    }

    /// Extends the subtree of the inner `node` covering leaves starting at `base`
    /// from `existing` to `target` leaves.
    fn grow_node(
        &self,
        node: &mut Node,
        base: u64,
        existing: u64,
        target: u64,
        plan: &GrowPlan,
    ) -> Result<()> {
        let (id, depth) = (node.id, node.depth);
        let per_child = self.leaves_per_child(depth);
        let NodeData::Inner(children) = &mut node.data else {
            return Err(Error::invalid(format!("expected inner node at {id}")));
        };
        let last_index = to_u64(children.len().saturating_sub(1));
        let last_start = last_index.checked_mul(per_child).ok_or_else(overflow)?;
        let last_existing = existing.saturating_sub(last_start);
        let last_target = min(per_child, target.saturating_sub(last_start));
        if depth > 1 && last_target > last_existing {
            let last = *children
                .last()
                .ok_or_else(|| Error::invalid("inner node without children"))?;
            let mut child = self.nodes.load(&last)?;
            self.grow_node(
                &mut child,
                base.saturating_add(last_start),
                last_existing,
                last_target,
                plan,
            )?;
        }

        let wanted = target.div_ceil(per_child);
        let old_len = to_u64(children.len());
        for index in old_len..wanted {
            let start = index.checked_mul(per_child).ok_or_else(overflow)?;
            let count = min(per_child, target.saturating_sub(start));
            let child = self.create_subtree(
                depth.saturating_sub(1),
                base.saturating_add(start),
                count,
                plan,
            )?;
            children.push(child);
        }
        if wanted > old_len {
            self.nodes.store(node)?;
        }
        Ok(())
    }

    /// Creates a new subtree with `count` zero-filled leaves; children are written first.
    fn create_subtree(&self, depth: u8, base: u64, count: u64, plan: &GrowPlan) -> Result<BlockId> {
        if depth == 0 {
            let leaf = self
                .nodes
                .create(0, NodeData::Leaf(vec![0; plan.leaf_len(base)?]))?;
            return Ok(leaf.id);
        }
        let per_child = self.leaves_per_child(depth);
        let mut children = Vec::new();
        let mut start = 0u64;
        while start < count {
            let child_count = min(per_child, count.saturating_sub(start));
            children.push(self.create_subtree(
                depth.saturating_sub(1),
                base.saturating_add(start),
                child_count,
                plan,
            )?);
            start = start.saturating_add(per_child);
        }
        Ok(self.nodes.create(depth, NodeData::Inner(children))?.id)
    }

    fn shrink(&mut self, new_size: u64) -> Result<()> {
        let old_leaves = self.num_leaves(self.size);
        let new_leaves = self.num_leaves(new_size);
        if new_leaves < old_leaves {
            let mut root = self.nodes.load(&self.root)?;
            self.shrink_node(&mut root, old_leaves, new_leaves)?;
        }
        self.size = new_size;

        let (last_id, mut bytes) = self.last_leaf()?;
        let start = new_leaves
            .saturating_sub(1)
            .saturating_mul(self.leaf_len());
        let last_len = to_usize(new_size.saturating_sub(start))?;
        if bytes.len() != last_len {
            bytes.truncate(last_len);
            self.store_leaf(last_id, bytes)?;
        }

        // Keep depth proportional to size: a root with one child takes over the child.
        loop {
            let root = self.nodes.load(&self.root)?;
            let NodeData::Inner(children) = &root.data else {
                break;
            };
            let [only] = children.as_slice() else {
                break;
            };
            let child = self.load_child(&root, only)?;
            self.nodes.store(&Node {
                id: self.root,
                depth: child.depth,
                data: child.data,
            })?;
            self.nodes.remove(&child.id)?;
            self.depth = child.depth;
            debug!(blob = %self.root, depth = self.depth, "decreased tree depth");
        }
        Ok(())
    }

    /// Cuts the subtree of `node` from `existing` down to `target` leaves.
    /// The parent is written before detached subtrees are removed.
    fn shrink_node(&self, node: &mut Node, existing: u64, target: u64) -> Result<()> {
        if existing <= target || node.is_leaf() {
            return Ok(());
        }
        let depth = node.depth;
        let per_child = self.leaves_per_child(depth);
        let keep = to_usize(target.div_ceil(per_child).max(1))?;
        let NodeData::Inner(children) = &mut node.data else {
            return Ok(());
        };
        let old_len = children.len();
        let detached = if keep < old_len {
            children.split_off(keep)
        } else {
            Vec::new()
        };
        let last = *children
            .last()
            .ok_or_else(|| Error::invalid("inner node without children"))?;
        if !detached.is_empty() {
            self.nodes.store(node)?;
        }
        for id in &detached {
            self.remove_subtree(id)?;
        }

        if depth > 1 {
            let last_start = to_u64(keep.saturating_sub(1)).saturating_mul(per_child);
            let last_existing = if keep >= old_len {
                existing.saturating_sub(last_start)
            } else {
                per_child
            };
            let mut child = self.nodes.load(&last)?;
            self.shrink_node(&mut child, last_existing, target.saturating_sub(last_start))?;
        }
        Ok(())
    }

    fn remove_subtree(&self, id: &BlockId) -> Result<()> {
        let node = self.nodes.load(id)?;
        if let NodeData::Inner(children) = &node.data {
            for child in children {
                self.remove_subtree(child)?;
            }
        }
        self.nodes.remove(id)
    }

    /// Ids of all blocks of this blob.
    #[inline]
    pub fn block_ids(&self) -> Result<Vec<BlockId>> {
        let mut out = Vec::new();
        let mut pending = vec![self.root];
        while let Some(id) = pending.pop() {
            if let NodeData::Inner(children) = self.nodes.load(&id)?.data {
                pending.extend(children);
            }
            out.push(id);
        }
        Ok(out)
    }

    #[inline]
    pub fn flush(&self) -> Result<()> {
        self.nodes.blocks().flush()
    }

    /// Removes all blocks of the blob, leaves first.
    #[inline]
    pub fn remove(self) -> Result<()> {
        debug!(blob = %self.root, "removing blob");
        self.remove_subtree(&self.root)
    }
}

#[cfg(test)]
#[expect(clippy::indexing_slicing, reason = "test")]
mod tests {
    use {
        super::*,
        crate::blockstore::{BlockContainer, InMemoryContainer, test_util::store_with},
        rand::{Rng, RngCore},
    };

    fn setup(block_size: usize) -> (Arc<InMemoryContainer>, Arc<NodeStore>) {
        let container = Arc::new(InMemoryContainer::new());
        let store = store_with(Arc::clone(&container) as Arc<dyn BlockContainer>, block_size);
        (container, Arc::new(NodeStore::new(store)))
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::rng().fill_bytes(&mut data);
        data
    }

    #[test]
    fn empty_blob() {
        let (container, nodes) = setup(128);
        let blob = Blob::create(Arc::clone(&nodes)).unwrap();
        assert_eq!(blob.size(), 0);
        assert_eq!(container.len(), 1);
        assert!(blob.try_read(0, 10).unwrap().is_empty());
        blob.read(0, 1).unwrap_err();
        let loaded = Blob::load(nodes, &blob.id()).unwrap().unwrap();
        assert_eq!(loaded.size(), 0);
    }

    #[test]
    fn write_read_across_levels() {
        let (_container, nodes) = setup(128);
        let leaf = nodes.max_bytes_per_leaf();
        let fanout = nodes.max_children();
        let mut blob = Blob::create(Arc::clone(&nodes)).unwrap();
        let data = random_bytes(leaf * fanout * fanout + 17);
        blob.write(0, &data).unwrap();
        assert_eq!(blob.size(), data.len() as u64);
        assert_eq!(blob.depth(), 3);
        assert_eq!(blob.read(0, data.len()).unwrap(), data);
        assert_eq!(blob.read(5, 300).unwrap(), &data[5..305]);

        let id = blob.id();
        let loaded = Blob::load(nodes, &id).unwrap().unwrap();
        assert_eq!(loaded.id(), id);
        assert_eq!(loaded.size(), data.len() as u64);
        assert_eq!(loaded.depth(), 3);
        assert_eq!(loaded.read(0, data.len()).unwrap(), data);
    }

    #[test]
    fn random_operations_match_model() {
        let (_container, nodes) = setup(128);
        let mut blob = Blob::create(Arc::clone(&nodes)).unwrap();
        let mut model = Vec::<u8>::new();
        let mut rng = rand::rng();
        for _ in 0..100 {
            if rng.random_bool(0.3) {
                let size = rng.random_range(0..3000);
                blob.resize(size as u64).unwrap();
                model.resize(size, 0);
            } else {
                let offset = rng.random_range(0..=model.len() + 100);
                let data = random_bytes(rng.random_range(1..600));
                blob.write(offset as u64, &data).unwrap();
                if model.len() < offset + data.len() {
                    model.resize(offset + data.len(), 0);
                }
                model[offset..offset + data.len()].copy_from_slice(&data);
            }
            assert_eq!(blob.size(), model.len() as u64);
            assert_eq!(blob.try_read(0, model.len() + 10).unwrap(), model);
        }
        let blob = Blob::load(nodes, &blob.id()).unwrap().unwrap();
        assert_eq!(blob.read(0, model.len()).unwrap(), model);
    }

    #[test]
    fn resize_to_zero_and_back_yields_zeros() {
        let (container, nodes) = setup(128);
        let mut blob = Blob::create(nodes).unwrap();
        blob.write(0, &random_bytes(5000)).unwrap();
        blob.resize(0).unwrap();
        assert_eq!(blob.size(), 0);
        assert_eq!(blob.depth(), 0);
        assert_eq!(container.len(), 1);
        blob.resize(5000).unwrap();
        assert_eq!(blob.read(0, 5000).unwrap(), vec![0; 5000]);
    }

    #[test]
    fn shrink_releases_blocks() {
        let (container, nodes) = setup(128);
        let leaf = nodes.max_bytes_per_leaf();
        let mut reference = Blob::create(Arc::clone(&nodes)).unwrap();
        reference.resize(leaf as u64 * 5 + 3).unwrap();
        let reference_blocks = reference.block_ids().unwrap().len();
        reference.remove().unwrap();
        assert_eq!(container.len(), 0);

        let mut blob = Blob::create(nodes).unwrap();
        blob.write(0, &random_bytes(leaf * 40)).unwrap();
        let big_depth = blob.depth();
        blob.resize(leaf as u64 * 5 + 3).unwrap();
        assert!(blob.depth() < big_depth);
        assert_eq!(blob.block_ids().unwrap().len(), reference_blocks);
        assert_eq!(container.len(), reference_blocks);
    }

    #[test]
    fn in_bounds_write_touches_only_covered_leaves() {
        let (container, nodes) = setup(128);
        let leaf = nodes.max_bytes_per_leaf();
        let mut blob = Blob::create(nodes).unwrap();
        blob.write(0, &random_bytes(leaf * 10)).unwrap();
        let before: std::collections::HashMap<_, _> = container
            .list_ids()
            .unwrap()
            .into_iter()
            .map(|id| (id, container.get(&id).unwrap()))
            .collect();
        blob.write(leaf as u64 * 3 + 1, b"xy").unwrap();
        let changed = before
            .iter()
            .filter(|(id, data)| container.get(id).unwrap() != **data)
            .count();
        assert_eq!(changed, 1);
    }

    #[test]
    fn remove_deletes_all_blocks() {
        let (container, nodes) = setup(256);
        let mut blob = Blob::create(nodes).unwrap();
        blob.write(0, &random_bytes(20_000)).unwrap();
        assert!(container.len() > 1);
        blob.remove().unwrap();
        assert!(container.is_empty());
    }
}
