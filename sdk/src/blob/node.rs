//! Nodes of the block tree.
//!
//! Node layout (inside the block payload):
//!
//! - format (16 bits, little endian)
//! - reserved (8 bits, zero)
//! - depth (8 bits) - 0 for leaves
//! - size (32 bits, little endian) - number of data bytes (leaves) or child ids (inner nodes)
//! - data bytes or child ids

use {
    crate::{Error, Result, blockstore::IntegrityBlockStore},
    blockvault_protocol::{BlockId, ID_LEN},
    byteorder::{ByteOrder, LE},
    std::sync::Arc,
};

const NODE_FORMAT: u16 = 1;
pub const NODE_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeData {
    Leaf(Vec<u8>),
    Inner(Vec<BlockId>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: BlockId,
    pub depth: u8,
    pub data: NodeData,
}

impl Node {
    #[must_use]
    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self.data, NodeData::Leaf(_))
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let (size, body) = match &self.data {
            NodeData::Leaf(bytes) => (bytes.len(), bytes.clone()),
            NodeData::Inner(children) => (
                children.len(),
                children.iter().flat_map(|id| *id.as_bytes()).collect(),
            ),
        };
        let size = u32::try_from(size)
            .map_err(|_| Error::InvalidArgument(format!("node size {size} is too large")))?;
        let mut buf = Vec::with_capacity(NODE_HEADER_LEN.saturating_add(body.len()));
        buf.extend_from_slice(&NODE_FORMAT.to_le_bytes());
        buf.push(0);
        buf.push(self.depth);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    fn parse(id: BlockId, payload: &[u8]) -> Result<Self> {
        let invalid = |detail: &str| Error::invalid(format!("block {id}: {detail}"));
        let (header, body) = payload
            .split_at_checked(NODE_HEADER_LEN)
            .ok_or_else(|| invalid("node is shorter than its header"))?;
        let format = LE::read_u16(header);
        if format != NODE_FORMAT {
            return Err(invalid(&format!("unknown node format {format}")));
        }
        let depth = header.get(3).copied().unwrap_or_default();
        let size = header
            .get(4..)
            .map(LE::read_u32)
            .and_then(|size| usize::try_from(size).ok())
            .ok_or_else(|| invalid("invalid node size"))?;
        let data = if depth == 0 {
            let bytes = body
                .get(..size)
                .ok_or_else(|| invalid("leaf size exceeds block"))?;
            NodeData::Leaf(bytes.to_vec())
        } else {
            let len = size
                .checked_mul(ID_LEN)
                .and_then(|len| body.get(..len))
                .ok_or_else(|| invalid("child count exceeds block"))?;
            if size == 0 {
                return Err(invalid("inner node without children"));
            }
            let children = len
                .chunks_exact(ID_LEN)
                .map(BlockId::from_slice)
                .collect::<anyhow::Result<Vec<_>>>()?;
            NodeData::Inner(children)
        };
        Ok(Self { id, depth, data })
    }
}

/// Loads and stores tree nodes in the encrypted block store.
pub struct NodeStore {
    blocks: Arc<IntegrityBlockStore>,
}

impl NodeStore {
    #[must_use]
    #[inline]
    pub fn new(blocks: Arc<IntegrityBlockStore>) -> Self {
        Self { blocks }
    }

    #[must_use]
    #[inline]
    pub fn blocks(&self) -> &Arc<IntegrityBlockStore> {
        &self.blocks
    }

    /// Number of data bytes a leaf holds.
    #[must_use]
    #[inline]
    pub fn max_bytes_per_leaf(&self) -> usize {
        self.blocks.payload_size().saturating_sub(NODE_HEADER_LEN)
    }

    /// Fan-out of inner nodes.
    #[must_use]
    #[inline]
    pub fn max_children(&self) -> usize {
        self.max_bytes_per_leaf() / ID_LEN
    }

    #[inline]
    pub fn try_load(&self, id: &BlockId) -> Result<Option<Node>> {
        match self.blocks.try_read(id)? {
            Some(payload) => Node::parse(*id, &payload).map(Some),
            None => Ok(None),
        }
    }

    #[inline]
    pub fn load(&self, id: &BlockId) -> Result<Node> {
        self.try_load(id)?
            .ok_or_else(|| Error::invalid(format!("tree node {id} is missing")))
    }

    #[inline]
    pub fn store(&self, node: &Node) -> Result<()> {
        self.blocks.write(&node.id, &node.to_bytes()?)
    }

    /// Creates a node with a new id from `depth` and `data`.
    #[inline]
    pub fn create(&self, depth: u8, data: NodeData) -> Result<Node> {
        let mut node = Node {
            id: BlockId::random(),
            depth,
            data,
        };
        node.id = self.blocks.create(&node.to_bytes()?)?;
        Ok(node)
    }

    #[inline]
    pub fn remove(&self, id: &BlockId) -> Result<()> {
        self.blocks.remove(id)?;
        Ok(())
    }
}
