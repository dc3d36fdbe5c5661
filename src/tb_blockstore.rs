//! Content-addressed Blocks
//!
//! Files are chunked into raw leaf blocks and assembled bottom-up into a
//! balanced tree of link nodes. A block's id is the blake3 digest of its
//! encoding, so identical content always yields the same root.
//!
//! Encoding:
//! - raw leaf: `0x00 || data`
//! - link node: `0x01 || id_0 || id_1 || ...` (32 bytes per id)

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::tb_error::NodeError;
use crate::tb_interface::{ContentId, DagService};

/// Default fan-out of a link node
pub const MAX_LINKS: usize = 174;

const TAG_RAW: u8 = 0x00;
const TAG_NODE: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Raw(Vec<u8>),
    Node(Vec<ContentId>),
}

impl Block {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Block::Raw(data) => {
                let mut out = Vec::with_capacity(1 + data.len());
                out.push(TAG_RAW);
                out.extend_from_slice(data);
                out
            }
            Block::Node(links) => {
                let mut out = Vec::with_capacity(1 + 32 * links.len());
                out.push(TAG_NODE);
                for link in links {
                    out.extend_from_slice(link.as_bytes());
                }
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<Block> {
        let (tag, body) = bytes.split_first()?;
        match *tag {
            TAG_RAW => Some(Block::Raw(body.to_vec())),
            TAG_NODE if body.len() % 32 == 0 => {
                let links = body
                    .chunks_exact(32)
                    .map(|c| {
                        let mut id = [0u8; 32];
                        id.copy_from_slice(c);
                        ContentId(id)
                    })
                    .collect();
                Some(Block::Node(links))
            }
            _ => None,
        }
    }

    pub fn links(&self) -> &[ContentId] {
        match self {
            Block::Raw(_) => &[],
            Block::Node(links) => links,
        }
    }
}

pub fn block_id(encoded: &[u8]) -> ContentId {
    ContentId(*blake3::hash(encoded).as_bytes())
}

/// Result of chunking a file
#[derive(Debug, Clone)]
pub struct BuiltDag {
    pub root: ContentId,
    /// Encoded blocks, leaves first then each level up to the root
    pub blocks: Vec<(ContentId, Vec<u8>)>,
    pub leaves: usize,
}

pub fn build_dag(data: &[u8], chunk_size: usize, max_links: usize) -> BuiltDag {
    let chunk_size = chunk_size.max(1);
    let max_links = max_links.max(2);
    let mut blocks = Vec::new();

    let push = |block: Block, blocks: &mut Vec<(ContentId, Vec<u8>)>| {
        let encoded = block.encode();
        let id = block_id(&encoded);
        blocks.push((id, encoded));
        id
    };

    let mut level: Vec<ContentId> = if data.is_empty() {
        vec![push(Block::Raw(Vec::new()), &mut blocks)]
    } else {
        data.chunks(chunk_size)
            .map(|chunk| push(Block::Raw(chunk.to_vec()), &mut blocks))
            .collect()
    };
    let leaves = level.len();

    while level.len() > 1 {
        level = level
            .chunks(max_links)
            .map(|links| push(Block::Node(links.to_vec()), &mut blocks))
            .collect();
    }

    BuiltDag {
        root: level[0],
        blocks,
        leaves,
    }
}

// ============================================================================
// In-Memory Blockstore
// ============================================================================

/// Block storage private to one node. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockstore {
    blocks: Arc<Mutex<IndexMap<ContentId, Arc<Vec<u8>>>>>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<ContentId, Arc<Vec<u8>>>> {
        self.blocks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns false if the block was already present
    pub fn put(&self, id: ContentId, encoded: Vec<u8>) -> bool {
        self.lock().insert(id, Arc::new(encoded)).is_none()
    }

    pub fn put_all(&self, blocks: Vec<(ContentId, Vec<u8>)>) {
        let mut store = self.lock();
        for (id, encoded) in blocks {
            store.insert(id, Arc::new(encoded));
        }
    }

    pub fn get(&self, id: &ContentId) -> Option<Arc<Vec<u8>>> {
        self.lock().get(id).cloned()
    }

    pub fn has(&self, id: &ContentId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn block(&self, id: &ContentId) -> Result<Block, NodeError> {
        let encoded = self.get(id).ok_or(NodeError::NotFound(*id))?;
        Block::decode(&encoded).ok_or(NodeError::Malformed(*id))
    }

    pub fn remove(&self, ids: &[ContentId]) {
        let mut store = self.lock();
        for id in ids {
            store.shift_remove(id);
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reassemble the file under `root` from local blocks only
    pub fn read_file(&self, root: &ContentId) -> Result<Vec<u8>, NodeError> {
        let mut data = Vec::new();
        let mut stack = vec![*root];
        while let Some(id) = stack.pop() {
            match self.block(&id)? {
                Block::Raw(bytes) => data.extend(bytes),
                Block::Node(links) => stack.extend(links.into_iter().rev()),
            }
        }
        Ok(data)
    }
}

#[async_trait]
impl DagService for MemoryBlockstore {
    async fn links(&self, cid: &ContentId) -> Result<Vec<ContentId>, NodeError> {
        Ok(self.block(cid)?.links().to_vec())
    }

    async fn remove_many(&self, cids: &[ContentId]) -> Result<(), NodeError> {
        self.remove(cids);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_block_codec() {
        let leaf = Block::Raw(vec![1, 2, 3]);
        assert_eq!(Block::decode(&leaf.encode()), Some(leaf));

        let node = Block::Node(vec![ContentId([1; 32]), ContentId([2; 32])]);
        let encoded = node.encode();
        assert_eq!(encoded.len(), 65);
        assert_eq!(Block::decode(&encoded), Some(node));

        assert_eq!(Block::decode(&[]), None);
        assert_eq!(Block::decode(&[TAG_NODE, 1, 2]), None);
        assert_eq!(Block::decode(&[9]), None);
    }

    #[test]
    fn test_build_dag_shape() {
        // 10 leaves, fan-out 4: 3 nodes on level 1, root on level 2
        let dag = build_dag(&data(100), 10, 4);
        assert_eq!(dag.leaves, 10);
        assert_eq!(dag.blocks.len(), 10 + 3 + 1);
        assert_eq!(dag.blocks.last().unwrap().0, dag.root);

        let store = MemoryBlockstore::new();
        store.put_all(dag.blocks.clone());
        assert_eq!(store.block(&dag.root).unwrap().links().len(), 3);
        assert_eq!(store.read_file(&dag.root).unwrap(), data(100));
    }

    #[test]
    fn test_small_file_is_single_leaf() {
        let dag = build_dag(&data(5), 10, 4);
        assert_eq!(dag.leaves, 1);
        assert_eq!(dag.blocks.len(), 1);

        let empty = build_dag(&[], 10, 4);
        assert_eq!(empty.leaves, 1);
    }

    #[test]
    fn test_same_content_same_root() {
        let a = build_dag(&data(1000), 64, MAX_LINKS);
        let b = build_dag(&data(1000), 64, MAX_LINKS);
        assert_eq!(a.root, b.root);
        let c = build_dag(&data(1000), 32, MAX_LINKS);
        assert_ne!(a.root, c.root);
    }

    #[tokio::test]
    async fn test_missing_block_is_not_found() {
        let dag = build_dag(&data(100), 10, 4);
        let store = MemoryBlockstore::new();
        store.put_all(dag.blocks);

        let leaf = crate::tb_fraction::collect_leaves(&store, &dag.root).await.unwrap()[3];
        store.remove_many(&[leaf]).await.unwrap();
        assert!(matches!(store.read_file(&dag.root), Err(NodeError::NotFound(id)) if id == leaf));
    }
}
