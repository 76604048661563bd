use {
    super::BlockContainer,
    crate::Result,
    blockvault_protocol::BlockId,
    parking_lot::Mutex,
    std::collections::HashMap,
};

/// Container that keeps all blocks in memory. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct InMemoryContainer {
    blocks: Mutex<HashMap<BlockId, Vec<u8>>>,
}

impl InMemoryContainer {
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }
}

impl BlockContainer for InMemoryContainer {
    fn get(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks.lock().get(id).cloned())
    }

    fn put(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        self.blocks.lock().insert(*id, data.to_vec());
        Ok(())
    }

    fn remove(&self, id: &BlockId) -> Result<bool> {
        Ok(self.blocks.lock().remove(id).is_some())
    }

    fn exists(&self, id: &BlockId) -> Result<bool> {
        Ok(self.blocks.lock().contains_key(id))
    }

    fn list_ids(&self) -> Result<Vec<BlockId>> {
        Ok(self.blocks.lock().keys().copied().collect())
    }
}
