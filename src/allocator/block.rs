//! Per-process block cache over the distributed allocator.
//!
//! Request handlers draw IDs from a local `(next, end)` pair; only an
//! exhausted block costs a network round trip. The block mutex is held
//! across the refill so concurrent callers never double-allocate.

use std::sync::Arc;
use tokio::sync::Mutex;

use super::service::IdAllocator;
use crate::error::ZipResult;

#[derive(Debug, Clone, Copy)]
struct Block {
    next: i64,
    end: i64,
}

impl Block {
    const fn exhausted(&self) -> bool {
        self.next > self.end
    }
}

pub struct CodeBlocks {
    allocator: Arc<IdAllocator>,
    block_size: i64,
    block: Mutex<Block>,
}

impl CodeBlocks {
    pub fn new(allocator: Arc<IdAllocator>, block_size: i64) -> Self {
        Self {
            allocator,
            block_size: block_size.max(1),
            block: Mutex::new(Block { next: 1, end: 0 }),
        }
    }

    /// Draw one ID; refills the block with a single `allocate_range` call
    /// when exhausted.
    pub async fn next_id(&self) -> ZipResult<i64> {
        let mut block = self.block.lock().await;
        if block.exhausted() {
            let range = self.allocator.allocate_range(self.block_size).await?;
            block.next = range.start;
            block.end = range.end;
        }
        let id = block.next;
        block.next += 1;
        Ok(id)
    }
}
