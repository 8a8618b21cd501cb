pub mod block;
pub mod http;
pub mod service;
pub mod sync;

pub use block::CodeBlocks;
pub use service::{
    AllocatedRange, AllocationSource, AllocatorMetricsSnapshot, IdAllocator, PendingAllocation,
    ServiceHealth, MAX_BLOCK,
};
pub use sync::spawn_sync_worker;
