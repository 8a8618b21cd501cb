pub mod backend;
pub mod lock;
pub mod lookup;
pub mod memory;
pub mod pair;
pub mod redis;

pub use backend::{CacheBackend, StreamEntry};
pub use lock::DistributedLock;
pub use lookup::LookupCache;
pub use memory::MemoryBackend;
pub use pair::CachePair;
pub use redis::RedisBackend;
