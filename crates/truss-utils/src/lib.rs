mod assert;
mod pool;

pub use pool::{Buffer, BufferPool, CachePolicy, class_count, index_to_capacity, size_to_index};
