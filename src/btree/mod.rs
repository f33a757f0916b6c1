pub mod buffer_pool;
pub mod consts;
pub mod cursor;
pub mod level_cache;
pub mod mvv;
pub mod page;
pub mod tree;
pub mod volume;
