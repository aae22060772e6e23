pub mod arena;
pub mod cache;
pub mod patcher;
pub mod pause;
