//! 记忆层：学习到的模式与目标会话的持久化

pub mod patterns;
pub mod persistence;
pub mod store;

pub use patterns::{LearnedPattern, FAILED_APPROACH, SUCCESSFUL_APPROACH};
pub use persistence::JsonFile;
pub use store::PatternMemory;
