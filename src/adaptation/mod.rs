//! 适应层：把执行结果转成可复用的模式与建议

pub mod analyzer;

pub use analyzer::{AdaptationAnalyzer, AdaptationUpdate, PatternEnricher};
