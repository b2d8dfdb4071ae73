//! 记忆层：跨任务的模式统计（仅进程内）

pub mod patterns;

pub use patterns::{PatternKey, PatternLearner, PatternRecord, PatternStore, NEUTRAL_PRIOR};
