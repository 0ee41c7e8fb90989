//! HITL 暂停 / 恢复状态持久化

pub mod state_store;

pub use state_store::{HitlStateStore, HitlStoreSettings, StateSource, STATE_NOT_FOUND};
