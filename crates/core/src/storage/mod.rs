pub mod event_log;
pub mod index;

pub use event_log::JsonlEventLog;
pub use index::{IndexStore, RedbIndexStore};
