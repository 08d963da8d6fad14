//! 持久化：任务日志（SQLite）+ 恢复快照（原子写 JSON）

pub mod fs_atomic;
pub mod journal;
pub mod snapshot;

pub use fs_atomic::atomic_write_file;
pub use journal::{
    JournalError, PromotionMark, RecoveryEvent, RecoveryEventRow, RecoveryStage, TaskJournal,
    TaskSummary,
};
pub use snapshot::{FileSnapshotStore, RecoverySnapshot, SnapshotError, SnapshotStore};
