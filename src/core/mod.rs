pub mod db;
pub mod runs;
pub mod sync;
pub mod train;

pub use db::{RecordSource, SqlRecordStore, StaticRecords, StoreOptions, SyncError};
pub use runs::{DirectoryRunRegistry, RunRegistry, next_run_id};
pub use sync::{DatasetSyncOrchestrator, PairOutcome, SyncSummary, SyncTarget, pool_size};
pub use train::{CommandTrainer, TrainHyperparameters, TrainOverrides, TrainRequest, Trainer};
