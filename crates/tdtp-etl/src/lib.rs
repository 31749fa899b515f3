//! ETL processor: multi-part import coordination (C9), the merge engine
//! (C10), the pipeline processor (C11), and incremental sync (C12).

pub mod checkpoint;
pub mod import_coordinator;
pub mod merge;
pub mod pipeline;
pub mod safety;
pub mod workspace;

pub use checkpoint::{
    incremental_query, next_checkpoint_from_packets, next_checkpoint_value, CheckpointStore, SyncState,
};
pub use import_coordinator::{import_batch, validate_multi_part_batch};
pub use merge::{merge, merge_all, merge_all_by, merge_packets, MergeConflict, MergeOutcome, MergeStrategy};
pub use pipeline::{
    build_sink, run_pipeline, ErrorHandlingConfig, FileResultLog, OutputConfig, OutputErrorPolicy,
    PipelineConfig, PipelineResult, ResultPublisher, RunStatus, SourceConfig, SourceErrorPolicy,
    SourceKind, TransformErrorPolicy,
};
pub use safety::validate_transform_sql;
pub use workspace::Workspace;
