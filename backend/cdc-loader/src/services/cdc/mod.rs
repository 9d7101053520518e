mod consumer;
mod grouper;
mod models;
mod parser;
mod queue;
mod resource;

pub use consumer::{build_load_units, BatchOutcome, ConsumerLoop, LoopState, LoopSummary};
pub use grouper::{group_by_table, TableGroup};
pub use models::{
    Batch, ChangeEnvelope, ChangeOp, ChangePayload, ChangeSource, ParsedEvent, RawChangeRecord,
    Row,
};
pub use parser::{parse_event, DropReason};
pub use queue::{change_queue, ChangeQueue, ChangeSender, QueueHandler};
pub use resource::{
    build_load_unit, LoadUnit, PrimaryKeys, WriteDisposition, DELETED_COLUMN, OP_COLUMN,
};
