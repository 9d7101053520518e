pub mod cdc;

pub use cdc::{change_queue, ChangeQueue, ChangeSender, ConsumerLoop, QueueHandler};
