/*
 * Kernel Data Structures
 *
 * The queue is the workhorse: threads, processes, timers and signal
 * records all live in one or more queues. The hashmap backs keyed
 * registries and the bitmap backs identifier allocation.
 */

pub mod bitmap;
pub mod hashmap;
pub mod queue;

pub use bitmap::Bitmap;
pub use hashmap::HashMap;
pub use queue::{Queue, QueueList, SortOrder, Whence};
