pub mod queue;
pub mod task;

pub use queue::{TaskQueue, TaskSource};
pub use task::{QueuedTask, ResultSlot, Task, TaskResult, DISPATCH_FAILURE};
