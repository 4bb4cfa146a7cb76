//! Core data model.
//!
//! A task is a unit of work: a named action plus serialized arguments,
//! scheduling fields, and lock/lifecycle state. A recurring definition is a
//! template that spawns tasks on an interval; it never executes itself.

pub mod recurring;
pub mod task;

pub use recurring::{Interval, NewRecurringTask, RecurringTaskDefinition, RecurringTaskId, RecurringTaskRun};
pub use task::{NewTask, RunResult, Task, TaskId, TaskRun, TaskState};
