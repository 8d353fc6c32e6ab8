//! `tasks` crate — the `FireTask` trait, the `FwAction` result type and
//! built-in task implementations.
//!
//! Every task — built-in and plugin alike — must implement [`FireTask`].
//! The engine crate looks tasks up by name in a [`TaskRegistry`] and
//! dispatches execution through this trait object.

pub mod action;
pub mod builtin;
pub mod descriptor;
pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use action::{FwAction, Outcome};
pub use descriptor::{Spec, TaskDescriptor};
pub use error::TaskError;
pub use registry::TaskRegistry;
pub use traits::{FireTask, TaskContext, TaskOutput};
