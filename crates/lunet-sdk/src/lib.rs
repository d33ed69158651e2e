//! Lunet SDK - the boundary a cooperative scripting host implements to embed
//! the Lunet asynchronous I/O runtime.
//!
//! Lunet owns the event loop, the handle lifecycle, and the completion
//! pipeline. It never owns the host's coroutine objects directly: a host
//! hands lunet a [`CoroutineId`] when it submits an operation, and implements
//! [`HostContext`] so lunet can resume that id later with a [`Completion`].

#![warn(missing_docs)]

mod error;
mod host;
mod value;

pub use error::LunetError;
pub use host::{Completion, CoroutineId, HostContext, ResumeStatus};
pub use value::HostValue;
