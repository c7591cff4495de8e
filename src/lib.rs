//! Command lists over Vulkan with automatic resource lifetime tracking.
//!
//! Command lists retain every buffer, image and pipeline they record, track
//! image layouts and insert the barriers for layout changes, open dynamic
//! rendering scopes from a declarative description, and are paced with
//! binary and timeline semaphores through the [`Device`](backend::Device)
//! facade.

pub mod backend;
pub mod config;
