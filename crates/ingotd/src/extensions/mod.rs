//! Agent extensions.
//!
//! Each extension registers its commands into the shared [`CommandRegistry`]
//! at construction. Command names are namespaced `extension.command`.
//!
//! [`CommandRegistry`]: crate::commands::CommandRegistry

pub mod clean;
pub mod decom;
pub mod fake;
pub mod standby;
