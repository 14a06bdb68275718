//! Process, temp-file and DevTools plumbing shared by the slotwatch core and binary.
//!
//! Nothing in here knows about appointments or identities; it only deals with
//! OS processes, files on disk and the Chrome DevTools wire protocol.

pub mod cdp;
pub mod error;
pub mod process;
pub mod sweep;

pub use error::{Result, RuntimeError};
