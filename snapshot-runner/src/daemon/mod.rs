//! Process lifecycle.

pub mod shutdown;
