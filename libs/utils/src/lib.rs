//! `utils` is intended to be a place to put code that is shared
//! between other crates in this repository.

/// `Lsn` type implements common tasks on Log Sequence Numbers
pub mod lsn;

// utility functions and helper traits for unified unique id generation/serialization etc.
pub mod id;

// common log initialisation routine
pub mod logging;
