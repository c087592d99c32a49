//! Route modules, one per API area.

pub mod receiver;
