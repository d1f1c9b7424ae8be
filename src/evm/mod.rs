//! EVM side of the bridge: contract bindings and the chain watcher.

pub mod contract;
pub mod watcher;
