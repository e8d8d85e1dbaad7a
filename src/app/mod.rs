pub mod actions;
pub mod adb;
pub mod autoconnect;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod poll;
pub mod prober;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod rooms;
pub mod scheduler;
pub mod store;
#[cfg(test)]
pub mod testing;
