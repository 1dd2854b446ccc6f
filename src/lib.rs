//! Campus records core: attendance sessions, risk analytics, results and
//! live subscriptions over a document store.

pub mod analytics;
pub mod attendance;
pub mod calendar;
pub mod config;
pub mod db;
pub mod error;
pub mod memory;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod report;
pub mod results;
pub mod retry;
pub mod store;
pub mod sync;

pub use error::{CoreError, Result};
