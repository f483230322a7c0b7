pub mod binance;
pub mod broker;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod indicators;
pub mod ledger;
pub mod models;
pub mod paper;
pub(crate) mod retry;
pub mod signal;
pub mod supervisor;
