//! M-Pesa Daraja gateway backend.
//!
//! Maps vendor result codes to a stable internal vocabulary, correlates asynchronous
//! Daraja callbacks with the requests that caused them, and resolves which business a
//! caller acts for.

#![allow(clippy::too_many_arguments)]

#[cfg(feature = "database")]
pub mod api;
#[cfg(feature = "database")]
pub mod auth;
#[cfg(feature = "cache")]
pub mod cache;
pub mod config;
#[cfg(feature = "database")]
pub mod database;
#[cfg(feature = "database")]
pub mod error;
#[cfg(feature = "cache")]
pub mod health;
#[cfg(feature = "database")]
pub mod ledger;
#[cfg(feature = "database")]
pub mod logging;
#[cfg(feature = "database")]
pub mod middleware;
#[cfg(feature = "database")]
pub mod payments;
#[cfg(feature = "database")]
pub mod services;
#[cfg(feature = "database")]
pub mod status_codes;
#[cfg(feature = "database")]
pub mod workers;
