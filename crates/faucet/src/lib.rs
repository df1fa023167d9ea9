//! Testnet faucet that batches transfer requests.
//!
//! This crate provides:
//! - A batcher coalescing single transfers into multi-output transactions
//! - A dispatch pool with one worker per funding account
//! - Per-IP rate limiting (weighted sliding window)
//! - An HTTP API in front of both

pub mod api;
pub mod batcher;
pub mod client;
pub mod config;
pub mod error;
pub mod limiter;

pub use batcher::{Batcher, BatcherState};
pub use client::{RpcTransferClient, TransferClient, TransferRequest};
pub use config::{FaucetConfig, RateLimit};
pub use error::{FaucetError, FaucetResult, TransferError};
pub use limiter::WeightedWindowLimiter;
