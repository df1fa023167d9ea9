//! Shared building blocks for the faucet workspace: account types, error
//! types, logging setup and configuration loading.

pub mod error;
pub mod types;
pub mod utils;

pub use error::{CommonError, Result};
pub use types::{Address, Coin, ADDRESS_LENGTH};
