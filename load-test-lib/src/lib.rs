#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

pub mod config;
pub mod distributed;
pub mod engine;
pub mod rpc;
pub mod standalone;
pub mod tx;
pub mod utils;

#[cfg(test)]
mod test;
