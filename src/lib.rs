//! Turnstile - In-process request admission
//!
//! This crate implements the rate limiters that gate inbound traffic per
//! client IP, per authenticated user and per system-load state. Each traffic
//! category owns an independent limiter with its own window, threshold and
//! counting strategy (fixed window or sliding log), optionally scaled down
//! when the host reports high load.
//!
//! Counters live in process memory only; multiple server instances do not
//! share state.

pub mod config;
pub mod error;
pub mod logging;
pub mod ratelimit;
