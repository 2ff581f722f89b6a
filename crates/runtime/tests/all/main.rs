//! Engine integration tests.
//!
//! Structural tests run everywhere; end-to-end execution requires an
//! aarch64 host and is gated accordingly.

mod helpers;
mod structural;

#[cfg(target_arch = "aarch64")]
mod execute;
