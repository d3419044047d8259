//! Integrations that rely on components outside the crate.
//!
//! This module groups the captcha solver boundary and its adapters for
//! recognizers that live in other processes or libraries.

pub mod captcha;

pub use captcha::{CommandRecognizer, SerializedSolver};
