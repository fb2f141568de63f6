#![allow(clippy::result_large_err)]

pub mod fake_driver;
pub mod fixtures;

pub use fake_driver::FakeDriver;
