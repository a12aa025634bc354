#![doc = include_str!("../README.md")]

mod clock_sync;
mod config;
pub mod coordination;
mod error;
mod facade;
mod generator;
mod id;
mod lease;
mod time;

pub use crate::clock_sync::*;
pub use crate::config::*;
pub use crate::error::*;
pub use crate::facade::*;
pub use crate::generator::*;
pub use crate::id::*;
pub use crate::lease::*;
pub use crate::time::*;
