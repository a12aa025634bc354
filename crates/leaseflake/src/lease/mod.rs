//! Slot leasing against a coordination service.
//!
//! ## Layout
//! - `<root>` – persistent, shared by every application.
//! - `<root>/<app>` – persistent; its payload is the decimal slot handed out
//!   last.
//! - `<root>/<app>/<slot>` – ephemeral, one per held slot. Its creation time
//!   tells two generations of the same slot apart.

mod coordinator;
mod scan;
#[cfg(test)]
mod tests;

pub use coordinator::*;
pub use scan::*;
