//! NWScript toolchain: NSS source to NCS bytecode and back.
//!
//! ```text
//! nss::parser ─► nss::resolver ─► nss::typeck ─► nss::compiler ─► ncs::optimize ─► ncs::codec
//!                                                                                      │
//! nss::printer ◄─ decompiler::render ◄─ decompiler::structure ◄─ decompiler::depth ◄───┘
//! ```
//!
//! [`driver`] wires one unit through either direction; [`batch`] runs many
//! on a worker pool.

pub mod batch;
pub mod decompiler;
pub mod driver;
pub mod error;
pub mod game;
pub mod ncs;
pub mod nss;
pub mod output;
pub mod paths;
pub mod settings;

pub use driver::{CompileOptions, Compiled};
pub use error::ToolError;
pub use game::GameVariant;
