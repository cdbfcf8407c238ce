// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]

/// Batch processing of raw lotes.
pub mod batch;
/// Carryover of unprinted work across shifts.
pub mod carryover;
/// The engine error taxonomy with stable codes.
pub mod error;
/// The print-job engine and renderer seam.
pub mod print;
/// Derived route color and collector transitions.
pub mod route_state;
/// Shift lifecycle and the auto-closer.
pub mod shift;

pub use batch::BatchProcessor;
pub use error::EngineError;
pub use print::{
    ComandaRenderer, EnterOutcome, PrintManager, PrintReceipt, RenderError, TextRenderer,
};
pub use shift::ShiftManager;
