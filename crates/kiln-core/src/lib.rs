//! # KILN Core
//!
//! Foundational types, errors, configuration and backend traits for the KILN
//! command submission engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        kiln-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Traits    │  │   Types     │  │   Error / Config    │  │
//! │  │ (Memory,    │  │ (GpuAddr,   │  │ (Error, CsrConfig,  │  │
//! │  │  Submission)│  │  Stamps)    │  │  DispatchFlags)     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod error;
pub mod flags;
pub mod memory;
pub mod sync;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use config::{BudgetPolicy, CsrConfig};
pub use error::{Error, Result};
pub use flags::*;
pub use memory::*;
pub use sync::{CompletionCounter, CompletionStamp, FlushStamp};
pub use traits::*;
pub use types::*;
