//! Interfaces to the runtime's external collaborators.
//!
//! The shadow-memory bitmap and the stack-capture/symbolization subsystem
//! live outside this crate in a full deployment. The manager consumes them
//! through the traits defined here; the submodules provide reference
//! implementations good enough for embedding and for the test suite.

pub mod shadow;
pub mod stack;

pub use shadow::{ShadowMap, ShadowMarker, ShadowMemory};
pub use stack::{BacktraceRegistry, NullStackCapture, StackCapture, StackId};
