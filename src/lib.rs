// Thu Feb 12 2026 - Alex

//! Recovery of MSVC RTTI and C++ exception-handling metadata from a
//! read-only byte image: type descriptors, complete object locators, class
//! hierarchies with direct-base linearization, vftables, throw-side
//! catchable metadata, and both classic and compact per-function FuncInfo.
//!
//! Discovery is pattern-scan driven and never writes to the image. All
//! structure instances are memoized per [`session::Session`], so reference
//! equality stands in for deep equality across the recovered graphs.

pub mod arch;
pub mod classes;
pub mod codec;
pub mod eh;
pub mod export;
pub mod layout;
pub mod linearize;
pub mod memory;
pub mod name;
pub mod rtti;
pub mod scanner;
pub mod session;
pub mod structs;
pub mod symbols;

pub use classes::{VisualCxxBaseClass, VisualCxxClass};
pub use eh::{build_exception_metadata, ExceptionMetadata};
pub use export::RecoverySummary;
pub use memory::{Address, ByteImage, OwnedImage, PeImage};
pub use rtti::{build_rtti_graph, RttiGraph};
pub use session::{Session, SessionConfig};
pub use symbols::{FunctionRegistry, SimpleFunctionRegistry};

use anyhow::Context;
use std::path::Path;

/// Everything one full pass over an image produces.
#[derive(Debug)]
pub struct Recovery {
    pub rtti: RttiGraph,
    pub exceptions: ExceptionMetadata,
}

impl Recovery {
    pub fn summary(&self) -> RecoverySummary {
        RecoverySummary::new(&self.rtti, &self.exceptions)
    }
}

/// Runs RTTI recovery and exception metadata recovery, in that order; the
/// exception pass reuses every structure the RTTI pass already validated.
pub fn analyze(session: &Session) -> Recovery {
    let rtti = build_rtti_graph(session);
    let exceptions = build_exception_metadata(session);
    Recovery { rtti, exceptions }
}

/// Convenience entry point: map a PE file and analyze it with default
/// session settings. Without a symbol collaborator, personality-routine
/// classification stays empty; use [`analyze`] with a configured
/// [`Session`] for full results.
pub fn analyze_pe_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Recovery> {
    let path = path.as_ref();
    let image = PeImage::load(path)
        .with_context(|| format!("failed to load PE image {}", path.display()))?;
    let session = Session::new(&image);
    Ok(analyze(&session))
}
