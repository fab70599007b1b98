//! ABOUTME: Library half of the motrack binary
//! ABOUTME: CLI definition, frame sources and the async analysis driver

pub mod cli;
pub mod pipeline;
pub mod source;

pub use cli::{Cli, SourceArgs};
pub use pipeline::{run, RunSummary};
pub use source::{DirectorySource, FrameSource, SyntheticSource};
