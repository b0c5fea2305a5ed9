//! Concrete collaborators
//!
//! AWS access goes through the `aws` CLI; the scan engine runs under `sh`.

pub mod aws;
pub mod scan;

pub use aws::AwsCli;
pub use scan::ShellScanProcess;
