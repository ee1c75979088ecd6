//! Provider abstractions for object storage, security scanning and content analysis
//!
//! The scanning and analysis engines are external collaborators; this module
//! only defines their boundary plus local stand-ins.

pub mod analyzer;
pub mod local;
pub mod object_store;
pub mod scanner;

pub use analyzer::ContentAnalyzer;
pub use local::{LocalObjectStore, NoopScanner, PlainTextAnalyzer};
pub use object_store::{hash_file, object_key, sha256_hex, ObjectStore, StoredObject};
pub use scanner::{ScanReport, SecurityScanner};
