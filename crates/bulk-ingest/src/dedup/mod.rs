//! Duplicate detection: similarity algorithms, domain checks, clustering

pub mod algorithms;
pub mod cluster;
pub mod detector;
pub mod domain;
pub mod quality;

pub use algorithms::Candidate;
pub use cluster::{cluster_pairs, UnionFind};
pub use detector::{DuplicateDetector, PairMatch, SYSTEM_ACTOR};
pub use domain::DomainSignals;
pub use quality::{choose_master, filename_descriptiveness, MasterChoice, QualityInput};
