//! Shared domain types for the pax pipeline: project names, content
//! fingerprints, and resolve targets.

mod hashing;
mod name;
mod target;
mod wheel;

pub use hashing::{hash_dir, hash_file, Fingerprint, HashAlgorithm, Hasher};
pub use name::ProjectName;
pub use target::{
    AbbreviatedPlatform, CompletePlatform, Interpreter, PlatformFamily, Target, WheelMismatch,
};
pub use wheel::{is_sdist_path, is_wheel_path, SdistName, WheelName};

pub use pep440_rs::{Version, VersionSpecifiers};
pub use pep508_rs::Requirement;
