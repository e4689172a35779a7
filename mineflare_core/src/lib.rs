pub mod agent;
pub mod capability;
pub mod error;
pub mod geometry;
pub mod program;
pub mod rng;
pub mod value;

/// A type alias for a boxed error that is thread-safe and sendable across threads.
/// This is commonly used as a return type for functions that can return various error types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A type alias for a JSON value, the interchange currency for program
/// arguments, results, metadata defaults and error detail payloads.
pub type Json = serde_json::Value;
