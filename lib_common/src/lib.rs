// Declare the modules to re-export
#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "utils")]
pub mod utils;

// Re-export everything
#[cfg(feature = "connections")]
pub use connections::cache_redis::*;
#[cfg(feature = "utils")]
pub use utils::time::*;
