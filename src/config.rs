//! Runtime configuration (spec.md §6, SPEC_FULL.md §A.4).
//!
//! Grounded on the teacher's `runtimes::runtime_config::RuntimeConfig`
//! pattern: one small struct centralizing environment reads, with an env
//! loader that tolerates a missing `.env` file via `dotenvy`.

use crate::secret::SecretKey;

#[derive(Clone)]
pub struct RuntimeConfig {
    pub mcp_pool_size: usize,
    pub secret_key: SecretKey,
}

impl RuntimeConfig {
    /// Loads configuration from the process environment, after attempting
    /// to populate it from a `.env` file in the current directory (a
    /// missing file is not an error).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            mcp_pool_size: crate::tools::adapters::pool::mcp_pool_size_from_env(),
            secret_key: SecretKey::resolve_from_env(),
        }
    }
}
