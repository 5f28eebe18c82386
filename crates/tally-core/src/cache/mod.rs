pub mod key;
pub mod response;

pub use key::cache_key;
pub use response::{CacheStats, ResponseCache};

use lazy_static::lazy_static;
use std::sync::Arc;

lazy_static! {
    static ref GLOBAL: Arc<ResponseCache> = Arc::new(ResponseCache::new());
}

/// The process-wide response cache used by `Engine::new`.
pub fn global() -> Arc<ResponseCache> {
    GLOBAL.clone()
}
