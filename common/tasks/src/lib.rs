pub mod backoff;
pub mod cache;
pub mod looper;
pub mod pool;
pub mod reservoir;

pub use backoff::ExponentialBackoff;
pub use cache::ExpiringCache;
pub use looper::{CancelWatch, Looper};
pub use pool::{Job, WorkerPool};
pub use reservoir::{reservoir, ReservoirHandles};
