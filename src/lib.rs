//! reactor-pool: an HTTP file server on a readiness reactor and a
//! self-scaling worker pool.
//!
//! - `runtime`: edge-triggered one-shot dispatch of connections to the pool
//! - `pool`: workers added and retired based on the share of busy workers
//! - `index`: the ordered index behind connection timers and the file cache
//! - `cache`: in-memory file cache with revalidation, compression and sweeping
//! - `http`: request framing, static GET/HEAD serving and the query endpoint
//! - `services`: bearer token authentication and the query executor seam

pub mod cache;
pub mod config;
pub mod http;
pub mod index;
pub mod pool;
pub mod runtime;
pub mod services;
pub mod util;
