//! Library crate backing the evmbench job execution platform's five
//! services (Admission, Secret Store, Model Proxy, Instancer, Result
//! Service) and the Reaper, each shipped as a thin binary under `src/bin/`.

pub mod admission;
pub mod auth;
pub mod broker;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod instancer;
pub mod job;
pub mod oai_proxy;
pub mod prunner;
pub mod resultsvc;
pub mod secretsvc;
pub mod worker_init;
