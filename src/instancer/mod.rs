//! Instancer (I): the sole consumer of the job broker, turning a queued
//! `JobMessage` into a running worker. Delegates the actual provisioning to
//! whichever [`backend::WorkerBackend`] the deployment configures.

pub mod backend;
pub mod consumer;
pub mod docker;
pub mod k8s;

pub use backend::{BackendError, StartWorkerSpec, WorkerBackend, WorkerHandle, WorkerState};
pub use consumer::{Consumer, ConsumerConfig, DlqConsumer, InstancerError};
