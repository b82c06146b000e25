#![forbid(unsafe_code)]
//! Cloud synchronization pipelines.
//!
//! Three long-lived loops over the registry queues: the upload pipeline
//! ([`SyncPipeline`]) drains the dirty queue, the delete pipeline
//! ([`DeletePipeline`]) drains the to-delete queue, and the
//! [`PinScheduler`] drains the pin-pending queue. Each dispatches
//! short-lived worker threads bounded by counting semaphores, and the
//! upload and delete pipelines share an [`InFlightTable`] so a removal
//! never races a sync of the same inode.

mod delete;
mod pin;
mod transfer;
mod upload;
mod workers;

pub use delete::{DeletePipeline, DsyncReport};
pub use pin::PinScheduler;
pub use transfer::{delete_object, get_object, put_object};
pub use upload::{SyncPipeline, SyncReport};
pub use workers::{InFlightTable, Semaphore, SemaphorePermit};
