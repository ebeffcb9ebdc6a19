//! Repository implementations for database operations.

mod delivery_repo;
mod job_repo;

pub use delivery_repo::DeliveryRepository;
pub use job_repo::{JobFilter, JobRepository};
