pub mod consistency;
pub mod coordinator;
pub mod deadlock;
pub mod error;
pub mod log;
pub mod metrics;
pub mod participant;
pub mod participants;

pub use consistency::{ConsistencyCheck, ConsistencyValidator, KeyRange, RecordCounter};
pub use coordinator::{DistributedTransaction, TransactionCoordinator};
pub use deadlock::{AdmissionRejection, DeadlockDetector};
pub use error::{TransactionError, TransactionErrorKind};
pub use log::{TransactionLog, TransactionLogEntry};
pub use metrics::{MetricsSnapshot, TransactionMetrics};
pub use participant::{ParticipantSession, ParticipantStore, Sessions, StoreRef};
