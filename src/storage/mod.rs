pub mod duckdb;
pub mod traits;
pub mod unit_of_work;
pub mod writer;

pub use traits::{MetricQuery, MetricRow, Storage, StorageError, TransactionalStore, UnitOfWork};
pub use unit_of_work::{UnitOfWorkCoordinator, WorkContext};
pub use writer::{BatchWriter, MetricsTableWriter};
