use super::traits::{StorageError, TransactionalStore, UnitOfWork};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Execution context handed to operations running inside a unit of work.
///
/// Carries the active unit of work explicitly. A detached context has no unit
/// of work, and writers given one fail with `StorageError::MissingUnitOfWork`.
pub struct WorkContext<'a> {
    unit_of_work: Option<&'a mut dyn UnitOfWork>,
    deadline: Option<Instant>,
}

impl<'a> WorkContext<'a> {
    pub fn new(unit_of_work: &'a mut dyn UnitOfWork, deadline: Option<Instant>) -> Self {
        Self {
            unit_of_work: Some(unit_of_work),
            deadline,
        }
    }

    /// A context with no unit of work attached.
    pub fn detached() -> Self {
        Self {
            unit_of_work: None,
            deadline: None,
        }
    }

    pub fn unit_of_work(&mut self) -> Result<&mut dyn UnitOfWork, StorageError> {
        match self.unit_of_work.as_mut() {
            Some(uow) => Ok(&mut **uow),
            None => Err(StorageError::MissingUnitOfWork),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn check_deadline(&self) -> Result<(), StorageError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StorageError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

/// Rolls the unit of work back when dropped, whichever way the scope exits.
/// After a successful commit the rollback is a no-op.
struct RollbackGuard {
    unit_of_work: Box<dyn UnitOfWork>,
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if let Err(e) = self.unit_of_work.rollback() {
            warn!(error = %e, "Rollback failed while releasing unit of work");
        }
    }
}

/// Runs operations inside a transactional unit of work: commit on success,
/// rollback on error, panic or deadline expiry.
#[derive(Clone)]
pub struct UnitOfWorkCoordinator {
    store: Arc<dyn TransactionalStore>,
}

impl UnitOfWorkCoordinator {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self { store }
    }

    /// Open a unit of work, run `operation` against it and commit.
    ///
    /// Errors returned by `operation` are passed through unchanged. A panic in
    /// `operation` rolls the unit of work back and keeps unwinding. Blocking:
    /// call from a blocking-friendly thread.
    pub fn run<T, E, F>(&self, deadline: Option<Instant>, operation: F) -> Result<T, E>
    where
        F: FnOnce(&mut WorkContext<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(StorageError::DeadlineExceeded.into());
            }
        }

        let mut guard = RollbackGuard {
            unit_of_work: self.store.begin()?,
        };

        let output = {
            let mut ctx = WorkContext::new(guard.unit_of_work.as_mut(), deadline);
            operation(&mut ctx)?
        };

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(StorageError::DeadlineExceeded.into());
            }
        }

        guard.unit_of_work.commit()?;
        Ok(output)
    }
}
