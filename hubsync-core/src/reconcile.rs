//! Read-only comparison of local and remote row counts.

use serde::Serialize;
use thiserror::Error;

use crate::{EntityAdapter, LocalStore, LocalStoreError, RemoteError};

/// Errors raised while reconciling a table.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The local count could not be read.
    #[error("failed to count local rows")]
    Local(#[from] LocalStoreError),
    /// The remote count could not be fetched.
    #[error("failed to fetch the remote count")]
    Remote(#[from] RemoteError),
}

/// Local and remote counts for one table.
///
/// The probe only reports; deciding what drift means is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// Table that was probed.
    pub table_name: String,
    /// Whether the local table exists.
    pub table_present: bool,
    /// Rows in the local table.
    pub local_count: u64,
    /// Records at the source.
    pub remote_count: u64,
}

impl Reconciliation {
    /// `(local, remote)` counts.
    #[must_use]
    pub const fn counts(&self) -> (u64, u64) {
        (self.local_count, self.remote_count)
    }

    /// Local count minus remote count.
    ///
    /// # Examples
    /// ```
    /// use hubsync_core::Reconciliation;
    ///
    /// let probe = Reconciliation {
    ///     table_name: "hubcheckout".into(),
    ///     table_present: true,
    ///     local_count: 90,
    ///     remote_count: 100,
    /// };
    /// assert_eq!(probe.drift(), -10);
    /// ```
    #[must_use]
    pub fn drift(&self) -> i128 {
        i128::from(self.local_count) - i128::from(self.remote_count)
    }

    /// Return `true` when both counts agree.
    #[must_use]
    pub const fn is_in_sync(&self) -> bool {
        self.local_count == self.remote_count
    }
}

/// Count the adapter's table locally and at the source. Nothing is written.
///
/// # Errors
/// Returns [`ReconcileError`] when either count cannot be obtained.
pub fn reconcile<A, L>(adapter: &A, store: &L) -> Result<Reconciliation, ReconcileError>
where
    A: EntityAdapter + ?Sized,
    L: LocalStore + ?Sized,
{
    let table_name = adapter.table().name();
    let table_present = store.table_exists(table_name)?;
    let local_count = if table_present {
        store.count(table_name)?
    } else {
        0
    };
    let remote_count = adapter.count()?;
    Ok(Reconciliation {
        table_name: table_name.to_owned(),
        table_present,
        local_count,
        remote_count,
    })
}
