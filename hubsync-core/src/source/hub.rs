//! Core service entities: transactions, checkouts and checkout trackers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{EntityAdapter, Page, RemoteError};
use crate::{Cursor, TableSpec};

/// Field every Core entity uses as its last-modified marker.
pub const CORE_MARKER_FIELD: &str = "updated_at";

/// Entity types served by the Core API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreEntity {
    /// Payment transactions, synced into `hubtransaction`.
    Transaction,
    /// Checkouts, synced into `hubcheckout`.
    Checkout,
    /// Checkout progress trackers, synced into `hubcheckouttracker`.
    CheckoutTracker,
}

impl CoreEntity {
    /// Every Core entity, in a stable order.
    pub const ALL: [Self; 3] = [Self::Transaction, Self::Checkout, Self::CheckoutTracker];

    /// Local table name.
    #[must_use]
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Transaction => "hubtransaction",
            Self::Checkout => "hubcheckout",
            Self::CheckoutTracker => "hubcheckouttracker",
        }
    }

    /// Path segment of the entity's API resource.
    #[must_use]
    pub const fn resource(self) -> &'static str {
        match self {
            Self::Transaction => "hub-transactions",
            Self::Checkout => "hub-checkouts",
            Self::CheckoutTracker => "hub-checkout-trackers",
        }
    }

    const fn retained_columns(self) -> &'static [&'static str] {
        match self {
            Self::Transaction => &[
                "hub_id",
                "checkout_id",
                "amount",
                "currency",
                "status",
                "payment_method",
                "created_at",
            ],
            Self::Checkout => &[
                "hub_id",
                "customer_id",
                "total_amount",
                "currency",
                "status",
                "created_at",
            ],
            Self::CheckoutTracker => &["checkout_id", "step", "status", "message", "created_at"],
        }
    }

    /// Local table definition for the entity.
    #[must_use]
    pub fn table_spec(self) -> TableSpec {
        TableSpec::trusted(
            self.table_name(),
            "id",
            Some(CORE_MARKER_FIELD),
            self.retained_columns().iter().copied(),
        )
    }
}

impl fmt::Display for CoreEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Error returned when a name matches no Core entity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{0}` is not a Core entity table")]
pub struct UnknownEntity(pub String);

impl FromStr for CoreEntity {
    type Err = UnknownEntity;

    /// Parse a local table name, case-insensitively.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|entity| entity.table_name().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownEntity(name.to_owned()))
    }
}

/// Paginated, countable access to Core entities.
///
/// Implementations return records ordered by `(updated_at, id)` strictly
/// after the cursor, at most `page_size` of them. An empty page means the
/// entity has been read to the end.
pub trait CoreClient: Send + Sync {
    /// Authoritative record count for `entity`.
    ///
    /// # Errors
    /// Returns [`RemoteError`] when the count cannot be obtained.
    fn count(&self, entity: CoreEntity) -> Result<u64, RemoteError>;

    /// Fetch the next page of `entity` after `cursor`.
    ///
    /// # Errors
    /// Returns [`RemoteError`] when the page cannot be fetched or decoded.
    fn fetch_page(
        &self,
        entity: CoreEntity,
        cursor: &Cursor,
        page_size: usize,
    ) -> Result<Page, RemoteError>;
}

impl<C: CoreClient + ?Sized> CoreClient for Arc<C> {
    fn count(&self, entity: CoreEntity) -> Result<u64, RemoteError> {
        (**self).count(entity)
    }

    fn fetch_page(
        &self,
        entity: CoreEntity,
        cursor: &Cursor,
        page_size: usize,
    ) -> Result<Page, RemoteError> {
        (**self).fetch_page(entity, cursor, page_size)
    }
}

/// Adapter syncing one Core entity through a shared [`CoreClient`].
///
/// # Examples
/// ```
/// use std::sync::Arc;
/// use hubsync_core::{CoreEntity, CoreEntityAdapter, EntityAdapter};
/// # use hubsync_core::{CoreClient, Cursor, Page, RemoteError};
/// # struct Offline;
/// # impl CoreClient for Offline {
/// #     fn count(&self, _: CoreEntity) -> Result<u64, RemoteError> { Ok(0) }
/// #     fn fetch_page(&self, _: CoreEntity, _: &Cursor, _: usize) -> Result<Page, RemoteError> {
/// #         Ok(Page::default())
/// #     }
/// # }
///
/// let client = Arc::new(Offline);
/// let adapter = CoreEntityAdapter::new(Arc::clone(&client), CoreEntity::Checkout);
/// assert_eq!(adapter.table().name(), "hubcheckout");
/// ```
#[derive(Debug, Clone)]
pub struct CoreEntityAdapter<C> {
    client: C,
    entity: CoreEntity,
    table: TableSpec,
}

impl<C: CoreClient> CoreEntityAdapter<C> {
    /// Bind `client` to `entity`.
    #[must_use]
    pub fn new(client: C, entity: CoreEntity) -> Self {
        Self {
            client,
            entity,
            table: entity.table_spec(),
        }
    }

    /// Entity this adapter syncs.
    #[must_use]
    pub const fn entity(&self) -> CoreEntity {
        self.entity
    }
}

impl<C: CoreClient> EntityAdapter for CoreEntityAdapter<C> {
    fn table(&self) -> &TableSpec {
        &self.table
    }

    fn count(&self) -> Result<u64, RemoteError> {
        self.client.count(self.entity)
    }

    fn fetch_page(&self, cursor: &Cursor, page_size: usize) -> Result<Page, RemoteError> {
        if let Cursor::Token { .. } = cursor {
            return Err(RemoteError::Misconfigured {
                message: format!(
                    "{} is synced by watermark and cannot resume from a listing token",
                    self.entity
                ),
            });
        }
        self.client.fetch_page(self.entity, cursor, page_size)
    }
}
