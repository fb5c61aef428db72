//! Sync progress cursors.
//!
//! A cursor records how far a table has been synced. Core entities use a
//! keyset watermark: the `(marker, key)` pair of the last committed record.
//! Sources return records ordered by that pair, so resuming strictly after the
//! watermark never skips a record that shares its marker with the last one
//! written. Blob listings instead hand out continuation tokens.

use serde::{Deserialize, Serialize};

use crate::Scalar;

/// Position from which the next page is fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    /// Beginning of the dataset.
    #[default]
    Start,
    /// Every record ordered at or before `(marker, key)` has been committed.
    Watermark {
        /// Last-modified marker of the last committed record.
        marker: Scalar,
        /// Primary key of the last committed record.
        key: Scalar,
    },
    /// Opaque continuation token issued by the source.
    Token {
        /// Token value to hand back to the source.
        token: String,
    },
}

impl Cursor {
    /// Construct a watermark cursor.
    #[must_use]
    pub fn watermark(marker: impl Into<Scalar>, key: impl Into<Scalar>) -> Self {
        Self::Watermark {
            marker: marker.into(),
            key: key.into(),
        }
    }

    /// Construct a continuation-token cursor.
    #[must_use]
    pub fn token(token: impl Into<String>) -> Self {
        Self::Token {
            token: token.into(),
        }
    }

    /// Return `true` when the cursor points at the beginning of the dataset.
    #[must_use]
    pub const fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }

    /// Highest watermark among `positions`, or `None` when empty.
    ///
    /// # Examples
    /// ```
    /// use hubsync_core::{Cursor, Scalar};
    ///
    /// let positions = [
    ///     (Scalar::Int(5), Scalar::Int(2)),
    ///     (Scalar::Int(5), Scalar::Int(9)),
    ///     (Scalar::Int(4), Scalar::Int(30)),
    /// ];
    /// assert_eq!(Cursor::highest_watermark(positions), Some(Cursor::watermark(5, 9)));
    /// ```
    #[must_use]
    pub fn highest_watermark(positions: impl IntoIterator<Item = (Scalar, Scalar)>) -> Option<Self> {
        positions
            .into_iter()
            .max()
            .map(|(marker, key)| Self::Watermark { marker, key })
    }

    /// Combine the current cursor with a candidate for the next one.
    ///
    /// Watermarks never move backwards: if the candidate is ordered before the
    /// current watermark, the current one is kept. Any other combination
    /// adopts the candidate, which is how token listings and resets proceed.
    #[must_use]
    pub fn advance(&self, candidate: Self) -> Self {
        if let (
            Self::Watermark { marker, key },
            Self::Watermark {
                marker: next_marker,
                key: next_key,
            },
        ) = (self, &candidate)
            && (next_marker, next_key) < (marker, key)
        {
            return self.clone();
        }
        candidate
    }

    /// Serialize the cursor for persistence.
    ///
    /// # Errors
    /// Returns the `serde_json` error if encoding fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a persisted cursor.
    ///
    /// # Errors
    /// Returns the `serde_json` error when `encoded` is not a valid cursor.
    pub fn from_json(encoded: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(encoded)
    }
}
