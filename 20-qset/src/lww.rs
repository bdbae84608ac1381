//! Add/remove element set built from two replicated sets.

use chrono::{DateTime, Utc};

use crate::error::QSetError;
use crate::qset::QSet;

/// LWW element set: an element is present when its latest add is newer
/// than its latest remove.
///
/// Both halves must use different set keys. Adds and removes replicate
/// independently, so `exists` converges once both sets have converged.
pub struct Lww<T> {
    add: QSet<T>,
    remove: QSet<T>,
}

impl<T> Lww<T> {
    pub fn new(add: QSet<T>, remove: QSet<T>) -> Self {
        Self { add, remove }
    }

    pub async fn init(&self) -> Result<(), QSetError> {
        self.add.init().await?;
        if let Err(err) = self.remove.init().await {
            self.add.quit().await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn add(&self, element: &T, at: DateTime<Utc>) {
        self.add.set(element, at).await;
    }

    pub async fn remove(&self, element: &T, at: DateTime<Utc>) {
        self.remove.set(element, at).await;
    }

    /// A remove at the same timestamp as the add wins.
    pub fn exists(&self, element: &T) -> bool {
        match (self.add.get(element), self.remove.get(element)) {
            (Some(added), Some(removed)) => removed < added,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub async fn sync(&self) {
        self.add.sync().await;
        self.remove.sync().await;
    }

    pub async fn quit(&self) {
        self.add.quit().await;
        self.remove.quit().await;
    }

    pub fn adds(&self) -> &QSet<T> {
        &self.add
    }

    pub fn removes(&self) -> &QSet<T> {
        &self.remove
    }

    /// Error recorded by the add set, or else by the remove set. A newer
    /// error on the remove set does not hide an older one on the add set.
    pub fn last_state(&self) -> Option<QSetError> {
        self.add.last_state().or_else(|| self.remove.last_state())
    }
}
