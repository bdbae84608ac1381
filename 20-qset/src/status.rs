use std::sync::{PoisonError, RwLock};

use tracing::warn;

use crate::error::QSetError;

/// Last error observed by any task of one set instance.
///
/// Store failures never surface from `set`/`get`; they land here instead.
#[derive(Debug, Default)]
pub struct Status {
    last: RwLock<Option<QSetError>>,
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, err: impl Into<QSetError>) {
        let err = err.into();
        warn!(error = %err, "qset error recorded");
        *self.last.write().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    pub fn last(&self) -> Option<QSetError> {
        self.last
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn keeps_most_recent_error() {
        let status = Status::new();
        assert!(status.last().is_none());

        status.record(QSetError::MissingConfig("set key"));
        status.record(StoreError::Closed);

        assert!(matches!(
            status.last(),
            Some(QSetError::Store(StoreError::Closed))
        ));
    }
}
