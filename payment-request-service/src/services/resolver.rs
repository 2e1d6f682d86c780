//! Filter resolver: canonical filter criteria to record ids against the
//! live ledger.

use crate::error::PaymentRequestError;
use crate::models::RecordFilter;
use crate::services::ledger::LedgerService;
use crate::services::selection::Selection;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;
use validator::Validate;

/// Stateless. Every call reads current ledger state.
#[derive(Clone)]
pub struct FilterResolver {
    ledger: Arc<dyn LedgerService>,
}

impl FilterResolver {
    pub fn new(ledger: Arc<dyn LedgerService>) -> Self {
        Self { ledger }
    }

    #[instrument(skip(self, filter))]
    pub async fn resolve_count(&self, filter: &RecordFilter) -> Result<i64, PaymentRequestError> {
        let filter = prepare(filter)?;
        let count = self.ledger.count_unpaid(&filter).await?;
        debug!(count = count, "Resolved filter count");
        Ok(count)
    }

    #[instrument(skip(self, filter))]
    pub async fn resolve_ids(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<Uuid>, PaymentRequestError> {
        let filter = prepare(filter)?;
        let ids = self.ledger.resolve_unpaid_ids(&filter).await?;
        debug!(
            record_count = ids.len(),
            unrestricted = filter.is_unrestricted(),
            "Resolved filter ids"
        );
        Ok(ids)
    }

    /// Concrete record ids of a selection descriptor. Explicit ids pass
    /// through unchanged; all-filtered selections resolve now and subtract
    /// the exclusions.
    pub async fn resolve_selection(
        &self,
        selection: &Selection,
    ) -> Result<Vec<Uuid>, PaymentRequestError> {
        match selection {
            Selection::None => Ok(Vec::new()),
            Selection::Explicit(ids) => Ok(ids.iter().copied().collect()),
            Selection::AllFiltered { filter, exclusions } => Ok(self
                .resolve_ids(filter)
                .await?
                .into_iter()
                .filter(|id| !exclusions.contains(id))
                .collect()),
        }
    }
}

fn prepare(filter: &RecordFilter) -> Result<RecordFilter, PaymentRequestError> {
    let filter = filter.clone().canonical();
    filter
        .validate()
        .map_err(|e| PaymentRequestError::InvalidFilter(e.to_string()))?;
    Ok(filter)
}
