//! Selection tracker: which records the user has chosen, across pages.

use crate::error::PaymentRequestError;
use crate::models::RecordFilter;
use crate::services::resolver::FilterResolver;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Current selection descriptor.
///
/// `AllFiltered` stores the records the user unticked after escalating, so
/// the effective set is `resolve(filter) - exclusions` at whatever moment it
/// is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    None,
    Explicit(BTreeSet<Uuid>),
    AllFiltered {
        filter: RecordFilter,
        exclusions: BTreeSet<Uuid>,
    },
}

impl Selection {
    pub fn select_one(&mut self, id: Uuid) {
        match self {
            Selection::None => *self = Selection::Explicit(BTreeSet::from([id])),
            Selection::Explicit(ids) => {
                ids.insert(id);
            }
            Selection::AllFiltered { exclusions, .. } => {
                exclusions.remove(&id);
            }
        }
    }

    pub fn deselect_one(&mut self, id: Uuid) {
        match self {
            Selection::None => {}
            Selection::Explicit(ids) => {
                ids.remove(&id);
                self.collapse_if_empty();
            }
            Selection::AllFiltered { exclusions, .. } => {
                exclusions.insert(id);
            }
        }
    }

    /// Add every row of the visible page.
    pub fn select_all_on_page(&mut self, ids: &[Uuid]) {
        for id in ids {
            self.select_one(*id);
        }
    }

    /// Remove every row of the visible page.
    pub fn deselect_all_on_page(&mut self, ids: &[Uuid]) {
        for id in ids {
            self.deselect_one(*id);
        }
    }

    /// Switch to "every record matching the filter", dropping explicit ids
    /// and prior exclusions.
    pub fn escalate_to_all_filtered(&mut self, filter: RecordFilter) {
        *self = Selection::AllFiltered {
            filter: filter.canonical(),
            exclusions: BTreeSet::new(),
        };
    }

    pub fn clear(&mut self) {
        *self = Selection::None;
    }

    pub fn is_all_filtered(&self) -> bool {
        matches!(self, Selection::AllFiltered { .. })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Selection::None)
    }

    pub fn is_selected(&self, id: &Uuid) -> bool {
        match self {
            Selection::None => false,
            Selection::Explicit(ids) => ids.contains(id),
            Selection::AllFiltered { exclusions, .. } => !exclusions.contains(id),
        }
    }

    /// True when the whole visible page is selected but more matching rows
    /// exist, which is when the UI offers "select all N matching".
    pub fn should_offer_escalation(&self, page_ids: &[Uuid], total_matching: i64) -> bool {
        if self.is_all_filtered() || page_ids.is_empty() {
            return false;
        }
        page_ids.iter().all(|id| self.is_selected(id)) && total_matching > page_ids.len() as i64
    }

    /// Number of effective records. In `AllFiltered` mode this asks the
    /// resolver for the live server-side count. Exclusions only subtract
    /// while they still match the filter, so the count always equals the
    /// length of the resolved selection.
    pub async fn count(&self, resolver: &FilterResolver) -> Result<i64, PaymentRequestError> {
        match self {
            Selection::None => Ok(0),
            Selection::Explicit(ids) => Ok(ids.len() as i64),
            Selection::AllFiltered { filter, exclusions } if exclusions.is_empty() => {
                resolver.resolve_count(filter).await
            }
            Selection::AllFiltered { .. } => {
                Ok(resolver.resolve_selection(self).await?.len() as i64)
            }
        }
    }

    fn collapse_if_empty(&mut self) {
        if matches!(self, Selection::Explicit(ids) if ids.is_empty()) {
            *self = Selection::None;
        }
    }
}
