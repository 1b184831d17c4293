use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CrmConfig;
use crate::contact::{Contact, ContactPatch, ContactType, NewContact};
use crate::error::{CrmError, Result};
use crate::store::{ContactQuery, ContactStore, MatchColumn};
use crate::supabase::SupabaseClient;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactFilter {
    pub contact_type: Option<ContactType>,
    pub tag: Option<String>,
    pub search: Option<String>,
    pub include_archived: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// A missing identifier counts as already deleted.
    #[default]
    Idempotent,
    /// A missing identifier is reported as `NotFound`.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyMissing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub message: String,
}

pub struct ContactsManager<S: ContactStore> {
    store: S,
    page_size: usize,
}

impl ContactsManager<SupabaseClient> {
    /// Build a manager over a fresh hosted-database client.
    pub fn connect(config: &CrmConfig) -> Result<Self> {
        Ok(Self::new(SupabaseClient::from_config(config)?, config.page_size))
    }
}

impl<S: ContactStore> ContactsManager<S> {
    pub fn new(store: S, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Lazily page through contacts matching `filter`, newest first.
    pub fn list(&mut self, filter: ContactFilter) -> ContactPages<'_, S> {
        ContactPages {
            store: &mut self.store,
            filter,
            page_size: self.page_size,
            offset: 0,
            buffer: Vec::new(),
            exhausted: false,
            failed: false,
        }
    }

    pub fn get(&mut self, id: Uuid) -> Result<Contact> {
        self.store
            .select_contact(id)?
            .ok_or_else(|| CrmError::NotFound(id.to_string()))
    }

    pub fn create(&mut self, fields: NewContact) -> Result<Contact> {
        fields.validate()?;
        let id = Uuid::new_v4();
        let row = fields.into_row(id, Utc::now());
        let created = self.store.insert_contact(&row).map_err(into_persistence)?;
        info!(id = %created.id, name = %created.display_name(), "created contact");
        Ok(created)
    }

    pub fn update(&mut self, id: Uuid, patch: ContactPatch) -> Result<Contact> {
        patch.validate()?;
        let mut patch = patch.normalized();
        patch.updated_at = Some(Utc::now());
        let updated = self
            .store
            .update_contact(id, &patch)
            .map_err(into_persistence)?
            .ok_or_else(|| CrmError::NotFound(id.to_string()))?;
        info!(%id, "updated contact");
        Ok(updated)
    }

    pub fn delete(&mut self, id: Uuid, policy: DeletePolicy) -> Result<DeleteOutcome> {
        let removed = self.store.delete_contact(id).map_err(into_persistence)?;
        match (removed, policy) {
            (true, _) => {
                info!(%id, "deleted contact");
                Ok(DeleteOutcome::Deleted)
            }
            (false, DeletePolicy::Idempotent) => {
                debug!(%id, "delete matched no rows");
                Ok(DeleteOutcome::AlreadyMissing)
            }
            (false, DeletePolicy::Strict) => Err(CrmError::NotFound(id.to_string())),
        }
    }

    /// Soft delete: hide the contact from default listings.
    pub fn archive(&mut self, id: Uuid) -> Result<Contact> {
        self.update(
            id,
            ContactPatch {
                archived: Some(true),
                archived_at: Some(Some(Utc::now())),
                ..ContactPatch::default()
            },
        )
    }

    pub fn unarchive(&mut self, id: Uuid) -> Result<Contact> {
        self.update(
            id,
            ContactPatch {
                archived: Some(false),
                archived_at: Some(None),
                ..ContactPatch::default()
            },
        )
    }

    /// Look for an existing contact: email first, then name + company, then
    /// name alone.
    pub fn find_duplicate(
        &mut self,
        first_name: &str,
        last_name: &str,
        email: Option<&str>,
        company: Option<&str>,
    ) -> Result<Option<Contact>> {
        let first_name = first_name.trim();
        let last_name = last_name.trim();
        let email = email.map(str::trim).filter(|value| !value.is_empty());
        let company = company.map(str::trim).filter(|value| !value.is_empty());

        let mut attempts: Vec<Vec<(MatchColumn, String)>> = Vec::new();
        if let Some(email) = email {
            attempts.push(vec![(MatchColumn::Email, email.to_string())]);
        }
        let has_name = !first_name.is_empty() && !last_name.is_empty();
        if has_name && let Some(company) = company {
            attempts.push(vec![
                (MatchColumn::FirstName, first_name.to_string()),
                (MatchColumn::LastName, last_name.to_string()),
                (MatchColumn::Company, company.to_string()),
            ]);
        }
        if has_name {
            attempts.push(vec![
                (MatchColumn::FirstName, first_name.to_string()),
                (MatchColumn::LastName, last_name.to_string()),
            ]);
        }

        for filters in attempts {
            if let Some(found) = self.store.select_matching(&filters)?.into_iter().next() {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Count of non-archived contacts per type, in display order.
    pub fn type_counts(&mut self) -> Result<Vec<(ContactType, usize)>> {
        let mut counts: BTreeMap<ContactType, usize> =
            ContactType::ALL.into_iter().map(|kind| (kind, 0)).collect();
        for contact in self.list(ContactFilter::default()) {
            *counts.entry(contact?.kind()).or_default() += 1;
        }
        Ok(ContactType::ALL
            .into_iter()
            .map(|kind| (kind, counts.get(&kind).copied().unwrap_or(0)))
            .collect())
    }

    pub fn test_connection(&mut self) -> ConnectionStatus {
        match self.store.ping() {
            Ok(()) => ConnectionStatus {
                connected: true,
                message: "Connection successful".to_string(),
            },
            Err(error) => ConnectionStatus {
                connected: false,
                message: error.to_string(),
            },
        }
    }
}

/// Remote failures during a write that are not already classified become
/// persistence errors.
fn into_persistence(error: CrmError) -> CrmError {
    match error {
        CrmError::Connection(_)
        | CrmError::ConfigurationMissing(_)
        | CrmError::Persistence(_)
        | CrmError::NotFound(_)
        | CrmError::Validation(_) => error,
        other => CrmError::Persistence(other.to_string()),
    }
}

/// Page-at-a-time iterator over a contact listing.
///
/// Finite: stops after the first short page. Restartable: [`restart`]
/// rewinds to the first page and fetches again. After an error the
/// iterator yields that error once and then ends.
///
/// [`restart`]: ContactPages::restart
pub struct ContactPages<'a, S: ContactStore> {
    store: &'a mut S,
    filter: ContactFilter,
    page_size: usize,
    offset: usize,
    buffer: Vec<Contact>,
    exhausted: bool,
    failed: bool,
}

impl<S: ContactStore> ContactPages<'_, S> {
    pub fn restart(&mut self) {
        self.offset = 0;
        self.buffer.clear();
        self.exhausted = false;
        self.failed = false;
    }

    fn fetch_next_page(&mut self) -> Result<()> {
        let query = ContactQuery {
            contact_type: self.filter.contact_type,
            tag: self.filter.tag.clone(),
            include_archived: self.filter.include_archived,
            offset: self.offset,
            limit: self.page_size,
        };
        let rows = self.store.select_contacts(&query)?;
        debug!(offset = self.offset, rows = rows.len(), "fetched contact page");
        self.offset += rows.len();
        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        let search = self.filter.search.as_deref().unwrap_or("");
        self.buffer = rows
            .into_iter()
            .filter(|contact| contact.matches_search(search))
            .rev()
            .collect();
        Ok(())
    }
}

impl<S: ContactStore> Iterator for ContactPages<'_, S> {
    type Item = Result<Contact>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if let Some(contact) = self.buffer.pop() {
                return Some(Ok(contact));
            }
            if self.exhausted {
                return None;
            }
            if let Err(error) = self.fetch_next_page() {
                self.failed = true;
                return Some(Err(error));
            }
        }
    }
}
