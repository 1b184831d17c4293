use uuid::Uuid;

use crate::contact::{Contact, ContactPatch, ContactType};
use crate::error::Result;

pub const CONTACTS_TABLE: &str = "contacts";

/// One page of a filtered, newest-first contact listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactQuery {
    pub contact_type: Option<ContactType>,
    pub tag: Option<String>,
    pub include_archived: bool,
    pub offset: usize,
    pub limit: usize,
}

/// Equality filters on a subset of contact columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchColumn {
    Email,
    FirstName,
    LastName,
    Company,
}

impl MatchColumn {
    pub fn column(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::Company => "company",
        }
    }
}

pub trait ContactStore {
    fn select_contacts(&mut self, query: &ContactQuery) -> Result<Vec<Contact>>;
    fn select_contact(&mut self, id: Uuid) -> Result<Option<Contact>>;
    fn select_matching(&mut self, filters: &[(MatchColumn, String)]) -> Result<Vec<Contact>>;
    fn insert_contact(&mut self, row: &Contact) -> Result<Contact>;
    /// `Ok(None)` when no row carries `id`.
    fn update_contact(&mut self, id: Uuid, patch: &ContactPatch) -> Result<Option<Contact>>;
    /// `Ok(false)` when no row carries `id`.
    fn delete_contact(&mut self, id: Uuid) -> Result<bool>;
    /// Cheapest possible round trip, used to report connection status.
    fn ping(&mut self) -> Result<()>;
    fn request_count(&self) -> usize;
}

pub trait SqlExecutor {
    /// Submit `sql` as a single remote execution call.
    fn exec_sql(&mut self, sql: &str) -> Result<()>;
}
