use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CrmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactType {
    Networking,
    Prospect,
    Lead,
    Client,
    FormerClient,
    Partner,
    Vendor,
}

impl ContactType {
    pub const ALL: [ContactType; 7] = [
        Self::Networking,
        Self::Prospect,
        Self::Lead,
        Self::Client,
        Self::FormerClient,
        Self::Partner,
        Self::Vendor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Networking => "networking",
            Self::Prospect => "prospect",
            Self::Lead => "lead",
            Self::Client => "client",
            Self::FormerClient => "former_client",
            Self::Partner => "partner",
            Self::Vendor => "vendor",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Networking => "Networking",
            Self::Prospect => "Prospect",
            Self::Lead => "Lead",
            Self::Client => "Client",
            Self::FormerClient => "Former Client",
            Self::Partner => "Partner",
            Self::Vendor => "Vendor",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Self::Networking | Self::Partner => "🤝",
            Self::Prospect => "🎯",
            Self::Lead => "🔥",
            Self::Client => "⭐",
            Self::FormerClient => "📦",
            Self::Vendor => "🏢",
        }
    }

    /// Accepts the stored key (`former_client`) or the display label
    /// (`Former Client`), case-insensitively.
    pub fn parse(value: &str) -> Result<Self> {
        let needle = value.trim();
        Self::ALL
            .into_iter()
            .find(|kind| {
                kind.as_str().eq_ignore_ascii_case(needle) || kind.label().eq_ignore_ascii_case(needle)
            })
            .ok_or_else(|| {
                CrmError::Validation(format!(
                    "unknown contact type: {needle} (expected one of {})",
                    Self::ALL
                        .iter()
                        .map(|kind| kind.as_str())
                        .collect::<Vec<_>>()
                        .join("|")
                ))
            })
    }
}

impl fmt::Display for ContactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    #[default]
    Active,
    Unsubscribed,
    Bounced,
}

impl EmailStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Unsubscribed => "unsubscribed",
            Self::Bounced => "bounced",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "unsubscribed" => Ok(Self::Unsubscribed),
            "bounced" => Ok(Self::Bounced),
            other => Err(CrmError::Validation(format!(
                "unknown email status: {other} (expected active|unsubscribed|bounced)"
            ))),
        }
    }
}

/// A contact row as stored in the `contacts` table.
///
/// `contact_type` is kept as the raw column text so a row with a type this
/// build does not know still loads; [`Contact::kind`] interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    #[serde(rename = "type", default)]
    pub contact_type: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub company: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub source: Option<String>,
    pub source_detail: Option<String>,
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "tags_or_null")]
    pub tags: BTreeSet<String>,
    #[serde(default, deserialize_with = "email_status_or_none")]
    pub email_status: Option<EmailStatus>,
    pub card_image_url: Option<String>,
    #[serde(default)]
    pub archived: Option<bool>,
    #[serde(default, deserialize_with = "timestamp_or_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub last_contacted: Option<String>,
    #[serde(default, deserialize_with = "timestamp_or_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp_or_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// Interpreted type; unknown or missing values display as a prospect.
    pub fn kind(&self) -> ContactType {
        self.contact_type
            .as_deref()
            .and_then(|value| ContactType::parse(value).ok())
            .unwrap_or(ContactType::Prospect)
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }

    pub fn is_archived(&self) -> bool {
        self.archived.unwrap_or(false)
    }

    /// Case-insensitive substring match over name, company and email.
    pub fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        [
            Some(self.first_name.as_str()),
            Some(self.last_name.as_str()),
            self.company.as_deref(),
            self.email.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(&needle))
    }
}

fn tags_or_null<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<BTreeSet<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Unknown statuses load as `None` instead of failing the whole page.
fn email_status_or_none<'de, D>(deserializer: D) -> std::result::Result<Option<EmailStatus>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .and_then(|value| EmailStatus::parse(&value).ok()))
}

fn timestamp_or_none<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.and_then(|value| parse_timestamp(&value)))
}

/// RFC 3339, a naive `YYYY-MM-DD[ T]HH:MM:SS` taken as UTC, or a bare date
/// taken as midnight UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Fields supplied when creating a contact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewContact {
    pub first_name: String,
    pub last_name: String,
    pub contact_type: Option<ContactType>,
    pub company: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub source: Option<String>,
    pub source_detail: Option<String>,
    pub notes: Option<String>,
    pub tags: BTreeSet<String>,
    pub card_image_url: Option<String>,
}

impl NewContact {
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.first_name.trim().is_empty() {
            missing.push("first_name");
        }
        if self.last_name.trim().is_empty() {
            missing.push("last_name");
        }
        if !missing.is_empty() {
            return Err(CrmError::Validation(format!(
                "required fields are empty: {}",
                missing.join(", ")
            )));
        }
        validate_email(self.email.as_deref())?;
        validate_tags(&self.tags)
    }

    /// Build the full row to insert. Identifier and timestamps are assigned
    /// here and never change afterwards.
    pub fn into_row(self, id: Uuid, now: DateTime<Utc>) -> Contact {
        Contact {
            id,
            contact_type: Some(
                self.contact_type
                    .unwrap_or(ContactType::Prospect)
                    .as_str()
                    .to_string(),
            ),
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            company: trimmed(self.company),
            email: trimmed(self.email),
            phone: trimmed(self.phone),
            address: trimmed(self.address),
            source: trimmed(self.source),
            source_detail: trimmed(self.source_detail),
            notes: self.notes,
            tags: normalize_tags(self.tags),
            email_status: Some(EmailStatus::Active),
            card_image_url: trimmed(self.card_image_url),
            archived: Some(false),
            archived_at: None,
            last_contacted: None,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }
}

/// Partial update. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContactPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub contact_type: Option<ContactType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_status: Option<EmailStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(
        serialize_with = "serialize_archived_at",
        skip_serializing_if = "Option::is_none"
    )]
    pub archived_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn serialize_archived_at<S>(
    value: &Option<Option<DateTime<Utc>>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(inner) => inner.serialize(serializer),
        None => serializer.serialize_none(),
    }
}

impl ContactPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(CrmError::Validation("update has no fields to change".to_string()));
        }
        for (field, value) in [
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
        ] {
            if let Some(value) = value
                && value.trim().is_empty()
            {
                return Err(CrmError::Validation(format!("{field} cannot be empty")));
            }
        }
        validate_email(self.email.as_deref())?;
        if let Some(tags) = &self.tags {
            validate_tags(tags)?;
        }
        Ok(())
    }

    /// Trim text fields and tags the same way a new row is cleaned before
    /// insert. Notes are kept as written.
    pub fn normalized(self) -> Self {
        let trim = |value: Option<String>| value.map(|value| value.trim().to_string());
        Self {
            first_name: trim(self.first_name),
            last_name: trim(self.last_name),
            company: trim(self.company),
            email: trim(self.email),
            phone: trim(self.phone),
            address: trim(self.address),
            source: trim(self.source),
            source_detail: trim(self.source_detail),
            card_image_url: trim(self.card_image_url),
            tags: self.tags.map(normalize_tags),
            ..self
        }
    }

    /// Assign every set field onto an in-memory row, as the database does.
    pub fn apply_to(&self, contact: &mut Contact) {
        if let Some(value) = &self.first_name {
            contact.first_name = value.clone();
        }
        if let Some(value) = &self.last_name {
            contact.last_name = value.clone();
        }
        if let Some(kind) = self.contact_type {
            contact.contact_type = Some(kind.as_str().to_string());
        }
        let assign = |target: &mut Option<String>, value: &Option<String>| {
            if let Some(value) = value {
                *target = Some(value.clone());
            }
        };
        assign(&mut contact.company, &self.company);
        assign(&mut contact.email, &self.email);
        assign(&mut contact.phone, &self.phone);
        assign(&mut contact.address, &self.address);
        assign(&mut contact.source, &self.source);
        assign(&mut contact.source_detail, &self.source_detail);
        assign(&mut contact.notes, &self.notes);
        assign(&mut contact.card_image_url, &self.card_image_url);
        if let Some(tags) = &self.tags {
            contact.tags = tags.clone();
        }
        if let Some(status) = self.email_status {
            contact.email_status = Some(status);
        }
        if let Some(archived) = self.archived {
            contact.archived = Some(archived);
        }
        if let Some(archived_at) = self.archived_at {
            contact.archived_at = archived_at;
        }
        if let Some(updated_at) = self.updated_at {
            contact.updated_at = Some(updated_at);
        }
    }
}

fn validate_email(email: Option<&str>) -> Result<()> {
    match email.map(str::trim) {
        Some(value) if !value.is_empty() && !value.contains('@') => Err(CrmError::Validation(
            format!("email address is malformed: {value}"),
        )),
        _ => Ok(()),
    }
}

fn validate_tags(tags: &BTreeSet<String>) -> Result<()> {
    if tags.iter().any(|tag| tag.trim().is_empty()) {
        return Err(CrmError::Validation("tags cannot be empty".to_string()));
    }
    Ok(())
}

fn normalize_tags(tags: BTreeSet<String>) -> BTreeSet<String> {
    tags.into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use super::{Contact, ContactPatch, ContactType, EmailStatus, NewContact};
    use crate::error::CrmError;

    fn new_contact() -> NewContact {
        NewContact {
            first_name: " John ".to_string(),
            last_name: "Smith".to_string(),
            contact_type: Some(ContactType::Networking),
            company: Some("Smith Consulting".to_string()),
            email: Some("john@smithconsulting.com".to_string()),
            tags: BTreeSet::from(["Cape Coral Chamber".to_string()]),
            ..NewContact::default()
        }
    }

    #[test]
    fn contact_type_parses_keys_and_labels() {
        assert_eq!(
            ContactType::parse("former_client").expect("key"),
            ContactType::FormerClient
        );
        assert_eq!(
            ContactType::parse("Former Client").expect("label"),
            ContactType::FormerClient
        );
        let error = ContactType::parse("stranger").expect_err("must fail");
        assert!(error.to_string().contains("unknown contact type"));
    }

    #[test]
    fn new_contact_requires_names() {
        let contact = NewContact {
            first_name: "  ".to_string(),
            ..NewContact::default()
        };
        let error = contact.validate().expect_err("must fail");
        assert!(matches!(error, CrmError::Validation(_)));
        assert!(error.to_string().contains("first_name, last_name"));
    }

    #[test]
    fn new_contact_rejects_malformed_email() {
        let contact = NewContact {
            email: Some("not-an-email".to_string()),
            ..new_contact()
        };
        assert!(contact.validate().is_err());
    }

    #[test]
    fn into_row_trims_and_stamps() {
        let id = Uuid::new_v4();
        let now = Utc.with_ymd_and_hms(2026, 1, 23, 12, 0, 0).single().expect("time");
        let row = new_contact().into_row(id, now);
        assert_eq!(row.id, id);
        assert_eq!(row.first_name, "John");
        assert_eq!(row.kind(), ContactType::Networking);
        assert_eq!(row.created_at, Some(now));
        assert_eq!(row.updated_at, Some(now));
        assert_eq!(row.email_status, Some(EmailStatus::Active));
        assert!(!row.is_archived());
    }

    #[test]
    fn row_deserializes_with_nulls_and_unknown_type() {
        let id = Uuid::new_v4();
        let row: Contact = serde_json::from_value(json!({
            "id": id,
            "type": "alien",
            "first_name": "Ada",
            "last_name": "Lovelace",
            "company": null,
            "email": null,
            "tags": null,
            "created_at": "2026-01-10T09:30:00+00:00",
            "some_future_column": 1
        }))
        .expect("deserialize");
        assert_eq!(row.id, id);
        assert!(row.tags.is_empty());
        assert_eq!(row.kind(), ContactType::Prospect);
        assert!(row.created_at.is_some());
    }

    #[test]
    fn search_matches_company_and_email_case_insensitively() {
        let row = new_contact().into_row(Uuid::new_v4(), Utc::now());
        assert!(row.matches_search("smith cons"));
        assert!(row.matches_search("JOHN@"));
        assert!(!row.matches_search("martinez"));
        assert!(row.matches_search("   "));
    }

    #[test]
    fn empty_patch_is_rejected() {
        let error = ContactPatch::default().validate().expect_err("must fail");
        assert!(error.to_string().contains("no fields"));
    }

    #[test]
    fn patch_serializes_only_set_fields() {
        let patch = ContactPatch {
            phone: Some("(239) 555-0101".to_string()),
            contact_type: Some(ContactType::Client),
            archived_at: Some(None),
            ..ContactPatch::default()
        };
        let value = serde_json::to_value(&patch).expect("serialize");
        assert_eq!(
            value,
            json!({"phone": "(239) 555-0101", "type": "client", "archived_at": null})
        );
    }

    #[test]
    fn normalized_patch_trims_like_insert() {
        let patch = ContactPatch {
            first_name: Some(" Bob ".to_string()),
            phone: Some(" 555-0101 ".to_string()),
            notes: Some("  keep spacing ".to_string()),
            tags: Some(BTreeSet::from([" VIP ".to_string(), "  ".to_string()])),
            ..ContactPatch::default()
        }
        .normalized();
        assert_eq!(
            serde_json::to_value(&patch).expect("serialize"),
            json!({
                "first_name": "Bob",
                "phone": "555-0101",
                "notes": "  keep spacing ",
                "tags": ["VIP"]
            })
        );
    }

    #[test]
    fn row_tolerates_unknown_status_and_date_only_timestamps() {
        let row: Contact = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "first_name": "Mike",
            "last_name": "Williams",
            "email_status": "pending",
            "created_at": "2026-01-23",
            "updated_at": "2026-01-23 09:15:00",
            "archived_at": "not a date"
        }))
        .expect("deserialize");
        assert_eq!(row.email_status, None);
        assert_eq!(
            row.created_at,
            Utc.with_ymd_and_hms(2026, 1, 23, 0, 0, 0).single()
        );
        assert_eq!(
            row.updated_at,
            Utc.with_ymd_and_hms(2026, 1, 23, 9, 15, 0).single()
        );
        assert!(row.archived_at.is_none());
    }

    #[test]
    fn patch_apply_keeps_identity() {
        let mut row = new_contact().into_row(Uuid::new_v4(), Utc::now());
        let id = row.id;
        let created = row.created_at;
        ContactPatch {
            last_name: Some("Smythe".to_string()),
            tags: Some(BTreeSet::from(["VIP".to_string()])),
            ..ContactPatch::default()
        }
        .apply_to(&mut row);
        assert_eq!(row.id, id);
        assert_eq!(row.created_at, created);
        assert_eq!(row.last_name, "Smythe");
        assert_eq!(row.tags, BTreeSet::from(["VIP".to_string()]));
    }
}
