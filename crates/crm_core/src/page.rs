use std::fmt::Write as _;

use crate::config::CrmConfig;
use crate::contact::{Contact, EmailStatus};
use crate::contacts::{ContactFilter, ContactsManager};
use crate::error::{CrmError, Result};
use crate::help::HelpRegistry;
use crate::photo::{PhotoFetcher, PhotoSession};
use crate::store::ContactStore;

pub fn render_error_banner(error: &CrmError) -> String {
    let (headline, hint) = if error.is_unavailable() {
        match error {
            CrmError::ConfigurationMissing(_) => (
                "Database not configured",
                Some("Set SUPABASE_URL and SUPABASE_ANON_KEY in .env, or run `crm config set-supabase`."),
            ),
            _ => (
                "Database unavailable",
                Some("Check the URL and key, then run `crm db test`."),
            ),
        }
    } else {
        match error {
            CrmError::Config(_) => (
                "Invalid configuration",
                Some("Fix or remove the config file, then retry."),
            ),
            CrmError::NotFound(_) => ("Not found", None),
            CrmError::Validation(_) => ("Invalid input", None),
            _ => ("Request failed", None),
        }
    };
    let mut out = format!("[!] {headline}\n    {error}\n");
    if let Some(hint) = hint {
        let _ = writeln!(out, "    {hint}");
    }
    out
}

/// Contacts list page. A config that failed to load renders as a banner.
pub fn contacts_page(
    config: &Result<CrmConfig>,
    filter: ContactFilter,
    help: &HelpRegistry,
) -> String {
    let config = match config {
        Ok(config) => config,
        Err(error) => return error_page(help, error),
    };
    match ContactsManager::connect(config) {
        Ok(mut manager) => render_contact_list(&mut manager, filter, help),
        Err(error) => error_page(help, &error),
    }
}

fn error_page(help: &HelpRegistry, error: &CrmError) -> String {
    format!(
        "{}\n\n{}",
        help.help_header("Contacts", "contacts", 1),
        render_error_banner(error)
    )
}

pub fn render_contact_list<S: ContactStore>(
    manager: &mut ContactsManager<S>,
    filter: ContactFilter,
    help: &HelpRegistry,
) -> String {
    let mut out = help.help_header("Contacts", "contacts", 1);
    out.push_str("\n\n");

    let counts = match manager.type_counts() {
        Ok(counts) => counts,
        Err(error) => {
            out.push_str(&render_error_banner(&error));
            return out;
        }
    };
    let total: usize = counts.iter().map(|(_, count)| count).sum();
    let mut stats = vec![format!("Total: {total}")];
    stats.extend(
        counts
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(kind, count)| format!("{} {}: {count}", kind.icon(), kind.label())),
    );
    let _ = writeln!(out, "{}", stats.join(" | "));
    out.push('\n');

    out.push_str(&help.help_header("Contact List", "contact_type", 2));
    out.push('\n');
    let active_filters = describe_filter(&filter);
    if !active_filters.is_empty() {
        let _ = writeln!(out, "filters: {active_filters}");
    }

    let mut shown = 0usize;
    for row in manager.list(filter) {
        match row {
            Ok(contact) => {
                shown += 1;
                out.push_str(&render_list_row(&contact));
            }
            Err(error) => {
                out.push_str(&render_error_banner(&error));
                return out;
            }
        }
    }
    if shown == 0 {
        out.push_str("No contacts found.\n");
    } else {
        let _ = writeln!(out, "\n{shown} contact(s)");
    }
    out
}

fn describe_filter(filter: &ContactFilter) -> String {
    let mut parts = Vec::new();
    if let Some(kind) = filter.contact_type {
        parts.push(format!("type={}", kind.as_str()));
    }
    if let Some(tag) = &filter.tag {
        parts.push(format!("tag={tag}"));
    }
    if let Some(search) = filter.search.as_deref().filter(|value| !value.trim().is_empty()) {
        parts.push(format!("search={search:?}"));
    }
    if filter.include_archived {
        parts.push("archived=included".to_string());
    }
    parts.join(", ")
}

fn render_list_row(contact: &Contact) -> String {
    let kind = contact.kind();
    let mut line = format!("{} {}", kind.icon(), contact.display_name());
    if let Some(company) = contact.company.as_deref().filter(|value| !value.is_empty()) {
        let _ = write!(line, " ({company})");
    }
    let _ = write!(line, " - {}", kind.label());
    if let Some(email) = &contact.email {
        let _ = write!(line, " | {email}");
    }
    if let Some(phone) = &contact.phone {
        let _ = write!(line, " | {phone}");
    }
    if !contact.tags.is_empty() {
        let tags = contact.tags.iter().cloned().collect::<Vec<_>>().join(", ");
        let _ = write!(line, " | tags: {tags}");
    }
    if contact.is_archived() {
        line.push_str(" [archived]");
    }
    let _ = writeln!(line, "\n    id: {}", contact.id);
    line
}

/// Detail form for one contact, with its card photo inlined.
pub fn render_contact_detail(
    contact: &Contact,
    help: &HelpRegistry,
    photos: &mut PhotoSession<'_>,
) -> String {
    let kind = contact.kind();
    let mut out = format!("# {} {}\n\n", kind.icon(), contact.display_name());

    out.push_str(&help.help_header("Details", "contacts", 2));
    out.push('\n');
    let optional = |value: &Option<String>| value.clone().unwrap_or_default();
    let fields = [
        ("id", contact.id.to_string()),
        ("first_name", contact.first_name.clone()),
        ("last_name", contact.last_name.clone()),
        ("company", optional(&contact.company)),
        ("email", optional(&contact.email)),
        ("phone", optional(&contact.phone)),
        ("address", optional(&contact.address)),
        ("source", optional(&contact.source)),
        ("source_detail", optional(&contact.source_detail)),
        (
            "email_status",
            contact
                .email_status
                .unwrap_or(EmailStatus::Active)
                .as_str()
                .to_string(),
        ),
        ("last_contacted", optional(&contact.last_contacted)),
        (
            "created_at",
            contact
                .created_at
                .map(|value| value.to_rfc3339())
                .unwrap_or_default(),
        ),
        (
            "updated_at",
            contact
                .updated_at
                .map(|value| value.to_rfc3339())
                .unwrap_or_default(),
        ),
    ];
    for (label, value) in fields {
        let _ = writeln!(out, "{label}: {value}");
    }
    if contact.is_archived() {
        let archived_at = contact
            .archived_at
            .map(|value| value.to_rfc3339())
            .unwrap_or_default();
        let _ = writeln!(out, "archived: true {archived_at}");
    }
    out.push('\n');

    out.push_str(&help.help_header("Contact Type", "contact_type", 2));
    out.push('\n');
    for option in crate::contact::ContactType::ALL {
        let marker = if option == kind { "(x)" } else { "( )" };
        let _ = writeln!(out, "{marker} {} {}", option.icon(), option.label());
    }
    out.push('\n');

    out.push_str("## Tags\n");
    if contact.tags.is_empty() {
        out.push_str("(none)\n");
    } else {
        for tag in &contact.tags {
            let _ = writeln!(out, "- {tag}");
        }
    }
    out.push('\n');

    out.push_str("## Notes\n");
    let _ = writeln!(
        out,
        "{}",
        contact.notes.as_deref().unwrap_or("(none)").trim_end()
    );

    if let Some(url) = contact
        .card_image_url
        .as_deref()
        .filter(|value| !value.trim().is_empty())
    {
        let photo = photos.photo(url);
        out.push_str("\n## Business Card\n");
        let _ = writeln!(out, "source: {url}");
        if photo.is_placeholder {
            out.push_str("(photo unavailable, showing placeholder)\n");
        }
        let _ = writeln!(out, "image: {}", photo.data_uri);
    }
    out
}

/// Detail page: loads its own client and photo fetcher for one render.
pub fn contact_detail_page(
    config: &Result<CrmConfig>,
    id: uuid::Uuid,
    help: &HelpRegistry,
) -> String {
    let config = match config {
        Ok(config) => config,
        Err(error) => return render_error_banner(error),
    };
    let rendered = ContactsManager::connect(config)
        .and_then(|mut manager| manager.get(id))
        .and_then(|contact| {
            let fetcher = PhotoFetcher::from_config(config)?;
            let mut photos = PhotoSession::new(&fetcher);
            Ok(render_contact_detail(&contact, help, &mut photos))
        });
    match rendered {
        Ok(page) => page,
        Err(error) => render_error_banner(&error),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;
    use uuid::Uuid;

    use super::{
        contact_detail_page, contacts_page, render_contact_detail, render_contact_list,
        render_error_banner,
    };
    use crate::config::CrmConfig;
    use crate::contact::{ContactType, NewContact};
    use crate::contacts::tests::{MockStore, fields};
    use crate::contacts::{ContactFilter, ContactsManager};
    use crate::error::CrmError;
    use crate::help::HelpRegistry;
    use crate::photo::{PhotoFetcher, PhotoSession};

    #[test]
    fn missing_url_renders_banner() {
        let page = contacts_page(
            &Ok(CrmConfig::default()),
            ContactFilter::default(),
            &HelpRegistry::builtin(),
        );
        assert!(page.starts_with("# Contacts [?contacts]"));
        assert!(page.contains("[!] Database not configured"));
        assert!(page.contains("SUPABASE_URL is not set"));
    }

    #[test]
    fn missing_url_detail_page_renders_banner() {
        let page = contact_detail_page(
            &Ok(CrmConfig::default()),
            Uuid::new_v4(),
            &HelpRegistry::builtin(),
        );
        assert!(page.contains("Database not configured"));
    }

    #[test]
    fn list_page_shows_stats_and_rows() {
        let mut manager = ContactsManager::new(MockStore::default(), 10);
        manager
            .create(fields("Sarah", "Johnson", ContactType::Lead, &["Referral"]))
            .expect("create");
        manager
            .create(fields("Robert", "Taylor", ContactType::Client, &[]))
            .expect("create");

        let page = render_contact_list(
            &mut manager,
            ContactFilter::default(),
            &HelpRegistry::builtin(),
        );
        assert!(page.contains("Total: 2"));
        assert!(page.contains("Lead: 1"));
        assert!(page.contains("Sarah Johnson (Johnson Co) - Lead"));
        assert!(page.contains("tags: Referral"));
        assert!(page.contains("2 contact(s)"));
    }

    #[test]
    fn list_page_with_unreachable_store_shows_banner() {
        let mut manager = ContactsManager::new(
            MockStore {
                unreachable: true,
                ..MockStore::default()
            },
            10,
        );
        let page = render_contact_list(
            &mut manager,
            ContactFilter::default(),
            &HelpRegistry::builtin(),
        );
        assert!(page.contains("[!] Database unavailable"));
        assert!(page.contains("crm db test"));
    }

    #[test]
    fn empty_list_says_so() {
        let mut manager = ContactsManager::new(MockStore::default(), 10);
        let page = render_contact_list(
            &mut manager,
            ContactFilter {
                search: Some("nobody".to_string()),
                ..ContactFilter::default()
            },
            &HelpRegistry::builtin(),
        );
        assert!(page.contains("filters: search=\"nobody\""));
        assert!(page.contains("No contacts found."));
    }

    #[test]
    fn detail_page_inlines_placeholder_for_bad_photo() {
        let contact = NewContact {
            first_name: "Lisa".to_string(),
            last_name: "Martinez".to_string(),
            contact_type: Some(ContactType::Networking),
            card_image_url: Some("http://127.0.0.1:9/card.png".to_string()),
            tags: ["Chamber".to_string()].into_iter().collect(),
            ..NewContact::default()
        }
        .into_row(Uuid::new_v4(), chrono::Utc::now());

        let fetcher = PhotoFetcher::new(300, "crm-test").expect("fetcher");
        let mut photos = PhotoSession::new(&fetcher);
        let page = render_contact_detail(&contact, &HelpRegistry::builtin(), &mut photos);
        assert!(page.starts_with("# 🤝 Lisa Martinez"));
        assert!(page.contains("(x) 🤝 Networking"));
        assert!(page.contains("- Chamber"));
        assert!(page.contains("photo unavailable"));
        assert!(page.contains("image: data:image/svg+xml;base64,"));
        assert_eq!(photos.len(), 1);
    }

    #[test]
    fn banner_for_remote_failure_is_generic() {
        let banner = render_error_banner(&CrmError::Persistence("boom".to_string()));
        assert!(banner.starts_with("[!] Request failed"));
        assert!(banner.contains("boom"));
    }

    #[test]
    fn malformed_config_file_renders_banner_on_both_pages() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("crm.toml");
        fs::write(&path, "[supabase\nurl = ").expect("write");
        let config = CrmConfig::load(&path);
        assert!(matches!(config, Err(CrmError::Config(_))));

        let help = HelpRegistry::builtin();
        let list = contacts_page(&config, ContactFilter::default(), &help);
        assert!(list.starts_with("# Contacts [?contacts]"));
        assert!(list.contains("[!] Invalid configuration"));
        assert!(list.contains("failed to parse"));

        let detail = contact_detail_page(&config, Uuid::new_v4(), &help);
        assert!(detail.starts_with("[!] Invalid configuration"));
        assert!(detail.contains("Fix or remove the config file"));
    }
}
