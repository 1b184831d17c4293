use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CrmConfig;
use crate::contact::{Contact, ContactPatch};
use crate::error::{CrmError, Result};
use crate::store::{CONTACTS_TABLE, ContactQuery, ContactStore, MatchColumn, SqlExecutor};

pub const EXEC_SQL_FUNCTION: &str = "exec_sql";

#[derive(Debug, Clone)]
pub struct SupabaseClientConfig {
    pub base_url: String,
    pub anon_key: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl SupabaseClientConfig {
    pub fn from_config(config: &CrmConfig) -> Result<Self> {
        let credentials = config.credentials()?;
        Ok(Self {
            base_url: credentials.url,
            anon_key: credentials.anon_key,
            user_agent: config.http.user_agent.clone(),
            timeout_ms: config.http.timeout_ms,
            max_retries: config.http.retries,
            retry_delay_ms: config.http.retry_delay_ms,
        })
    }
}

/// PostgREST client for the hosted database.
pub struct SupabaseClient {
    client: Client,
    config: SupabaseClientConfig,
    request_count: usize,
}

impl SupabaseClient {
    pub fn from_config(config: &CrmConfig) -> Result<Self> {
        Self::new(SupabaseClientConfig::from_config(config)?)
    }

    pub fn new(config: SupabaseClientConfig) -> Result<Self> {
        if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
            return Err(CrmError::ConfigurationMissing(format!(
                "SUPABASE_URL must be an http(s) URL, got {}",
                config.base_url
            )));
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|error| {
                CrmError::Connection(format!("failed to build database HTTP client: {error}"))
            })?;
        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    fn table_url(&self) -> String {
        format!(
            "{}/rest/v1/{CONTACTS_TABLE}",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn rpc_url(&self, function: &str) -> String {
        format!(
            "{}/rest/v1/rpc/{function}",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", self.config.anon_key.as_str())
            .header(
                "Authorization",
                format!("Bearer {}", self.config.anon_key),
            )
            .header("User-Agent", self.config.user_agent.as_str())
            .header("Accept", "application/json")
    }

    /// Send a request, retrying transient failures when `retryable`.
    /// Writes are sent exactly once.
    fn send<F>(&mut self, retryable: bool, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let max_retries = if retryable { self.config.max_retries } else { 0 };
        for attempt in 0..=max_retries {
            self.request_count += 1;
            let request = self.authorize(build(&self.client));
            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if attempt < max_retries && is_retryable_status(status) {
                        debug!(%status, attempt, "retrying database request");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(status_error(status, response));
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        debug!(%error, attempt, "retrying database request");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(transport_error(&error));
                }
            }
        }
        Err(CrmError::Connection(
            "database request exhausted retry budget".to_string(),
        ))
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }

    fn fetch_rows<T: DeserializeOwned>(&mut self, params: Vec<(String, String)>) -> Result<Vec<T>> {
        let url = self.table_url();
        debug!(%url, ?params, "select contacts");
        let response = self.send(true, |client| client.get(&url).query(&params))?;
        decode(response)
    }
}

impl ContactStore for SupabaseClient {
    fn select_contacts(&mut self, query: &ContactQuery) -> Result<Vec<Contact>> {
        let mut params = vec![
            ("select".to_string(), "*".to_string()),
            ("order".to_string(), "created_at.desc,id.desc".to_string()),
            ("offset".to_string(), query.offset.to_string()),
            ("limit".to_string(), query.limit.max(1).to_string()),
        ];
        if let Some(kind) = query.contact_type {
            params.push(("type".to_string(), format!("eq.{}", kind.as_str())));
        }
        if let Some(tag) = query.tag.as_deref().map(str::trim).filter(|tag| !tag.is_empty()) {
            params.push(("tags".to_string(), array_contains(tag)));
        }
        if !query.include_archived {
            params.push(("archived".to_string(), "not.is.true".to_string()));
        }
        self.fetch_rows(params)
    }

    fn select_contact(&mut self, id: Uuid) -> Result<Option<Contact>> {
        let rows: Vec<Contact> = self.fetch_rows(vec![
            ("select".to_string(), "*".to_string()),
            ("id".to_string(), format!("eq.{id}")),
        ])?;
        Ok(rows.into_iter().next())
    }

    fn select_matching(&mut self, filters: &[(MatchColumn, String)]) -> Result<Vec<Contact>> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        for (column, value) in filters {
            params.push((column.column().to_string(), format!("eq.{value}")));
        }
        self.fetch_rows(params)
    }

    fn insert_contact(&mut self, row: &Contact) -> Result<Contact> {
        let url = self.table_url();
        let response = self.send(false, |client| {
            client
                .post(&url)
                .header("Prefer", "return=representation")
                .json(row)
        })?;
        let rows: Vec<Contact> = decode(response)?;
        rows.into_iter().next().ok_or_else(|| {
            CrmError::Persistence("insert returned no rows (check row-level security)".to_string())
        })
    }

    fn update_contact(&mut self, id: Uuid, patch: &ContactPatch) -> Result<Option<Contact>> {
        let url = self.table_url();
        let filter = format!("eq.{id}");
        let response = self.send(false, |client| {
            client
                .patch(&url)
                .query(&[("id", filter.as_str())])
                .header("Prefer", "return=representation")
                .json(patch)
        })?;
        let rows: Vec<Contact> = decode(response)?;
        Ok(rows.into_iter().next())
    }

    fn delete_contact(&mut self, id: Uuid) -> Result<bool> {
        let url = self.table_url();
        let filter = format!("eq.{id}");
        let response = self.send(false, |client| {
            client
                .delete(&url)
                .query(&[("id", filter.as_str())])
                .header("Prefer", "return=representation")
        })?;
        let rows: Vec<Value> = decode(response)?;
        Ok(!rows.is_empty())
    }

    fn ping(&mut self) -> Result<()> {
        let _: Vec<Value> = self.fetch_rows(vec![
            ("select".to_string(), "id".to_string()),
            ("limit".to_string(), "1".to_string()),
        ])?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl SqlExecutor for SupabaseClient {
    fn exec_sql(&mut self, sql: &str) -> Result<()> {
        let url = self.rpc_url(EXEC_SQL_FUNCTION);
        let body = json!({ "sql": sql });
        debug!(%url, bytes = sql.len(), "exec_sql");
        match self.send(false, |client| client.post(&url).json(&body)) {
            Ok(_) => Ok(()),
            Err(CrmError::Persistence(message)) => Err(CrmError::RemoteExecution(message)),
            Err(error) => Err(error),
        }
    }
}

fn decode<T: DeserializeOwned>(response: Response) -> Result<Vec<T>> {
    let text = response.text().map_err(|error| {
        CrmError::Connection(format!("failed to read database response: {error}"))
    })?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&text).map_err(|error| {
        CrmError::Persistence(format!("unexpected database response shape: {error}"))
    })
}

/// PostgREST array containment filter for one value, quoted so tags with
/// spaces or commas survive.
fn array_contains(tag: &str) -> String {
    format!("cs.{{\"{}\"}}", tag.replace('\\', "\\\\").replace('"', "\\\""))
}

fn status_error(status: StatusCode, response: Response) -> CrmError {
    let body = response.text().unwrap_or_default();
    let message = remote_message(&body).unwrap_or_else(|| format!("HTTP {status}"));
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        warn!(%status, "database rejected credentials");
        return CrmError::Connection(format!("credentials rejected ({status}): {message}"));
    }
    if status.is_server_error() && status != StatusCode::INTERNAL_SERVER_ERROR {
        return CrmError::Connection(format!("HTTP {status}: {message}"));
    }
    CrmError::Persistence(message)
}

fn transport_error(error: &reqwest::Error) -> CrmError {
    if error.is_timeout() {
        CrmError::Connection(format!("database request timed out: {error}"))
    } else {
        CrmError::Connection(format!("failed to reach database: {error}"))
    }
}

/// PostgREST errors look like `{"code": "...", "message": "...", "details": ...}`.
fn remote_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = serde_json::from_str::<Value>(trimmed).ok();
    let message = parsed
        .as_ref()
        .and_then(|value| value.get("message"))
        .and_then(Value::as_str);
    match message {
        Some(message) => Some(message.to_string()),
        None => Some(trimmed.to_string()),
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{TimeZone, Utc};
    use mockito::Matcher;
    use serde_json::json;
    use uuid::Uuid;

    use super::{SupabaseClient, SupabaseClientConfig, array_contains, remote_message};
    use crate::contact::{ContactPatch, ContactType, NewContact};
    use crate::contacts::{ContactFilter, ContactsManager};
    use crate::error::CrmError;
    use crate::store::{ContactQuery, ContactStore, SqlExecutor};

    fn client_for(server: &mockito::Server) -> SupabaseClient {
        SupabaseClient::new(SupabaseClientConfig {
            base_url: server.url(),
            anon_key: "anon-key".to_string(),
            user_agent: "crm-test".to_string(),
            timeout_ms: 2_000,
            max_retries: 1,
            retry_delay_ms: 1,
        })
        .expect("client")
    }

    fn row_json(id: Uuid) -> serde_json::Value {
        json!({
            "id": id,
            "type": "lead",
            "first_name": "Sarah",
            "last_name": "Johnson",
            "company": "Johnson & Co",
            "email": "sarah@johnsonco.com",
            "tags": ["Referral", "Hot Lead"],
            "created_at": "2026-01-10T00:00:00+00:00"
        })
    }

    #[test]
    fn select_sends_filters_and_auth_headers() {
        let mut server = mockito::Server::new();
        let id = Uuid::new_v4();
        let mock = server
            .mock("GET", "/rest/v1/contacts")
            .match_header("apikey", "anon-key")
            .match_header("authorization", "Bearer anon-key")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("type".into(), "eq.lead".into()),
                Matcher::UrlEncoded("tags".into(), "cs.{\"Hot Lead\"}".into()),
                Matcher::UrlEncoded("archived".into(), "not.is.true".into()),
                Matcher::UrlEncoded("order".into(), "created_at.desc,id.desc".into()),
                Matcher::UrlEncoded("limit".into(), "10".into()),
                Matcher::UrlEncoded("offset".into(), "20".into()),
            ]))
            .with_status(200)
            .with_body(json!([row_json(id)]).to_string())
            .create();

        let mut client = client_for(&server);
        let rows = client
            .select_contacts(&ContactQuery {
                contact_type: Some(ContactType::Lead),
                tag: Some("Hot Lead".to_string()),
                include_archived: false,
                offset: 20,
                limit: 10,
            })
            .expect("select");
        mock.assert();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert!(rows[0].tags.contains("Hot Lead"));
    }

    #[test]
    fn insert_returns_created_row() {
        let mut server = mockito::Server::new();
        let id = Uuid::new_v4();
        let mock = server
            .mock("POST", "/rest/v1/contacts")
            .match_header("prefer", "return=representation")
            .with_status(201)
            .with_body(json!([row_json(id)]).to_string())
            .create();

        let row = NewContact {
            first_name: "Sarah".to_string(),
            last_name: "Johnson".to_string(),
            ..NewContact::default()
        }
        .into_row(id, Utc::now());
        let mut client = client_for(&server);
        let created = client.insert_contact(&row).expect("insert");
        mock.assert();
        assert_eq!(created.id, id);
    }

    #[test]
    fn listing_keeps_rows_with_unexpected_status_or_dates() {
        let mut server = mockito::Server::new();
        let good = Uuid::new_v4();
        let odd = Uuid::new_v4();
        let mut odd_row = row_json(odd);
        odd_row["email_status"] = json!("pending");
        odd_row["created_at"] = json!("2026-01-23");
        let _mock = server
            .mock("GET", "/rest/v1/contacts")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!([row_json(good), odd_row]).to_string())
            .create();

        let mut manager = ContactsManager::new(client_for(&server), 10);
        let rows = manager
            .list(ContactFilter::default())
            .collect::<crate::Result<Vec<_>>>()
            .expect("list");
        assert_eq!(
            rows.iter().map(|row| row.id).collect::<Vec<_>>(),
            vec![good, odd]
        );
        assert_eq!(rows[1].email_status, None);
        assert_eq!(
            rows[1].created_at,
            Utc.with_ymd_and_hms(2026, 1, 23, 0, 0, 0).single()
        );
    }

    #[test]
    fn manager_update_sends_trimmed_fields() {
        let mut server = mockito::Server::new();
        let id = Uuid::new_v4();
        let mock = server
            .mock("PATCH", "/rest/v1/contacts")
            .match_query(Matcher::UrlEncoded("id".into(), format!("eq.{id}")))
            .match_body(Matcher::PartialJson(json!({
                "first_name": "Bob",
                "company": "Acme",
                "tags": ["Hot Lead", "VIP"]
            })))
            .with_status(200)
            .with_body(json!([row_json(id)]).to_string())
            .expect(1)
            .create();

        let mut manager = ContactsManager::new(client_for(&server), 10);
        manager
            .update(
                id,
                ContactPatch {
                    first_name: Some(" Bob ".to_string()),
                    company: Some("  Acme ".to_string()),
                    tags: Some(BTreeSet::from([" VIP ".to_string(), "Hot Lead ".to_string()])),
                    ..ContactPatch::default()
                },
            )
            .expect("update");
        mock.assert();
    }

    #[test]
    fn update_with_no_matching_row_is_none() {
        let mut server = mockito::Server::new();
        let id = Uuid::new_v4();
        let mock = server
            .mock("PATCH", "/rest/v1/contacts")
            .match_query(Matcher::UrlEncoded("id".into(), format!("eq.{id}")))
            .with_status(200)
            .with_body("[]")
            .create();

        let mut client = client_for(&server);
        let updated = client
            .update_contact(
                id,
                &ContactPatch {
                    phone: Some("555".to_string()),
                    ..ContactPatch::default()
                },
            )
            .expect("update");
        mock.assert();
        assert!(updated.is_none());
    }

    #[test]
    fn delete_reports_whether_a_row_was_removed() {
        let mut server = mockito::Server::new();
        let id = Uuid::new_v4();
        let _mock = server
            .mock("DELETE", "/rest/v1/contacts")
            .match_query(Matcher::UrlEncoded("id".into(), format!("eq.{id}")))
            .with_status(200)
            .with_body(json!([{"id": id}]).to_string())
            .create();

        let mut client = client_for(&server);
        assert!(client.delete_contact(id).expect("delete"));
    }

    #[test]
    fn writes_are_not_retried() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/rest/v1/contacts")
            .with_status(503)
            .expect(1)
            .create();

        let row = NewContact {
            first_name: "A".to_string(),
            last_name: "B".to_string(),
            ..NewContact::default()
        }
        .into_row(Uuid::new_v4(), Utc::now());
        let mut client = client_for(&server);
        let error = client.insert_contact(&row).expect_err("must fail");
        mock.assert();
        assert!(matches!(error, CrmError::Connection(_)));
        assert_eq!(client.request_count(), 1);
    }

    #[test]
    fn reads_retry_transient_statuses() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/rest/v1/contacts")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(2)
            .create();

        let mut client = client_for(&server);
        let error = client.ping().expect_err("must fail");
        mock.assert();
        assert!(error.is_unavailable());
    }

    #[test]
    fn unauthorized_is_a_connection_error() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/rest/v1/contacts")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"message":"Invalid API key"}"#)
            .create();

        let mut client = client_for(&server);
        let error = client.ping().expect_err("must fail");
        assert!(matches!(error, CrmError::Connection(_)));
        assert!(error.to_string().contains("Invalid API key"));
    }

    #[test]
    fn exec_sql_surfaces_remote_message_verbatim() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/rest/v1/rpc/exec_sql")
            .match_body(Matcher::Json(json!({"sql": "CREATE TABLE change_orders ();"})))
            .with_status(400)
            .with_body(r#"{"code":"42P07","message":"relation \"change_orders\" already exists"}"#)
            .create();

        let mut client = client_for(&server);
        let error = client
            .exec_sql("CREATE TABLE change_orders ();")
            .expect_err("must fail");
        mock.assert();
        assert!(matches!(error, CrmError::RemoteExecution(_)));
        assert_eq!(
            error.to_string(),
            "relation \"change_orders\" already exists"
        );
    }

    #[test]
    fn non_http_url_is_rejected() {
        let error = SupabaseClient::new(SupabaseClientConfig {
            base_url: "abc.supabase.co".to_string(),
            anon_key: "k".to_string(),
            user_agent: "t".to_string(),
            timeout_ms: 1,
            max_retries: 0,
            retry_delay_ms: 0,
        })
        .err()
        .expect("must fail");
        assert!(matches!(error, CrmError::ConfigurationMissing(_)));
    }

    #[test]
    fn tag_filter_is_quoted() {
        assert_eq!(array_contains("VIP"), "cs.{\"VIP\"}");
        assert_eq!(array_contains("a\"b"), "cs.{\"a\\\"b\"}");
    }

    #[test]
    fn remote_message_prefers_json_message() {
        assert_eq!(
            remote_message(r#"{"message":"boom","code":"1"}"#).as_deref(),
            Some("boom")
        );
        assert_eq!(remote_message("plain failure").as_deref(), Some("plain failure"));
        assert_eq!(remote_message("   "), None);
    }
}
