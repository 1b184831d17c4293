use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::CrmConfig;
use crate::error::{CrmError, Result};
use crate::ledger::MigrationLedger;
use crate::store::SqlExecutor;
use crate::supabase::SupabaseClient;

pub const DEFAULT_MIGRATION_PATH: &str = "database/schema_update_v15_change_orders.sql";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MigrationMode {
    /// The whole file in one remote call.
    #[default]
    Batch,
    /// One remote call per statement; keeps going after a failure.
    PerStatement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub success: bool,
    pub message: String,
    /// Statements submitted (batch mode counts the file as one).
    pub statements: usize,
    pub previously_applied: bool,
}

impl MigrationOutcome {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            statements: 0,
            previously_applied: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub path: PathBuf,
    pub sql: String,
    pub sha256: String,
}

impl MigrationScript {
    pub fn read(path: &Path) -> Result<Self> {
        let sql = fs::read_to_string(path).map_err(|error| match error.kind() {
            ErrorKind::NotFound => CrmError::FileNotFound(path.to_path_buf()),
            _ => CrmError::Validation(format!("failed to read {}: {error}", path.display())),
        })?;
        if sql.trim().is_empty() {
            return Err(CrmError::Validation(format!(
                "migration file is empty: {}",
                path.display()
            )));
        }
        let sha256 = compute_hash(&sql);
        Ok(Self {
            path: path.to_path_buf(),
            sql,
            sha256,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

pub struct MigrationRunner<E: SqlExecutor> {
    executor: E,
    mode: MigrationMode,
    ledger: Option<MigrationLedger>,
}

impl<E: SqlExecutor> MigrationRunner<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            mode: MigrationMode::Batch,
            ledger: None,
        }
    }

    pub fn with_mode(mut self, mode: MigrationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_ledger(mut self, ledger: MigrationLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Read `path` and submit it. Never fails: every error becomes an
    /// unsuccessful outcome.
    pub fn run(&mut self, path: &Path) -> MigrationOutcome {
        let script = match MigrationScript::read(path) {
            Ok(script) => script,
            Err(error) => return MigrationOutcome::failure(error.to_string()),
        };

        let previous = self.previous_application(&script);
        if let Some(applied_at) = previous {
            warn!(
                file = %script.file_name(),
                sha256 = %script.sha256,
                applied_at,
                "migration script was previously applied; running again"
            );
        }

        let mut outcome = match self.mode {
            MigrationMode::Batch => self.run_batch(&script),
            MigrationMode::PerStatement => self.run_per_statement(&script),
        };
        if previous.is_some() {
            outcome.previously_applied = true;
            outcome.message = format!("{} (previously applied)", outcome.message);
        }
        if outcome.success {
            info!(file = %script.file_name(), statements = outcome.statements, "migration applied");
            if let Some(ledger) = &self.ledger
                && let Err(error) =
                    ledger.record(&script.file_name(), &script.sha256, outcome.statements)
            {
                warn!(%error, "failed to record migration in ledger");
            }
        }
        outcome
    }

    fn previous_application(&self, script: &MigrationScript) -> Option<i64> {
        let ledger = self.ledger.as_ref()?;
        match ledger.last_applied(&script.sha256) {
            Ok(applied) => applied.map(|entry| entry.applied_at_unix),
            Err(error) => {
                warn!(%error, "failed to read migration ledger");
                None
            }
        }
    }

    fn run_batch(&mut self, script: &MigrationScript) -> MigrationOutcome {
        match self.executor.exec_sql(&script.sql) {
            Ok(()) => MigrationOutcome {
                success: true,
                message: format!("Migration {} completed successfully", script.file_name()),
                statements: 1,
                previously_applied: false,
            },
            Err(error) => MigrationOutcome {
                statements: 1,
                ..MigrationOutcome::failure(error.to_string())
            },
        }
    }

    fn run_per_statement(&mut self, script: &MigrationScript) -> MigrationOutcome {
        let statements = split_statements(&script.sql);
        if statements.is_empty() {
            return MigrationOutcome::failure(format!(
                "migration file has no statements: {}",
                script.path.display()
            ));
        }
        let mut failures = Vec::new();
        for (index, statement) in statements.iter().enumerate() {
            if let Err(error) = self.executor.exec_sql(statement) {
                warn!(statement = index + 1, %error, "statement failed; continuing");
                failures.push(format!("statement {}: {error}", index + 1));
            }
        }
        let total = statements.len();
        if failures.is_empty() {
            MigrationOutcome {
                success: true,
                message: format!(
                    "Migration {} completed successfully ({total} statements)",
                    script.file_name()
                ),
                statements: total,
                previously_applied: false,
            }
        } else {
            MigrationOutcome {
                statements: total,
                ..MigrationOutcome::failure(format!(
                    "{} of {total} statements failed: {}",
                    failures.len(),
                    failures.join("; ")
                ))
            }
        }
    }
}

/// Build a client from `config` and run `path`. Missing credentials are a
/// failed outcome, not an error.
pub fn run_migration(
    config: &CrmConfig,
    path: &Path,
    mode: MigrationMode,
    ledger_path: Option<&Path>,
) -> MigrationOutcome {
    let client = match SupabaseClient::from_config(config) {
        Ok(client) => client,
        Err(error) => return MigrationOutcome::failure(error.to_string()),
    };
    let mut runner = MigrationRunner::new(client).with_mode(mode);
    if let Some(ledger_path) = ledger_path {
        match MigrationLedger::open(ledger_path) {
            Ok(ledger) => runner = runner.with_ledger(ledger),
            Err(error) => warn!(%error, "continuing without migration ledger"),
        }
    }
    runner.run(path)
}

/// Split SQL on `;` outside quotes, dollar-quoted bodies and comments.
/// Statements made only of comments are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();
    let mut in_single = false;
    let mut in_dollar = false;

    while let Some(ch) = chars.next() {
        if in_single {
            current.push(ch);
            if ch == '\'' {
                in_single = false;
            }
            continue;
        }
        if in_dollar {
            current.push(ch);
            if ch == '$' && chars.peek() == Some(&'$') {
                current.push('$');
                chars.next();
                in_dollar = false;
            }
            continue;
        }
        match ch {
            '\'' => {
                in_single = true;
                current.push(ch);
            }
            '$' if chars.peek() == Some(&'$') => {
                chars.next();
                current.push_str("$$");
                in_dollar = true;
            }
            '-' if chars.peek() == Some(&'-') => {
                for comment_ch in chars.by_ref() {
                    if comment_ch == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            ';' => push_statement(&mut statements, &mut current),
            _ => current.push(ch),
        }
    }
    push_statement(&mut statements, &mut current);
    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use std::fs;

    use mockito::Matcher;
    use serde_json::json;
    use tempfile::tempdir;

    use super::{
        MigrationMode, MigrationRunner, compute_hash, run_migration, split_statements,
    };
    use crate::config::CrmConfig;
    use crate::error::{CrmError, Result};
    use crate::ledger::MigrationLedger;
    use crate::store::SqlExecutor;

    #[derive(Default)]
    struct MockExecutor {
        calls: Vec<String>,
        fail_containing: Option<&'static str>,
    }

    impl SqlExecutor for MockExecutor {
        fn exec_sql(&mut self, sql: &str) -> Result<()> {
            self.calls.push(sql.to_string());
            match self.fail_containing {
                Some(needle) if sql.contains(needle) => Err(CrmError::RemoteExecution(format!(
                    "syntax error at or near \"{needle}\""
                ))),
                _ => Ok(()),
            }
        }
    }

    const SCRIPT: &str = "-- change orders\nCREATE TABLE change_orders (id uuid primary key);\nALTER TABLE change_orders ADD COLUMN note text;\n";

    #[test]
    fn missing_file_fails_without_remote_call() {
        let temp = tempdir().expect("tempdir");
        let mut runner = MigrationRunner::new(MockExecutor::default());
        let outcome = runner.run(&temp.path().join("nonexistent.sql"));
        assert!(!outcome.success);
        assert!(outcome.message.contains("file not found"));
        assert!(outcome.message.contains("nonexistent.sql"));
        assert!(runner.executor().calls.is_empty());
    }

    #[test]
    fn empty_file_fails_without_remote_call() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("empty.sql");
        fs::write(&path, "  \n\t\n").expect("write");
        let mut runner = MigrationRunner::new(MockExecutor::default());
        let outcome = runner.run(&path);
        assert!(!outcome.success);
        assert!(outcome.message.contains("empty"));
        assert!(runner.executor().calls.is_empty());
    }

    #[test]
    fn batch_mode_submits_whole_file_once() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("v15.sql");
        fs::write(&path, SCRIPT).expect("write");
        let mut runner = MigrationRunner::new(MockExecutor::default());
        let outcome = runner.run(&path);
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.statements, 1);
        assert_eq!(runner.executor().calls, vec![SCRIPT.to_string()]);
    }

    #[test]
    fn batch_failure_surfaces_remote_message_verbatim() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("v15.sql");
        fs::write(&path, SCRIPT).expect("write");
        let mut runner = MigrationRunner::new(MockExecutor {
            fail_containing: Some("ALTER"),
            ..MockExecutor::default()
        });
        let outcome = runner.run(&path);
        assert!(!outcome.success);
        assert_eq!(outcome.message, "syntax error at or near \"ALTER\"");
    }

    #[test]
    fn per_statement_mode_continues_after_failure() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("v15.sql");
        fs::write(&path, format!("{SCRIPT}CREATE INDEX idx ON change_orders(id);\n"))
            .expect("write");
        let mut runner = MigrationRunner::new(MockExecutor {
            fail_containing: Some("ALTER"),
            ..MockExecutor::default()
        })
        .with_mode(MigrationMode::PerStatement);
        let outcome = runner.run(&path);
        assert!(!outcome.success);
        assert_eq!(outcome.statements, 3);
        assert_eq!(runner.executor().calls.len(), 3);
        assert!(outcome.message.starts_with("1 of 3 statements failed"));
    }

    #[test]
    fn ledger_flags_reapplied_script_but_still_runs() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("v15.sql");
        fs::write(&path, SCRIPT).expect("write");
        let ledger_path = temp.path().join(".crm/migrations.db");

        let mut first = MigrationRunner::new(MockExecutor::default())
            .with_ledger(MigrationLedger::open(&ledger_path).expect("ledger"));
        let outcome = first.run(&path);
        assert!(outcome.success);
        assert!(!outcome.previously_applied);

        let mut second = MigrationRunner::new(MockExecutor::default())
            .with_ledger(MigrationLedger::open(&ledger_path).expect("ledger"));
        let outcome = second.run(&path);
        assert!(outcome.success);
        assert!(outcome.previously_applied);
        assert!(outcome.message.contains("previously applied"));
        assert_eq!(second.executor().calls.len(), 1);

        let history = MigrationLedger::open(&ledger_path)
            .expect("ledger")
            .history()
            .expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sha256, compute_hash(SCRIPT));
    }

    #[test]
    fn failed_runs_are_not_recorded() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("v15.sql");
        fs::write(&path, SCRIPT).expect("write");
        let ledger_path = temp.path().join("ledger.db");
        let mut runner = MigrationRunner::new(MockExecutor {
            fail_containing: Some("CREATE"),
            ..MockExecutor::default()
        })
        .with_ledger(MigrationLedger::open(&ledger_path).expect("ledger"));
        assert!(!runner.run(&path).success);
        let ledger = MigrationLedger::open(&ledger_path).expect("ledger");
        assert!(ledger.history().expect("history").is_empty());
    }

    #[test]
    fn missing_credentials_are_a_failed_outcome() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("v15.sql");
        fs::write(&path, SCRIPT).expect("write");
        let outcome = run_migration(&CrmConfig::default(), &path, MigrationMode::Batch, None);
        assert!(!outcome.success);
        assert!(outcome.message.contains("SUPABASE_URL"));
    }

    #[test]
    fn run_against_reachable_database_succeeds() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("v15.sql");
        fs::write(&path, SCRIPT).expect("write");

        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/rest/v1/rpc/exec_sql")
            .match_header("apikey", "anon-key")
            .match_body(Matcher::Json(json!({ "sql": SCRIPT })))
            .with_status(200)
            .with_body("null")
            .create();

        let config = CrmConfig {
            supabase_url: Some(server.url()),
            supabase_anon_key: Some("anon-key".to_string()),
            ..CrmConfig::default()
        };
        let outcome = run_migration(&config, &path, MigrationMode::Batch, None);
        mock.assert();
        assert!(outcome.success, "{}", outcome.message);
    }

    #[test]
    fn split_skips_comments_and_keeps_quoted_semicolons() {
        let sql = "-- header only;\n\
                   INSERT INTO notes VALUES ('a;b');\n\
                   -- trailing comment\n\
                   CREATE FUNCTION f() RETURNS void AS $$ BEGIN PERFORM 1; END; $$ LANGUAGE plpgsql;\n\
                   ;\n";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "INSERT INTO notes VALUES ('a;b')");
        assert!(statements[1].contains("PERFORM 1; END;"));
        assert!(statements[1].ends_with("LANGUAGE plpgsql"));
    }
}
