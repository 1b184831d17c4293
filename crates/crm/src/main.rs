use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use crm_core::config::{
    CrmConfig, DEFAULT_CONFIG_PATH, ENV_FILE_NAME, SupabaseConfigPatch, patch_supabase_config,
};
use crm_core::contact::{ContactPatch, ContactType, EmailStatus, NewContact};
use crm_core::contacts::{ContactFilter, ContactsManager, DeleteOutcome, DeletePolicy};
use crm_core::help::HelpRegistry;
use crm_core::ledger::DEFAULT_LEDGER_PATH;
use crm_core::migrate::{DEFAULT_MIGRATION_PATH, MigrationMode, run_migration};
use crm_core::page::{contact_detail_page, contacts_page};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "crm",
    version,
    about = "Contacts, inline help and schema migrations for the hosted CRM database",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Log debug output to stderr")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: PathBuf,
    config_path: PathBuf,
    explicit_root: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        let project_root = cli
            .project_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| project_root.join(DEFAULT_CONFIG_PATH));
        Self {
            project_root,
            config_path,
            explicit_root: cli.project_root.is_some(),
        }
    }

    fn ledger_path(&self) -> PathBuf {
        self.project_root.join(DEFAULT_LEDGER_PATH)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Render the contacts list page")]
    Contacts(ListArgs),
    #[command(about = "Show or change a single contact")]
    Contact(ContactArgs),
    #[command(about = "Show a help topic, or list topics")]
    Help(HelpArgs),
    #[command(about = "Submit a SQL file to the database's exec_sql function")]
    Migrate(MigrateArgs),
    Db(DbArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long = "type", value_name = "TYPE", value_parser = parse_contact_type)]
    contact_type: Option<ContactType>,
    #[arg(long)]
    tag: Option<String>,
    #[arg(short, long, help = "Match name, company or email")]
    search: Option<String>,
    #[arg(long)]
    include_archived: bool,
}

#[derive(Debug, Args)]
struct ContactArgs {
    #[command(subcommand)]
    command: ContactSubcommand,
}

#[derive(Debug, Subcommand)]
enum ContactSubcommand {
    Show {
        id: Uuid,
        #[arg(long, help = "Print the raw row as JSON")]
        json: bool,
    },
    Add(AddArgs),
    Update(UpdateArgs),
    Delete {
        id: Uuid,
        #[arg(long, help = "Fail when no contact has this id")]
        strict: bool,
    },
    Archive {
        id: Uuid,
    },
    Unarchive {
        id: Uuid,
    },
    #[command(about = "Look for an existing contact matching these details")]
    Dupes {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        company: Option<String>,
    },
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long = "type", value_name = "TYPE", value_parser = parse_contact_type)]
    contact_type: Option<ContactType>,
    #[command(flatten)]
    details: DetailArgs,
    #[arg(long, help = "Create even if a matching contact exists")]
    allow_duplicate: bool,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    id: Uuid,
    #[arg(long)]
    first_name: Option<String>,
    #[arg(long)]
    last_name: Option<String>,
    #[arg(long = "type", value_name = "TYPE", value_parser = parse_contact_type)]
    contact_type: Option<ContactType>,
    #[arg(long, value_parser = parse_email_status)]
    email_status: Option<EmailStatus>,
    #[arg(long, help = "Remove all tags before applying --tag")]
    clear_tags: bool,
    #[command(flatten)]
    details: DetailArgs,
}

#[derive(Debug, Args)]
struct DetailArgs {
    #[arg(long)]
    company: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    source_detail: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,
    #[arg(long, value_name = "URL")]
    card_image_url: Option<String>,
}

#[derive(Debug, Args)]
struct HelpArgs {
    topic: Option<String>,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(default_value = DEFAULT_MIGRATION_PATH)]
    path: PathBuf,
    #[arg(long, help = "Execute statements one at a time and continue past failures")]
    per_statement: bool,
    #[arg(long, help = "Do not read or write the local migration ledger")]
    no_ledger: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    #[command(about = "Check that the database is reachable with the configured key")]
    Test,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
enum ConfigSubcommand {
    #[command(name = "set-supabase")]
    SetSupabase {
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        anon_key: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Contacts(args)) => run_contacts_page(&runtime, args),
        Some(Commands::Contact(ContactArgs { command })) => match command {
            ContactSubcommand::Show { id, json } => run_contact_show(&runtime, id, json),
            ContactSubcommand::Add(args) => run_contact_add(&runtime, args),
            ContactSubcommand::Update(args) => run_contact_update(&runtime, args),
            ContactSubcommand::Delete { id, strict } => run_contact_delete(&runtime, id, strict),
            ContactSubcommand::Archive { id } => run_contact_archive(&runtime, id, true),
            ContactSubcommand::Unarchive { id } => run_contact_archive(&runtime, id, false),
            ContactSubcommand::Dupes {
                first_name,
                last_name,
                email,
                company,
            } => run_contact_dupes(
                &runtime,
                &first_name,
                &last_name,
                email.as_deref(),
                company.as_deref(),
            ),
        },
        Some(Commands::Help(HelpArgs { topic })) => run_help(topic.as_deref()),
        Some(Commands::Migrate(args)) => run_migrate(&runtime, args),
        Some(Commands::Db(DbArgs {
            command: DbSubcommand::Test,
        })) => run_db_test(&runtime),
        Some(Commands::Config(ConfigArgs {
            command: ConfigSubcommand::SetSupabase { url, anon_key },
        })) => run_config_set_supabase(&runtime, url, anon_key),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_contacts_page(runtime: &RuntimeOptions, args: ListArgs) -> Result<()> {
    let config = load_config_layers(runtime);
    let filter = ContactFilter {
        contact_type: args.contact_type,
        tag: args.tag,
        search: args.search,
        include_archived: args.include_archived,
    };
    print!("{}", contacts_page(&config, filter, &HelpRegistry::builtin()));
    Ok(())
}

fn run_contact_show(runtime: &RuntimeOptions, id: Uuid, json: bool) -> Result<()> {
    if json {
        let config = load_config(runtime)?;
        let contact = ContactsManager::connect(&config)?.get(id)?;
        println!("{}", serde_json::to_string_pretty(&contact)?);
        return Ok(());
    }
    let config = load_config_layers(runtime);
    print!("{}", contact_detail_page(&config, id, &HelpRegistry::builtin()));
    Ok(())
}

fn run_contact_add(runtime: &RuntimeOptions, args: AddArgs) -> Result<()> {
    let config = load_config(runtime)?;
    let mut manager = ContactsManager::connect(&config)?;
    let details = args.details;

    if !args.allow_duplicate
        && let Some(existing) = manager.find_duplicate(
            &args.first_name,
            &args.last_name,
            details.email.as_deref(),
            details.company.as_deref(),
        )?
    {
        bail!(
            "a matching contact already exists: {} ({}); pass --allow-duplicate to create anyway",
            existing.display_name(),
            existing.id
        );
    }

    let created = manager.create(NewContact {
        first_name: args.first_name,
        last_name: args.last_name,
        contact_type: args.contact_type,
        company: details.company,
        email: details.email,
        phone: details.phone,
        address: details.address,
        source: details.source,
        source_detail: details.source_detail,
        notes: details.notes,
        tags: details.tags.into_iter().collect(),
        card_image_url: details.card_image_url,
    })?;

    println!("contact created");
    println!("id: {}", created.id);
    println!("name: {}", created.display_name());
    println!("type: {}", created.kind());
    Ok(())
}

fn run_contact_update(runtime: &RuntimeOptions, args: UpdateArgs) -> Result<()> {
    let config = load_config(runtime)?;
    let details = args.details;
    let tags = if args.clear_tags || !details.tags.is_empty() {
        Some(details.tags.into_iter().collect::<BTreeSet<_>>())
    } else {
        None
    };
    let patch = ContactPatch {
        first_name: args.first_name,
        last_name: args.last_name,
        contact_type: args.contact_type,
        company: details.company,
        email: details.email,
        phone: details.phone,
        address: details.address,
        source: details.source,
        source_detail: details.source_detail,
        notes: details.notes,
        tags,
        email_status: args.email_status,
        card_image_url: details.card_image_url,
        ..ContactPatch::default()
    };

    let updated = ContactsManager::connect(&config)?.update(args.id, patch)?;
    println!("contact updated");
    println!("id: {}", updated.id);
    println!("name: {}", updated.display_name());
    println!(
        "updated_at: {}",
        updated
            .updated_at
            .map(|value| value.to_rfc3339())
            .unwrap_or_else(|| "<unknown>".to_string())
    );
    Ok(())
}

fn run_contact_delete(runtime: &RuntimeOptions, id: Uuid, strict: bool) -> Result<()> {
    let config = load_config(runtime)?;
    let policy = if strict {
        DeletePolicy::Strict
    } else {
        DeletePolicy::Idempotent
    };
    let outcome = ContactsManager::connect(&config)?.delete(id, policy)?;
    println!("contact delete");
    println!("id: {id}");
    println!(
        "result: {}",
        match outcome {
            DeleteOutcome::Deleted => "deleted",
            DeleteOutcome::AlreadyMissing => "already missing",
        }
    );
    Ok(())
}

fn run_contact_archive(runtime: &RuntimeOptions, id: Uuid, archive: bool) -> Result<()> {
    let config = load_config(runtime)?;
    let mut manager = ContactsManager::connect(&config)?;
    let contact = if archive {
        manager.archive(id)?
    } else {
        manager.unarchive(id)?
    };
    println!("contact {}", if archive { "archived" } else { "unarchived" });
    println!("id: {}", contact.id);
    println!("name: {}", contact.display_name());
    Ok(())
}

fn run_contact_dupes(
    runtime: &RuntimeOptions,
    first_name: &str,
    last_name: &str,
    email: Option<&str>,
    company: Option<&str>,
) -> Result<()> {
    let config = load_config(runtime)?;
    let found =
        ContactsManager::connect(&config)?.find_duplicate(first_name, last_name, email, company)?;
    match found {
        Some(contact) => {
            println!("duplicate: yes");
            println!("id: {}", contact.id);
            println!("name: {}", contact.display_name());
            println!("email: {}", contact.email.as_deref().unwrap_or("<none>"));
            println!("company: {}", contact.company.as_deref().unwrap_or("<none>"));
        }
        None => println!("duplicate: no"),
    }
    Ok(())
}

fn run_help(topic: Option<&str>) -> Result<()> {
    let registry = HelpRegistry::builtin();
    match topic {
        Some(topic) => print!("{}", registry.render_popover(topic)),
        None => {
            println!("help topics");
            for key in registry.keys() {
                println!("  {key}: {}", registry.lookup(key).title);
            }
        }
    }
    Ok(())
}

fn run_migrate(runtime: &RuntimeOptions, args: MigrateArgs) -> Result<()> {
    let config = load_config(runtime)?;
    let mode = if args.per_statement {
        MigrationMode::PerStatement
    } else {
        MigrationMode::Batch
    };
    let ledger_path = runtime.ledger_path();
    let ledger = (!args.no_ledger).then_some(ledger_path.as_path());
    let outcome = run_migration(&config, &args.path, mode, ledger);

    println!("migration");
    println!("path: {}", normalize_path(&args.path));
    println!(
        "mode: {}",
        match mode {
            MigrationMode::Batch => "batch",
            MigrationMode::PerStatement => "per-statement",
        }
    );
    println!("statements: {}", outcome.statements);
    println!("previously_applied: {}", format_flag(outcome.previously_applied));
    println!("success: {}", format_flag(outcome.success));
    println!("message: {}", outcome.message);
    if !outcome.success {
        bail!("migration failed");
    }
    Ok(())
}

fn run_db_test(runtime: &RuntimeOptions) -> Result<()> {
    let config = load_config(runtime)?;
    let status = match ContactsManager::connect(&config) {
        Ok(mut manager) => manager.test_connection(),
        Err(error) => crm_core::contacts::ConnectionStatus {
            connected: false,
            message: error.to_string(),
        },
    };
    println!("database connection");
    println!(
        "url: {}",
        config.supabase_url.as_deref().unwrap_or("<not set>")
    );
    println!("connected: {}", format_flag(status.connected));
    println!("message: {}", status.message);
    Ok(())
}

fn run_config_set_supabase(
    runtime: &RuntimeOptions,
    url: Option<String>,
    anon_key: Option<String>,
) -> Result<()> {
    if url.is_none() && anon_key.is_none() {
        bail!("nothing to set: pass --url and/or --anon-key");
    }
    let changed = patch_supabase_config(
        &runtime.config_path,
        &SupabaseConfigPatch {
            set_url: url,
            set_anon_key: anon_key,
        },
    )
    .with_context(|| format!("failed to update {}", runtime.config_path.display()))?;
    println!("config set-supabase");
    println!("config_path: {}", normalize_path(&runtime.config_path));
    println!("changed: {}", format_flag(changed));
    Ok(())
}

/// `.env` from the invocation directory, then the project root's `.env`
/// when one was given, then the config file with env overrides on top.
fn load_config(runtime: &RuntimeOptions) -> Result<CrmConfig> {
    load_config_layers(runtime)
        .with_context(|| format!("failed to load {}", runtime.config_path.display()))
}

/// `.env`, the project override, then the TOML file. Page commands render
/// a failure here as a banner instead of exiting.
fn load_config_layers(runtime: &RuntimeOptions) -> crm_core::Result<CrmConfig> {
    dotenvy::dotenv().ok();
    let project_env = runtime.project_root.join(ENV_FILE_NAME);
    if runtime.explicit_root && project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }
    let config = CrmConfig::load(&runtime.config_path)?;
    debug!(
        config_path = %normalize_path(&runtime.config_path),
        has_credentials = config.has_credentials(),
        page_size = config.page_size,
        "loaded configuration"
    );
    Ok(config)
}

fn parse_contact_type(value: &str) -> std::result::Result<ContactType, String> {
    ContactType::parse(value).map_err(|error| error.to_string())
}

fn parse_email_status(value: &str) -> std::result::Result<EmailStatus, String> {
    EmailStatus::parse(value).map_err(|error| error.to_string())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
