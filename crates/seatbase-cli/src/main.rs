use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use seatbase_core::{
    ensure_install_id, DefaultSettingsInitializer, EntityId, EntityKind, MigrationCoordinator,
    SchemaVersion, UnitRegistry,
};
use seatbase_store_sqlite::{core_units, ExtensionManifest, SqliteStore, TARGET_SCHEMA_VERSION};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "seatbase")]
#[command(about = "Seatbase schema upgrade and startup coordinator")]
struct Cli {
    #[arg(long, default_value = "./seatbase.sqlite3")]
    db: PathBuf,

    /// Extension manifest (YAML); repeat to load several, in order.
    #[arg(long = "extension")]
    extensions: Vec<PathBuf>,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Status(TargetArgs),
    Migrate(MigrateArgs),
    InstallId,
    Defaults,
    Bootstrap(TargetArgs),
    History,
    Org {
        #[command(subcommand)]
        command: OrgCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Debug, Args)]
struct TargetArgs {
    #[arg(long, default_value_t = TARGET_SCHEMA_VERSION)]
    target: u32,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum OrgCommand {
    Create {
        #[arg(long)]
        name: String,
    },
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Create {
        #[arg(long = "org")]
        organization_id: String,
        #[arg(long)]
        email: String,
    },
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Show {
        #[arg(long)]
        kind: KindArg,
        #[arg(long)]
        id: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Organization,
    User,
}

impl From<KindArg> for EntityKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Organization => Self::Organization,
            KindArg::User => Self::User,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let result = run(&cli);
    if let Err(err) = &result {
        error!("seatbase {}: {err:#}", command_name(&cli.command));
    }
    result
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Status(_) => "status",
        Command::Migrate(_) => "migrate",
        Command::InstallId => "install-id",
        Command::Defaults => "defaults",
        Command::Bootstrap(_) => "bootstrap",
        Command::History => "history",
        Command::Org { .. } => "org",
        Command::User { .. } => "user",
        Command::Settings { .. } => "settings",
    }
}

fn run(cli: &Cli) -> Result<()> {
    let store = SqliteStore::open(&cli.db)?;
    match &cli.command {
        Command::Status(args) => run_status(&store, &load_registry(&cli.extensions)?, args),
        Command::Migrate(args) => run_migrate(&store, &load_registry(&cli.extensions)?, args),
        Command::InstallId => run_install_id(&store),
        Command::Defaults => run_defaults(&store),
        Command::Bootstrap(args) => {
            run_bootstrap(&store, &load_registry(&cli.extensions)?, args)
        }
        Command::History => run_history(&store),
        Command::Org { command } => run_org(&store, command),
        Command::User { command } => run_user(&store, command),
        Command::Settings { command } => run_settings(&store, command),
    }
}

/// Core units first, then every extension manifest's units in flag order.
fn load_registry(extensions: &[PathBuf]) -> Result<UnitRegistry<SqliteStore>> {
    let mut registry = UnitRegistry::new(core_units());
    for path in extensions {
        let manifest = ExtensionManifest::load(path)?;
        info!(module = %manifest.name, units = manifest.units.len(), "registered extension module");
        registry.register_module(&manifest);
    }
    Ok(registry)
}

fn run_status(
    store: &SqliteStore,
    registry: &UnitRegistry<SqliteStore>,
    args: &TargetArgs,
) -> Result<()> {
    let coordinator = MigrationCoordinator::new(store, registry);
    let status = coordinator.status(SchemaVersion(args.target))?;
    let history = store.upgrade_history()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "up_to_date": status.up_to_date,
        "install_id": status.install_id,
        "units": status.units,
        "modules": status.modules,
        "history": history
    }))
}

fn run_migrate(
    store: &SqliteStore,
    registry: &UnitRegistry<SqliteStore>,
    args: &MigrateArgs,
) -> Result<()> {
    let coordinator = MigrationCoordinator::new(store, registry);
    let target = SchemaVersion(args.target.target);

    if args.dry_run {
        let plan = coordinator.plan(target)?;
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": coordinator.current_version()?,
            "target_version": target,
            "would_invoke": plan
        }));
    }

    let report = coordinator.run_schema_upgrades(target)?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": report.from_version,
        "after_version": report.to_version,
        "version_changed": report.version_changed(),
        "upgraded_units": report.upgraded_units
    }))
}

fn run_install_id(store: &SqliteStore) -> Result<()> {
    let outcome = ensure_install_id(store)?;
    emit_json(serde_json::json!({
        "install_id": outcome.install_id,
        "generated": outcome.generated
    }))
}

fn run_defaults(store: &SqliteStore) -> Result<()> {
    let initializer = DefaultSettingsInitializer::new(store, store);
    let organizations = initializer.ensure_org_defaults()?;
    let users = initializer.ensure_user_defaults()?;
    emit_json(serde_json::json!({
        "organizations": organizations,
        "users": users
    }))
}

fn run_bootstrap(
    store: &SqliteStore,
    registry: &UnitRegistry<SqliteStore>,
    args: &TargetArgs,
) -> Result<()> {
    let report = MigrationCoordinator::new(store, registry).run(SchemaVersion(args.target))?;

    let initializer = DefaultSettingsInitializer::new(store, store);
    let organizations = initializer.ensure_org_defaults()?;
    let users = initializer.ensure_user_defaults()?;
    info!(
        schema_version = report.schema.to_version.get(),
        install_id = %report.install.install_id,
        "startup bootstrap complete"
    );

    emit_json(serde_json::json!({
        "schema": report.schema,
        "install": report.install,
        "defaults": {
            "organizations": organizations,
            "users": users
        }
    }))
}

fn run_history(store: &SqliteStore) -> Result<()> {
    emit_json(serde_json::json!({ "entries": store.upgrade_history()? }))
}

fn run_org(store: &SqliteStore, command: &OrgCommand) -> Result<()> {
    match command {
        OrgCommand::Create { name } => {
            let id = store.create_organization(name)?;
            emit_json(serde_json::json!({ "organization_id": id, "name": name }))
        }
    }
}

fn run_user(store: &SqliteStore, command: &UserCommand) -> Result<()> {
    match command {
        UserCommand::Create { organization_id, email } => {
            let organization_id = EntityId(organization_id.clone());
            let id = store.create_user(&organization_id, email)?;
            emit_json(serde_json::json!({
                "user_id": id,
                "organization_id": organization_id,
                "email": email
            }))
        }
    }
}

fn run_settings(store: &SqliteStore, command: &SettingsCommand) -> Result<()> {
    match command {
        SettingsCommand::Show { kind, id } => {
            let kind = EntityKind::from(*kind);
            let settings = store.entity_settings(kind, &EntityId(id.clone()))?;
            emit_json(serde_json::json!({
                "kind": kind,
                "id": id,
                "settings": settings
            }))
        }
    }
}
