use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use rusqlite::Connection;
use wikifarm_core::audit::SqliteAuditLog;
use wikifarm_core::clock::{SystemClock, format_mw_timestamp};
use wikifarm_core::config::{ApprovalPolicy, FarmSettings, load_config};
use wikifarm_core::db::{count_query, open_connection};
use wikifarm_core::jobs::{SqliteJobQueue, run_pending_jobs};
use wikifarm_core::migrate::{current_version, pending_migration_count, run_migrations};
use wikifarm_core::notify::{Notifier, SqliteOutbox};
use wikifarm_core::provision::SqliteWikiManager;
use wikifarm_core::request::derive_dbname;
use wikifarm_core::runtime::{
    InitOptions, MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_runtime_ready, init_layout, inspect_runtime, resolve_paths,
};
use wikifarm_core::store::{RequestFilter, RequestStore, SqliteRequestStore};
use wikifarm_core::users::{SqliteUserDirectory, UserDirectory};
use wikifarm_core::{
    ApprovalBackend, RequestDetails, RequestId, RequestServices, RequestStatus, User,
    WikiRequest,
};

#[derive(Debug, Parser)]
#[command(
    name = "wikifarm",
    version,
    about = "File, review and provision wiki creation requests for a wiki farm"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Db(DbArgs),
    User(UserArgs),
    Request(RequestArgs),
    #[command(about = "List requests, newest first")]
    Queue(QueueArgs),
    Jobs(JobsArgs),
    #[command(about = "Show notifications delivered to a user")]
    Notifications(NotificationsArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .wikifarm/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Stats,
    Migrate,
}

#[derive(Debug, Args)]
struct UserArgs {
    #[command(subcommand)]
    command: UserSubcommand,
}

#[derive(Debug, Subcommand)]
enum UserSubcommand {
    Add { name: String },
}

#[derive(Debug, Args)]
struct RequestArgs {
    #[command(subcommand)]
    command: RequestSubcommand,
}

#[derive(Debug, Subcommand)]
enum RequestSubcommand {
    Create(CreateArgs),
    Show {
        id: i64,
        #[arg(long)]
        json: bool,
    },
    Comment {
        id: i64,
        #[arg(long, value_name = "NAME")]
        user: String,
        #[arg(long)]
        text: String,
    },
    Approve {
        id: i64,
        #[arg(long, value_name = "NAME")]
        user: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Decline {
        id: i64,
        #[arg(long, value_name = "NAME")]
        user: String,
        #[arg(long)]
        reason: String,
    },
    Reopen {
        id: i64,
        #[arg(long, value_name = "NAME")]
        user: String,
        #[arg(long, help = "Do not add an \"Updated request.\" comment")]
        quiet: bool,
    },
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(long, value_name = "NAME")]
    requester: String,
    #[arg(long)]
    sitename: String,
    #[arg(long)]
    url: String,
    #[arg(long, default_value = "en")]
    language: String,
    #[arg(long, default_value = "uncategorised")]
    category: String,
    #[arg(long)]
    description: String,
    #[arg(long, help = "Database name; derived from --url on farm subdomains")]
    dbname: Option<String>,
    #[arg(long)]
    private: bool,
    #[arg(long, value_name = "N", default_value_t = 0, help = "Queue visibility level; 0 is public")]
    visibility: i64,
}

#[derive(Debug, Args)]
struct QueueArgs {
    #[arg(long, help = "inreview, approved or declined")]
    status: Option<String>,
    #[arg(long, value_name = "NAME")]
    requester: Option<String>,
    #[arg(long, value_name = "N", default_value_t = 0)]
    max_visibility: i64,
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct JobsArgs {
    #[command(subcommand)]
    command: JobsSubcommand,
}

#[derive(Debug, Subcommand)]
enum JobsSubcommand {
    Run {
        #[arg(long, value_name = "N", default_value_t = 10)]
        limit: usize,
    },
    List,
}

#[derive(Debug, Args)]
struct NotificationsArgs {
    user: String,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Stats => run_db_stats(&runtime),
            DbSubcommand::Migrate => run_db_migrate(&runtime),
        },
        Some(Commands::User(UserArgs {
            command: UserSubcommand::Add { name },
        })) => run_user_add(&runtime, &name),
        Some(Commands::Request(RequestArgs { command })) => run_request(&runtime, command),
        Some(Commands::Queue(args)) => run_queue(&runtime, args),
        Some(Commands::Jobs(JobsArgs { command })) => match command {
            JobsSubcommand::Run { limit } => run_jobs(&runtime, limit),
            JobsSubcommand::List => run_jobs_list(&runtime),
        },
        Some(Commands::Notifications(NotificationsArgs { user })) => {
            run_notifications(&runtime, &user)
        }
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// An opened, migrated farm database plus the settings that drive requests.
struct Farm {
    paths: ResolvedPaths,
    settings: FarmSettings,
    connection: Connection,
    clock: SystemClock,
}

impl Farm {
    fn open(runtime: &RuntimeOptions) -> Result<Self> {
        let paths = resolve_runtime_paths(runtime)?;
        let status = inspect_runtime(&paths)?;
        ensure_runtime_ready(&paths, &status)?;
        let pending = pending_migration_count(&paths)?;
        if pending > 0 {
            bail!("{pending} schema migration(s) pending. {MIGRATIONS_POLICY_MESSAGE}");
        }

        let settings = load_config(&paths.config_path)?.resolve()?;
        let connection = open_connection(&paths.db_path)?;
        if runtime.diagnostics {
            eprintln!("[diagnostics]\n{}", paths.diagnostics());
        }
        tracing::debug!(
            db = %normalize_path(&paths.db_path),
            approval = ?settings.approval,
            notifications = settings.notifications,
            "opened farm"
        );
        Ok(Self {
            paths,
            settings,
            connection,
            clock: SystemClock,
        })
    }

    fn users(&self) -> SqliteUserDirectory<'_> {
        SqliteUserDirectory::new(&self.connection)
    }

    fn wiki_manager(&self) -> SqliteWikiManager<'_> {
        SqliteWikiManager::new(
            &self.connection,
            self.settings.database_suffix.clone(),
            &self.clock,
        )
    }

    fn user(&self, name: &str) -> Result<User> {
        self.users()
            .lookup_by_name(name)?
            .ok_or_else(|| anyhow!("unknown user {name:?}; register it with `wikifarm user add`"))
    }

    fn with_services<R>(&self, body: impl FnOnce(&RequestServices<'_>) -> Result<R>) -> Result<R> {
        let store = SqliteRequestStore::new(&self.connection);
        let users = self.users();
        let outbox = SqliteOutbox::new(&self.connection);
        let jobs = SqliteJobQueue::new(&self.connection, &self.clock);
        let manager = self.wiki_manager();
        let audit = SqliteAuditLog::new(&self.connection);

        let services = RequestServices {
            store: &store,
            users: &users,
            notifier: self
                .settings
                .notifications
                .then_some(&outbox as &dyn Notifier),
            approval: match self.settings.approval {
                ApprovalPolicy::Deferred => ApprovalBackend::Deferred(&jobs),
                ApprovalPolicy::Immediate => ApprovalBackend::Immediate(&manager),
            },
            audit: &audit,
            clock: &self.clock,
            settings: self.settings.request_settings(),
        };
        body(&services)
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    let migrations = run_migrations(&paths)?;

    println!("Initialized wikifarm runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("migrations_applied: {}", migrations.applied.len());
    println!("schema_version: {}", migrations.current_version);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths)?;

    if report.applied.is_empty() {
        println!("schema is up to date (version {})", report.current_version);
    } else {
        for migration in &report.applied {
            println!("applied v{:03} {}", migration.version, migration.name);
        }
        println!("schema_version: {}", report.current_version);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    if status.db_exists {
        let connection = open_connection(&paths.db_path)?;
        println!("schema_version: {}", current_version(&connection)?);
        let pending = pending_migration_count(&paths)?;
        println!("pending_migrations: {pending}");
        if pending == 0 {
            for request_status in RequestStatus::ALL {
                let count = count_query(
                    &connection,
                    &format!(
                        "SELECT COUNT(*) FROM cw_requests WHERE cw_status = '{}'",
                        request_status.as_str()
                    ),
                )?;
                println!("requests.{request_status}: {count}");
            }
            for (label, sql) in [
                ("comments", "SELECT COUNT(*) FROM cw_comments"),
                ("users", "SELECT COUNT(*) FROM farm_users"),
                ("wikis", "SELECT COUNT(*) FROM cw_wikis"),
                (
                    "jobs.queued",
                    "SELECT COUNT(*) FROM farm_jobs WHERE job_status = 'queued'",
                ),
                ("notifications", "SELECT COUNT(*) FROM cw_notifications"),
            ] {
                println!("{label}: {}", count_query(&connection, sql)?);
            }
        }
    }
    for warning in &status.warnings {
        println!("warning: {warning}");
    }
    println!("policy: {MIGRATIONS_POLICY_MESSAGE}");
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_user_add(runtime: &RuntimeOptions, name: &str) -> Result<()> {
    let farm = Farm::open(runtime)?;
    let user = farm.users().ensure_user(name)?;
    println!("user {} (id {})", user.name, user.id);
    Ok(())
}

fn run_request(runtime: &RuntimeOptions, command: RequestSubcommand) -> Result<()> {
    let farm = Farm::open(runtime)?;
    match command {
        RequestSubcommand::Create(args) => {
            let dbname = resolve_dbname(args.dbname, &args.url, &farm.settings)?;
            let requester = farm.users().ensure_user(&args.requester)?;
            let details = RequestDetails {
                dbname,
                sitename: args.sitename,
                url: args.url,
                language: args.language,
                category: args.category,
                description: args.description,
                private: args.private,
                visibility: args.visibility,
            };
            let mut request = WikiRequest::new(details, requester);
            let id = farm.with_services(|services| Ok(request.save(services)?))?;
            println!(
                "Created request #{id} for {} ({})",
                request.details().sitename,
                request.details().dbname
            );
            println!("{}", farm.settings.request_settings().queue_url(id));
        }
        RequestSubcommand::Show { id, json } => {
            let request =
                farm.with_services(|services| Ok(WikiRequest::load(services, Some(RequestId(id)))?))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&request)?);
            } else {
                print_request(&request);
            }
        }
        RequestSubcommand::Comment { id, user, text } => {
            let author = farm.user(&user)?;
            farm.with_services(|services| {
                let mut request = WikiRequest::load(services, Some(RequestId(id)))?;
                request.add_comment(services, &text, &author)?;
                Ok(())
            })?;
            println!("Commented on request #{id}");
        }
        RequestSubcommand::Approve { id, user, reason } => {
            let approver = farm.user(&user)?;
            let status = farm.with_services(|services| {
                let mut request = WikiRequest::load(services, Some(RequestId(id)))?;
                request.approve(services, &approver, reason.as_deref())?;
                Ok(request.status())
            })?;
            match farm.settings.approval {
                ApprovalPolicy::Deferred => {
                    println!("Request #{id} is {status}; wiki creation queued (run `wikifarm jobs run`)")
                }
                ApprovalPolicy::Immediate => println!("Request #{id} is {status}; wiki created"),
            }
        }
        RequestSubcommand::Decline { id, user, reason } => {
            let decliner = farm.user(&user)?;
            let status = farm.with_services(|services| {
                let mut request = WikiRequest::load(services, Some(RequestId(id)))?;
                request.decline(services, &reason, &decliner)?;
                Ok(request.status())
            })?;
            println!("Request #{id} is {status}");
        }
        RequestSubcommand::Reopen { id, user, quiet } => {
            let actor = farm.user(&user)?;
            let status = farm.with_services(|services| {
                let mut request = WikiRequest::load(services, Some(RequestId(id)))?;
                request.reopen(services, &actor, !quiet)?;
                Ok(request.status())
            })?;
            println!("Request #{id} is {status}");
        }
    }
    Ok(())
}

fn print_request(request: &WikiRequest) {
    let details = request.details();
    println!(
        "request: #{}",
        request
            .id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<unsaved>".to_string())
    );
    println!("status: {}", request.status());
    println!("sitename: {}", details.sitename);
    println!("dbname: {}", details.dbname);
    println!("url: {}", details.url);
    println!("language: {}", details.language);
    println!("category: {}", details.category);
    println!("private: {}", format_flag(details.private));
    println!(
        "requester: {}",
        request
            .requester()
            .map(|user| user.name.as_str())
            .unwrap_or("<none>")
    );
    if let Some(timestamp) = request.timestamp() {
        println!("timestamp: {}", format_mw_timestamp(timestamp));
    }
    println!("description: {}", details.description);
    if request.comments().is_empty() {
        println!("comments: <none>");
    } else {
        println!("comments:");
        for comment in request.comments() {
            println!(
                "  [{}] {}: {}",
                format_mw_timestamp(comment.timestamp),
                comment.author.name,
                comment.text
            );
        }
    }
}

fn run_queue(runtime: &RuntimeOptions, args: QueueArgs) -> Result<()> {
    let farm = Farm::open(runtime)?;
    let status = args
        .status
        .as_deref()
        .map(str::parse::<RequestStatus>)
        .transpose()?;
    let requester = match args.requester.as_deref() {
        Some(name) => Some(farm.user(name)?.id),
        None => None,
    };
    let filter = RequestFilter {
        status,
        requester,
        max_visibility: Some(args.max_visibility),
        limit: args.limit,
    };
    let rows = SqliteRequestStore::new(&farm.connection).list_requests(&filter)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("queue: <empty>");
        return Ok(());
    }
    let users = farm.users();
    for row in &rows {
        let requester = users.lookup_by_id(row.requester)?;
        println!(
            "#{} [{}] {} ({}) by {} at {}",
            row.id,
            row.status,
            row.sitename,
            row.dbname,
            requester.name,
            format_mw_timestamp(row.timestamp)
        );
    }
    Ok(())
}

fn run_jobs(runtime: &RuntimeOptions, limit: usize) -> Result<()> {
    let farm = Farm::open(runtime)?;
    let queue = SqliteJobQueue::new(&farm.connection, &farm.clock);
    let manager = farm.wiki_manager();
    let report = run_pending_jobs(&queue, &manager, limit)?;

    for dbname in &report.succeeded {
        println!("created: {dbname}");
    }
    for (dbname, error) in &report.failed {
        println!("failed: {dbname}: {error}");
    }
    println!(
        "jobs: {} succeeded, {} failed",
        report.succeeded.len(),
        report.failed.len()
    );
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", farm.paths.diagnostics());
    }
    Ok(())
}

fn run_jobs_list(runtime: &RuntimeOptions) -> Result<()> {
    let farm = Farm::open(runtime)?;
    let jobs = SqliteJobQueue::new(&farm.connection, &farm.clock).list()?;
    if jobs.is_empty() {
        println!("jobs: <none>");
        return Ok(());
    }
    for queued in &jobs {
        println!(
            "{} {} {} queued {}{}",
            queued.job_id,
            queued.status.as_str(),
            queued.job.dbname,
            format_mw_timestamp(queued.queued_at),
            queued
                .error
                .as_deref()
                .map(|error| format!(" error: {error}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn run_notifications(runtime: &RuntimeOptions, name: &str) -> Result<()> {
    let farm = Farm::open(runtime)?;
    let user = farm.user(name)?;
    let notifications = SqliteOutbox::new(&farm.connection)
        .for_recipient(user.id)
        .with_context(|| format!("failed to load notifications for {}", user.name))?;
    if notifications.is_empty() {
        println!("notifications: <none>");
        return Ok(());
    }
    for notification in &notifications {
        println!(
            "[{}] {} #{}: {} ({})",
            format_mw_timestamp(notification.timestamp),
            notification.kind,
            notification.request,
            notification.text,
            notification.request_url
        );
    }
    Ok(())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// An explicit `--dbname` wins; otherwise the name must be derivable from a
/// farm subdomain URL.
fn resolve_dbname(explicit: Option<String>, url: &str, settings: &FarmSettings) -> Result<String> {
    if let Some(dbname) = explicit.filter(|dbname| !dbname.trim().is_empty()) {
        return Ok(dbname);
    }
    derive_dbname(url, &settings.subdomain, &settings.database_suffix).with_context(|| {
        if settings.subdomain.is_empty() {
            "--dbname is required when no farm subdomain is configured".to_string()
        } else {
            format!("--dbname is required unless --url is <name>.{}", settings.subdomain)
        }
    })
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
