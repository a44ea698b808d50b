use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rustyline::DefaultEditor;
use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use liath::shell::Shell;
use liath::{gateway, Config, Liath};

/// Isolated key-value namespaces queried through sandboxed Lua scripts.
#[derive(Parser, Debug)]
#[command(name = "liath")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: $LIATH_CONFIG, then the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one script and print the result
    Query {
        /// Lua source, or `-` to read it from stdin
        query: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// dict, json, yaml or markdown
        #[arg(short, long, default_value = "json")]
        format: String,
        /// Authenticate before running
        #[arg(long, env = "LIATH_USER", requires = "password")]
        user: Option<String>,
        #[arg(long, env = "LIATH_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Interactive shell
    Shell,
    /// Create a namespace (no-op if it exists)
    CreateNamespace {
        name: String,
        /// Packages to record for the namespace
        #[arg(short, long)]
        package: Vec<String>,
    },
    /// List namespaces
    ListNamespaces,
    /// Remove a namespace from the registry (its files stay on disk)
    DropNamespace { name: String },
    /// Add a user
    CreateUser { username: String, password: String },
    /// Record a package for a namespace
    InstallPackage { namespace: String, package: String },
    /// List registered capabilities and their functions
    Plugins,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Install the subscriber before anything logs. Until the config is read the
/// filter comes from `RUST_LOG`, else `info`.
fn init_tracing() -> FilterHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    handle
}

/// Switch to the configured level unless `RUST_LOG` is set.
fn apply_log_level(handle: &FilterHandle, level: &str) {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return;
    }
    if let Err(e) = handle.reload(EnvFilter::new(level)) {
        tracing::warn!(error = %e, level = %level, "Failed to apply configured log level");
    }
}

fn read_query(raw: String) -> Result<String> {
    if raw != "-" {
        return Ok(raw);
    }
    let mut source = String::new();
    std::io::stdin()
        .read_to_string(&mut source)
        .context("failed to read query from stdin")?;
    Ok(source)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_filter = init_tracing();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    apply_log_level(&log_filter, &config.log_level);

    if let Command::Serve { host, port } = &cli.command {
        if let Some(host) = host {
            config.gateway.host = host.clone();
        }
        if let Some(port) = port {
            config.gateway.port = *port;
        }
    }

    let liath = Arc::new(Liath::open(config.clone()).context("failed to open liath")?);
    let outcome = run(&liath, cli.command, &config);
    if let Err(e) = liath.close() {
        tracing::warn!(error = %e, "Failed to close stores cleanly");
    }
    outcome
}

fn run(liath: &Arc<Liath>, command: Command, config: &Config) -> Result<()> {
    match command {
        Command::Serve { .. } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(gateway::serve(Arc::clone(liath), config.gateway.clone()))?;
        }
        Command::Query {
            query,
            namespace,
            format,
            user,
            password,
        } => {
            if let (Some(user), Some(password)) = (user, password) {
                liath.require_user(&user, &password)?;
            }
            let source = read_query(query)?;
            let output = liath.execute(&namespace, &source, &format)?;
            println!("{}", output.to_text()?.trim_end());
        }
        Command::Shell => {
            let stdin = std::io::stdin();
            let mut shell = Shell::new(liath);
            if stdin.is_terminal() {
                let mut editor = DefaultEditor::new().context("failed to start line editor")?;
                shell.interactive(&mut editor, std::io::stdout())?;
            } else {
                shell.run(stdin.lock(), std::io::stdout())?;
            }
        }
        Command::CreateNamespace { name, package } => {
            liath.create_namespace(&name, &package)?;
            println!("Namespace {name} ready");
        }
        Command::ListNamespaces => {
            for name in liath.list_namespaces() {
                println!("{name}");
            }
        }
        Command::DropNamespace { name } => {
            liath.drop_namespace(&name)?;
            println!("Namespace {name} dropped");
        }
        Command::CreateUser { username, password } => {
            liath.create_user(&username, &password)?;
            println!("User {username} created");
        }
        Command::InstallPackage { namespace, package } => {
            if liath.install_package(&namespace, &package)? {
                println!("Package {package} installed in namespace {namespace}");
            } else {
                println!("Package {package} already installed in namespace {namespace}");
            }
        }
        Command::Plugins => {
            let capabilities = liath.capabilities();
            if capabilities.is_empty() {
                bail!("no capabilities registered");
            }
            for info in capabilities {
                println!("{:<10} {}", info.name, info.description);
                println!("{:<10} {}", "", info.functions.join(", "));
            }
        }
    }
    Ok(())
}
