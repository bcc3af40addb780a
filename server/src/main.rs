//! Keyward command-line tool.
//!
//! Issuer side:
//!   keyward issue --duration 30d --bind
//!   keyward list | revoke <ID> | delete <ID> | purge
//!   keyward serve --port 8888
//!
//! Client side:
//!   keyward activate <TOKEN>
//!   keyward check [--consult-registry]
//!   keyward watch --server http://issuer:8888
//!
//! Results are printed on stdout; logs go to stderr.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use keyward_license::{
    ClientConfig, ConnectionReport, DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SERVER_PORT, DisplayState, DurationClass, Issuer, LicenseRegistry, PollOutcome,
    RegistryConfig, RevocationClient, RevocationWatcher, UsageReporter, Verifier, poll_once,
};
use keyward_server::{AppState, ServerConfig, serve};
use std::io::{BufRead, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "keyward")]
#[command(about = "Issue, verify and revoke Keyward license tokens")]
#[command(version)]
struct Args {
    /// Registry database (issuer host)
    #[arg(long, global = true, env = "KEYWARD_DB")]
    db: Option<PathBuf>,

    /// Local license token file (client)
    #[arg(long, global = true, env = "KEYWARD_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a new license and print its token
    Issue {
        /// Validity: 1m, 1h, 1d, 7d, 30d or perpetual
        #[arg(short, long, default_value = "30d")]
        duration: DurationClass,

        /// Bind the token to the first machine that verifies it
        #[arg(short, long)]
        bind: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// List issued licenses, newest first
    List {
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// Revoke a license by short id, registry id, or a prefix of either
    Revoke { id: String },
    /// Permanently delete a license from the registry
    Delete { id: String },
    /// Remove every expired or revoked license
    Purge {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Run the HTTP API (revocation checks, usage reports, listing)
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0", env = "KEYWARD_BIND")]
        bind: IpAddr,

        /// HTTP port
        #[arg(short, long, default_value_t = DEFAULT_SERVER_PORT, env = "KEYWARD_PORT")]
        port: u16,
    },
    /// Install a license token on this machine and verify it
    Activate {
        /// The token; read from stdin when omitted or "-"
        token: Option<String>,

        /// Also consult the local registry
        #[arg(long)]
        consult_registry: bool,
    },
    /// Verify the installed license token
    Check {
        /// Also consult the local registry (issuer host installs)
        #[arg(long)]
        consult_registry: bool,

        /// Also ask the issuer host whether the license is revoked
        #[arg(long, env = "KEYWARD_SERVER")]
        server: Option<String>,
    },
    /// Verify, then keep polling the issuer host until revoked or Ctrl-C
    Watch {
        /// Issuer host base URL, e.g. http://10.0.0.5:8888
        #[arg(long, env = "KEYWARD_SERVER")]
        server: String,

        /// Seconds between revocation checks
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
        interval: u64,

        /// Seconds before a revocation check is abandoned
        #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let db_path = args
        .db
        .clone()
        .unwrap_or_else(|| RegistryConfig::default().database_path);
    let mut client_config = ClientConfig::default();
    if let Some(path) = &args.token_file {
        client_config.token_path = path.clone();
    }

    match args.command {
        Command::Issue {
            duration,
            bind,
            json,
        } => {
            let registry = open_registry(&db_path)?;
            let issued = Issuer::new(registry)
                .issue(duration, bind)
                .context("Failed to issue license")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&issued)?);
            } else {
                println!("Short id:    {}", issued.short_id);
                println!("Registry id: {}", issued.registry_id);
                println!(
                    "Expires:     {}",
                    issued
                        .expires_at
                        .map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
                );
                println!("Binding:     {}", if bind { "first device" } else { "none" });
                println!("\n{}", issued.token);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::List { json } => {
            let registry = open_registry(&db_path)?;
            let summaries = registry.summaries().context("Failed to list licenses")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
                return Ok(ExitCode::SUCCESS);
            }
            if summaries.is_empty() {
                println!("No licenses issued.");
                return Ok(ExitCode::SUCCESS);
            }
            println!(
                "{:<12}  {:<9}  {:<8}  {:<25}  {:<5}  LAST DEVICE",
                "SHORT ID", "DURATION", "STATE", "EXPIRES", "USED"
            );
            for s in summaries {
                let state = match s.state {
                    DisplayState::Active => "active",
                    DisplayState::Expired => "expired",
                    DisplayState::Revoked => "revoked",
                };
                println!(
                    "{:<12}  {:<9}  {:<8}  {:<25}  {:<5}  {}",
                    s.short_id,
                    s.duration.as_str(),
                    state,
                    s.expires_at
                        .map_or_else(|| "never".to_string(), |t| t.to_rfc3339()),
                    if s.used { "yes" } else { "no" },
                    s.last_device_id.as_deref().unwrap_or("-"),
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Revoke { id } => {
            let registry = open_registry(&db_path)?;
            if registry.revoke(&id).context("Failed to revoke license")? {
                println!("Revoked {id}");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("No license matches '{id}'");
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Delete { id } => {
            let registry = open_registry(&db_path)?;
            if registry.delete(&id).context("Failed to delete license")? {
                println!("Deleted {id}");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("No license matches '{id}'");
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Purge { yes } => {
            let registry = open_registry(&db_path)?;
            let (expired, revoked) = registry
                .count_expired_or_revoked()
                .context("Failed to count licenses")?;
            if expired + revoked == 0 {
                println!("Nothing to purge.");
                return Ok(ExitCode::SUCCESS);
            }
            println!("{expired} expired and {revoked} revoked license(s) will be deleted.");
            if !yes && !confirm("Proceed?")? {
                println!("Aborted.");
                return Ok(ExitCode::SUCCESS);
            }
            let (expired, revoked) = registry
                .purge_expired_or_revoked()
                .context("Failed to purge licenses")?;
            println!("Purged {expired} expired and {revoked} revoked license(s).");
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve { bind, port } => {
            let config = ServerConfig {
                bind,
                port,
                database_path: db_path,
            };
            run_server(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Activate {
            token,
            consult_registry,
        } => {
            let token = match token.filter(|t| t != "-") {
                Some(token) => token,
                None => read_token_from_stdin()?,
            };
            let verifier = client_verifier(&client_config, consult_registry, &db_path)?;
            let outcome = tokio::task::spawn_blocking(move || {
                verifier.activate(&token, consult_registry)
            })
            .await
            .context("Activation task failed")?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(exit_code(outcome.valid))
        }
        Command::Check {
            consult_registry,
            server,
        } => {
            let verifier = Arc::new(client_verifier(&client_config, consult_registry, &db_path)?);
            let pass = Arc::clone(&verifier);
            let outcome = tokio::task::spawn_blocking(move || pass.check_valid(consult_registry))
                .await
                .context("Verification task failed")?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.valid {
                return Ok(ExitCode::FAILURE);
            }

            if let Some(url) = server {
                let client = RevocationClient::new(url, client_config.request_timeout)?;
                match poll_once(&verifier, &client).await {
                    PollOutcome::Revoked => {
                        println!("Issuer reports this license as revoked.");
                        return Ok(ExitCode::FAILURE);
                    }
                    PollOutcome::Indeterminate => {
                        warn!("issuer host unreachable; offline result stands");
                    }
                    _ => {}
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch {
            server,
            interval,
            timeout,
        } => {
            client_config.server_url = Some(server);
            client_config.poll_interval = Duration::from_secs(interval);
            client_config.request_timeout = Duration::from_secs(timeout);
            watch(client_config).await
        }
    }
}

fn open_registry(path: &Path) -> Result<Arc<LicenseRegistry>> {
    let registry = LicenseRegistry::open(path)
        .with_context(|| format!("Failed to open registry at {}", path.display()))?;
    Ok(Arc::new(registry))
}

fn client_verifier(
    config: &ClientConfig,
    consult_registry: bool,
    db_path: &Path,
) -> Result<Verifier> {
    let verifier = Verifier::from_config(config);
    if consult_registry {
        Ok(verifier.with_registry(open_registry(db_path)?))
    } else {
        Ok(verifier)
    }
}

fn exit_code(valid: bool) -> ExitCode {
    if valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn read_token_from_stdin() -> Result<String> {
    let mut token = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut token)
        .context("Failed to read token from stdin")?;
    let token = token.trim().to_string();
    if token.is_empty() {
        bail!("No token given");
    }
    Ok(token)
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let state = AppState::open(&config).with_context(|| {
        format!(
            "Failed to open database at {}",
            config.database_path.display()
        )
    })?;
    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    println!("\n========================================");
    println!("  Keyward Issuer Host Running");
    println!("========================================");
    println!("  HTTP:      http://{addr}");
    println!("  Database:  {}", config.database_path.display());
    println!("  Check:     POST {}", keyward_license::CHECK_LICENSE_PATH);
    println!("========================================\n");
    info!("HTTP API listening on {}", addr);

    tokio::select! {
        result = serve(listener, state) => result.context("HTTP server failed")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

async fn watch(config: ClientConfig) -> Result<ExitCode> {
    let verifier = Arc::new(Verifier::from_config(&config));
    let pass = Arc::clone(&verifier);
    let outcome = tokio::task::spawn_blocking(move || pass.check_valid(false))
        .await
        .context("Verification task failed")?;
    if !outcome.valid {
        eprintln!("License not valid: {}", outcome.reason);
        return Ok(ExitCode::FAILURE);
    }
    info!(short_id = ?outcome.short_id, "license verified; watching for revocation");

    let Some(client) = RevocationClient::from_config(&config)? else {
        bail!("No issuer host configured");
    };
    if let (Some(url), Some(short_id)) = (&config.server_url, outcome.short_id.clone()) {
        UsageReporter::new(url.clone(), config.request_timeout)?.report_detached(
            ConnectionReport {
                device_id: verifier.device_id().to_string(),
                license_short_id: short_id,
                client_address: String::new(),
            },
        );
    }

    let mut watcher = RevocationWatcher::spawn(verifier, client, config.poll_interval);
    tokio::select! {
        revoked = watcher.revoked() => {
            if !revoked {
                bail!("Revocation watcher stopped unexpectedly");
            }
            println!("License revoked at {}. Stopping.", Utc::now().to_rfc3339());
            Ok(ExitCode::FAILURE)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Stopped watching");
            Ok(ExitCode::SUCCESS)
        }
    }
}
