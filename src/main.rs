//! MailHub - scheduled multi-account mail sync
//!
//! Main entry point for the MailHub CLI. Every command prints one JSON
//! document on stdout; logs go to stderr.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mailhub::accounts::{AccountRegistry, BindRequest, CapabilitySet};
use mailhub::config::{validate_config, validate_config_result, MailHubConfig, StatePaths};
use mailhub::jobs::{self, JobGate};
use mailhub::provider::{Capability, MailContent, ProviderRegistry};
use mailhub::reply::ReplyQueue;
use mailhub::store::{ComposeMode, EncryptedStore};
use mailhub::sync::SyncEngine;
use mailhub::triage::{self, ExternalAnalysis, TriageRouter};
use mailhub::vault::SecretVault;
use mailhub::MailHubError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Read;
use std::path::PathBuf;
use std::process;

/// MailHub - multi-account mail sync with an encrypted store and a confirmed reply queue
#[derive(Parser, Debug)]
#[command(name = "mailhub")]
#[command(version, about, long_about = None)]
struct Cli {
    /// State directory (default: ~/.config/mailhub)
    #[arg(long, global = true, env = "MAILHUB_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Review, confirm and validate the configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Key backend probing and setup
    #[command(subcommand)]
    Vault(VaultCommands),

    /// Manage bound accounts
    #[command(subcommand)]
    Account(AccountCommands),

    /// Persist one message supplied as JSON (file path or `-` for stdin)
    Ingest {
        /// Account id, external key or alias
        account: String,

        /// JSON file with id, from, to, subject, body, received_at
        #[arg(default_value = "-")]
        input: String,
    },

    /// Gated run: sync, triage, reply housekeeping, scheduled tasks
    Run,

    /// Today's statistics
    Summary {
        /// Print the cached report of the last run instead
        #[arg(long)]
        cached: bool,
    },

    /// Record analysis produced outside a run
    #[command(subcommand)]
    Analysis(AnalysisCommands),

    /// Reply queue
    #[command(subcommand)]
    Reply(ReplyCommands),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the configuration and mark it reviewed
    Show,
    /// Confirm the reviewed configuration
    Confirm,
    /// Check the configuration without changing it
    Validate,
}

#[derive(Subcommand, Debug)]
enum VaultCommands {
    /// Probe every key backend (reachability and round trip)
    Probe,
    /// Re-probe, select a backend and make sure it holds the store key
    Setup,
}

#[derive(Subcommand, Debug)]
enum AccountCommands {
    /// Bind (or re-bind) an account
    Bind {
        /// Provider name (e.g. spool)
        provider: String,

        /// Provider-side account key, unique per provider
        external_key: String,

        #[arg(long)]
        alias: Option<String>,

        /// Address replies are sent from
        #[arg(long)]
        address: Option<String>,

        /// Comma-separated capabilities (mail, calendar, contacts)
        #[arg(long, value_delimiter = ',', default_value = "mail")]
        capabilities: Vec<Capability>,

        /// Name of an environment variable holding the account secret
        #[arg(long)]
        secret_env: Option<String>,
    },

    /// List accounts
    List,

    /// Set or clear an alias
    Alias {
        account: String,
        alias: Option<String>,
    },

    /// Stop syncing an account without deleting it
    Disable { account: String },
}

#[derive(Subcommand, Debug)]
enum AnalysisCommands {
    /// Record an analysis for a message (local id or provider message id)
    Record {
        message: String,

        /// JSON object: tag, confidence, summary, suggest_reply, suggestion, reasons
        #[arg(long)]
        json: Option<String>,

        /// Shorthand for a bare tag
        #[arg(long)]
        tag: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ReplyCommands {
    /// Sendable entries and the not-ready report
    List,

    /// Start a draft for a message
    Compose {
        message: String,

        /// generated, refined or raw
        #[arg(long, default_value = "generated")]
        mode: ComposeMode,

        #[arg(long)]
        text: Option<String>,
    },

    /// Replace the draft of an entry
    Revise {
        /// Entry id, `item N`, or a title
        target: String,

        #[arg(long, default_value = "generated")]
        mode: ComposeMode,

        #[arg(long)]
        text: Option<String>,
    },

    /// Mark a draft ready to send
    Confirm { target: String },

    /// Send a confirmed entry
    Send {
        target: String,

        /// Explicit confirmation; must contain the word "send"
        #[arg(long)]
        confirm: Option<String>,

        /// JSON override replacing the draft: subject, to, from, context
        #[arg(long)]
        payload: Option<String>,
    },

    /// Abandon an entry
    Abandon { target: String },
}

/// Manual ingest input; field names follow the spool format
#[derive(Debug, Deserialize)]
struct IngestInput {
    #[serde(alias = "id")]
    provider_message_id: String,
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default, alias = "body")]
    body_text: String,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
}

impl From<IngestInput> for MailContent {
    fn from(input: IngestInput) -> Self {
        let snippet = input
            .snippet
            .unwrap_or_else(|| input.body_text.chars().take(160).collect());
        MailContent {
            provider_message_id: input.provider_message_id,
            from: input.from,
            to: input.to,
            subject: input.subject,
            snippet,
            body_text: input.body_text,
            received_at: input.received_at.unwrap_or_else(Utc::now),
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    if let Err(e) = mailhub::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    match run(cli).await {
        Ok((output, code)) => {
            print_json(&output);
            if code != 0 {
                process::exit(code);
            }
        }
        Err(e) => {
            let mut error = json!({ "code": e.code(), "message": e.to_string() });
            if let MailHubError::Ambiguous { candidates, .. } = &e {
                error["candidates"] = json!(candidates);
            }
            print_json(&json!({ "ok": false, "error": error }));
            process::exit(1);
        }
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to render output: {}", e),
    }
}

async fn run(cli: Cli) -> mailhub::Result<(Value, i32)> {
    let paths = cli
        .state_dir
        .map(StatePaths::new)
        .unwrap_or_else(StatePaths::from_env);
    let mut config = MailHubConfig::load_or_default(paths.config())?;

    // Commands that never touch the store
    match &cli.command {
        Commands::Config(cmd) => return handle_config_command(cmd, &mut config, &paths).map(|v| (v, 0)),
        Commands::Vault(cmd) => return handle_vault_command(cmd, &config, &paths).map(|v| (v, 0)),
        _ => {}
    }

    let store = open_store(&config, &paths)?;
    let result = dispatch(cli.command, &store, &config, &paths).await;
    let closed = store.close();
    let output = result?;
    closed?;
    Ok(output)
}

/// Acquire the key from the selected backend, then open the store with it
fn open_store(config: &MailHubConfig, paths: &StatePaths) -> mailhub::Result<EncryptedStore> {
    let key = SecretVault::from_config(config, paths).acquire_key()?;
    EncryptedStore::open(paths.store(), &key)
}

fn handle_config_command(
    cmd: &ConfigCommands,
    config: &mut MailHubConfig,
    paths: &StatePaths,
) -> mailhub::Result<Value> {
    match cmd {
        ConfigCommands::Show => {
            if !config.runtime.config_reviewed {
                config.mark_reviewed();
                config.save(paths.config())?;
            }
            Ok(json!({
                "ok": true,
                "path": paths.config(),
                "config": config,
                "next": if config.runtime.config_confirmed { Value::Null } else { json!("mailhub config confirm") },
            }))
        }
        ConfigCommands::Confirm => {
            validate_config_result(config)?;
            config.confirm()?;
            config.save(paths.config())?;
            Ok(json!({ "ok": true, "confirmed_at": config.runtime.confirmed_at }))
        }
        ConfigCommands::Validate => {
            let errors: Vec<String> = match validate_config(config) {
                Ok(()) => Vec::new(),
                Err(errors) => errors.iter().map(|e| e.to_string()).collect(),
            };
            Ok(json!({ "ok": errors.is_empty(), "errors": errors }))
        }
    }
}

fn handle_vault_command(cmd: &VaultCommands, config: &MailHubConfig, paths: &StatePaths) -> mailhub::Result<Value> {
    let vault = SecretVault::from_config(config, paths);
    match cmd {
        VaultCommands::Probe => {
            let checks = vault.probe_all();
            let record = vault.load_record()?;
            Ok(json!({
                "ok": checks.iter().any(|c| c.available),
                "checks": checks,
                "selected": record,
            }))
        }
        VaultCommands::Setup => {
            let report = vault.setup()?;
            // the store must open with the selected key before setup counts as done
            let store = open_store(config, paths)?;
            store.close()?;
            Ok(json!({ "ok": true, "setup": report }))
        }
    }
}

async fn dispatch(
    command: Commands,
    store: &EncryptedStore,
    config: &MailHubConfig,
    paths: &StatePaths,
) -> mailhub::Result<(Value, i32)> {
    let providers = ProviderRegistry::with_defaults(paths);
    let collaborator = triage::build_collaborator(&config.collaborator);
    let registry = AccountRegistry::new(store);

    let output = match command {
        Commands::Config(_) | Commands::Vault(_) => {
            return Err(MailHubError::Other("handled before the store is opened".to_string()))
        }

        Commands::Account(cmd) => match cmd {
            AccountCommands::Bind {
                provider,
                external_key,
                alias,
                address,
                capabilities,
                secret_env,
            } => {
                if !providers.contains(&provider) {
                    return Err(MailHubError::NotFound(format!(
                        "provider '{}' (available: {})",
                        provider,
                        providers.names().join(", ")
                    )));
                }
                let secret = match secret_env {
                    Some(var) => Some(std::env::var(&var).map_err(|_| {
                        MailHubError::Config(format!("environment variable {} is not set", var))
                    })?),
                    None => None,
                };
                let outcome = registry.bind(&BindRequest {
                    provider,
                    external_key,
                    alias,
                    address,
                    capabilities: CapabilitySet::from_list(&capabilities),
                    secret,
                })?;
                json!({ "ok": true, "account": outcome.account, "created": outcome.created })
            }
            AccountCommands::List => json!({ "ok": true, "accounts": registry.list()? }),
            AccountCommands::Alias { account, alias } => {
                let account = registry.resolve(&account)?;
                json!({ "ok": true, "account": registry.set_alias(account.id, alias.as_deref())? })
            }
            AccountCommands::Disable { account } => {
                let account = registry.resolve(&account)?;
                json!({ "ok": true, "account": registry.disable(account.id)? })
            }
        },

        Commands::Ingest { account, input } => {
            let account = registry.resolve(&account)?;
            let raw = if input == "-" {
                let mut raw = String::new();
                std::io::stdin().read_to_string(&mut raw)?;
                raw
            } else {
                std::fs::read_to_string(&input)?
            };
            let parsed: IngestInput = serde_json::from_str(&raw)?;
            let engine = SyncEngine::new(store, &providers, &config.sync);
            let id = engine.ingest(account.id, parsed.into())?;
            let analyzed = match id {
                Some(id) => TriageRouter::new(store, config, collaborator.as_ref())
                    .triage(&[id])
                    .await?,
                None => Vec::new(),
            };
            json!({ "ok": true, "message_id": id, "duplicate": id.is_none(), "analyzed": analyzed })
        }

        Commands::Run => {
            let report = JobGate::new(store, config, &providers, collaborator.as_ref())
                .run()
                .await?;
            let code = if report.ok { 0 } else { 2 };
            return Ok((serde_json::to_value(&report)?, code));
        }

        Commands::Summary { cached } => {
            if cached {
                json!({
                    "ok": true,
                    "run": jobs::latest_cached(store, jobs::LATEST_RUN_KEY)?,
                    "digest": jobs::latest_cached(store, jobs::LATEST_DIGEST_KEY)?,
                    "billing_rollup": jobs::latest_cached(store, jobs::LATEST_BILLING_KEY)?,
                })
            } else {
                let stats = JobGate::new(store, config, &providers, collaborator.as_ref()).summary_at(Utc::now())?;
                json!({ "ok": true, "stats": stats })
            }
        }

        Commands::Analysis(AnalysisCommands::Record { message, json, tag }) => {
            let analysis: ExternalAnalysis = match (json, tag) {
                (Some(raw), _) => serde_json::from_str(&raw)?,
                (None, Some(tag)) => serde_json::from_value(json!({ "tag": tag }))?,
                (None, None) => {
                    return Err(MailHubError::InvalidState(
                        "either --json or --tag is required".to_string(),
                    ))
                }
            };
            let item = TriageRouter::new(store, config, collaborator.as_ref()).record_external_analysis(&message, analysis)?;
            json!({ "ok": true, "analysis": item })
        }

        Commands::Reply(cmd) => {
            let queue = ReplyQueue::new(store, config, collaborator.as_ref(), &providers);
            match cmd {
                ReplyCommands::List => json!({ "ok": true, "replies": queue.list()? }),
                ReplyCommands::Compose { message, mode, text } => {
                    json!({ "ok": true, "draft": queue.compose(&message, mode, text.as_deref()).await? })
                }
                ReplyCommands::Revise { target, mode, text } => {
                    json!({ "ok": true, "draft": queue.revise(&target, mode, text.as_deref()).await? })
                }
                ReplyCommands::Confirm { target } => {
                    let entry = queue.confirm(&target)?;
                    json!({
                        "ok": true,
                        "reply": entry,
                        "next": format!("mailhub reply send {} --confirm \"send\"", entry.id),
                    })
                }
                ReplyCommands::Send {
                    target,
                    confirm,
                    payload,
                } => {
                    let outcome = queue
                        .send(&target, confirm.as_deref(), payload.as_deref())
                        .await?;
                    json!({ "ok": true, "sent": outcome })
                }
                ReplyCommands::Abandon { target } => json!({ "ok": true, "reply": queue.abandon(&target)? }),
            }
        }
    };
    Ok((output, 0))
}
