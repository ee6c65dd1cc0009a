//! cellar - command-line client for the cellar storage backend.
//!
//! Exit codes: 0 success, 1 runtime failure, 2 configuration error.

mod client;
mod output;

use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use client::Client;
use output::{print_value, OutputMode};

#[derive(Parser)]
#[command(name = "cellar", version, about = "Client for the cellar storage backend")]
struct Cli {
    #[command(flatten)]
    global: GlobalFlags,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalFlags {
    /// Server base URL.
    #[arg(long, env = "CELLAR_URL", global = true)]
    url: Option<String>,

    /// API key (admin or project key).
    #[arg(long, env = "CELLAR_API_KEY", global = true)]
    api_key: Option<String>,

    /// Named profile; reads CELLAR_<PROFILE>_URL / CELLAR_<PROFILE>_API_KEY.
    #[arg(long, env = "CELLAR_PROFILE", global = true)]
    profile: Option<String>,

    /// Emit raw JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Output format: table | json.
    #[arg(long, global = true)]
    format: Option<String>,

    /// Assume yes on confirmation prompts.
    #[arg(long, global = true)]
    yes: bool,

    /// Print what would be done without doing it.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Suppress non-essential output.
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Verbose diagnostics.
    #[arg(long, short, env = "CELLAR_DEBUG", global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, env = "CELLAR_NO_COLOR", global = true)]
    no_color: bool,

    /// Request timeout in seconds.
    #[arg(long, env = "CELLAR_TIMEOUT_SECS", default_value_t = 120, global = true)]
    timeout: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Manage projects (admin key required for create/delete).
    Projects {
        #[command(subcommand)]
        action: ProjectAction,
    },
    /// Manage development branches.
    Branches {
        #[command(subcommand)]
        action: BranchAction,
    },
    /// Manage buckets.
    Buckets {
        #[command(subcommand)]
        action: BucketAction,
    },
    /// Manage tables.
    Tables {
        #[command(subcommand)]
        action: TableAction,
    },
    /// Inspect and change table schemas.
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },
    /// Move data in and out of tables.
    Data {
        #[command(subcommand)]
        action: DataAction,
    },
    /// Manage stored files.
    Files {
        #[command(subcommand)]
        action: FileAction,
    },
    /// Manage snapshots.
    Snapshots {
        #[command(subcommand)]
        action: SnapshotAction,
    },
    /// Manage interactive workspaces.
    Workspaces {
        #[command(subcommand)]
        action: WorkspaceAction,
    },
    /// Show effective client configuration.
    Config,
}

#[derive(Subcommand)]
enum ProjectAction {
    List,
    Get { project: String },
    Create { id: String, name: String },
    Delete { project: String },
}

#[derive(Subcommand)]
enum BranchAction {
    List { project: String },
    Create { project: String, branch: String },
    Delete { project: String, branch: String },
}

#[derive(Subcommand)]
enum BucketAction {
    List { project: String },
    Create {
        project: String,
        name: String,
        #[arg(long, default_value = "in")]
        stage: String,
    },
    Delete { project: String, bucket: String },
}

#[derive(Subcommand)]
enum TableAction {
    List {
        project: String,
        bucket: String,
        #[arg(long, default_value = "default")]
        branch: String,
    },
    Get {
        project: String,
        bucket: String,
        table: String,
        #[arg(long, default_value = "default")]
        branch: String,
    },
    Preview {
        project: String,
        bucket: String,
        table: String,
        #[arg(long, default_value = "default")]
        branch: String,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    Profile {
        project: String,
        bucket: String,
        table: String,
        #[arg(long, default_value = "default")]
        branch: String,
        #[arg(long, default_value = "quality")]
        mode: String,
    },
    Drop {
        project: String,
        bucket: String,
        table: String,
        #[arg(long, default_value = "default")]
        branch: String,
    },
}

#[derive(Subcommand)]
enum SchemaAction {
    /// Create a table from a JSON schema document.
    CreateTable {
        project: String,
        bucket: String,
        /// JSON: {"name": ..., "columns": [...], "primary_key": [...]}
        schema_json: String,
        #[arg(long, default_value = "default")]
        branch: String,
    },
    AddColumn {
        project: String,
        bucket: String,
        table: String,
        name: String,
        #[arg(long = "type")]
        type_name: String,
        #[arg(long, default_value = "default")]
        branch: String,
    },
    DropColumn {
        project: String,
        bucket: String,
        table: String,
        name: String,
        #[arg(long, default_value = "default")]
        branch: String,
    },
}

#[derive(Subcommand)]
enum DataAction {
    /// Import a registered file into a table.
    Import {
        project: String,
        bucket: String,
        table: String,
        file_id: String,
        #[arg(long, default_value = "default")]
        branch: String,
        #[arg(long)]
        incremental: bool,
        #[arg(long, default_value = "update_duplicates")]
        dedup: String,
    },
    /// Export a table to a destination path.
    Export {
        project: String,
        bucket: String,
        table: String,
        destination: String,
        #[arg(long, default_value = "default")]
        branch: String,
        #[arg(long, default_value = "csv")]
        format: String,
    },
    /// Delete rows matching a predicate (empty deletes everything).
    DeleteRows {
        project: String,
        bucket: String,
        table: String,
        #[arg(long, default_value = "")]
        r#where: String,
        #[arg(long, default_value = "default")]
        branch: String,
    },
}

#[derive(Subcommand)]
enum FileAction {
    List {
        project: String,
        #[arg(long)]
        tag: Option<String>,
    },
    Usage { project: String },
    Delete { project: String, file_id: String },
}

#[derive(Subcommand)]
enum SnapshotAction {
    List {
        project: String,
        #[arg(long)]
        table: Option<String>,
    },
    Create {
        project: String,
        bucket: String,
        table: String,
    },
    Restore { project: String, snapshot_id: String },
    Delete { project: String, snapshot_id: String },
}

#[derive(Subcommand)]
enum WorkspaceAction {
    List { project: String },
    Create {
        project: String,
        #[arg(long)]
        branch: Option<String>,
    },
    Delete { project: String, workspace_id: String },
    ResetCredentials { project: String, workspace_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.global.no_color {
        colored::control::set_override(false);
    }

    let (url, api_key) = match resolve_config(&cli.global) {
        Ok(pair) => pair,
        Err(message) => {
            eprintln!("{} {message}", "config error:".red().bold());
            return ExitCode::from(2);
        }
    };

    if cli.global.verbose && !cli.global.quiet {
        eprintln!("{} {url}", "server:".dimmed());
    }

    let client = match Client::new(&url, &api_key, cli.global.timeout) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{} {e:#}", "config error:".red().bold());
            return ExitCode::from(2);
        }
    };

    let mode = OutputMode::from_flags(cli.global.json, cli.global.format.as_deref());
    match run(&client, &cli, mode).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::from(1)
        }
    }
}

/// Resolve URL and key from flags, profile variables, then plain variables.
fn resolve_config(global: &GlobalFlags) -> Result<(String, String), String> {
    let from_profile = |suffix: &str| {
        global.profile.as_ref().and_then(|p| {
            std::env::var(format!("CELLAR_{}_{suffix}", p.to_uppercase())).ok()
        })
    };
    let url = global
        .url
        .clone()
        .or_else(|| from_profile("URL"))
        .ok_or("no server URL; set --url or CELLAR_URL")?;
    let api_key = global
        .api_key
        .clone()
        .or_else(|| from_profile("API_KEY"))
        .ok_or("no API key; set --api-key or CELLAR_API_KEY")?;
    Ok((url, api_key))
}

async fn run(client: &Client, cli: &Cli, mode: OutputMode) -> anyhow::Result<()> {
    if cli.global.dry_run {
        if !cli.global.quiet {
            println!("{}", "dry run: no request sent".yellow());
        }
        return Ok(());
    }

    let value = match &cli.command {
        Command::Config => {
            let url = cli.global.url.clone().unwrap_or_default();
            serde_json::json!({
                "url": url,
                "profile": cli.global.profile,
                "timeout_secs": cli.global.timeout,
            })
        }
        Command::Projects { action } => match action {
            ProjectAction::List => client.get("/projects").await?,
            ProjectAction::Get { project } => client.get(&format!("/projects/{project}")).await?,
            ProjectAction::Create { id, name } => {
                client
                    .post("/projects", serde_json::json!({ "id": id, "name": name }))
                    .await?
            }
            ProjectAction::Delete { project } => {
                confirm(cli, &format!("delete project {project} and all its data"))?;
                client.delete(&format!("/projects/{project}")).await?
            }
        },
        Command::Branches { action } => match action {
            BranchAction::List { project } => {
                client.get(&format!("/projects/{project}/branches")).await?
            }
            BranchAction::Create { project, branch } => {
                client
                    .post(
                        &format!("/projects/{project}/branches"),
                        serde_json::json!({ "branch_id": branch }),
                    )
                    .await?
            }
            BranchAction::Delete { project, branch } => {
                confirm(cli, &format!("delete branch {branch}"))?;
                client
                    .delete(&format!("/projects/{project}/branches/{branch}"))
                    .await?
            }
        },
        Command::Buckets { action } => match action {
            BucketAction::List { project } => {
                client.get(&format!("/projects/{project}/buckets")).await?
            }
            BucketAction::Create { project, name, stage } => {
                client
                    .post(
                        &format!("/projects/{project}/buckets"),
                        serde_json::json!({ "name": name, "stage": stage }),
                    )
                    .await?
            }
            BucketAction::Delete { project, bucket } => {
                confirm(cli, &format!("delete bucket {bucket}"))?;
                client
                    .delete(&format!("/projects/{project}/buckets/{bucket}"))
                    .await?
            }
        },
        Command::Tables { action } => match action {
            TableAction::List { project, bucket, branch } => {
                client
                    .get(&format!(
                        "/projects/{project}/branches/{branch}/buckets/{bucket}/tables"
                    ))
                    .await?
            }
            TableAction::Get { project, bucket, table, branch } => {
                client
                    .get(&format!(
                        "/projects/{project}/branches/{branch}/buckets/{bucket}/tables/{table}"
                    ))
                    .await?
            }
            TableAction::Preview { project, bucket, table, branch, limit } => {
                client
                    .get(&format!(
                        "/projects/{project}/branches/{branch}/buckets/{bucket}/tables/{table}/preview?limit={limit}"
                    ))
                    .await?
            }
            TableAction::Profile { project, bucket, table, branch, mode } => {
                client
                    .get(&format!(
                        "/projects/{project}/branches/{branch}/buckets/{bucket}/tables/{table}/profile?mode={mode}"
                    ))
                    .await?
            }
            TableAction::Drop { project, bucket, table, branch } => {
                confirm(cli, &format!("drop table {bucket}.{table}"))?;
                client
                    .delete(&format!(
                        "/projects/{project}/branches/{branch}/buckets/{bucket}/tables/{table}"
                    ))
                    .await?
            }
        },
        Command::Schema { action } => match action {
            SchemaAction::CreateTable { project, bucket, schema_json, branch } => {
                let schema: serde_json::Value = serde_json::from_str(schema_json)?;
                client
                    .post(
                        &format!("/projects/{project}/branches/{branch}/buckets/{bucket}/tables"),
                        schema,
                    )
                    .await?
            }
            SchemaAction::AddColumn { project, bucket, table, name, type_name, branch } => {
                client
                    .post(
                        &format!(
                            "/projects/{project}/branches/{branch}/buckets/{bucket}/tables/{table}/columns"
                        ),
                        serde_json::json!({ "name": name, "type": type_name }),
                    )
                    .await?
            }
            SchemaAction::DropColumn { project, bucket, table, name, branch } => {
                confirm(cli, &format!("drop column {name}"))?;
                client
                    .delete(&format!(
                        "/projects/{project}/branches/{branch}/buckets/{bucket}/tables/{table}/columns/{name}"
                    ))
                    .await?
            }
        },
        Command::Data { action } => match action {
            DataAction::Import { project, bucket, table, file_id, branch, incremental, dedup } => {
                client
                    .post(
                        &format!(
                            "/projects/{project}/branches/{branch}/buckets/{bucket}/tables/{table}/import"
                        ),
                        serde_json::json!({
                            "source": { "type": "file_id", "value": file_id },
                            "incremental": incremental,
                            "dedup": dedup,
                        }),
                    )
                    .await?
            }
            DataAction::Export { project, bucket, table, destination, branch, format } => {
                client
                    .post(
                        &format!(
                            "/projects/{project}/branches/{branch}/buckets/{bucket}/tables/{table}/export"
                        ),
                        serde_json::json!({ "destination": destination, "format": format }),
                    )
                    .await?
            }
            DataAction::DeleteRows { project, bucket, table, r#where, branch } => {
                if r#where.is_empty() {
                    confirm(cli, &format!("delete ALL rows from {bucket}.{table}"))?;
                }
                client
                    .request(
                        reqwest::Method::DELETE,
                        &format!(
                            "/projects/{project}/branches/{branch}/buckets/{bucket}/tables/{table}/rows"
                        ),
                        Some(serde_json::json!({ "where": r#where })),
                    )
                    .await?
            }
        },
        Command::Files { action } => match action {
            FileAction::List { project, tag } => {
                let query = tag
                    .as_ref()
                    .map(|t| format!("?tag={t}"))
                    .unwrap_or_default();
                client.get(&format!("/projects/{project}/files{query}")).await?
            }
            FileAction::Usage { project } => {
                client.get(&format!("/projects/{project}/files/usage")).await?
            }
            FileAction::Delete { project, file_id } => {
                confirm(cli, &format!("delete file {file_id}"))?;
                client
                    .delete(&format!("/projects/{project}/files/{file_id}"))
                    .await?
            }
        },
        Command::Snapshots { action } => match action {
            SnapshotAction::List { project, table } => {
                let query = table
                    .as_ref()
                    .map(|t| format!("?table={t}"))
                    .unwrap_or_default();
                client
                    .get(&format!("/projects/{project}/snapshots{query}"))
                    .await?
            }
            SnapshotAction::Create { project, bucket, table } => {
                client
                    .post(
                        &format!("/projects/{project}/buckets/{bucket}/tables/{table}/snapshots"),
                        serde_json::json!({}),
                    )
                    .await?
            }
            SnapshotAction::Restore { project, snapshot_id } => {
                confirm(cli, &format!("restore snapshot {snapshot_id} over its table"))?;
                client
                    .post(
                        &format!("/projects/{project}/snapshots/{snapshot_id}/restore"),
                        serde_json::json!({}),
                    )
                    .await?
            }
            SnapshotAction::Delete { project, snapshot_id } => {
                confirm(cli, &format!("delete snapshot {snapshot_id}"))?;
                client
                    .delete(&format!("/projects/{project}/snapshots/{snapshot_id}"))
                    .await?
            }
        },
        Command::Workspaces { action } => match action {
            WorkspaceAction::List { project } => {
                client.get(&format!("/projects/{project}/workspaces")).await?
            }
            WorkspaceAction::Create { project, branch } => {
                client
                    .post(
                        &format!("/projects/{project}/workspaces"),
                        serde_json::json!({ "branch_id": branch }),
                    )
                    .await?
            }
            WorkspaceAction::Delete { project, workspace_id } => {
                confirm(cli, &format!("delete workspace {workspace_id}"))?;
                client
                    .delete(&format!("/projects/{project}/workspaces/{workspace_id}"))
                    .await?
            }
            WorkspaceAction::ResetCredentials { project, workspace_id } => {
                client
                    .post(
                        &format!(
                            "/projects/{project}/workspaces/{workspace_id}/reset-credentials"
                        ),
                        serde_json::json!({}),
                    )
                    .await?
            }
        },
    };

    if !cli.global.quiet {
        print_value(&value, mode);
    }
    Ok(())
}

/// Destructive operations need --yes or an interactive confirmation.
fn confirm(cli: &Cli, what: &str) -> anyhow::Result<()> {
    if cli.global.yes {
        return Ok(());
    }
    eprint!("{} {what}? [y/N] ", "confirm:".yellow().bold());
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    if answer.trim().eq_ignore_ascii_case("y") {
        Ok(())
    } else {
        Err(anyhow::anyhow!("aborted"))
    }
}
