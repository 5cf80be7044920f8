//! CLI for node operations

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use minicoord::workloads::{MigrationProtocol, RecipientSyncRequest, Timestamp};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "minicoord")]
#[command(about = "minicoord durable coordinator CLI")]
#[command(version)]
struct Cli {
    /// Node URL
    #[arg(long, default_value = "http://localhost:7000")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or rejoin) a migration and wait until the recipient is consistent
    SyncData {
        /// Migration id (generated if omitted)
        #[arg(long)]
        migration_id: Option<Uuid>,

        /// Donor replica set connection string (setName/host1,host2)
        #[arg(long)]
        donor: String,

        /// shard_merge or multitenant_migrations
        #[arg(long, default_value = "multitenant_migrations", value_parser = parse_protocol)]
        protocol: MigrationProtocol,

        /// Tenant to migrate (multitenant migrations only)
        #[arg(long)]
        tenant: Option<String>,

        /// Donor timestamp the migration starts at (seconds)
        #[arg(long)]
        start_ts: u32,

        /// Return once the donor reaches this timestamp (seconds)
        #[arg(long)]
        return_after_ts: Option<u32>,
    },

    /// Forget a migration and wait until it is garbage collectable
    Forget {
        /// Migration id
        id: Uuid,
    },

    /// Show a migration
    Status {
        /// Migration id
        id: Uuid,
    },

    /// List operations in progress on the node
    CurrentOp,

    /// Enable or disable change streams for a tenant
    SetChangeStream {
        /// Tenant id (24 hex characters)
        tenant: String,

        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /// Show whether change streams are enabled for a tenant
    GetChangeStream {
        /// Tenant id
        tenant: String,
    },

    /// Node health
    Health,
}

fn parse_protocol(s: &str) -> Result<MigrationProtocol, String> {
    match s {
        "shard_merge" => Ok(MigrationProtocol::ShardMerge),
        "multitenant_migrations" => Ok(MigrationProtocol::MultitenantMigrations),
        other => Err(format!("unknown protocol '{}'", other)),
    }
}

struct NodeClient {
    http: reqwest::Client,
    base: String,
}

impl NodeClient {
    fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> anyhow::Result<Value> {
        let resp = request.send().await.context("node unreachable")?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            let code = body.get("code").and_then(Value::as_str).unwrap_or("");
            bail!("{} ({}): {}", status, code, message);
        }
        Ok(body)
    }

    async fn get(&self, path: &str) -> anyhow::Result<Value> {
        self.send(self.http.get(format!("{}{}", self.base, path)))
            .await
    }

    async fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        self.send(self.http.post(format!("{}{}", self.base, path)).json(body))
            .await
    }

    async fn put(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        self.send(self.http.put(format!("{}{}", self.base, path)).json(body))
            .await
    }
}

fn print_report(title: &str, report: &Value) {
    println!("{}:", title);
    if let Some(fields) = report.as_object() {
        for (name, value) in fields {
            println!("  {}: {}", name, value);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = NodeClient::new(&cli.node);

    match cli.command {
        Commands::SyncData {
            migration_id,
            donor,
            protocol,
            tenant,
            start_ts,
            return_after_ts,
        } => {
            let request = RecipientSyncRequest {
                migration_id: migration_id.unwrap_or_else(Uuid::new_v4),
                protocol,
                tenant_id: tenant,
                donor_connection_string: donor,
                start_migration_donor_timestamp: Timestamp::new(start_ts, 1),
                read_preference: Default::default(),
                return_after_reaching_donor_timestamp: return_after_ts
                    .map(|secs| Timestamp::new(secs, 1)),
                recipient_certificate_for_donor: None,
            };
            let report = client
                .post("/migrations", &serde_json::to_value(&request)?)
                .await?;
            print_report("Migration", &report);
        }

        Commands::Forget { id } => {
            client
                .post(&format!("/migrations/{}/forget", id), &json!({}))
                .await?;
            println!("Migration {} forgotten", id);
        }

        Commands::Status { id } => {
            let report = client.get(&format!("/migrations/{}", id)).await?;
            print_report("Migration", &report);
        }

        Commands::CurrentOp => {
            let body = client.get("/admin/current-op").await?;
            let inprog = body
                .get("inprog")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            println!("Operations in progress: {}", inprog.len());
            for op in &inprog {
                let kind = op.get("kind").and_then(Value::as_str).unwrap_or("?");
                print_report(kind, op);
            }
        }

        Commands::SetChangeStream { tenant, enabled } => {
            let report = client
                .put(
                    &format!("/tenants/{}/change-streams", tenant),
                    &json!({ "enabled": enabled }),
                )
                .await?;
            print_report("Change stream state", &report);
        }

        Commands::GetChangeStream { tenant } => {
            let body = client
                .get(&format!("/tenants/{}/change-streams", tenant))
                .await?;
            print_report("Change stream state", &body);
        }

        Commands::Health => {
            let body = client.get("/health").await?;
            print_report("Node", &body);
        }
    }

    Ok(())
}
