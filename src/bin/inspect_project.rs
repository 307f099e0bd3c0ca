use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use snapshot_relay::config;
use snapshot_relay::db;
use snapshot_relay::introspect::introspect;
use snapshot_relay::platform::{Platform, RestPlatform};
use snapshot_relay::snapshot::Snapshot;

/// Print what schema discovery finds in a project without writing a backup.
#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Project ref to inspect
    #[arg(long)]
    project: String,

    /// Management token; read from the ledger for --user when omitted
    #[arg(long)]
    token: Option<String>,

    #[arg(long)]
    user: Option<String>,

    /// Schema to inspect instead of the configured one
    #[arg(long)]
    schema: Option<String>,

    /// Print the captured sections as snapshot JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let token = match (args.token, args.user) {
        (Some(token), _) => token,
        (None, Some(user)) => {
            let url = std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| format!("sqlite://{}/ledger.db", cfg.app.data_dir));
            let pool = db::init_pool(&url).await?;
            db::get_management_token(&pool, &user)
                .await?
                .ok_or_else(|| anyhow!("no management token stored for user {user}"))?
        }
        (None, None) => return Err(anyhow!("pass --token or --user")),
    };

    let platform = RestPlatform::from_config(&cfg)?;
    let control = platform.control_plane(&token);
    let key = control.service_role_key(&args.project).await?;
    let instance = platform.instance(&args.project, &key);
    let schema = args.schema.unwrap_or_else(|| cfg.app.schema.clone());

    let found = introspect(instance.as_ref(), &schema).await?;

    if args.json {
        let mut snap = Snapshot::new(&args.project);
        found.apply(&mut snap);
        println!("{}", String::from_utf8(snap.to_vec_pretty()?)?);
        return Ok(());
    }

    println!("Schema: {schema}");
    println!("Tables:");
    for table in &found.schema.tables {
        println!(
            "  {} -> {{ columns: {}, pk: [{}], rls: {:?} }}",
            table.qualified(),
            table.columns.len(),
            table.primary_keys.join(", "),
            table.rls_status
        );
    }
    println!("Discovery methods:");
    for (class, method) in &found.schema.methods {
        println!("  {class} -> {method}");
    }
    let counts = [
        ("extensions", found.extensions.captured().map(Vec::len)),
        ("custom types", found.custom_types.captured().map(Vec::len)),
        ("sequences", found.sequences.captured().map(Vec::len)),
        ("indexes", found.indexes.captured().map(Vec::len)),
        ("views", found.views.captured().map(Vec::len)),
        ("triggers", found.triggers.captured().map(Vec::len)),
        ("policies", found.policies.captured().map(Vec::len)),
    ];
    for (name, count) in counts {
        match count {
            Some(n) => println!("{name}: {n}"),
            None => println!("{name}: not discovered"),
        }
    }
    for warning in &found.warnings {
        println!("warning: {warning}");
    }
    Ok(())
}
