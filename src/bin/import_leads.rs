use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgGroup, Parser};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use lead_import::config::ImportConfig;
use lead_import::database::run_migrations;
use lead_import::import::{
    FileFormat, ImportError, ImportRequest, LeadImporter, PgLeadRepository,
};

#[derive(Parser, Debug)]
#[command(
    name = "import_leads",
    about = "Import a CRM or ad-platform export into a campaign",
    group(ArgGroup::new("assignment").args(["assignee", "auto_distribute"]))
)]
struct Args {
    /// File to import (.csv, .tsv, .txt, .xlsx, .xls, .ods).
    #[arg(long)]
    file: PathBuf,

    /// Campaign the leads are placed into.
    #[arg(long)]
    campaign: i32,

    /// Stage new campaign entries start in.
    #[arg(long)]
    stage: i32,

    /// Assign every lead to this team member.
    #[arg(long)]
    assignee: Option<i32>,

    /// Spread leads over `--member` ids in round-robin order.
    #[arg(long, requires = "members")]
    auto_distribute: bool,

    /// Team member id for round-robin distribution; repeatable.
    #[arg(long = "member", value_name = "ID")]
    members: Vec<i32>,

    /// Column vocabulary of the file (`crm`, `ads`, or a custom rule set).
    #[arg(long, default_value = "crm")]
    source_kind: String,

    /// Label for this run; becomes part of the import tag name.
    #[arg(long)]
    label: String,

    /// Override format detection (`csv` or `xlsx`).
    #[arg(long)]
    format: Option<FileFormat>,

    /// Database connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    let config = ImportConfig::from_env();
    let rules = lead_import::load_rules(&config)?;

    if rules.get(&args.source_kind).is_none() {
        writeln!(
            io::stderr(),
            "error: unknown source kind '{}'. Known: {}",
            args.source_kind,
            rules.kinds().join(", ")
        )?;
        std::process::exit(1);
    }

    let pool = PgPoolOptions::new()
        .max_connections((config.workers + 2) as u32)
        .connect(&args.database_url)
        .await?;
    run_migrations(&pool).await?;

    let repository = Arc::new(PgLeadRepository::new(pool.clone(), config.lookup_chunk_size));
    let importer = LeadImporter::new(repository, Arc::new(rules), config);

    let request = ImportRequest {
        campaign_id: args.campaign,
        stage_id: args.stage,
        fixed_assignee_id: args.assignee,
        auto_distribute: args.auto_distribute,
        member_ids: args.members,
        source_kind: args.source_kind,
        import_label: args.label,
        format: args.format,
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, stopping after the current batch");
            on_interrupt.cancel();
        }
    });

    let progress = |percent: u8| log::info!("progress: {}%", percent);
    let result = match importer.run(&request, &args.file, &progress, cancel).await {
        Ok(result) => result,
        Err(ImportError::Cancelled { partial, .. }) => {
            println!("{}", serde_json::to_string_pretty(&partial)?);
            pool.close().await;
            writeln!(io::stderr(), "error: import cancelled")?;
            std::process::exit(130);
        }
        Err(err) => return Err(err.into()),
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    pool.close().await;
    Ok(())
}
