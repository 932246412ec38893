//! ISO preparation lab tool (isoprep-lab) - Main entry point
//!
//! Plans requests into ISO jobs, assigns stock racks, moves stock tubes,
//! prints worklist bundles and executes ISO and job phases against the
//! inventory (SQLite database, or a JSON fixture with `--inventory`).

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use isoprep_common::config::{load_config, MachineConstants};
use isoprep_common::labels::EntityLabel;
use isoprep_lab::converter::request::{decode_request, referenced_pools};
use isoprep_lab::executor::{execute, print_worklists};
use isoprep_lab::model::IsoRequestRecord;
use isoprep_lab::planner::{self, build_isos, register_job, IsoBatch};
use isoprep_lab::repository::{Inventory, MemoryInventory, SqliteInventory};
use isoprep_lab::stock::{apply_tube_moves, assign_stock_racks, StockRackBarcodes};
use isoprep_lab::worklists::generate_processing_series;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for isoprep-lab
#[derive(Parser, Debug)]
#[command(name = "isoprep-lab")]
#[command(about = "Plan, assign and execute ISO preparations")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "ISOPREP_CONFIG")]
    config: Option<PathBuf>,

    /// Use a JSON inventory fixture instead of the database (written back on success)
    #[arg(long)]
    inventory: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan a request and create its ISO job
    Plan {
        /// Request file (JSON)
        request: PathBuf,

        /// Number of ISOs to create
        #[arg(long, default_value = "1")]
        isos: u32,

        /// Job number within the ticket
        #[arg(long, default_value = "1")]
        job: u32,

        /// Create the last ISO even when floating pools run short
        #[arg(long)]
        allow_incomplete: bool,

        /// Only print the plan, store nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Assign stock tubes and racks to a job
    Assign {
        /// Job label (`<ticket>_job_<NN>`)
        job: String,

        /// Stock rack barcode as `<rack label>=<barcode>` (repeatable)
        #[arg(long = "rack", value_parser = parse_rack_barcode)]
        racks: Vec<(String, String)>,
    },

    /// Move the assigned stock tubes into their stock racks
    Pick {
        /// ISO or job label
        entity: String,
    },

    /// Write the worklist bundle of the current phase
    Print {
        /// ISO or job label
        entity: String,

        /// Output directory
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// Execute the current phase of an ISO or job
    Execute {
        /// ISO or job label
        entity: String,

        /// Executing user
        #[arg(long, env = "ISOPREP_USER")]
        user: String,
    },
}

fn parse_rack_barcode(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((label, barcode)) if !label.is_empty() && !barcode.is_empty() => {
            Ok((label.to_string(), barcode.to_string()))
        }
        _ => Err(format!("expected <rack label>=<barcode>, got '{}'", value)),
    }
}

fn parse_label(text: &str) -> Result<EntityLabel> {
    text.parse::<EntityLabel>()
        .with_context(|| format!("Invalid ISO or job label '{}'", text))
}

async fn run<R: Inventory>(repo: &R, constants: MachineConstants, command: Command) -> Result<()> {
    match command {
        Command::Plan {
            request,
            isos,
            job,
            allow_incomplete,
            dry_run,
        } => {
            let text = tokio::fs::read_to_string(&request)
                .await
                .with_context(|| format!("Failed to read request {}", request.display()))?;
            let record: IsoRequestRecord = serde_json::from_str(&text).context("Failed to parse request")?;
            let context = isoprep_lab::Context::load(repo, &referenced_pools(&record), constants).await?;
            let request = decode_request(&record, &context)?;
            let plan = planner::plan(&request, &context)?;
            let series = generate_processing_series(&plan, &context)?;
            let used = repo.used_floating_pools(&request.ticket).await?;
            let batch = IsoBatch {
                job_number: job,
                first_iso_number: 1,
                count: isos,
                allow_incomplete,
            };
            let draft = build_isos(&plan, series, &request.pool_set, &used, &batch)?;

            println!("Ticket {} ({}, order {})", plan.ticket, plan.scenario, plan.processing_order);
            for plate in &plan.prep_plates {
                println!("  preparation plate {}: {} wells", plate.marker, plate.layout.len());
            }
            for rack in &plan.stock_racks {
                println!("  stock rack {} ({}, sector {:?})", rack.marker, rack.owner, rack.sector);
            }
            for label in draft.job.processing_series.labels() {
                println!("  worklist {}", label);
            }
            for iso in &draft.isos {
                println!("  {}", iso.label);
            }
            if dry_run {
                return Ok(());
            }
            register_job(repo, &context, &draft).await?;
            println!("Created {} with {} ISO(s)", draft.job.label, draft.isos.len());
        }
        Command::Assign { job, racks } => {
            let label = parse_label(&job)?;
            let context = isoprep_lab::Context::for_entity(repo, &label, constants).await?;
            let barcodes: StockRackBarcodes = racks.into_iter().collect();
            let assigned = assign_stock_racks(repo, &context, &label, &barcodes).await?;
            for rack in &assigned {
                println!("{} ({}): {} tube(s)", rack.label, rack.barcode, rack.layout.len());
            }
        }
        Command::Pick { entity } => {
            let label = parse_label(&entity)?;
            let moves = apply_tube_moves(repo, &label).await?;
            for tube in &moves {
                println!(
                    "{}: {} {} -> {} {}",
                    tube.tube_barcode, tube.from_rack, tube.from_position, tube.to_rack, tube.to_position
                );
            }
        }
        Command::Print { entity, out } => {
            let label = parse_label(&entity)?;
            let context = isoprep_lab::Context::for_entity(repo, &label, constants).await?;
            let bundle = print_worklists(repo, &context, &label).await?;
            let written = bundle.write_to(&out).await?;
            for path in written {
                println!("{}", path.display());
            }
        }
        Command::Execute { entity, user } => {
            let label = parse_label(&entity)?;
            let context = isoprep_lab::Context::for_entity(repo, &label, constants).await?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling execution");
                    on_signal.cancel();
                }
            });

            let report = execute(repo, &context, &label, &user, &cancel).await?;
            println!(
                "{}: {} worklist(s) executed, status {}",
                report.entity,
                report.worklists.len(),
                report.status
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration, then initialize tracing from it
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    match &config.logging.file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
    let constants = MachineConstants::from_config(&config);
    constants.validate().context("Invalid configuration")?;

    match args.inventory {
        Some(path) => {
            info!("Using inventory fixture {}", path.display());
            let repo = MemoryInventory::load_json(&path)
                .await
                .with_context(|| format!("Failed to load inventory {}", path.display()))?;
            run(&repo, constants, args.command).await?;
            repo.save_json(&path).await?;
        }
        None => {
            if config.database_path.as_os_str().is_empty() {
                bail!("No database path configured");
            }
            info!("Using database {}", config.database_path.display());
            let repo = SqliteInventory::open(&config.database_path)
                .await
                .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
            run(&repo, constants, args.command).await?;
        }
    }
    Ok(())
}
