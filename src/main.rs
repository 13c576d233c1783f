use clap::{Parser, Subcommand};
use dispatch_sorter::config::{Config, ProcessingMode};
use dispatch_sorter::document::Pdftoppm;
use dispatch_sorter::extract::{IdentifierExtractor, OrderIdentifier, TesseractCli};
use dispatch_sorter::lookup::LookupTable;
use dispatch_sorter::pipeline::Pipeline;
use dispatch_sorter::store::{DispatchStore, NewPickItem};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML config file; built-in defaults are used when it does not exist.
    #[arg(short, long, default_value = ".config/dispatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split PDFs into one document per driver.
    Sort {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Delivery-sequence JSON (record list or cached delivery data).
        #[arg(short, long)]
        lookup: PathBuf,
        #[arg(short, long, value_enum)]
        mode: Option<ProcessingMode>,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        pattern: Option<String>,
        #[arg(long)]
        dpi: Option<u32>,
        #[arg(short, long)]
        workers: Option<usize>,
        /// Also write pages without a known order to Unmatched_Pages.pdf.
        #[arg(long)]
        keep_unmatched: bool,
        /// Do not record barcodes in the database.
        #[arg(long)]
        no_store: bool,
    },
    /// Pick lists per order.
    PickList {
        #[command(subcommand)]
        action: PickListAction,
    },
    /// Record a picked item.
    Pick {
        item_id: i64,
        quantity: u32,
        #[arg(long)]
        by: String,
    },
    /// Record a barcode scan.
    Scan {
        order_id: String,
        #[arg(long)]
        by: String,
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        location: Option<String>,
    },
    /// Scan history for an order, newest first.
    History { order_id: String },
    /// Barcode record for an order.
    Barcode { order_id: String },
}

#[derive(Subcommand, Debug)]
enum PickListAction {
    /// Import items from a JSON array.
    Import { order_id: String, file: PathBuf },
    Show { order_id: String },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = Config::load_or_default(&args.config)?;
    let mut incomplete: Option<String> = None;

    match args.command {
        Command::Sort {
            inputs,
            lookup,
            mode,
            output_dir,
            pattern,
            dpi,
            workers,
            keep_unmatched,
            no_store,
        } => {
            let mut section = cfg.sorter.clone();
            if let Some(mode) = mode {
                section.mode = mode;
            }
            if let Some(dir) = output_dir {
                section.output_dir = dir;
            }
            if let Some(pattern) = pattern {
                section.identifier_pattern = pattern;
            }
            if let Some(dpi) = dpi {
                section.ocr_dpi = dpi;
            }
            if let Some(workers) = workers {
                section.workers = workers;
            }
            section.keep_unmatched |= keep_unmatched;
            let sorter = section.validate()?;

            let table = LookupTable::from_json_file(&lookup)?;
            for (driver, orders) in table.orders_per_driver() {
                info!(driver = %driver, orders, "Delivery data");
            }

            let extractor = IdentifierExtractor::new(
                sorter.pattern.clone(),
                sorter.ocr_dpi,
                Arc::new(Pdftoppm::new(cfg.ocr.pdftoppm.clone())),
                Arc::new(TesseractCli::new(
                    cfg.ocr.tesseract.clone(),
                    cfg.ocr.language.clone(),
                )),
            );

            let mut store = if no_store {
                None
            } else {
                Some(open_store(&cfg.db_path)?)
            };
            let report = Pipeline::new(&sorter, &table, &extractor).run(&inputs, store.as_mut())?;
            print!("{}", report.render_text());
            if !report.is_clean() {
                incomplete = Some(format!(
                    "{} driver file(s) and {} source document(s) failed; see the summary",
                    report.failures.len(),
                    report.documents_failed.len()
                ));
            }
        }
        Command::PickList { action } => {
            let mut db = open_store(&cfg.db_path)?;
            match action {
                PickListAction::Import { order_id, file } => {
                    let order = order_key(&order_id)?;
                    let items: Vec<NewPickItem> = serde_json::from_str(&fs::read_to_string(file)?)?;
                    let ids = db.insert_pick_list(&order, &items)?;
                    info!(order = %order, items = ids.len(), "Pick list imported");
                }
                PickListAction::Show { order_id } => {
                    let items = db.pick_list_for_order(&order_key(&order_id)?)?;
                    println!("{}", serde_json::to_string_pretty(&items)?);
                }
            }
        }
        Command::Pick {
            item_id,
            quantity,
            by,
        } => {
            let db = open_store(&cfg.db_path)?;
            if !db.update_pick_item(item_id, quantity, &by)? {
                return Err(format!("no pick item with id {item_id}").into());
            }
        }
        Command::Scan {
            order_id,
            by,
            device,
            location,
        } => {
            let mut db = open_store(&cfg.db_path)?;
            db.record_scan(
                &order_key(&order_id)?,
                &by,
                device.as_deref(),
                location.as_deref(),
            )?;
        }
        Command::History { order_id } => {
            let db = open_store(&cfg.db_path)?;
            let scans = db.scan_history(&order_key(&order_id)?)?;
            println!("{}", serde_json::to_string_pretty(&scans)?);
        }
        Command::Barcode { order_id } => {
            let db = open_store(&cfg.db_path)?;
            match db.get_barcode(&order_key(&order_id)?)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => return Err(format!("no barcode recorded for {order_id}").into()),
            }
        }
    }

    let db_path = Path::new(&cfg.db_path);
    if db_path.exists() {
        let (barcodes, scanned, items, picked) = open_store(&cfg.db_path)?.get_counts()?;
        info!(barcodes, scanned, pick_items = items, picked, "Database statistics");
    }

    // Any failed driver or source document gives a non-zero exit status.
    match incomplete {
        Some(reason) => Err(reason.into()),
        None => Ok(()),
    }
}

fn open_store(db_path: &str) -> Result<DispatchStore, Box<dyn std::error::Error>> {
    if let Some(parent) = Path::new(db_path).parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(DispatchStore::new(db_path)?)
}

/// Orders are stored under their canonical upper-case id.
fn order_key(raw: &str) -> Result<String, Box<dyn std::error::Error>> {
    OrderIdentifier::normalize(raw)
        .map(|id| id.as_str().to_string())
        .ok_or_else(|| "order id must not be empty".into())
}
