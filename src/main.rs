mod archive;
mod db;
mod error;
mod filter;
mod parser;
mod pipeline;
mod settings;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use filter::FilterOptions;
use parser::table::CLASS_COLUMN_CANDIDATES;
use pipeline::{DocumentReport, Ingest, Outcome};
use settings::Settings;

#[derive(Parser)]
#[command(name = "gazette_grants", about = "Granted trademarks from INPI gazettes")]
struct Cli {
    /// Settings file (TOML). Defaults to ./gazette.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract granted records from gazette files (.xml, .csv, .xlsx) and store them
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Nice class to keep (repeatable). Replaces the configured classes.
        #[arg(short, long = "class")]
        classes: Vec<String>,
        /// Specification keyword (repeatable). Replaces the configured keywords.
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,
        /// Keep every granted record
        #[arg(long, conflicts_with_all = ["classes", "keywords"])]
        no_filter: bool,
        /// Extract and filter without touching the store
        #[arg(long)]
        dry_run: bool,
        /// Print the filtered records as JSON
        #[arg(long)]
        json: bool,
    },
    /// List stored records, newest first
    Query {
        #[arg(short, long)]
        class: Option<String>,
        /// Case-insensitive part of the mark
        #[arg(short, long)]
        mark: Option<String>,
        #[arg(short, long)]
        issue: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Show store statistics
    Stats,
    /// Gazette issues in the store
    Issues,
    /// Delete every stored record of one issue
    DeleteIssue { issue: String },
    /// Tag stored processes with a usage verification
    Verify {
        #[arg(value_enum)]
        status: db::Verification,
        #[arg(required = true)]
        processes: Vec<String>,
    },
    /// Copy gazette files into the archive
    Archive {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List archived documents
    Archived,
    /// Retrieve an archived document
    Fetch {
        name: String,
        /// Where to write it (default: ./<NAME>)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Ingest it with the configured filters instead of only writing it out
        #[arg(long)]
        ingest: bool,
    },
    /// Remove documents from the archive
    Unarchive {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Ingest {
            files,
            classes,
            keywords,
            no_filter,
            dry_run,
            json,
        } => {
            let filters = if no_filter {
                FilterOptions::default()
            } else {
                let defaults = settings.default_filters();
                FilterOptions {
                    classes: if classes.is_empty() { defaults.classes } else { classes },
                    keywords: if keywords.is_empty() { defaults.keywords } else { keywords },
                }
            };
            let opts = settings.extract_options()?;
            let conn = if dry_run { None } else { Some(open_store(&settings)?) };

            if !json {
                println!(
                    "Ingesting {} file(s) | classes: {} | keywords: {}{}",
                    files.len(),
                    describe_list(&filters.classes),
                    filters.keywords.len(),
                    if dry_run { " | dry run" } else { "" },
                );
            }
            let ingest = Ingest {
                conn: conn.as_ref(),
                filters: &filters,
                opts: &opts,
                batch_size: settings.insert_batch_size,
            };
            let (reports, tally) = ingest.paths(&files);

            if json {
                let out: Vec<serde_json::Value> = reports.iter().map(report_json).collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for report in &reports {
                    print_report(report);
                }
                println!();
                tally.print();
            }
            Ok(())
        }
        Commands::Query {
            class,
            mark,
            issue,
            limit,
        } => {
            let conn = open_store(&settings)?;
            let query = db::RecordQuery {
                class,
                mark,
                issue,
                limit: Some(limit),
            };
            let rows = db::query_records(&conn, &query, settings.query_page_size)?;
            if rows.is_empty() {
                println!("No records found.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<11} | {:<24} | {:>5} | {:<28} | {:>6} | {:<10} | {:<12}",
                "#", "Process", "Mark", "Class", "Holder", "Issue", "Status", "Verification"
            );
            println!("{}", "-".repeat(125));
            for (i, r) in rows.iter().enumerate() {
                println!(
                    "{:>3} | {:<11} | {:<24} | {:>5} | {:<28} | {:>6} | {:<10} | {:<12}",
                    i + 1,
                    r.process.as_deref().unwrap_or("-"),
                    truncate(r.mark.as_deref().unwrap_or("-"), 24),
                    r.class.as_deref().unwrap_or("-"),
                    truncate(r.holder.as_deref().unwrap_or("-"), 28),
                    r.issue_number.as_deref().unwrap_or("-"),
                    truncate(&r.status, 10),
                    truncate(r.verification.as_deref().unwrap_or(""), 12),
                );
            }
            println!("\n{} records", rows.len());
            Ok(())
        }
        Commands::Stats => {
            let conn = open_store(&settings)?;
            let s = db::get_stats(&conn)?;
            println!("Records:   {}", s.total_records);
            println!("Processes: {}", s.unique_processes);
            println!("Classes:   {}", s.unique_classes);
            println!("Issues:    {}", s.issues);
            Ok(())
        }
        Commands::Issues => {
            let conn = open_store(&settings)?;
            let mut issues = db::list_issue_numbers(&conn)?;
            for registered in db::list_registered_issues(&conn)? {
                if !issues.contains(&registered) {
                    issues.push(registered);
                }
            }
            db::sort_issues_desc(&mut issues);
            if issues.is_empty() {
                println!("No issues yet. Run 'ingest' or 'archive' first.");
                return Ok(());
            }
            let stored = db::list_issue_numbers(&conn)?;
            for issue in &issues {
                println!(
                    "{:>6}  records: {:<3}  registered: {}",
                    issue,
                    if stored.contains(issue) { "yes" } else { "no" },
                    if db::is_issue_registered(&conn, issue)? { "yes" } else { "no" },
                );
            }
            Ok(())
        }
        Commands::DeleteIssue { issue } => {
            let conn = open_store(&settings)?;
            let n = db::delete_issue_records(&conn, &issue)?;
            println!("Deleted {} records of issue {}.", n, issue.trim());
            Ok(())
        }
        Commands::Verify { status, processes } => {
            let conn = open_store(&settings)?;
            let pairs: Vec<(String, db::Verification)> = processes.into_iter().map(|p| (p, status)).collect();
            let tally = db::set_verifications(&conn, &pairs);
            println!("Updated {} process(es).", tally.updated);
            if !tally.unknown.is_empty() {
                println!("Not in store: {}", tally.unknown.join(", "));
            }
            for e in &tally.errors {
                println!("  {}: {}", e.process.as_deref().unwrap_or("?"), e.message);
            }
            Ok(())
        }
        Commands::Archive { files } => {
            let conn = open_store(&settings)?;
            let store = archive::Archive::open(&settings.archive_dir)?;
            let mut failed = 0;
            for path in &files {
                let name = match path.file_name() {
                    Some(n) => n.to_string_lossy().to_string(),
                    None => bail!("{:?} is not a file", path),
                };
                let outcome = std::fs::read(path)
                    .with_context(|| format!("Failed to read {:?}", path))
                    .and_then(|bytes| archive::archive_document(&store, &conn, &name, &bytes));
                match outcome {
                    Ok(receipt) => {
                        match &receipt.issue {
                            Some(issue) => println!("{} -> {} (issue {})", name, receipt.name, issue),
                            None => println!("{} -> {}", name, receipt.name),
                        }
                        if let Some(w) = &receipt.warning {
                            println!("  warning: {}", w);
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        println!("{}: {:#}", name, e);
                    }
                }
            }
            if failed > 0 {
                println!("{} of {} file(s) not archived.", failed, files.len());
            }
            Ok(())
        }
        Commands::Archived => {
            let conn = open_store(&settings)?;
            let store = archive::Archive::open(&settings.archive_dir)?;
            let entries = store.list()?;
            let names = archive::available_documents(&store, &conn)?;
            if names.is_empty() {
                println!("Archive {:?} is empty.", store.root());
                return Ok(());
            }
            for name in &names {
                match entries.iter().find(|e| &e.name == name) {
                    Some(e) => println!(
                        "{:<32} {:>10} bytes  {}",
                        e.name,
                        e.size,
                        e.modified
                            .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_default()
                    ),
                    None if !store.contains(name) => println!("{:<32} (registered, not archived)", name),
                    None => println!("{}", name),
                }
            }
            Ok(())
        }
        Commands::Fetch { name, output, ingest } => {
            let store = archive::Archive::open(&settings.archive_dir)?;
            let Some(bytes) = store.download(&name)? else {
                bail!("{} is not archived", name);
            };

            if output.is_some() || !ingest {
                let path = output.unwrap_or_else(|| PathBuf::from(&name));
                std::fs::write(&path, &bytes).with_context(|| format!("Failed to write {:?}", path))?;
                println!("Wrote {} ({} bytes)", path.display(), bytes.len());
            }
            if ingest {
                let conn = open_store(&settings)?;
                let filters = settings.default_filters();
                let opts = settings.extract_options()?;
                let run = Ingest {
                    conn: Some(&conn),
                    filters: &filters,
                    opts: &opts,
                    batch_size: settings.insert_batch_size,
                };
                print_report(&run.document(&name, &bytes));
            }
            Ok(())
        }
        Commands::Unarchive { names } => {
            let store = archive::Archive::open(&settings.archive_dir)?;
            for name in &names {
                if store.delete(name)? {
                    println!("Deleted {}", name);
                } else {
                    println!("{} was not archived", name);
                }
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_store(settings: &Settings) -> anyhow::Result<rusqlite::Connection> {
    let conn = db::connect(&settings.database_path)?;
    db::init_schema(&conn)?;
    Ok(conn)
}

fn print_report(report: &DocumentReport) {
    let issue = report
        .issue
        .as_deref()
        .map(|i| format!(" (issue {})", i))
        .unwrap_or_default();
    match &report.outcome {
        Outcome::Processed {
            table,
            extracted,
            saved,
        } => {
            println!("{}{}: {} of {} granted records kept", report.name, issue, table.len(), extracted);
            if let Some(column) = table.find_column(CLASS_COLUMN_CANDIDATES) {
                let counts = filter::class_counts(table, &table.columns()[column]);
                if !counts.is_empty() {
                    let summary: Vec<String> = counts.iter().map(|(c, n)| format!("{}: {}", c, n)).collect();
                    println!("  classes  {}", summary.join(" | "));
                }
            }
            if let Some(s) = saved {
                println!(
                    "  saved {} of {} ({} duplicates, {} errors)",
                    s.saved,
                    s.total,
                    s.duplicates,
                    s.errors.len()
                );
                for e in s.errors.iter().take(10) {
                    println!("    {}: {}", e.process.as_deref().unwrap_or("?"), e.message);
                }
            }
        }
        Outcome::Empty { extracted } => {
            println!("{}{}: no records left after filtering ({} extracted)", report.name, issue, extracted);
        }
        Outcome::Failed(e) => println!("{}: {}", report.name, e),
    }
}

fn report_json(report: &DocumentReport) -> serde_json::Value {
    let (status, records, error) = match &report.outcome {
        Outcome::Processed { table, .. } => ("processed", table.to_json(), None),
        Outcome::Empty { .. } => ("empty", serde_json::Value::Array(Vec::new()), None),
        Outcome::Failed(e) => ("failed", serde_json::Value::Array(Vec::new()), Some(e.clone())),
    };
    serde_json::json!({
        "document": report.name,
        "issue": report.issue,
        "status": status,
        "error": error,
        "records": records,
    })
}

fn describe_list(items: &[String]) -> String {
    if items.is_empty() {
        "all".to_string()
    } else {
        items.join(",")
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
