use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_core::Embedding;
use rollcall_store::SqliteStore;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance administration")]
struct Cli {
    /// Database path (default: $ROLLCALL_DB_PATH or ~/.local/share/rollcall/attendance.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage enrolled staff
    Staff {
        #[command(subcommand)]
        command: StaffCommand,
    },
    /// Manage known customers
    Customer {
        #[command(subcommand)]
        command: CustomerCommand,
    },
    /// Show attendance for a day
    Attendance {
        /// Day to show, YYYY-MM-DD (default: today)
        #[arg(short, long)]
        date: Option<NaiveDate>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Review captured unknown entries
    Unknowns {
        #[command(subcommand)]
        command: UnknownCommand,
    },
}

#[derive(Subcommand)]
enum StaffCommand {
    /// Enroll a staff member, replacing any existing embeddings
    Add {
        staff_id: String,
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        employee_id: Option<String>,
        /// JSON file with one embedding array or an array of them
        #[arg(long)]
        embeddings: PathBuf,
    },
    /// List enrolled staff
    List {
        #[arg(long)]
        json: bool,
    },
    /// Deactivate a staff member
    Remove { staff_id: String },
}

#[derive(Subcommand)]
enum CustomerCommand {
    /// Enroll a known customer
    Add {
        customer_id: String,
        #[arg(short, long)]
        name: Option<String>,
        /// JSON file with one embedding array or an array of them
        #[arg(long)]
        embeddings: PathBuf,
    },
    /// Deactivate a customer
    Remove { customer_id: String },
}

#[derive(Subcommand)]
enum UnknownCommand {
    /// List entries, newest first
    List {
        /// Only entries from this day, YYYY-MM-DD
        #[arg(short, long)]
        date: Option<NaiveDate>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Write an entry's snapshot to a JPEG file
    Export { id: i64, output: PathBuf },
    /// Mark an entry as reviewed
    MarkProcessed { id: i64 },
    /// Delete an entry and its snapshot
    Delete { id: i64 },
}

/// Either `[0.1, 0.2, ...]` or `[[0.1, ...], [0.3, ...]]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingFile {
    Many(Vec<Vec<f32>>),
    One(Vec<f32>),
}

fn parse_embeddings(text: &str) -> Result<Vec<Embedding>> {
    let parsed: EmbeddingFile =
        serde_json::from_str(text).context("expected a JSON array of numbers or of arrays")?;
    let vectors = match parsed {
        EmbeddingFile::Many(v) => v,
        EmbeddingFile::One(v) => vec![v],
    };
    if vectors.is_empty() {
        bail!("embedding file contains no embeddings");
    }
    Ok(vectors.into_iter().map(Embedding::new).collect())
}

fn read_embeddings(path: &Path) -> Result<Vec<Embedding>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let embeddings = parse_embeddings(&text)
        .with_context(|| format!("invalid embedding file {}", path.display()))?;
    tracing::debug!(
        path = %path.display(),
        count = embeddings.len(),
        dim = embeddings[0].dim(),
        "embedding file loaded"
    );
    Ok(embeddings)
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("ROLLCALL_DB_PATH") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/attendance.db")
}

fn fmt_time(t: Option<chrono::NaiveDateTime>) -> String {
    t.map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db = cli.db.unwrap_or_else(default_db_path);
    let store =
        SqliteStore::open(&db).with_context(|| format!("failed to open {}", db.display()))?;

    run(&store, cli.command)
}

fn run(store: &SqliteStore, command: Commands) -> Result<()> {
    match command {
        Commands::Staff { command } => match command {
            StaffCommand::Add {
                staff_id,
                name,
                employee_id,
                embeddings,
            } => {
                let embeddings = read_embeddings(&embeddings)?;
                store.add_staff(&staff_id, &name, employee_id.as_deref(), &embeddings)?;
                println!("Enrolled {staff_id} ({name}) with {} embedding(s)", embeddings.len());
            }
            StaffCommand::List { json } => {
                let staff = store.list_staff()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&staff)?);
                } else if staff.is_empty() {
                    println!("No staff enrolled");
                } else {
                    for s in staff {
                        println!(
                            "{:<12} {:<24} {:<10} {:>2} emb  {}",
                            s.staff_id,
                            s.name,
                            s.employee_id.as_deref().unwrap_or("-"),
                            s.embeddings,
                            if s.is_active { "active" } else { "inactive" }
                        );
                    }
                }
            }
            StaffCommand::Remove { staff_id } => {
                if !store.remove_staff(&staff_id)? {
                    bail!("no active staff member {staff_id}");
                }
                println!("Deactivated {staff_id}");
            }
        },
        Commands::Customer { command } => match command {
            CustomerCommand::Add {
                customer_id,
                name,
                embeddings,
            } => {
                let embeddings = read_embeddings(&embeddings)?;
                store.add_customer(&customer_id, name.as_deref(), &embeddings)?;
                println!("Enrolled customer {customer_id} with {} embedding(s)", embeddings.len());
            }
            CustomerCommand::Remove { customer_id } => {
                if !store.remove_customer(&customer_id)? {
                    bail!("no active customer {customer_id}");
                }
                tracing::info!(customer_id = %customer_id, "customer deactivated");
                println!("Deactivated customer {customer_id}");
            }
        },
        Commands::Attendance { date, json } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let rows = store.attendance_for_date(date)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No attendance recorded for {date}");
            } else {
                for r in rows {
                    println!(
                        "{:<12} in {}  out {}  {:<7} late {:>3}m  hours {}",
                        r.staff_id,
                        fmt_time(r.check_in_time),
                        fmt_time(r.check_out_time),
                        r.status.map(|s| s.as_str()).unwrap_or("-"),
                        r.late_minutes,
                        r.hours_worked
                            .map(|h| format!("{h:.2}"))
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
        }
        Commands::Unknowns { command } => match command {
            UnknownCommand::List { date, limit, json } => {
                let entries = store.list_unknown_entries(date, limit)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                } else if entries.is_empty() {
                    println!("No unknown entries");
                } else {
                    for e in entries {
                        println!(
                            "{:>6}  {}  track {:<6} {:<14} {:<8} {}{}",
                            e.id,
                            e.detection_time.format("%Y-%m-%d %H:%M:%S"),
                            e.track_id,
                            e.entry_type,
                            e.system_mode,
                            e.reason,
                            if e.is_processed { "  [processed]" } else { "" }
                        );
                    }
                }
            }
            UnknownCommand::Export { id, output } => {
                let Some(image) = store.unknown_entry_image(id)? else {
                    bail!("no unknown entry {id}");
                };
                std::fs::write(&output, &image)
                    .with_context(|| format!("failed to write {}", output.display()))?;
                println!("Wrote {} bytes to {}", image.len(), output.display());
            }
            UnknownCommand::MarkProcessed { id } => {
                if !store.mark_unknown_entry_processed(id)? {
                    bail!("no unknown entry {id}");
                }
                tracing::info!(entry_id = id, "unknown entry marked processed");
                println!("Marked entry {id} as processed");
            }
            UnknownCommand::Delete { id } => {
                if !store.delete_unknown_entry(id)? {
                    bail!("no unknown entry {id}");
                }
                println!("Deleted entry {id}");
            }
        },
    }

    Ok(())
}
