mod catalog;
mod config;
mod documents;
mod records;
mod review;
mod session;
mod storage;
#[cfg(test)]
mod test_support;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use catalog::{image_format, Catalog};
use config::{Settings, StorageArgs};
use documents::{encode_document, parse_edited_document, DocumentKind, SaveReport};
use records::AnnotationRecord;
use session::{DeleteOutcome, ReviewSession, SubmitOutcome};
use storage::{LocalBucket, ObjectStore};

#[derive(Parser, Debug)]
#[command(
    name = "calligraphy-annotator",
    version,
    about = "Label calligraphy images kept in a storage bucket and save the annotations as backed-up JSON"
)]
struct Cli {
    #[command(flatten)]
    storage: StorageArgs,
    /// Print results as JSON
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    json: bool,
    /// Log more (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[allow(clippy::enum_variant_names)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// List dataset folders in the bucket
    Folders,
    /// List images of a folder with their record ids
    Images(FolderArgs),
    /// Print annotation progress for a folder
    Status(FolderArgs),
    /// Export the merged grid (one row per image) as JSON
    Grid(GridArgs),
    /// Replace annotations.json with an edited grid export
    #[command(name = "grid-save")]
    GridSave(GridSaveArgs),
    /// Save an annotation for one image unless it already has one
    Submit(SubmitArgs),
    /// Exclude one image from labeling
    Delete(DeleteArgs),
    /// Check that an edited JSON document parses
    #[command(name = "raw-validate")]
    RawValidate(RawValidateArgs),
    /// Replace a document with edited JSON after validating it
    #[command(name = "raw-save")]
    RawSave(RawSaveArgs),
    /// Write the current content of a document to a local file
    Download(DownloadArgs),
    /// Review images one by one, reading commands from stdin
    Review(FolderArgs),
}

#[derive(Args, Debug)]
struct FolderArgs {
    /// Dataset folder name
    folder: String,
}

#[derive(Args, Debug)]
struct GridArgs {
    /// Dataset folder name
    folder: String,
    /// Output JSON path (default: stdout)
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GridSaveArgs {
    /// Dataset folder name
    folder: String,
    /// Edited grid JSON (or - for stdin)
    #[arg(long)]
    file: String,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Dataset folder name
    folder: String,
    /// Record id (image filename without extension)
    id: String,
    /// Form value as field=value; repeatable
    #[arg(long = "field", value_parser = parse_field_assignment)]
    fields: Vec<(String, String)>,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    /// Dataset folder name
    folder: String,
    /// Record id (image filename without extension)
    id: String,
}

#[derive(Args, Debug)]
struct RawValidateArgs {
    /// Edited JSON document (or - for stdin)
    #[arg(long)]
    file: String,
}

#[derive(Args, Debug)]
struct RawSaveArgs {
    /// Dataset folder name
    folder: String,
    /// Document to replace
    #[arg(long, value_enum, default_value = "annotations")]
    doc: DocumentKind,
    /// Edited JSON document (or - for stdin)
    #[arg(long)]
    file: String,
}

#[derive(Args, Debug)]
struct DownloadArgs {
    /// Dataset folder name
    folder: String,
    /// Document to download
    #[arg(long, value_enum, default_value = "annotations")]
    doc: DocumentKind,
    /// Output path, - for stdout (default: <doc>.json)
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Commands = cli.command {
        return print_commands();
    }
    if let Commands::RawValidate(args) = &cli.command {
        return command_raw_validate(args, cli.json);
    }

    let settings = Settings::resolve(&cli.storage);
    let bucket = LocalBucket::new(&settings.root, &settings.bucket, settings.public_url.clone());
    log::info!("using bucket {} at {}", settings.bucket, bucket.dir().display());
    let mut catalog = Catalog::new(bucket);
    let json = cli.json;

    match cli.command {
        Commands::Commands | Commands::RawValidate(_) => Ok(()),
        Commands::Folders => command_folders(&mut catalog, json),
        Commands::Images(args) => command_images(&mut catalog, &args.folder, json),
        Commands::Status(args) => command_status(&mut catalog, &args.folder, json),
        Commands::Grid(args) => command_grid(&mut catalog, args),
        Commands::GridSave(args) => command_grid_save(&mut catalog, args, json),
        Commands::Submit(args) => command_submit(&mut catalog, args, json),
        Commands::Delete(args) => command_delete(&mut catalog, args, json),
        Commands::RawSave(args) => command_raw_save(&mut catalog, args, json),
        Commands::Download(args) => command_download(&mut catalog, args),
        Commands::Review(args) => {
            let stdin = io::stdin();
            let mut stdout = io::stdout();
            review::run_review(&mut catalog, &args.folder, stdin.lock(), &mut stdout)
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({"name": "folders", "description": "List dataset folders in the bucket."}),
        json!({"name": "images", "description": "List images of a folder with record ids."}),
        json!({"name": "status", "description": "Show annotated/deleted/remaining counts."}),
        json!({"name": "grid", "description": "Export one merged row per image as JSON."}),
        json!({"name": "grid-save", "description": "Replace annotations.json with an edited grid."}),
        json!({"name": "submit", "description": "Annotate one image unless it already has a record."}),
        json!({"name": "delete", "description": "Exclude one image from labeling."}),
        json!({"name": "raw-validate", "description": "Check edited JSON before saving it."}),
        json!({"name": "raw-save", "description": "Replace a document with edited JSON."}),
        json!({"name": "download", "description": "Write a document to a local file."}),
        json!({"name": "review", "description": "Interactive one-image-at-a-time review."}),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn command_folders<S: ObjectStore>(catalog: &mut Catalog<S>, json: bool) -> Result<()> {
    let folders = catalog.folders()?;
    if folders.is_empty() {
        log::warn!("no folders found in bucket {}", catalog.store().bucket());
    }
    if json {
        println!("{}", serde_json::to_string(&json!({ "folders": folders }))?);
    } else {
        for folder in folders {
            println!("{folder}");
        }
    }
    Ok(())
}

fn command_images<S: ObjectStore>(catalog: &mut Catalog<S>, folder: &str, json: bool) -> Result<()> {
    let session = ReviewSession::open(catalog, folder)?;
    let rows: Vec<Value> = session
        .images()
        .iter()
        .map(|image| {
            json!({
                "id": image.id,
                "url": image.url,
                "mime": image_format(&image.url).map(|format| format.to_mime_type()),
                "processed": session.is_processed(&image.id),
            })
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string(&json!({ "folder": folder, "images": rows }))?);
    } else {
        for image in session.images() {
            println!("{}\t{}", image.id, image.url);
        }
    }
    Ok(())
}

fn command_status<S: ObjectStore>(catalog: &mut Catalog<S>, folder: &str, json: bool) -> Result<()> {
    let session = ReviewSession::open(catalog, folder)?;
    let status = session.status();
    if json {
        println!("{}", serde_json::to_string(&status)?);
    } else {
        println!(
            "{}: {} images, {} annotated, {} deleted, {} remaining",
            status.folder, status.images, status.annotated, status.deleted, status.remaining
        );
    }
    Ok(())
}

fn command_grid<S: ObjectStore>(catalog: &mut Catalog<S>, args: GridArgs) -> Result<()> {
    let session = ReviewSession::open(catalog, &args.folder)?;
    let bytes = encode_document(&session.rows())?;
    match args.out {
        Some(path) => write_bytes(&path, &bytes),
        None => {
            print!("{}", String::from_utf8_lossy(&bytes));
            Ok(())
        }
    }
}

fn command_grid_save<S: ObjectStore>(catalog: &mut Catalog<S>, args: GridSaveArgs, json: bool) -> Result<()> {
    let records = parse_edited_document(&read_input(&args.file)?)?;
    let mut session = ReviewSession::open(catalog, &args.folder)?;
    let report = session.replace_document(catalog.store(), DocumentKind::Annotations, records)?;
    print_reports(&[report], json)
}

fn command_submit<S: ObjectStore>(catalog: &mut Catalog<S>, args: SubmitArgs, json: bool) -> Result<()> {
    let mut session = ReviewSession::open(catalog, &args.folder)?;
    let mut record = AnnotationRecord {
        id: args.id.clone(),
        ..AnnotationRecord::default()
    };
    for (field, value) in args.fields {
        record.set_field(&field, value)?;
    }

    match session.submit(catalog.store(), record)? {
        SubmitOutcome::Saved(reports) => print_reports(&reports, json),
        SubmitOutcome::AlreadyAnnotated => {
            let message = format!(
                "{} is already annotated; edit it through grid-save or raw-save",
                args.id
            );
            if json {
                println!("{}", serde_json::to_string(&json!({ "saved": false, "info": message }))?);
            } else {
                println!("info: {message}");
            }
            Ok(())
        }
    }
}

fn command_delete<S: ObjectStore>(catalog: &mut Catalog<S>, args: DeleteArgs, json: bool) -> Result<()> {
    let mut session = ReviewSession::open(catalog, &args.folder)?;
    match session.delete(catalog.store(), &args.id)? {
        DeleteOutcome::Saved(reports) => print_reports(&reports, json),
        DeleteOutcome::AlreadyDeleted => {
            let message = format!("{} is already excluded", args.id);
            if json {
                println!("{}", serde_json::to_string(&json!({ "saved": false, "info": message }))?);
            } else {
                println!("info: {message}");
            }
            Ok(())
        }
    }
}

fn command_raw_validate(args: &RawValidateArgs, json: bool) -> Result<()> {
    let records = parse_edited_document(&read_input(&args.file)?)?;
    if json {
        println!("{}", serde_json::to_string(&json!({ "valid": true, "records": records.len() }))?);
    } else {
        println!("valid JSON, {} records after normalization", records.len());
    }
    Ok(())
}

fn command_raw_save<S: ObjectStore>(catalog: &mut Catalog<S>, args: RawSaveArgs, json: bool) -> Result<()> {
    let records = parse_edited_document(&read_input(&args.file)?)?;
    let mut session = ReviewSession::open(catalog, &args.folder)?;
    let report = session.replace_document(catalog.store(), args.doc, records)?;
    print_reports(&[report], json)
}

fn command_download<S: ObjectStore>(catalog: &mut Catalog<S>, args: DownloadArgs) -> Result<()> {
    let session = ReviewSession::open(catalog, &args.folder)?;
    let bytes = match args.doc {
        DocumentKind::Annotations => encode_document(session.annotations())?,
        DocumentKind::Deleted => encode_document(session.deletions())?,
    };
    let out = args
        .out
        .unwrap_or_else(|| PathBuf::from(args.doc.file_name()));
    if out.as_os_str() == "-" {
        print!("{}", String::from_utf8_lossy(&bytes));
        return Ok(());
    }
    write_bytes(&out, &bytes)?;
    println!("{}", out.display());
    Ok(())
}

fn print_reports(reports: &[SaveReport], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(&json!({ "saved": true, "reports": reports }))?);
    } else {
        for report in reports {
            println!(
                "saved {} records to {} (backup {})",
                report.records, report.canonical_path, report.backup_path
            );
        }
    }
    Ok(())
}

fn parse_field_assignment(raw: &str) -> Result<(String, String)> {
    let Some((field, value)) = raw.split_once('=') else {
        bail!("expected field=value, got {raw:?}");
    };
    let field = field.trim();
    if field.is_empty() {
        bail!("missing field name in {raw:?}");
    }
    Ok((field.to_string(), value.to_string()))
}

fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read JSON from stdin")?;
        Ok(buf)
    } else {
        fs::read_to_string(path).with_context(|| format!("failed to read JSON file: {path}"))
    }
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, bytes).with_context(|| format!("failed to write JSON: {}", path.display()))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}
