//! Binary entry point for the arclog administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use arclog::log::checkpoint::FatalSink;
use arclog::log::writer::PullRequest;
use arclog::log::{Collaborators, LogEngine, LogRecord, ScannedRecord, WriterMode};
use arclog::logging::init_logging;
use arclog::{LogConfig, Lsa};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::RngCore;
use serde::Serialize;

/// Exit status used when the log hits an unrecoverable failure.
const FATAL_EXIT_CODE: i32 = 70;

#[derive(Parser, Debug)]
#[command(
    name = "arclog",
    version,
    about = "Administrative CLI for the arclog write-ahead log",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        default_value = "warn",
        help = "Tracing filter used when RUST_LOG is unset"
    )]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, value_name = "FILE", help = "Config file (TOML)")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_name = "DIR", env = "ARCLOG_DIR", help = "Log directory")]
    dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Volume name prefix")]
    prefix: Option<String>,

    #[arg(long, global = true, help = "Page size in bytes when creating a log")]
    page_size: Option<u32>,

    #[arg(long, global = true, help = "Active log capacity in pages when creating a log")]
    active_pages: Option<u32>,

    #[arg(long, global = true, help = "Archives to keep (0 keeps all)")]
    max_archives: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Format a new active log volume")]
    Create,

    #[command(about = "Show the log header and engine counters")]
    Info,

    #[command(about = "Append random records from several threads")]
    Append(AppendCmd),

    #[command(about = "Append one record and commit it")]
    Commit {
        #[arg(help = "Record payload")]
        data: String,
    },

    #[command(about = "Archive every completed page now")]
    Archive,

    #[command(about = "List archive volumes")]
    Archives,

    #[command(about = "Apply archive retention")]
    Purge,

    #[command(about = "Take a checkpoint")]
    Checkpoint,

    #[command(about = "Print one log page")]
    DumpPage {
        #[arg(help = "Logical page id")]
        page_id: i64,

        #[arg(long, default_value_t = 128, help = "Body bytes to print as hex")]
        bytes: usize,
    },

    #[command(about = "List records starting at an LSA")]
    Scan {
        #[arg(long, value_name = "PAGE:OFFSET", value_parser = parse_lsa, help = "Start LSA")]
        from: Option<Lsa>,

        #[arg(long, help = "Maximum records to print")]
        limit: Option<usize>,
    },

    #[command(about = "Perform one log-shipping round trip")]
    Pull(PullCmd),
}

#[derive(Args, Debug)]
struct AppendCmd {
    #[arg(long, default_value_t = 4, help = "Producer threads")]
    threads: usize,

    #[arg(long, default_value_t = 1000, help = "Records per thread")]
    records: usize,

    #[arg(long, default_value_t = 128, help = "Payload bytes per record")]
    size: usize,

    #[arg(long, default_value_t = 100, help = "Commit every N records (0 never)")]
    commit_every: usize,
}

#[derive(Args, Debug)]
struct PullCmd {
    #[arg(long, default_value_t = 0, help = "First page to request")]
    first: i64,

    #[arg(long, value_enum, default_value_t = ModeArg::Async)]
    mode: ModeArg,

    #[arg(long, help = "Ask for a compressed payload")]
    compressed: bool,

    #[arg(long, default_value_t = 1000, help = "Async poll timeout in milliseconds")]
    poll_ms: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ModeArg {
    Async,
    #[value(name = "semi-sync")]
    SemiSync,
    Sync,
}

impl From<ModeArg> for WriterMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Async => WriterMode::Async,
            ModeArg::SemiSync => WriterMode::SemiSync,
            ModeArg::Sync => WriterMode::Sync,
        }
    }
}

struct ExitFatalSink;

impl FatalSink for ExitFatalSink {
    fn report_fatal(&self, component: &'static str, lsa: Lsa, reason: &str) {
        eprintln!("fatal: {component} failed at lsa {lsa}: {reason}");
        std::process::exit(FATAL_EXIT_CODE);
    }
}

fn parse_lsa(value: &str) -> Result<Lsa, String> {
    let (page, offset) = value
        .split_once(':')
        .ok_or_else(|| "expected PAGE:OFFSET".to_string())?;
    Ok(Lsa::new(
        page.parse().map_err(|_| format!("bad page id {page:?}"))?,
        offset.parse().map_err(|_| format!("bad offset {offset:?}"))?,
    ))
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging(&cli.log_level) {
        eprintln!("warning: {err}");
    }
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn build_config(args: &OpenArgs) -> Result<LogConfig, Box<dyn Error>> {
    let mut config = LogConfig::resolve(args.config.as_deref())?;
    if let Some(dir) = &args.dir {
        config.log_dir = dir.clone();
    }
    if let Some(prefix) = &args.prefix {
        config.prefix = prefix.clone();
    }
    if let Some(page_size) = args.page_size {
        config.page_size = page_size;
    }
    if let Some(active_pages) = args.active_pages {
        config.active_pages = active_pages;
    }
    if let Some(max_archives) = args.max_archives {
        config.max_archives = max_archives;
    }
    config.validate()?;
    Ok(config)
}

fn open_engine(config: LogConfig) -> Result<Arc<LogEngine>, Box<dyn Error>> {
    let collaborators = Collaborators {
        fatal_sink: Arc::new(ExitFatalSink),
        ..Collaborators::default()
    };
    Ok(LogEngine::open(config, collaborators)?)
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = build_config(&cli.open)?;
    if let Command::Pull(cmd) = &cli.command {
        config.writer.async_poll_ms = cmd.poll_ms;
    }
    let engine = open_engine(config)?;
    let format = cli.format;

    match cli.command {
        Command::Create | Command::Info => {
            let report = InfoReport::collect(&engine);
            emit(&format, &report, |_| print_info_text(&report))?;
        }
        Command::Append(cmd) => {
            let report = run_append(&engine, &cmd)?;
            emit(&format, &report, |_| {
                println!(
                    "Appended {} records ({} bytes) from {} threads in {:.2} ms; durable={}",
                    report.records,
                    report.bytes,
                    report.threads,
                    report.elapsed_ms,
                    report.durable_lsa
                )
            })?;
        }
        Command::Commit { data } => {
            let trid = engine.begin_transaction();
            let record_lsa = engine.append(LogRecord::undo_redo(trid, data.into_bytes()))?;
            let commit_lsa = engine.commit(trid)?;
            let report = CommitReport {
                trid,
                record_lsa,
                commit_lsa,
                durable_lsa: engine.durable_lsa(),
            };
            emit(&format, &report, |_| {
                println!(
                    "Transaction {} committed: record={} commit={} durable={}",
                    report.trid, report.record_lsa, report.commit_lsa, report.durable_lsa
                )
            })?;
        }
        Command::Archive => {
            let entry = engine.archive_now()?;
            emit(&format, &entry, |_| match &entry {
                Some(entry) => println!(
                    "Archive {} holds pages {}..{} ({})",
                    entry.number, entry.first_page_id, entry.last_page_id, entry.file
                ),
                None => println!("Nothing to archive"),
            })?;
        }
        Command::Archives => {
            let entries = engine.archives()?;
            emit(&format, &entries, |_| {
                if entries.is_empty() {
                    println!("No archives");
                }
                for entry in &entries {
                    println!(
                        "{:>6}  pages {}..{}  {}",
                        entry.number, entry.first_page_id, entry.last_page_id, entry.file
                    );
                }
            })?;
        }
        Command::Purge => {
            let removed = engine.purge_archives()?;
            emit(&format, &removed, |_| {
                println!("Removed {} archive(s)", removed.len());
            })?;
        }
        Command::Checkpoint => {
            let outcome = engine.checkpoint()?;
            emit(&format, &outcome, |_| {
                println!(
                    "Checkpoint at {} (redo from {}, {} active transactions)",
                    outcome.checkpoint_lsa, outcome.redo_lsa, outcome.active_transactions
                )
            })?;
        }
        Command::DumpPage { page_id, bytes } => {
            let page = engine.reader().read_page(page_id)?;
            let shown = bytes.min(page.body_len());
            let report = PageReport {
                page_id: page.page_id(),
                first_record_offset: page.first_record_offset(),
                continuation: page.is_continuation(),
                checksum_ok: page.checksum_ok(),
                body_hex: hex::encode(&page.body()[..shown]),
            };
            emit(&format, &report, |_| {
                println!(
                    "Page {} first_record={} continuation={} checksum_ok={}",
                    report.page_id,
                    report.first_record_offset,
                    report.continuation,
                    report.checksum_ok
                );
                for line in report.body_hex.as_bytes().chunks(64) {
                    println!("  {}", String::from_utf8_lossy(line));
                }
            })?;
        }
        Command::Scan { from, limit } => {
            let from = match from {
                Some(lsa) => lsa,
                None => engine.reader().first_record_from(0)?,
            };
            let records = engine
                .reader()
                .scan(from)?
                .take(limit.unwrap_or(usize::MAX))
                .map(|r| r.map(ScanLine::from))
                .collect::<Result<Vec<_>, _>>()?;
            emit(&format, &records, |_| {
                for line in &records {
                    println!(
                        "{:<14} {:<14} trid={:<6} {:<14} len={}",
                        line.lsa, line.forw_lsa, line.trid, line.rectype, line.data_len
                    );
                }
            })?;
        }
        Command::Pull(cmd) => {
            let consumer = engine.writers().register();
            let request = PullRequest {
                first_page_id: cmd.first,
                mode: cmd.mode.into(),
                compressed: cmd.compressed,
            };
            let response = engine.pull(consumer, request)?;
            engine.writers().disconnect(consumer);
            let report = PullReport {
                status: format!("{:?}", response.status),
                batch_size: response.batch_size,
                first_page_id: response.first_page_id,
                page_count: response.page_count,
                server_state: format!("{:?}", response.server_state),
                eof_lsa: response.eof_lsa,
                compressed: response.payload.is_compressed(),
                wire_bytes: response.encode().len(),
            };
            emit(&format, &report, |_| {
                println!(
                    "{} pages {}+{} eof={} compressed={} wire_bytes={}",
                    report.status,
                    report.first_page_id,
                    report.page_count,
                    report.eof_lsa,
                    report.compressed,
                    report.wire_bytes
                )
            })?;
        }
    }

    engine.shutdown()?;
    Ok(())
}

fn run_append(engine: &Arc<LogEngine>, cmd: &AppendCmd) -> Result<AppendReport, Box<dyn Error>> {
    let started = Instant::now();
    let handles: Vec<_> = (0..cmd.threads.max(1))
        .map(|_| {
            let engine = Arc::clone(engine);
            let (records, size, commit_every) = (cmd.records, cmd.size, cmd.commit_every);
            thread::spawn(move || -> arclog::Result<u64> {
                let mut rng = rand::thread_rng();
                let mut trid = engine.begin_transaction();
                let mut bytes = 0u64;
                for i in 1..=records {
                    let mut payload = vec![0u8; size];
                    rng.fill_bytes(&mut payload);
                    bytes += payload.len() as u64;
                    engine.append(LogRecord::undo_redo(trid, payload))?;
                    if commit_every > 0 && i % commit_every == 0 {
                        engine.commit(trid)?;
                        trid = engine.begin_transaction();
                    }
                }
                engine.commit(trid)?;
                Ok(bytes)
            })
        })
        .collect();
    let mut bytes = 0u64;
    for handle in handles {
        bytes += handle
            .join()
            .map_err(|_| "append worker panicked".to_string())??;
    }
    let durable_lsa = engine.flush()?;
    Ok(AppendReport {
        threads: cmd.threads.max(1),
        records: cmd.records * cmd.threads.max(1),
        bytes,
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        durable_lsa,
    })
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

#[derive(Serialize)]
struct InfoReport {
    prefix: String,
    page_size: u32,
    active_pages: u32,
    next_trid: i32,
    append_lsa: Lsa,
    durable_lsa: Lsa,
    checkpoint_lsa: Lsa,
    redo_lsa: Lsa,
    next_archive_page_id: i64,
    next_archive_num: i32,
    lowest_archive_num: i32,
    stats: arclog::stats::LogStatsSnapshot,
}

impl InfoReport {
    fn collect(engine: &LogEngine) -> Self {
        let header = engine.header();
        Self {
            prefix: header.prefix,
            page_size: header.page_size,
            active_pages: header.active_pages,
            next_trid: header.next_trid,
            append_lsa: engine.next_lsa(),
            durable_lsa: engine.durable_lsa(),
            checkpoint_lsa: header.checkpoint_lsa,
            redo_lsa: header.redo_lsa,
            next_archive_page_id: header.next_archive_page_id,
            next_archive_num: header.next_archive_num,
            lowest_archive_num: header.lowest_archive_num,
            stats: engine.stats(),
        }
    }
}

fn print_info_text(report: &InfoReport) {
    println!(
        "Log {:?}: page_size={} active_pages={}",
        report.prefix, report.page_size, report.active_pages
    );
    println!(
        "  append={} durable={} next_trid={}",
        report.append_lsa, report.durable_lsa, report.next_trid
    );
    println!(
        "  checkpoint={} redo={}",
        report.checkpoint_lsa, report.redo_lsa
    );
    println!(
        "  next_archive_page={} next_archive_num={} lowest_archive_num={}",
        report.next_archive_page_id, report.next_archive_num, report.lowest_archive_num
    );
    let stats = &report.stats;
    println!(
        "Stats: records={} flushes={} pages_written={} fsyncs={} archives={} checkpoints={}",
        stats.records_appended,
        stats.flushes,
        stats.pages_written,
        stats.fsyncs,
        stats.archives_created,
        stats.checkpoints
    );
}

#[derive(Serialize)]
struct AppendReport {
    threads: usize,
    records: usize,
    bytes: u64,
    elapsed_ms: f64,
    durable_lsa: Lsa,
}

#[derive(Serialize)]
struct CommitReport {
    trid: i32,
    record_lsa: Lsa,
    commit_lsa: Lsa,
    durable_lsa: Lsa,
}

#[derive(Serialize)]
struct PageReport {
    page_id: i64,
    first_record_offset: i32,
    continuation: bool,
    checksum_ok: bool,
    body_hex: String,
}

#[derive(Serialize)]
struct ScanLine {
    lsa: Lsa,
    forw_lsa: Lsa,
    trid: i32,
    rectype: String,
    data_len: u32,
}

impl From<ScannedRecord> for ScanLine {
    fn from(record: ScannedRecord) -> Self {
        Self {
            lsa: record.lsa,
            forw_lsa: record.header.forw_lsa,
            trid: record.header.trid,
            rectype: format!("{:?}", record.header.rectype),
            data_len: record.header.data_len,
        }
    }
}

#[derive(Serialize)]
struct PullReport {
    status: String,
    batch_size: i32,
    first_page_id: i64,
    page_count: i32,
    server_state: String,
    eof_lsa: Lsa,
    compressed: bool,
    wire_bytes: usize,
}
