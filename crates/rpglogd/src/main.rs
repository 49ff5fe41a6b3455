//! rpglogd - PostgreSQL log collector daemon.
//!
//! Tails the log files of one or more PostgreSQL servers, classifies log
//! lines and query samples, and spools compressed batches to disk.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use rpglog_core::collector::log_collector::DEFAULT_QUEUE_SIZE;
use rpglog_core::collector::log_collector::locate::LogfileWatcher;
use rpglog_core::collector::log_collector::parser::PrefixFormat;
use rpglog_core::collector::log_collector::tailer::{FileMarker, FileTailer};
use rpglog_core::collector::{CollectorOptions, LogCollector, LogSourceSender, RawLogLine};
use rpglog_core::config::{LogTimezone, ServerConfig, parse_timezone};
use rpglog_core::storage::{AgentState, SpoolSender};

/// How often a file source polls for new lines.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How often to re-check pg_current_logfile() for rotation.
const LOG_ROTATION_CHECK: Duration = Duration::from_secs(60);

/// PostgreSQL log collector daemon.
#[derive(Parser)]
#[command(name = "rpglogd", about = "PostgreSQL log collector daemon", version)]
struct Args {
    /// Server to collect logs from, as NAME=PATH. May be repeated.
    #[arg(long = "server", value_name = "NAME=PATH", value_parser = ServerConfig::from_arg)]
    servers: Vec<ServerConfig>,

    /// log_line_prefix format: "auto", a format name or the prefix itself.
    #[arg(long, default_value = "auto")]
    prefix: String,

    /// Timezone of zone-less timestamps: UTC or an offset like +02:00.
    /// Defaults to log_timezone with --postgres, UTC otherwise.
    #[arg(long, value_parser = parse_timezone)]
    timezone: Option<LogTimezone>,

    /// Discover the local server's log file, prefix and timezone.
    /// Uses PGHOST, PGPORT, PGUSER, PGPASSWORD and PGDATABASE.
    #[arg(long)]
    postgres: bool,

    /// Server name used for the discovered server.
    #[arg(long, default_value = "local")]
    postgres_name: String,

    /// Directory receiving batch files.
    #[arg(long, default_value = "./spool")]
    spool_dir: PathBuf,

    /// Where file positions and detected formats are kept across restarts.
    #[arg(long, default_value = "./rpglogd-state.json")]
    state_file: PathBuf,

    /// Flush interval in seconds.
    #[arg(short, long, default_value = "1")]
    interval: u64,

    /// Capacity of each server's line queue, in messages.
    #[arg(long, default_value_t = DEFAULT_QUEUE_SIZE)]
    queue_size: usize,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("rpglogd={}", level).parse().unwrap())
        .add_directive(format!("rpglog_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// A server to run, with the rotation watcher when it was discovered.
struct ServerSetup {
    config: ServerConfig,
    watcher: Option<LogfileWatcher>,
}

/// Applies command-line prefix and timezone to every server and adds the
/// discovered local server when `--postgres` is set.
fn build_servers(args: &Args) -> Result<Vec<ServerSetup>, String> {
    let prefix = PrefixFormat::from_setting(&args.prefix).map_err(|e| e.to_string())?;
    let mut servers: Vec<ServerSetup> = args
        .servers
        .iter()
        .cloned()
        .map(|mut config| {
            config.prefix_format = prefix;
            if let Some(tz) = args.timezone {
                config.timezone = tz;
            }
            ServerSetup {
                config,
                watcher: None,
            }
        })
        .collect();

    if args.postgres {
        let (watcher, settings) = LogfileWatcher::connect().map_err(|e| e.to_string())?;
        let log_path = settings.log_path().ok_or_else(|| {
            "pg_current_logfile() returned no result (is logging_collector on?)".to_string()
        })?;

        let mut config = ServerConfig::new(args.postgres_name.clone());
        config.log_path = Some(log_path);
        config.prefix_format = prefix.or_else(|| settings.prefix_format());
        let discovered = settings.timezone();
        if args.timezone.is_none()
            && discovered.is_none()
            && let Some(tz) = settings.log_timezone.as_deref()
        {
            warn!(
                server = %config.name,
                log_timezone = tz,
                "log_timezone is not recognized, interpreting timestamps as UTC"
            );
        }
        config.timezone = args.timezone.or(discovered).unwrap_or(config.timezone);

        if config.prefix_format.is_none()
            && let Some(prefix) = settings.log_line_prefix.as_deref()
        {
            warn!(
                server = %config.name,
                log_line_prefix = prefix,
                "log_line_prefix is not a supported layout, falling back to auto-detection"
            );
        }

        servers.push(ServerSetup {
            config,
            watcher: Some(watcher),
        });
    }

    let mut names: Vec<&str> = servers.iter().map(|s| s.config.name.as_str()).collect();
    names.sort_unstable();
    if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
        return Err(format!("duplicate server name '{}'", dup[0]));
    }

    Ok(servers)
}

/// Merges the committed state of every collector into `state` and saves it.
fn save_state(state: &mut AgentState, collectors: &[LogCollector], path: &Path) {
    for collector in collectors {
        state.server_mut(collector.server()).merge(collector.state());
    }
    if let Err(e) = state.save(path) {
        warn!(path = %path.display(), error = %e, "failed to save state");
    }
}

/// Reads `tailer` until the collector goes away or shutdown is requested.
fn run_file_source(
    mut tailer: FileTailer,
    source: LogSourceSender,
    mut watcher: Option<LogfileWatcher>,
    running: Arc<AtomicBool>,
) {
    let mut last_rotation_check = Instant::now();

    while running.load(Ordering::SeqCst) {
        if !forward_new_lines(&mut tailer, &source) {
            break;
        }

        if let Some(w) = watcher.as_mut()
            && last_rotation_check.elapsed() >= LOG_ROTATION_CHECK
        {
            last_rotation_check = Instant::now();
            match w.current_path() {
                Ok(path) if path != tailer.path() => {
                    // Drain the old file before moving on.
                    forward_new_lines(&mut tailer, &source);
                    info!(
                        from = %tailer.path().display(),
                        to = %path.display(),
                        "log file rotated"
                    );
                    if let Err(e) = tailer.switch_file(path) {
                        warn!(error = %e, "cannot open rotated log file");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "cannot check current log file"),
            }
        }

        thread::sleep(POLL_INTERVAL);
    }

    debug!(path = %tailer.path().display(), dropped = source.dropped(), "file source stopped");
}

/// Returns `false` once the collector no longer accepts lines.
fn forward_new_lines(tailer: &mut FileTailer, source: &LogSourceSender) -> bool {
    let lines = match tailer.read_new_lines() {
        Ok(lines) => lines,
        Err(e) => {
            warn!(path = %tailer.path().display(), error = %e, "failed to read log file");
            return true;
        }
    };
    if lines.is_empty() {
        return true;
    }

    let raw = lines.into_iter().map(RawLogLine::from).collect();
    source.send_lines(raw) && source.send_marker(tailer.path().to_path_buf(), tailer.marker())
}

fn spawn_file_source(
    config: &ServerConfig,
    marker: Option<FileMarker>,
    source: LogSourceSender,
    watcher: Option<LogfileWatcher>,
    running: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let path = config.log_path.clone()?;
    let tailer = match FileTailer::resume(path.clone(), marker) {
        Ok(t) => t,
        Err(e) => {
            error!(
                server = %config.name,
                path = %path.display(),
                error = %e,
                "cannot open log file"
            );
            return None;
        }
    };
    info!(
        server = %config.name,
        path = %path.display(),
        offset = tailer.marker().offset,
        "tailing log file"
    );

    thread::Builder::new()
        .name(format!("rpglog-tail-{}", config.name))
        .spawn(move || run_file_source(tailer, source, watcher, running))
        .map_err(|e| error!(server = %config.name, error = %e, "cannot start file source"))
        .ok()
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    info!(
        "rpglogd {} ({}) starting",
        env!("CARGO_PKG_VERSION"),
        rpglog_core::BUILD_SHA
    );

    let servers = match build_servers(&args) {
        Ok(servers) if servers.is_empty() => {
            eprintln!("No servers configured: use --server NAME=PATH or --postgres");
            std::process::exit(1);
        }
        Ok(servers) => servers,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let mut state = AgentState::load(&args.state_file);
    let options = CollectorOptions {
        queue_size: args.queue_size,
        flush_interval: Duration::from_secs(args.interval.max(1)),
    };
    info!(
        "Config: interval={}s, spool={}, state={}, queue={}",
        options.flush_interval.as_secs(),
        args.spool_dir.display(),
        args.state_file.display(),
        options.queue_size
    );

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let mut collectors = Vec::new();
    let mut sources = Vec::new();

    for ServerSetup {
        mut config,
        watcher,
    } in servers
    {
        let saved = state.server(&config.name).cloned().unwrap_or_default();
        if config.prefix_format.is_none() {
            config.prefix_format = saved.prefix_format;
        }
        let marker = config
            .log_path
            .as_deref()
            .and_then(|p| state.marker(&config.name, p));

        let sender = match SpoolSender::new(&args.spool_dir) {
            Ok(s) => s,
            Err(e) => {
                error!(
                    spool = %args.spool_dir.display(),
                    error = %e,
                    "cannot open spool directory"
                );
                std::process::exit(1);
            }
        };

        let collector = match LogCollector::spawn(config.clone(), Box::new(sender), options) {
            Ok(c) => c,
            Err(e) => {
                error!(server = %config.name, error = %e, "cannot start log collector");
                continue;
            }
        };

        if let Some(source) = collector.source()
            && let Some(handle) =
                spawn_file_source(&config, marker, source, watcher, running.clone())
        {
            sources.push(handle);
        }
        collectors.push(collector);
    }

    if collectors.is_empty() {
        error!("No collector could be started");
        std::process::exit(1);
    }

    info!("Starting collection loop");

    let interval = options.flush_interval;
    while running.load(Ordering::SeqCst) {
        // Sleep with periodic checks for shutdown signal
        let sleep_interval = Duration::from_millis(100);
        let mut remaining = interval;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let sleep_time = remaining.min(sleep_interval);
            thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }

        save_state(&mut state, &collectors, &args.state_file);
        for collector in &collectors {
            let dropped = collector.dropped();
            if dropped > 0 {
                debug!(server = collector.server(), dropped, "queue drops so far");
            }
        }
    }

    // Graceful shutdown
    info!("Shutting down...");

    for handle in sources {
        if handle.join().is_err() {
            warn!("file source thread panicked");
        }
    }
    for collector in collectors {
        let name = collector.server().to_string();
        let final_state = collector.shutdown();
        state.server_mut(&name).merge(final_state);
    }
    if let Err(e) = state.save(&args.state_file) {
        error!(path = %args.state_file.display(), error = %e, "failed to save state on shutdown");
    }

    info!("Shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_servers_inherit_prefix_and_timezone() {
        let args = parse(&[
            "rpglogd",
            "--server",
            "a=/var/log/a.log",
            "--server",
            "b=/var/log/b.log",
            "--prefix",
            "%m [%p-%l] %q%u@%d ",
            "--timezone",
            "+02:00",
        ]);
        let servers = build_servers(&args).unwrap();
        assert_eq!(servers.len(), 2);
        for s in &servers {
            assert_eq!(s.config.prefix_format, Some(PrefixFormat::TimePidLineUserDb));
            assert_eq!(s.config.timezone, parse_timezone("+02:00").unwrap());
            assert!(s.watcher.is_none());
        }
        assert_eq!(servers[1].config.log_path, Some(PathBuf::from("/var/log/b.log")));
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["rpglogd", "--server", "a=/a.log"]);
        assert_eq!(args.prefix, "auto");
        assert_eq!(args.timezone, None);
        assert_eq!(args.queue_size, DEFAULT_QUEUE_SIZE);
        let servers = build_servers(&args).unwrap();
        assert_eq!(servers[0].config.timezone, LogTimezone::default());
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(Args::try_parse_from(["rpglogd", "--server", "no-equals"]).is_err());
        assert!(Args::try_parse_from(["rpglogd", "--timezone", "Mars/Olympus"]).is_err());
    }

    #[test]
    fn test_named_timezone_accepted() {
        let args = parse(&[
            "rpglogd",
            "--server",
            "a=/a.log",
            "--timezone",
            "Europe/Paris",
        ]);
        let servers = build_servers(&args).unwrap();
        assert_eq!(servers[0].config.timezone.to_string(), "Europe/Paris");
    }

    #[test]
    fn test_unsupported_prefix() {
        let args = parse(&["rpglogd", "--server", "a=/a.log", "--prefix", "%t [%p] "]);
        assert!(build_servers(&args).is_err());
    }

    #[test]
    fn test_duplicate_server_names() {
        let args = parse(&["rpglogd", "--server", "a=/1.log", "--server", "a=/2.log"]);
        assert!(build_servers(&args).is_err());
    }
}
