//! httpwatch - TLS and HTTP interception sensor
//!
//! Replays recorded probe traces through the capture engine, lists the hook
//! manifest, prints or writes the configuration and reports host capabilities.

mod replay;

use clap::{Parser, Subcommand};
use httpwatch_capture::probe::{SOCKET_FILTER_SECTION, TCP_SENDMSG_SECTION};
use httpwatch_capture::{
    CaptureEngine, HookKind, HookPoint, ProbeContext, SnapshotMemory, SocketTable,
};
use httpwatch_core::{CollectingSink, ConfigLoader, ConnTuple, HttpwatchConfig, LibraryTag};
use replay::Replayer;
use std::io::{BufReader, BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "httpwatch")]
#[command(version)]
#[command(about = "TLS and HTTP interception sensor", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "HTTPWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed a recorded probe trace (JSONL) through the engine
    Replay {
        /// Input trace
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for JSONL events (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print engine metrics when done (json, prometheus)
        #[arg(long)]
        metrics: Option<String>,

        /// Filter by PID
        #[arg(long)]
        pid: Option<Vec<u32>>,
    },

    /// List every hook point and its attachment section
    Hooks {
        /// Only entry or only return hooks
        #[arg(long)]
        kind: Option<String>,
    },

    /// Print the effective configuration, or write it to a file
    Config {
        /// Write to this path instead of printing
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write to the user config path
        #[arg(long, conflicts_with = "output")]
        init: bool,
    },

    /// Show sensor status and capabilities
    Status,

    /// Self-test the capture engine
    Test,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.sensor.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Replay {
            input,
            output,
            metrics,
            pid,
        } => {
            let mut config = config;
            if let Some(pids) = pid {
                config.capture.pid_filter = pids;
            }
            replay_command(&config, &input, output, metrics.as_deref()).await
        }
        Commands::Hooks { kind } => hooks_command(kind.as_deref()).await,
        Commands::Config { output, init } => config_command(&config, output, init).await,
        Commands::Status => status_command(&config).await,
        Commands::Test => test_command().await,
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> HttpwatchConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            warn!("Failed to load configuration: {}, using defaults", e);
            HttpwatchConfig::default()
        }
    }
}

async fn replay_command(
    config: &HttpwatchConfig,
    input: &PathBuf,
    output: Option<PathBuf>,
    metrics: Option<&str>,
) -> anyhow::Result<()> {
    let replayer = Replayer::new(config);
    let reader = BufReader::new(std::fs::File::open(input)?);

    let summary = match output {
        Some(path) => {
            let writer = BufWriter::new(std::fs::File::create(&path)?);
            let summary = replayer.run(reader, writer)?;
            info!("Events written to {}", path.display());
            summary
        }
        None => replayer.run(reader, std::io::stdout().lock())?,
    };

    eprintln!(
        "Replayed {} records ({} hook invocations), {} events",
        summary.records, summary.hooks, summary.events
    );

    match metrics {
        Some("json") => {
            println!(
                "{}",
                serde_json::to_string_pretty(&replayer.engine().to_json())?
            );
        }
        Some("prometheus") => print!("{}", replayer.engine().to_prometheus()),
        Some(other) => anyhow::bail!("Unknown metrics format: {}", other),
        None => {}
    }

    Ok(())
}

async fn hooks_command(kind: Option<&str>) -> anyhow::Result<()> {
    let wanted = match kind {
        None => None,
        Some("entry") => Some(HookKind::Entry),
        Some("return") => Some(HookKind::Return),
        Some(other) => {
            anyhow::bail!("Unknown hook kind: {} (expected entry or return)", other)
        }
    };

    let mut stdout = std::io::stdout().lock();
    for hook in HookPoint::ALL {
        if wanted.is_some_and(|k| k != hook.kind()) {
            continue;
        }
        writeln!(stdout, "{:<48} {}", hook.section(), hook.symbol())?;
    }
    if wanted.is_none() {
        writeln!(stdout, "{:<48} tcp_sendmsg", TCP_SENDMSG_SECTION)?;
        writeln!(stdout, "{:<48} packet filter", SOCKET_FILTER_SECTION)?;
    }
    Ok(())
}

async fn config_command(
    config: &HttpwatchConfig,
    output: Option<PathBuf>,
    init: bool,
) -> anyhow::Result<()> {
    let target = if init {
        Some(ConfigLoader::default_config_path().ok_or_else(|| {
            anyhow::anyhow!("No user config directory (set HOME or XDG_CONFIG_HOME)")
        })?)
    } else {
        output
    };

    match target {
        Some(path) => {
            if init && path.exists() {
                anyhow::bail!("Config already exists: {}", path.display());
            }
            ConfigLoader::save(config, &path)?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{}", ConfigLoader::to_toml(config)?),
    }
    Ok(())
}

async fn status_command(config: &HttpwatchConfig) -> anyhow::Result<()> {
    println!();
    println!("httpwatch v{}", httpwatch_core::VERSION);
    println!();

    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    #[cfg(target_os = "linux")]
    {
        println!();
        println!("Linux Capabilities:");

        // Check if running as root
        let uid = unsafe { libc::getuid() };
        println!("  Running as root: {}", uid == 0);

        // Reading traced buffers goes through /proc/<pid>/mem
        let self_mem = std::path::Path::new("/proc/self/mem").exists();
        println!("  Process memory access: {}", self_mem);

        let ebpf_supported = std::path::Path::new("/sys/fs/bpf").exists();
        println!("  eBPF supported: {}", ebpf_supported);

        let btf_available = std::path::Path::new("/sys/kernel/btf/vmlinux").exists();
        println!("  BTF available: {}", btf_available);

        if let Ok(range) = std::fs::read_to_string("/proc/sys/net/ipv4/ip_local_port_range") {
            let bounds: Vec<&str> = range.split_whitespace().collect();
            println!("  Ephemeral ports (kernel): {}", bounds.join(".."));
        }

        if let Ok(release) = std::fs::read_to_string("/proc/sys/kernel/osrelease") {
            println!("  Kernel: {}", release.trim());
        }
    }

    println!();
    println!("Capture:");
    let c = &config.capture;
    for (name, enabled) in [
        (LibraryTag::NativeSsl.as_str(), c.native_ssl),
        (LibraryTag::GnutlsStyle.as_str(), c.gnutls),
        (LibraryTag::ManagedRuntime.as_str(), c.go_tls),
        (LibraryTag::Plaintext.as_str(), c.plaintext),
        ("library-loads", c.library_loads),
    ] {
        println!("  {:<16} {}", name, if enabled { "enabled" } else { "disabled" });
    }
    println!(
        "  Ephemeral ports (configured): {}..{}",
        config.ports.ephemeral_min, config.ports.ephemeral_max
    );
    println!();

    Ok(())
}

async fn test_command() -> anyhow::Result<()> {
    println!("Running capture engine self-test...\n");

    let memory = Arc::new(SnapshotMemory::new());
    let sockets = Arc::new(SocketTable::new());
    let sink = Arc::new(CollectingSink::new());
    let engine = CaptureEngine::new(
        &HttpwatchConfig::default(),
        memory.clone(),
        sockets.clone(),
        sink.clone(),
    );

    let (pid, tid) = (4242, 4242);
    let tuple = ConnTuple::tcp(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        50000,
        IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
        443,
    );
    sockets.bind(pid, 7, tuple);
    memory.insert(pid, 0x5000, b"GET / HTTP/1.1".to_vec());
    let ctx = ProbeContext::new(pid, tid);

    // Test 1: descriptor association and a write
    print!("  SSL_set_fd + SSL_write... ");
    engine.dispatch(HookPoint::SslSetFd, &ctx.with_params(&[0x10, 7]));
    engine.dispatch(HookPoint::SslWrite, &ctx.with_params(&[0x10, 0x5000, 14]));
    engine.dispatch(HookPoint::SslWriteReturn, &ctx.with_rc(14));
    let observed = sink.observed();
    let passed = observed.len() == 1 && observed[0].data == b"GET / HTTP/1.1";
    println!("{}", if passed { "OK" } else { "FAILED" });

    // Test 2: an exit with nothing pending is a no-op
    print!("  Unmatched exit... ");
    engine.dispatch(HookPoint::SslWriteReturn, &ctx.with_rc(14));
    let passed_unmatched = sink.observed().len() == 1;
    println!("{}", if passed_unmatched { "OK" } else { "FAILED" });

    // Test 3: teardown
    print!("  SSL_shutdown... ");
    engine.dispatch(HookPoint::SslShutdown, &ctx.with_params(&[0x10]));
    let passed_close = sink.closed().len() == 1;
    println!("{}", if passed_close { "OK" } else { "FAILED" });

    // Test 4: JSON serialization
    print!("  Event serialization... ");
    let json = serde_json::to_string(&sink.events())?;
    let _: Vec<httpwatch_core::CaptureEvent> = serde_json::from_str(&json)?;
    println!("OK");

    if passed && passed_unmatched && passed_close {
        println!("\nAll tests passed!\n");
        Ok(())
    } else {
        anyhow::bail!("Self-test failed")
    }
}
