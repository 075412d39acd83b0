use std::process::ExitCode;
use clap::Parser;
use log::{error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use sift::core::config::Config;
use sift::core::error::{Error, Result};
use sift::server::proto::{
    NetReader, NetWriter, CLIENT_VERSION, COMMAND_STATUS, SEARCHD_PROTO,
    SEARCHD_PROTO_SWAPPED, STATUS_OK, VER_COMMAND_STATUS,
};
use sift::server::{self, ServerCtx};

/// Query daemon.
#[derive(Parser, Debug)]
#[command(name = "searchd", version, about = "sift search daemon")]
struct Args {
    /// Configuration file path.
    #[arg(long, default_value = "sift.json")]
    config: String,

    /// Log to the console instead of the log file.
    #[arg(long)]
    console: bool,

    /// Stop a running daemon (reads the pid file) and exit.
    #[arg(long)]
    stop: bool,

    /// Query a running daemon's status and exit.
    #[arg(long)]
    status: bool,

    /// Override the first listener's port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the listener list entirely.
    #[arg(long)]
    listen: Vec<String>,

    /// Serve only the named index.
    #[arg(long)]
    index: Option<String>,

    /// Stay in the foreground (the daemon never forks; accepted for
    /// command line compatibility).
    #[arg(long)]
    nodetach: bool,

    /// Log per-query IO stats.
    #[arg(long)]
    iostats: bool,

    /// Log per-query CPU stats.
    #[arg(long)]
    cpustats: bool,
}

fn stop_daemon(config: &Config) -> Result<()> {
    let text = std::fs::read_to_string(&config.searchd.pid_file).map_err(|e| {
        Error::io(format!("cannot read pid file {}: {}", config.searchd.pid_file, e))
    })?;
    let pid: i32 = text
        .trim()
        .parse()
        .map_err(|_| Error::io("bad pid file contents".to_string()))?;
    #[cfg(unix)]
    unsafe {
        if libc::kill(pid, libc::SIGTERM) != 0 {
            return Err(Error::io(format!("failed to signal pid {}", pid)));
        }
    }
    println!("stop: sent SIGTERM to pid {}", pid);
    Ok(())
}

async fn query_status(config: &Config) -> Result<()> {
    for spec in &config.searchd.listen {
        let listen = server::parse_listen(spec)?;
        if listen.protocol != server::Protocol::Sphinx {
            continue;
        }
        let mut stream = tokio::net::TcpStream::connect(&listen.addr)
            .await
            .map_err(|e| Error::io(format!("connect to {} failed: {}", listen.addr, e)))?;

        let hello = stream.read_u32().await?;
        if hello != SEARCHD_PROTO && hello != SEARCHD_PROTO_SWAPPED {
            return Err(Error::protocol(format!("bad handshake from {}", listen.addr)));
        }
        stream.write_u32(CLIENT_VERSION).await?;

        let mut frame = NetWriter::new();
        frame.put_u16(COMMAND_STATUS);
        frame.put_u16(VER_COMMAND_STATUS);
        frame.put_u32(4);
        frame.put_u32(1);
        stream.write_all(&frame.into_bytes()).await?;

        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await?;
        let status = u16::from_be_bytes([header[0], header[1]]);
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await?;
        if status != STATUS_OK {
            let mut r = NetReader::new(&body);
            return Err(Error::protocol(r.read_string().unwrap_or_default()));
        }

        let mut r = NetReader::new(&body);
        let rows = r.read_u32()?;
        let _cols = r.read_u32()?;
        println!("searchd status ({})", listen.addr);
        for _ in 0..rows {
            let key = r.read_string()?;
            let value = r.read_string()?;
            println!("{:24}{}", key, value);
        }
        return Ok(());
    }
    Err(Error::config("no sphinx-protocol listener configured".to_string()))
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.stop {
        return match stop_daemon(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    // listener overrides
    if !args.listen.is_empty() {
        config.searchd.listen = args.listen.clone();
    } else if let Some(port) = args.port {
        config.searchd.listen = vec![format!("0.0.0.0:{}", port)];
    }
    if let Some(only) = &args.index {
        if !config.indexes.contains_key(only) {
            eprintln!("unknown index '{}'", only);
            return ExitCode::FAILURE;
        }
        config.indexes.retain(|name, _| name == only);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.status {
        return match runtime.block_on(query_status(&config)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    // logging: console, or append to the configured daemon log
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(log::LevelFilter::Info);
    if !args.console {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.searchd.log)
        {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("cannot open log {}: {}", config.searchd.log, e);
                return ExitCode::FAILURE;
            }
        }
    }
    builder.init();

    if args.iostats || args.cpustats {
        info!("per-query io/cpu stats logging enabled");
    }

    if let Err(e) = std::fs::write(&config.searchd.pid_file, format!("{}\n", std::process::id())) {
        error!("cannot write pid file {}: {}", config.searchd.pid_file, e);
        return ExitCode::FAILURE;
    }

    let outcome = runtime.block_on(async {
        let ctx = ServerCtx::new(config.clone())?;
        info!("accepting connections");
        server::run(ctx).await
    });

    let _ = std::fs::remove_file(&config.searchd.pid_file);
    match outcome {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
