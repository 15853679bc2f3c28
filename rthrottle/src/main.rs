use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use throttle::Clock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

fn parse_size(s: &str) -> Result<usize, String> {
    let bytes = s
        .trim()
        .parse::<bytesize::ByteSize>()
        .map_err(|error| error.to_string())?
        .as_u64();
    if bytes == 0 {
        return Err("size must be greater than zero".to_string());
    }
    usize::try_from(bytes).map_err(|error| error.to_string())
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rthrottle",
    version,
    about = "Copy data at a bandwidth that follows a time-of-day schedule",
    long_about = "`rthrottle` copies a file (or stdin) to a destination (or stdout) while keeping the average \
read rate at or below the rate of the schedule window currently in effect. Outside of every window the copy \
runs unthrottled.

EXAMPLE:
    # Limit to 64 KiB/s at night and 1 MiB/s during business hours
    rthrottle --window 00:00-06:00=64KiB --window 09:00-17:00=1MiB backup.tar -o /mnt/remote/backup.tar --summary"
)]
struct Args {
    // Schedule
    /// Throttling window in the form START-END=RATE (can be specified multiple times)
    ///
    /// START and END are times of day (HH:MM or HH:MM:SS), START must be earlier than END and
    /// END may be 24:00.
    /// RATE is in bytes per second and accepts suffixes like "64KiB" or "1MB". The first
    /// matching window wins.
    #[arg(short = 'w', long = "window", value_name = "SPEC", action = clap::ArgAction::Append, help_heading = "Schedule")]
    windows: Vec<throttle::WindowSpec>,

    /// Read windows from a schedule file (JSON or one START-END=RATE per line)
    #[arg(long, value_name = "PATH", conflicts_with = "windows", help_heading = "Schedule")]
    schedule_file: Option<std::path::PathBuf>,

    /// What to do if the byte counter overflows: fail-closed (default) or unthrottled
    #[arg(long, value_name = "POLICY", help_heading = "Schedule")]
    overflow_policy: Option<throttle::OverflowPolicy>,

    // Throttling
    /// Longest a single read may be delayed, e.g. "500ms", "5s"; reads fail instead of waiting longer
    ///
    /// If unspecified reads wait as long as needed.
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Throttling")]
    max_wait: Option<std::time::Duration>,

    /// Size of each read. Accepts suffixes like "4KiB", "1MiB"
    #[arg(
        long,
        default_value = "64KiB",
        value_name = "SIZE",
        value_parser = parse_size,
        help_heading = "Throttling"
    )]
    buffer_size: usize,

    // Progress & output
    /// Write to this file instead of stdout
    #[arg(short = 'o', long, value_name = "PATH", help_heading = "Progress & output")]
    output: Option<std::path::PathBuf>,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // ARGUMENTS
    /// File to read, "-" for stdin
    #[arg(default_value = "-")]
    input: std::path::PathBuf,
}

#[derive(Debug, Default, Clone, Copy)]
struct Summary {
    bytes_copied: u64,
    elapsed: std::time::Duration,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let millis = self.elapsed.as_millis().max(1);
        let rate = u128::from(self.bytes_copied) * 1000 / millis;
        write!(
            f,
            "bytes copied: {}\n\
            elapsed: {}\n\
            average rate: {}/s",
            bytesize::ByteSize(self.bytes_copied),
            humantime::format_duration(std::time::Duration::from_millis(
                u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
            )),
            bytesize::ByteSize(u64::try_from(rate).unwrap_or(u64::MAX))
        )
    }
}

fn load_config(args: &Args) -> Result<throttle::ScheduleConfig> {
    let mut config = match &args.schedule_file {
        Some(path) => throttle::ScheduleConfig::from_file(path)?,
        None => throttle::ScheduleConfig::new(args.windows.clone()),
    };
    if let Some(policy) = args.overflow_policy {
        config.overflow_policy = policy;
    }
    Ok(config)
}

async fn open_input(
    path: &std::path::Path,
) -> Result<Box<dyn tokio::io::AsyncRead + Unpin + Send>> {
    if path == std::path::Path::new("-") {
        return Ok(Box::new(tokio::io::stdin()));
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {path:?} for reading"))?;
    Ok(Box::new(file))
}

async fn open_output(
    path: Option<&std::path::Path>,
) -> Result<Box<dyn tokio::io::AsyncWrite + Unpin + Send>> {
    match path {
        None => Ok(Box::new(tokio::io::stdout())),
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("cannot open {path:?} for writing"))?;
            Ok(Box::new(file))
        }
    }
}

#[instrument]
async fn async_main(args: Args) -> Result<Summary> {
    let config = load_config(&args)?;
    let throttler = Arc::new(config.build_throttler().context("invalid schedule")?);
    tracing::info!("schedule:\n{}", throttler.schedule());
    tracing::info!(
        "current target rate: {}",
        throttler
            .schedule()
            .active_rate(&throttle::SystemClock.now())
    );
    let factory = throttle::ThrottledReaderFactory::new(throttler).with_max_wait(args.max_wait);
    let mut reader = factory.create_async(open_input(&args.input).await?);
    let mut writer = open_output(args.output.as_deref()).await?;
    let start = std::time::Instant::now();
    let mut summary = Summary::default();
    let mut buffer = vec![0u8; args.buffer_size];
    loop {
        let size = reader
            .read(&mut buffer)
            .await
            .with_context(|| format!("failed reading {:?}", &args.input))?;
        if size == 0 {
            break;
        }
        writer
            .write_all(&buffer[..size])
            .await
            .context("failed writing output")?;
        summary.bytes_copied += u64::try_from(size).unwrap_or(u64::MAX);
        tracing::trace!("copied {} bytes so far", summary.bytes_copied);
    }
    writer.flush().await.context("failed flushing output")?;
    summary.elapsed = start.elapsed();
    Ok(summary)
}

fn init_logging(quiet: bool, verbose: u8) {
    let level = if quiet {
        "off"
    } else {
        match verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    // stdout may carry the copied data
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.quiet, args.verbose);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the tokio runtime")?;
    match runtime.block_on(async_main(args.clone())) {
        Ok(summary) => {
            if args.summary {
                eprintln!("{summary}");
            }
            Ok(())
        }
        Err(error) => {
            tracing::error!("{:#}", &error);
            std::process::exit(1);
        }
    }
}
