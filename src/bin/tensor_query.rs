//! Tensor query CLI binary.
//!
//! # Commands
//!
//! - `serve` - Run a query server that echoes every frame to its session
//! - `query` - Connect, send frames and report round-trip latency
//! - `caps` - Parse a capability string and print it as JSON

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use tensor_query::{
    CapabilityDescriptor, Config, ConnectType, Frame, QueryClient, QueryServer, VERSION,
};

#[derive(Parser)]
#[command(name = "tensor-query")]
#[command(version = VERSION)]
#[command(about = "Tensor query offloading - remote pipeline segments over TCP/UDP", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/tensor-query/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Endpoint overrides shared by `serve` and `query`
#[derive(Args)]
struct EndpointArgs {
    /// Host to bind or connect to
    #[arg(long)]
    host: Option<String>,

    /// Port
    #[arg(short, long)]
    port: Option<u16>,

    /// Transport: tcp, udp, hybrid
    #[arg(short = 't', long)]
    connect_type: Option<ConnectType>,

    /// Timeout in seconds
    #[arg(long)]
    timeout: Option<u32>,

    /// Capability string, e.g. other/tensors,num_tensors=1,dimensions=3:4,types=uint8
    #[arg(long)]
    caps: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo query server
    Serve {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Accept offers against wildcard (0) dimensions
        #[arg(long)]
        allow_wildcard: bool,
    },

    /// Send frames to a query server
    Query {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Number of frames to send
        #[arg(short = 'n', long, default_value = "10")]
        count: u32,

        /// Log every frame
        #[arg(long)]
        no_silent: bool,
    },

    /// Parse a capability string and print it as JSON
    Caps {
        /// Capability string
        caps: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Caps { caps } => cmd_caps(&caps),
        Commands::Serve {
            endpoint,
            allow_wildcard,
        } => {
            let config = load_config(cli.config, &endpoint)?;
            run(cmd_serve(config, allow_wildcard))
        },
        Commands::Query {
            endpoint,
            count,
            no_silent,
        } => {
            let config = load_config(cli.config, &endpoint)?;
            run(cmd_query(config, count, !no_silent))
        },
    }
}

fn run<F>(future: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(future)
}

/// File (or default location), then environment, then command-line flags.
fn load_config(path: Option<PathBuf>, args: &EndpointArgs) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?.overlay_env(),
        None => Config::load()?,
    };

    for endpoint in [&mut config.server.endpoint, &mut config.client.config.endpoint] {
        if let Some(host) = &args.host {
            endpoint.host.clone_from(host);
        }
        if let Some(port) = args.port {
            endpoint.port = port;
        }
        if let Some(connect_type) = args.connect_type {
            endpoint.connect_type = connect_type;
        }
        if let Some(timeout) = args.timeout {
            endpoint.timeout_secs = timeout;
        }
    }
    if let Some(caps) = &args.caps {
        config.server.caps = Some(caps.clone());
        config.client.caps = Some(caps.clone());
    }
    Ok(config)
}

async fn cmd_serve(mut config: Config, allow_wildcard: bool) -> anyhow::Result<()> {
    config.server.allow_wildcard |= allow_wildcard;
    let server_config = config
        .server_config()
        .context("serve needs --caps or a [server] caps entry")?;
    if allow_wildcard {
        tracing::info!("Wildcard dimensions accepted");
    }

    let server = QueryServer::bind(server_config).await?;
    println!("Listening on {} ({})", server.local_addr(), server.connect_type());

    let (source, sink) = server.split();
    let shutdown = sink.clone();
    let echo = tokio::spawn(source.drive(sink, |frame: Frame| vec![frame]));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted");
    shutdown.shutdown();
    echo.await?;
    Ok(())
}

async fn cmd_query(config: Config, count: u32, silent: bool) -> anyhow::Result<()> {
    let caps = config
        .client_capability()?
        .context("query needs --caps or a [client] caps entry")?;
    let payload = sample_payload(&caps)?;
    let client_config = config.client_config().with_silent(silent);

    let mut client = QueryClient::new(client_config, caps);
    let session = client.connect().await?;
    println!("Session {session} active");

    let mut latencies = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let started = Instant::now();
        let reply = client.query(payload.clone()).await?;
        let elapsed = started.elapsed();
        if !silent {
            println!(
                "  #{:<4} {:>8} bytes  {:>8.3} ms",
                reply.sequence_ordinal,
                reply.payload_len(),
                elapsed.as_secs_f64() * 1000.0
            );
        }
        latencies.push(elapsed);
    }
    client.close().await;

    print_summary(&latencies);
    Ok(())
}

fn cmd_caps(caps: &str) -> anyhow::Result<()> {
    let caps: CapabilityDescriptor = caps.parse()?;
    let tensors: Vec<_> = (0..caps.tensor_count as usize)
        .map(|i| {
            serde_json::json!({
                "dimension": caps.dimensions[i],
                "type": caps.element_types[i].name(),
                "bytes": caps.tensor_size(i),
            })
        })
        .collect();

    let output = serde_json::json!({
        "caps": caps.to_string(),
        "num_tensors": caps.tensor_count,
        "tensors": tensors,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// One buffer per tensor filled with a repeating byte ramp.
fn sample_payload(caps: &CapabilityDescriptor) -> anyhow::Result<Vec<Bytes>> {
    (0..caps.tensor_count as usize)
        .map(|i| {
            let size = caps
                .tensor_size(i)
                .with_context(|| format!("tensor {i} has a wildcard dimension"))?;
            Ok(Bytes::from((0..size).map(|b| b as u8).collect::<Vec<u8>>()))
        })
        .collect()
}

fn print_summary(latencies: &[Duration]) {
    if latencies.is_empty() {
        return;
    }
    let mut sorted = latencies.to_vec();
    sorted.sort();
    let total: Duration = sorted.iter().sum();
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;

    println!("Round trips:  {}", sorted.len());
    println!("  Min:        {:.3} ms", ms(sorted[0]));
    println!("  Median:     {:.3} ms", ms(sorted[sorted.len() / 2]));
    println!("  Max:        {:.3} ms", ms(sorted[sorted.len() - 1]));
    println!("  Mean:       {:.3} ms", ms(total / sorted.len() as u32));
}
