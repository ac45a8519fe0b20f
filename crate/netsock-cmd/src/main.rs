//! Command-line client and echo server built on netsock-network.

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use futures_util::stream::StreamExt as _;
use netsock_network::config::NetConfig;
use netsock_network::tls::ClientAuth;
use netsock_network::{Connector, Listener, NetContext, Socket};
use signal_hook_tokio::Signals;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, process};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

mod logging;

/// Open TCP connections, or accept them, with optional TLS.
///
/// By default, outputs errors and warnings to stderr. Pass -v or -vv
/// for more, or set the env variable RUST_LOG. Set the env variable
/// RUST_LOG_FORMAT=SYSTEMD to a systemd-friendly log output.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about, verbatim_doc_comment)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log more; repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and echo back what they send.
    ///
    /// Prints "listening on ADDR" once ready. Stop it with Ctrl-C or
    /// SIGTERM.
    Listen(ListenArgs),

    /// Connect, send stdin, then print everything received on stdout.
    ///
    /// Exits once the server closes the connection, even if stdin is
    /// still open.
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Default)]
struct ListenArgs {
    /// Host name or address to bind to (default: 0.0.0.0)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to (default: any free port)
    #[arg(long)]
    port: Option<u16>,

    /// Send this file to every connection, then close it, instead of
    /// echoing
    #[arg(long)]
    send_file: Option<PathBuf>,

    /// PEM file containing the server certificate and key
    #[arg(long)]
    key_store: Option<PathBuf>,

    /// PEM file containing the CAs client certificates are required
    /// to come from
    #[arg(long)]
    trust_store: Option<PathBuf>,

    /// Run the TLS handshake on accept
    #[arg(long)]
    ssl: bool,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Host name or address to connect to
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Port to connect to
    #[arg(long)]
    port: u16,

    /// Connection timeout, TLS handshake included (example: 500ms)
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Connect with TLS
    #[arg(long)]
    ssl: bool,

    /// Accept any server certificate (insecure)
    #[arg(long)]
    trust_all: bool,

    /// PEM file containing the CAs to trust
    #[arg(long)]
    trust_store: Option<PathBuf>,

    /// PEM file containing a client certificate and key
    #[arg(long)]
    key_store: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let code = match execute(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            1
        }
    };
    // A pending read on stdin would otherwise block runtime shutdown.
    process::exit(code);
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => parse_config(path)
            .with_context(|| format!("{}: failed to read TOML config file", path.display()))?,
        None => NetConfig::default(),
    };
    let ctx = NetContext::from_config(&config);

    match cli.command {
        Command::Listen(args) => {
            apply_listen_args(&mut config, &args);
            listen(&ctx, &config, args.send_file).await?;
        }
        Command::Connect(args) => {
            apply_connect_args(&mut config, &args);
            connect(&ctx, &config, &args).await?;
        }
    }
    ctx.shutdown().await;

    Ok(())
}

fn parse_config(path: &Path) -> anyhow::Result<NetConfig> {
    let content = fs::read_to_string(path)?;

    Ok(toml::from_str(&content)?)
}

/// Override the listener config with the command-line arguments.
fn apply_listen_args(config: &mut NetConfig, args: &ListenArgs) {
    let listener = &mut config.listener;
    if let Some(host) = &args.host {
        listener.host = host.clone();
    }
    if let Some(port) = args.port {
        listener.port = port;
    }
    if args.key_store.is_none() && args.trust_store.is_none() && !args.ssl {
        return;
    }
    let tls = listener.tls.get_or_insert_default();
    if let Some(path) = &args.key_store {
        tls.key_store_path = Some(path.clone());
    }
    if let Some(path) = &args.trust_store {
        tls.trust_store_path = Some(path.clone());
        if listener.client_auth == ClientAuth::None {
            listener.client_auth = ClientAuth::Required;
        }
    }
    if args.ssl {
        tls.enabled = true;
    }
}

/// Override the connector config with the command-line arguments.
fn apply_connect_args(config: &mut NetConfig, args: &ConnectArgs) {
    let connector = &mut config.connector;
    if let Some(timeout) = args.timeout {
        connector.connect_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
    }
    if !args.ssl && !args.trust_all && args.trust_store.is_none() && args.key_store.is_none() {
        return;
    }
    let tls = connector.tls.get_or_insert_default();
    if args.ssl {
        tls.enabled = true;
    }
    if args.trust_all {
        tls.trust_all = true;
    }
    if let Some(path) = &args.trust_store {
        tls.trust_store_path = Some(path.clone());
    }
    if let Some(path) = &args.key_store {
        tls.key_store_path = Some(path.clone());
    }
}

async fn listen(
    ctx: &NetContext,
    config: &NetConfig,
    send_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut listener = Listener::from_config(ctx, &config.listener)
        .context("invalid listener TLS configuration")?;
    match send_file {
        Some(path) => {
            anyhow::ensure!(path.is_file(), "{}: not a file", path.display());
            listener.connect_handler(move |socket| send_and_close(socket, path.clone()));
        }
        None => {
            listener.connect_handler(echo);
        }
    }
    let host = &config.listener.host;
    let port = config.listener.port;
    let addr = listener
        .listen(port, host)
        .await
        .with_context(|| format!("failed to listen on {host}:{port}"))?;

    let mut signals = Signals::new([
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGQUIT,
    ])?;

    println!("listening on {addr}");

    let _ = signals.next().await;

    log::info!("Interrupted. Shutting down..");
    signals.handle().close(); // A 2nd signal kills the process
    listener.close().await;

    Ok(())
}

async fn echo(mut socket: Socket) -> anyhow::Result<()> {
    while let Some(chunk) = socket.read_chunk().await? {
        socket.write(chunk)?;
        if socket.write_queue_full() {
            socket.drained().await;
        }
    }
    socket.close().await?;

    Ok(())
}

async fn send_and_close(mut socket: Socket, path: PathBuf) -> anyhow::Result<()> {
    let sent = socket.send_file(&path).await?;
    log::info!(
        "@{} Sent {} ({sent} bytes)",
        socket.remote_address(),
        path.display()
    );
    socket.close().await?;

    Ok(())
}

async fn connect(ctx: &NetContext, config: &NetConfig, args: &ConnectArgs) -> anyhow::Result<()> {
    let connector = Connector::from_config(ctx, &config.connector)
        .context("invalid connector TLS configuration")?;
    let socket = connector
        .connect(args.port, &args.host)
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    log::info!("Connected to {}", socket.remote_address());

    let (mut reader, writer) = socket.into_split()?;
    let upload = async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            let n = stdin.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(buf[..n].to_vec())?;
            if writer.write_queue_full() {
                writer.drained().await;
            }
        }
        writer.close().await?;

        Ok::<(), anyhow::Error>(())
    };
    let download = async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = reader.read_chunk().await? {
            stdout.write_all(&chunk).await?;
        }
        stdout.flush().await?;

        Ok::<(), anyhow::Error>(())
    };
    tokio::pin!(upload, download);
    let downloaded = tokio::select! {
        downloaded = &mut download => downloaded,
        uploaded = &mut upload => {
            uploaded.context("failed to send")?;
            download.await
        }
    };
    // Unread stdin, if any, is dropped.
    downloaded.context("failed to receive")?;

    Ok(())
}
