use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ssh_bridge_core::client::{Client, ConnectRequest, ReuseRequest};
use ssh_bridge_core::lock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[derive(Parser, Debug)]
#[clap(version, author, about)]
struct Args {
    #[clap(short, long, action, help = "a directory holding the socket, lock file, and config; defaults to ~/.ssh-bridge")]
    config_dir: Option<String>,
    #[clap(short, long, action, help = "the file to write logs to; defaults to stderr")]
    log_file: Option<String>,
    #[clap(short, long, action = clap::ArgAction::Count, help = "show more in logs, may be provided multiple times")]
    verbose: u8,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[clap(about = "ssh-bridge daemon starts the daemon that pools SSH connections")]
    Daemon,
    #[clap(about = "ssh-bridge exec connects to a host and runs a command, streaming stdio")]
    Exec {
        #[clap(short, long, help = "username to authenticate as")]
        user: String,
        #[clap(short = 'H', long, help = "hostname or address to connect to")]
        host: String,
        #[clap(short, long, default_value_t = 22, help = "port to connect to")]
        port: u16,
        #[clap(long, help = "expected host key fingerprint, skips interactive verification")]
        fingerprint: Option<String>,
        #[clap(long, help = "path to a private key file")]
        identity: Option<String>,
        #[clap(long, help = "keep the connection in the daemon's pool for reuse after this process exits")]
        reusable: bool,
        #[clap(long, help = "allocate a pty for the command")]
        pty: bool,
        #[clap(help = "the command to run on the remote host")]
        command: String,
    },
    #[clap(about = "ssh-bridge reuse re-attaches to a pooled connection without a fresh handshake")]
    Reuse {
        #[clap(short, long, help = "username the pooled connection was authenticated as")]
        user: String,
        #[clap(short = 'H', long, help = "hostname the pooled connection targets")]
        host: String,
        #[clap(short, long, default_value_t = 22, help = "port the pooled connection targets")]
        port: u16,
        #[clap(long, help = "share key printed by a prior `ssh-bridge exec --reusable` or a running session")]
        share_key: Option<String>,
        #[clap(long, help = "allocate a pty for the command")]
        pty: bool,
        #[clap(help = "the command to run on the remote host")]
        command: String,
    },
}

fn default_config_dir() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".ssh-bridge"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    ssh_bridge_core::logging::init(args.verbose, args.log_file.as_deref().map(std::path::Path::new))?;

    let config_dir = match args.config_dir {
        Some(dir) => PathBuf::from(dir),
        None => default_config_dir()?,
    };

    match args.command {
        Commands::Daemon => run_daemon(config_dir).await,
        Commands::Exec { user, host, port, fingerprint, identity, reusable, pty, command } => {
            let private_key = match identity {
                Some(path) => Some(
                    tokio::fs::read(&path).await.with_context(|| format!("reading private key at {path}"))?,
                ),
                None => None,
            };
            let request = ConnectRequest {
                username: user,
                hostname: host,
                port,
                fingerprint,
                reusable,
                private_key,
                passphrase: None,
                password: None,
                try_keyboard: true,
            };
            run_exec(config_dir, ExecKind::Connect(request), pty, command).await
        }
        Commands::Reuse { user, host, port, share_key, pty, command } => {
            let request = ReuseRequest { username: user, hostname: host, port, share_key };
            run_exec(config_dir, ExecKind::Reuse(request), pty, command).await
        }
    }
}

async fn run_daemon(config_dir: PathBuf) -> anyhow::Result<()> {
    ssh_bridge_core::daemon::run(config_dir).await
}

enum ExecKind {
    Connect(ConnectRequest),
    Reuse(ReuseRequest),
}

async fn run_exec(config_dir: PathBuf, kind: ExecKind, pty: bool, command: String) -> anyhow::Result<()> {
    lock::ensure_config_dir(&config_dir)?;
    let socket_path = config_dir.join("sock");
    let stream = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("connecting to daemon at {}; is `ssh-bridge daemon` running?", socket_path.display()))?;

    let client = Client::spawn(stream);
    let outcome = match kind {
        ExecKind::Connect(request) => client.connect(request, Some(terminal_challenge_handler())).await,
        ExecKind::Reuse(request) => client.reuse(request).await,
    }
    .map_err(|err| anyhow::anyhow!("{err}"))?;
    if let Some(banner) = outcome.banner {
        eprint!("{banner}");
    }
    tracing::debug!(fingerprint = %outcome.fingerprint, "connected");

    let exec = client.exec(command, pty).await.map_err(|err| anyhow::anyhow!("{err}"))?;

    let stdin_handle = exec.stdin;
    let mut stdout_rx = exec.stdout;
    let mut stderr_rx = exec.stderr;

    let stdin_forward = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => stdin_handle.write(buf[..n].to_vec()),
            }
        }
        stdin_handle.end();
    });

    let stdout_forward = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = stdout_rx.recv().await {
            let _ = stdout.write_all(&chunk).await;
            let _ = stdout.flush().await;
        }
    });
    let stderr_forward = tokio::spawn(async move {
        let mut stderr = tokio::io::stderr();
        while let Some(chunk) = stderr_rx.recv().await {
            let _ = stderr.write_all(&chunk).await;
            let _ = stderr.flush().await;
        }
    });

    let result = exec.result.await.context("daemon connection dropped before the command finished")?;
    let _ = stdout_forward.await;
    let _ = stderr_forward.await;
    stdin_forward.abort();

    client.close().await;

    let payload = result.map_err(|err| anyhow::anyhow!("{err}"))?;
    if let Some(signal) = payload.signal {
        anyhow::bail!("remote command terminated by signal {signal}");
    }
    std::process::exit(payload.code.unwrap_or(0));
}

/// Reads challenge prompts from the terminal. No `rpassword`-style masking
/// dependency is carried for this one call site, so echo-off prompts are
/// still typed in the clear.
fn terminal_challenge_handler() -> ssh_bridge_core::client::ChallengeHandler {
    Box::new(move |challenge| {
        Box::pin(async move {
            if !challenge.instructions.is_empty() {
                eprintln!("{}", challenge.instructions);
            }
            let mut responses = Vec::with_capacity(challenge.prompts.len());
            for prompt in &challenge.prompts {
                eprint!("{}", prompt.prompt);
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).ok()?;
                responses.push(line.trim_end_matches(['\n', '\r']).to_string());
            }
            Some(responses)
        })
    })
}
