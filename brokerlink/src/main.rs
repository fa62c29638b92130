use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use brokerlink::config::{ExecJob, GatewayConfig, RelayConfig};
use brokerlink::error::{ConfigError, Result};
use brokerlink::fleet::FleetOrchestrator;
use brokerlink::relay::{RelayServer, ServerStatus};
use clap::{Args, Parser, Subcommand};
use log::{error, warn};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Run commands on devices behind a remote access broker, or relay SSH
/// sessions to them.
#[derive(Parser)]
#[command(name = "brokerlink", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send commands, answer prompts and wait for the devices to come back
    ExecAndWait(ExecArgs),

    /// Relay SSH sessions to `<target>@<routing-key>` backends
    SshProxy(ProxyArgs),
}

#[derive(Args)]
struct ExecArgs {
    #[command(flatten)]
    gateway: GatewayConfig,

    /// TOML job file; replaces the job flags
    #[arg(long, env = "BROKERLINK_JOB")]
    job: Option<PathBuf>,

    #[command(flatten)]
    flags: ExecJob,
}

#[derive(Args)]
struct ProxyArgs {
    #[command(flatten)]
    gateway: GatewayConfig,

    /// Address to listen on
    #[arg(long, env = "BROKERLINK_LOCAL_ADDRESS", default_value = "localhost")]
    local_address: String,

    /// Port to listen on
    #[arg(long, env = "BROKERLINK_LOCAL_PORT", value_parser = clap::value_parser!(u16).range(1..))]
    local_port: u16,

    /// Password clients must present
    #[arg(long = "proxy-password", env = "BROKERLINK_PROXY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Host key file (OpenSSH PEM); ephemeral when omitted
    #[arg(long, env = "BROKERLINK_HOST_KEY")]
    host_key: Option<PathBuf>,

    /// Stop serving after this many seconds
    #[arg(long, env = "BROKERLINK_LIFETIME")]
    lifetime: Option<u64>,

    /// Seconds live sessions get to finish on shutdown
    #[arg(long, env = "BROKERLINK_SHUTDOWN_GRACE", default_value_t = 5)]
    shutdown_grace: u64,

    /// Check the configuration and bind once, then exit
    #[arg(long)]
    test: bool,
}

impl ProxyArgs {
    fn relay_config(&self) -> Result<RelayConfig> {
        let host_key_pem = match &self.host_key {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })?),
            None => None,
        };

        Ok(RelayConfig {
            local_address: self.local_address.clone(),
            local_port: self.local_port,
            password: self.password.clone().map(SecretString::from),
            host_key_pem,
            lifetime: self.lifetime.map(Duration::from_secs),
            test_mode: self.test,
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, shutting down");
                cancel.cancel();
            }
        });
    }

    let result = match cli.command {
        Command::ExecAndWait(args) => exec_and_wait(args, cancel).await,
        Command::SshProxy(args) => ssh_proxy(args, cancel).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            print_json(&json!({
                "msg": e.to_string(),
                "exec_status": "FAILURE",
                "changed": false,
            }));
            ExitCode::FAILURE
        }
    }
}

async fn exec_and_wait(args: ExecArgs, cancel: CancellationToken) -> Result<ExitCode> {
    let job = match &args.job {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            ExecJob::from_toml(&text)?
        }
        None => args.flags.unescaped(),
    };

    let selection = job.selection()?;
    let params = job.run_params()?;
    let fleet = FleetOrchestrator::new(args.gateway.broker()?, job.fleet_options());

    let result = fleet.run(&selection, &params, &cancel).await?;
    let failure = result.failure();

    let mut report = serde_json::to_value(result.report()).unwrap_or(Value::Null);
    if let (Some(msg), Value::Object(fields)) = (&failure, &mut report) {
        fields.insert("msg".to_string(), json!(msg));
        fields.insert("exec_status".to_string(), json!("FAILURE"));
    }
    print_json(&report);

    Ok(if failure.is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn ssh_proxy(args: ProxyArgs, cancel: CancellationToken) -> Result<ExitCode> {
    let config = args.relay_config()?;
    let test_mode = config.test_mode;
    let server = RelayServer::new(Arc::new(args.gateway.broker()?), config)?;

    if test_mode {
        print_json(&server.test().await?);
        return Ok(ExitCode::SUCCESS);
    }

    let listener = server.bind().await?;
    print_json(&server.info(&listener, ServerStatus::Running));
    let stopped = server.serve(listener, cancel).await?;
    print_json(&stopped);
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => error!("failed to serialize output: {}", e),
    }
}
