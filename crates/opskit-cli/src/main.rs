//! opskit CLI
//!
//! Run commands on local or SSH hosts and wait for hosts to become reachable

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use opskit_core::{
    Host, HostConfig, InstallOptions, Logger, WaitConfig, WaitReport, is_tcp_port_open,
    probes::DEFAULT_CONNECT_TIMEOUT, wait_for_ping, wait_for_tcp_port,
};
use opskit_exec::CommandSpec;
use opskit_sshd::{ServerConfig, TestServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "opskit", version)]
#[command(about = "Run commands on hosts and wait for them to come up", long_about = None)]
struct Cli {
    /// Config file (default: $OPSKIT_CONFIG, ./opskit.toml, /etc/opskit/opskit.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command and exit with its status
    Run {
        /// Configured host name, `user@addr`, or `localhost`
        host: String,
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Command and arguments
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },

    /// Wait until a host is reachable
    Wait {
        host: String,
        #[command(flatten)]
        connection: ConnectionArgs,
        /// What "reachable" means
        #[arg(long, value_enum, default_value_t = WaitMode::Ssh)]
        mode: WaitMode,
        /// Overrides `wait.timeout_secs`
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Overrides `wait.poll_interval_ms`
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Replace the cached host key before each attempt
        #[arg(long)]
        renew_host_key: bool,
    },

    /// Check whether a TCP port accepts connections
    #[command(name = "port-open")]
    PortOpen { host: String, port: u16 },

    /// Copy a local file onto a host
    Install {
        host: String,
        local: PathBuf,
        dest: String,
        #[command(flatten)]
        connection: ConnectionArgs,
        /// `chown` argument, e.g. `root:root`
        #[arg(long)]
        owner: Option<String>,
        /// Octal permission bits
        #[arg(long, default_value = "755", value_parser = parse_mode)]
        mode: u32,
    },

    /// Run the test SSH server until Ctrl-C
    Serve {
        #[arg(long, default_value = "127.0.0.1:2222")]
        bind: String,
        #[arg(long, default_value = "user")]
        user: String,
        #[arg(long, default_value = "pass")]
        password: String,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum WaitMode {
    /// SSH login succeeds
    Ssh,
    /// SSH port accepts TCP connections
    Tcp,
    /// Host answers ICMP echo
    Ping,
}

/// Overrides for a host's connection settings
#[derive(Args, Debug, Default)]
struct ConnectionArgs {
    /// Login name
    #[arg(long)]
    user: Option<String>,
    /// SSH port
    #[arg(long)]
    port: Option<u16>,
    /// Environment variable holding the SSH password
    #[arg(long, value_name = "VAR")]
    password_env: Option<String>,
    /// SSH private key file
    #[arg(long, value_name = "PATH")]
    key: Option<PathBuf>,
}

impl ConnectionArgs {
    fn apply(&self, mut host: HostConfig) -> HostConfig {
        if let Some(user) = &self.user {
            host.user.clone_from(user);
        }
        if let Some(port) = self.port {
            host.port = port;
        }
        if let Some(var) = &self.password_env {
            host.password_env = Some(var.clone());
            host.ssh_key = None;
        }
        if let Some(key) = &self.key {
            host.ssh_key = Some(key.clone());
        }
        host
    }
}

fn parse_mode(value: &str) -> Result<u32, String> {
    u32::from_str_radix(value, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| format!("`{value}` is not an octal file mode"))
}

/// Process status for a command's return code; out-of-range codes become 1
fn exit_status(return_code: i32) -> u8 {
    u8::try_from(return_code).unwrap_or(1)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_report(target: &str, report: &WaitReport) {
    println!(
        "{target} ready after {} attempt(s) in {:.1?}",
        report.attempts, report.elapsed
    );
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load_default(cli.config.as_deref())?;
    let logger = Logger::tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            host,
            connection,
            argv,
        } => {
            let host = Host::from_config(&connection.apply(config.host_for(&host)), logger)?;
            let spec = CommandSpec::new(argv)?;
            let output = host.run_command(&spec).await?;

            std::io::stdout().write_all(&output.stdout)?;
            std::io::stderr().write_all(&output.stderr)?;
            Ok(ExitCode::from(exit_status(output.return_code)))
        }

        Commands::Wait {
            host,
            connection,
            mode,
            timeout_secs,
            interval_ms,
            renew_host_key,
        } => {
            let host_config = connection.apply(config.host_for(&host));
            let budget = WaitConfig {
                timeout_secs: timeout_secs.unwrap_or(config.wait.timeout_secs),
                poll_interval_ms: interval_ms.unwrap_or(config.wait.poll_interval_ms),
            }
            .budget()?;

            let report = match mode {
                WaitMode::Ssh => {
                    let host = Host::from_config(&host_config, logger)?;
                    host.check_reachable(&budget, renew_host_key).await?
                }
                WaitMode::Tcp => {
                    wait_for_tcp_port(&host_config.addr, host_config.port, &budget, &logger)
                        .await?
                }
                WaitMode::Ping => wait_for_ping(&host_config.addr, &budget, &logger).await?,
            };
            print_report(&host_config.name, &report);
            Ok(ExitCode::SUCCESS)
        }

        Commands::PortOpen { host, port } => {
            let addr = config.host_for(&host).addr;
            let open = is_tcp_port_open(&addr, port, DEFAULT_CONNECT_TIMEOUT).await;
            println!("{open}");
            Ok(if open {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Install {
            host,
            local,
            dest,
            connection,
            owner,
            mode,
        } => {
            let host = Host::from_config(&connection.apply(config.host_for(&host)), logger)?;
            host.install_binary(&local, &dest, &InstallOptions { owner, mode })
                .await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Serve {
            bind,
            user,
            password,
        } => {
            let server = TestServer::new(ServerConfig::new(bind, user, password));
            let addr = server.start().await?;
            info!(%addr, "test server listening, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            server.stop().await?;
            info!("test server stopped");
            Ok(ExitCode::SUCCESS)
        }
    }
}
