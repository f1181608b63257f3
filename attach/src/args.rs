use crate::{
    BindMounter, CniChain, Config, Error, Manager, PortAllocator, SidecarRedirect, UpInputs,
};
use anyhow::Context;
use clap::Parser;
use netpol_cell::Datastore;
use std::{io::Write, path::PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{error, info};

/// Exit status for a failed attach or detach.
pub const EXIT_FAILURE: i32 = 1;

/// Exit status for unusable arguments or configuration.
pub const EXIT_USAGE: i32 = 2;

#[derive(Debug, Parser)]
#[clap(
    name = "netpol-attach",
    about = "Attaches containers to the cell network; run by the container runtime"
)]
pub struct Args {
    #[clap(long, value_enum)]
    action: Action,

    #[clap(long)]
    handle: String,

    #[clap(long = "configFile")]
    config_file: PathBuf,

    #[clap(long, default_value = "netpol=info,warn", env = "NETPOL_ATTACH_LOG")]
    log_level: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Action {
    Up,
    Down,
}

impl Args {
    /// Runs the requested action and returns the process exit status.
    pub async fn parse_and_run() -> i32 {
        let args = match Self::try_parse() {
            Ok(args) => args,
            Err(e) => {
                let _ = e.print();
                return if e.use_stderr() { EXIT_USAGE } else { 0 };
            }
        };
        args.run().await
    }

    pub async fn run(self) -> i32 {
        let Self {
            action,
            handle,
            config_file,
            log_level,
        } = self;

        // Standard output carries the response document.
        let filter = tracing_subscriber::EnvFilter::try_new(&log_level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();

        let config = match Config::load(&config_file) {
            Ok(config) => config,
            Err(error) => {
                error!(%error, config = %config_file.display(), "Invalid configuration");
                return EXIT_USAGE;
            }
        };

        info!(?action, %handle, "Running");
        match execute(action, &handle, &config).await {
            Ok(()) => 0,
            Err(error) => {
                error!(?action, %handle, error = %format_args!("{error:#}"), "Failed");
                match error.downcast_ref::<Error>() {
                    Some(Error::Config(_)) => EXIT_USAGE,
                    _ => EXIT_FAILURE,
                }
            }
        }
    }
}

async fn execute(action: Action, handle: &str, config: &Config) -> anyhow::Result<()> {
    let mut stdin = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut stdin)
        .await
        .context("reading standard input")?;

    let plugins = CniChain::load(vec![config.cni_plugin_dir.clone()], &config.cni_config_dir)?;
    let mut manager = Manager::new(
        BindMounter::new(),
        plugins,
        SidecarRedirect::from_config(config),
        PortAllocator::new(config.start_port, config.total_ports, &config.state_file),
    )
    .with_bind_mount_dir(&config.bind_mount_dir)
    .with_dns_servers(config.dns_servers.clone())
    .with_search_domains(config.search_domains.clone());
    if let Some(path) = &config.datastore {
        manager = manager.with_datastore(Datastore::new(path));
    }

    match action {
        Action::Up => {
            let inputs = serde_json::from_slice::<UpInputs>(&stdin).context("parsing up inputs")?;
            let outputs = manager.up(handle, inputs).await?;
            let mut stdout = std::io::stdout().lock();
            serde_json::to_writer(&mut stdout, &outputs).context("writing response")?;
            writeln!(stdout).context("writing response")?;
        }
        Action::Down => manager.down(handle).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_runtime_flags() {
        let args = Args::try_parse_from([
            "netpol-attach",
            "--action",
            "up",
            "--handle",
            "abc",
            "--configFile",
            "/etc/attach.json",
        ])
        .unwrap();
        assert_eq!(args.action, Action::Up);
        assert_eq!(args.handle, "abc");
        assert_eq!(args.config_file, PathBuf::from("/etc/attach.json"));

        let err = Args::try_parse_from(["netpol-attach", "--action", "net-out", "--handle", "abc"])
            .unwrap_err();
        assert!(err.use_stderr());
    }

    #[tokio::test]
    async fn missing_config_is_a_usage_error() {
        let args = Args {
            action: Action::Down,
            handle: "abc".to_string(),
            config_file: PathBuf::from("/nonexistent/attach.json"),
            log_level: "off".to_string(),
        };
        assert_eq!(args.run().await, EXIT_USAGE);
    }
}
