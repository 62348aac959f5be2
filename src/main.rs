//! rostovvpn-rs CLI application entry point.
//!
//! # Startup Flow
//!
//! ```text
//!   ┌─────────────────┐
//!   │  Parse CLI Args │ ◄── clap parses command-line arguments
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌──────────────────┐      ┌─────────────────┐
//!   │ --generate-config│─────▶│ Write default   │────▶ Exit
//!   │    specified?    │      │ config & exit   │
//!   └────────┬─────────┘      └─────────────────┘
//!            │ No
//!            ▼
//!   ┌─────────────────┐
//!   │  Load Config    │ ◄── Defaults → File → Env → CLI
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Initialize      │
//!   │   Logging       │
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Run subcommand  │ ◄── build, check, run, stop, tunnel, proxy
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │  Exit with      │
//!   │  status code    │
//!   └─────────────────┘
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Operational failure |
//! | 2 | Usage or validation error |
//! | 3 | Fatal error (elevation refused, engine did not start) |
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `ROSTOVVPN_CONFIG` | Path to config file (equivalent to `--config`) |
//! | `ROSTOVVPN_WORK_DIR` | Runtime directory (equivalent to `--work-dir`) |

use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use rostovvpn_rs::core::{self as lifecycle, CURRENT_CONFIG};
use rostovvpn_rs::service::{self, ServiceAction, ServiceManager};
use rostovvpn_rs::synth::required_warp_keys;
use rostovvpn_rs::{
    config, logger, ActivationRequest, CliArgs, Command, Config, ControlClient, CoreService,
    Diagnostics, Document, Error, LogLevel, ProcessEngine, ProxyCommand, Result, StartParams,
    Synthesizer, SystemProxy, SystemRunner, TunnelCommand, TunnelSupervisor, WarpManager,
    VERSION,
};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let config = Config::default();
        let toml = config.to_toml()?;
        std::fs::write(output_path, toml)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;
    logger::init(config.loglevel, config.logfile.as_deref())?;

    logger::plog(LogLevel::Info, &format!("rostovvpn-rs {} starting", VERSION));
    logger::plog(
        LogLevel::Debug,
        &format!("Work dir: {}", config.work_dir.display()),
    );

    let Some(command) = args.command else {
        return Err(Error::Config(
            "no command given (try --help)".to_string(),
        ));
    };

    match command {
        Command::Build { output } => build(&config, output.as_deref()).await,
        Command::Check => {
            synthesize(&config).await?;
            println!("configuration is valid");
            Ok(())
        }
        Command::Run => run_core(&config).await,
        Command::Stop => {
            lifecycle::write_stop_marker(&config.work_dir)?;
            println!("stop requested");
            Ok(())
        }
        Command::Tunnel { action } => tunnel(&config, action).await,
        Command::Proxy {
            action: ProxyCommand::Off,
        } => SystemProxy::new(Arc::new(SystemRunner)).off().await,
    }
}

async fn synthesize(config: &Config) -> Result<Document> {
    let options = config.load_options()?;
    let base = Document::from_file(config.require_base_config()?)?;

    let warp = WarpManager::open(&config.work_dir)?;
    let keys = required_warp_keys(&options, &base);
    warp.prepare(keys.iter().map(String::as_str)).await?;

    let out = Synthesizer::new(&warp).synthesize(&options, &base)?;
    Ok(out.document)
}

async fn build(config: &Config, output: Option<&Path>) -> Result<()> {
    let document = synthesize(config).await?;
    match output {
        Some(path) => {
            document.write_to_file(path)?;
            println!("Wrote configuration to {}", path.display());
        }
        None => println!("{}", document.to_json_pretty()?),
    }
    Ok(())
}

fn supervisor(config: &Config) -> Result<TunnelSupervisor> {
    let exe = std::env::current_exe()?;
    Ok(
        TunnelSupervisor::system(config.control_port, exe, Diagnostics::log_only())
            .with_timings(config.activation_timings()),
    )
}

async fn run_core(config: &Config) -> Result<()> {
    std::fs::create_dir_all(&config.work_dir)?;
    lifecycle::clear_stop_marker(&config.work_dir);

    let options = config.load_options()?;
    let base = config.require_base_config()?.to_path_buf();
    let tunnel = supervisor(config)?;
    let engine = ProcessEngine::new(&config.engine_path, config.work_dir.join(CURRENT_CONFIG));
    let core = CoreService::new(Arc::new(engine), &config.work_dir)
        .with_warp(Arc::new(WarpManager::open(&config.work_dir)?))
        .with_tunnel(tunnel.clone());
    core.set_options(options);

    core.start(StartParams::from_path(base)).await?;
    logger::plog(LogLevel::Notice, "core started, waiting for Ctrl-C or stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => logger::plog(LogLevel::Notice, "interrupted"),
        _ = lifecycle::wait_for_stop_marker(&config.work_dir) => {}
    }

    let result = core.stop().await.map(|_| ());
    tunnel.close().await;
    result
}

async fn tunnel(config: &Config, action: TunnelCommand) -> Result<()> {
    let manager = || -> Result<ServiceManager> {
        Ok(ServiceManager::new(Arc::new(SystemRunner), std::env::current_exe()?))
    };

    match action {
        TunnelCommand::Run => {
            std::fs::create_dir_all(&config.work_dir)?;
            if !service::run_service(config.control_port, &config.engine_path, &config.work_dir)
                .await?
            {
                println!("Tunnel Service Already Running.");
            }
            Ok(())
        }
        TunnelCommand::Start => {
            if ControlClient::new(config.control_port).probe().await {
                println!("Tunnel Service Already Running.");
                return Ok(());
            }
            println!("{}", manager()?.control(ServiceAction::Start).await?);
            Ok(())
        }
        TunnelCommand::Stop => {
            println!("{}", manager()?.control(ServiceAction::Stop).await?);
            Ok(())
        }
        TunnelCommand::Install => {
            println!("{}", manager()?.control(ServiceAction::Install).await?);
            Ok(())
        }
        TunnelCommand::Uninstall => {
            println!("{}", manager()?.control(ServiceAction::Uninstall).await?);
            Ok(())
        }
        TunnelCommand::Activate => {
            let options = config.load_options()?;
            supervisor(config)?
                .activate(ActivationRequest::from_options(&options))
                .wait()
                .await?;
            println!("Tunnel Service activated.");
            Ok(())
        }
        TunnelCommand::Deactivate { force } => {
            let supervisor = supervisor(config)?;
            if force {
                supervisor.deactivate_force().await?;
            } else {
                supervisor.stop_service().await?;
            }
            println!("Tunnel Service deactivated.");
            Ok(())
        }
        TunnelCommand::Exit => supervisor(config)?.exit().await,
    }
}
