//! The `capturemock` server binary.
//!
//! Started by the process driver (or by hand), it binds the configured
//! protocol's listener and prints the bound address as its first stdout
//! line. The hidden `intercept` subcommand is the client half of the
//! PATH-interception shims.

use std::io::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::warn;

use capturemock::{
    CaptureMode, CaptureServer, DispatcherBuilder, InterceptFactory, RcConfig,
};

#[derive(Parser)]
#[command(name = "capturemock", version, about = "Capture/replay mock server for testing")]
struct Cli {
    /// 0 = replay, 1 = record, 2 = replay when recorded, record otherwise
    #[arg(short = 'm', long = "mode", default_value_t = 0)]
    mode: u8,

    /// Configuration files, in override order
    #[arg(long = "rcfiles", value_delimiter = ',')]
    rcfiles: Vec<PathBuf>,

    /// Replay journal
    #[arg(short = 'p', long = "replay-file")]
    replay_file: Option<PathBuf>,

    /// Record journal
    #[arg(short = 'r', long = "record-file")]
    record_file: Option<PathBuf>,

    /// Directory holding recorded file edits for replay
    #[arg(short = 'f', long = "replay-edits")]
    replay_edits: Option<PathBuf>,

    /// Directory receiving recorded file edits
    #[arg(short = 'F', long = "record-edits")]
    record_edits: Option<PathBuf>,

    /// Directory to populate with PATH-interception shims
    #[arg(short = 'i', long = "intercept-dir")]
    intercept_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<ClientCommand>,
}

#[derive(Subcommand)]
enum ClientCommand {
    /// The wire half of an interception shim; not for direct use.
    #[command(hide = true)]
    Intercept {
        script: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(ClientCommand::Intercept { script, args }) = cli.command {
        std::process::exit(capturemock::intercept::run_client(&script, &args).await);
    }

    if let Err(e) = run_server(cli).await {
        // Fatal start-up failure: exit non-zero before an address is
        // published, so the driver sees the failure immediately.
        eprintln!("capturemock: {e}");
        std::process::exit(1);
    }
}

async fn run_server(cli: Cli) -> capturemock::Result<()> {
    let config = RcConfig::load(&cli.rcfiles)?;
    let mode = CaptureMode::from_number(cli.mode);
    let dispatcher = DispatcherBuilder::new(mode, config.clone())
        .replay_file(cli.replay_file)
        .record_file(cli.record_file)
        .replay_edit_dir(cli.replay_edits)
        .record_edit_dir(cli.record_edits)
        .build()?;

    let server = CaptureServer::start(config, dispatcher).await?;

    if let Some(directory) = cli.intercept_dir {
        let factory = InterceptFactory::new(directory)?;
        let commands: Vec<String> = server
            .state()
            .config
            .get_list("command line", "intercepts")
            .into_iter()
            .filter(|command| {
                // replay mode only shims commands the journal mentions
                mode != CaptureMode::Replay
                    || server.state().dispatcher.has_recorded_command(command)
            })
            .collect();
        if let Err(e) = factory.create_shims(&commands) {
            warn!("Could not create all intercept shims: {e}");
        }
    }

    // The first stdout line is the contract with the process driver.
    println!("{}", server.address());
    let _ = std::io::stdout().flush();

    server.wait().await;
    Ok(())
}
