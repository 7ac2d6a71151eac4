use bridge_core::identity::{IdentityMapper, TemplateIdentityMapper};
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use voip_bridge::appservice::{self, AppState};
use voip_bridge::bridge::Bridge;
use voip_bridge::config;
use voip_bridge::matrix::{HomeserverClient, MatrixManager};
use voip_bridge::transport::TokioWebSocketTransportFactory;
use voip_bridge::verto::VertoManager;
use voip_bridge_ureq_http_client::UreqHttpClient;

/// Bridges Matrix voice calls to a FreeSWITCH Verto endpoint.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "bridge.yaml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = config::load(&args.config)?;
    info!("Loaded configuration from {}", args.config.display());

    let identities: Arc<dyn IdentityMapper> = Arc::new(TemplateIdentityMapper::new(
        &config.matrix.domain,
        &config.matrix.users,
        &config.call.routes,
    )?);

    let factory = TokioWebSocketTransportFactory::new(&config.verto.url);
    let verto = VertoManager::connect(&config, &factory).await?;

    let http = Arc::new(UreqHttpClient::new());
    let homeserver = Arc::new(HomeserverClient::new(
        http,
        &config.homeserver.host,
        &config.homeserver.as_token,
    ));
    let matrix = MatrixManager::new(&config, homeserver, identities.clone());
    let bridge = Bridge::new(matrix.clone(), verto.clone(), identities);

    let router = appservice::build_router(AppState::new(matrix, &config.homeserver.hs_token));
    let server = appservice::serve(&config.appservice.bind, router);

    let outcome = tokio::select! {
        result = server => result,
        _ = verto.closed() => Err(anyhow::anyhow!("media server connection closed")),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Unable to listen for Ctrl-C: {e}");
            }
            info!("Shutting down");
            Ok(())
        }
    };

    bridge.shutdown().await;
    verto.client().close().await;
    outcome
}
