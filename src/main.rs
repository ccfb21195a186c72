use chrono::Local;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use wechat_bridge::http::{HttpClient, UreqHttpClient};
use wechat_bridge::local::AppServiceApi;
use wechat_bridge::store::FileStore;
use wechat_bridge::transport::TokioWebSocketTransportFactory;
use wechat_bridge::{Bridge, BridgeContext, Client, Config};

// Bridges one WeChat box to a Matrix homeserver.
//
// Usage:
//   wechat-bridge --config config.toml
//   wechat-bridge -c config.toml --log-level debug

#[derive(Parser, Debug)]
#[command(name = "wechat-bridge", version, about = "A WeChat box to Matrix bridge")]
struct Args {
    /// Path of the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log filter, overrides `logging.filter`; `RUST_LOG` wins over both.
    #[arg(short, long)]
    log_level: Option<String>,
}

fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };

    let filter = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.filter.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
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

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async move {
        let config = Arc::new(config);

        let store = match FileStore::open(&config.appservice.database).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("Failed to open store at {}: {e}", config.appservice.database.display());
                return;
            }
        };
        info!("Store opened at {}", config.appservice.database.display());

        let client_config = config.wechat.client_config();
        let http_client: Arc<dyn HttpClient> =
            Arc::new(UreqHttpClient::new(client_config.http_timeout));
        let local = Arc::new(AppServiceApi::from_config(&config, http_client.clone()));
        let transport_factory = Arc::new(TokioWebSocketTransportFactory::for_box(
            &config.wechat.host,
            config.wechat.port,
        ));

        let (client, events) = Client::new(client_config, transport_factory, http_client);
        let ctx = BridgeContext::new(config.clone(), store, local, client);
        let bridge = Bridge::new(ctx);

        if let Err(e) = bridge.start(events).await {
            error!("Failed to start the bridge: {e}");
            return;
        }

        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
        }
        bridge.stop().await;
    });
}
