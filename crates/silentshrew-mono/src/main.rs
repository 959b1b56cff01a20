//! silentshrew daemon: follows a bitcoind node, indexes BIP-352 silent-payment
//! scalars and serves them over JSON-RPC.

use std::path::PathBuf;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpResponse, HttpServer};
use anyhow::{anyhow, bail, Result};
use bitcoincore_rpc::Auth;
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};

use silentshrew_db::{PgScalarRepository, RocksScalarRepository};
use silentshrew_sync::{ScalarRepository, ScalarSync, SyncConfig, SyncEngine};

mod adapters;
mod chain;
mod handler;
mod jsonrpc;
mod service;

use adapters::BitcoinRpcAdapter;
use chain::Network;
use jsonrpc::{JsonRpcRequest, INTERNAL_ERROR};
use service::ScalarService;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum DbType {
    Rocksdb,
    Postgres,
}

impl std::fmt::Display for DbType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbType::Rocksdb => write!(f, "rocksdb"),
            DbType::Postgres => write!(f, "postgres"),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, env = "NETWORK", value_enum, default_value_t = Network::Mainnet)]
    network: Network,
    #[arg(long, env = "START_HEIGHT", default_value_t = 0)]
    start_height: i32,
    #[arg(long, env = "DB_TYPE", value_enum, default_value_t = DbType::Rocksdb)]
    db_type: DbType,
    #[arg(long, env = "DB_DATADIR", default_value = "silentshrew-datadir")]
    db_path: PathBuf,
    #[arg(long, env = "DB_DSN")]
    postgres_dsn: Option<String>,
    #[arg(long, env = "RPC_HOST", default_value = "http://localhost:8332")]
    rpc_host: String,
    #[arg(long, env = "RPC_USER")]
    rpc_user: Option<String>,
    #[arg(long, env = "RPC_PASS")]
    rpc_pass: Option<String>,
    #[arg(long, env = "RPC_COOKIE_PATH")]
    rpc_cookie: Option<PathBuf>,
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "PORT", default_value_t = 9000)]
    port: u16,
    #[arg(long, help = "CORS allowed origins")]
    cors: Option<String>,
    #[arg(long, help = "Capacity of the processing pipeline", default_value_t = 16)]
    pipeline_size: usize,
    #[arg(long, env = "TLS_CERT")]
    tls_cert: Option<PathBuf>,
    #[arg(long, env = "TLS_KEY")]
    tls_key: Option<PathBuf>,
}

impl Args {
    fn validate(&self) -> Result<()> {
        if self.rpc_cookie.is_none() {
            if self.rpc_user.is_none() || self.rpc_pass.is_none() {
                bail!("rpc user and pass or cookie path must be set");
            }
            warn!("you're using rpc user and pass, consider using the cookie file instead");
        }

        if self.db_type == DbType::Postgres && self.postgres_dsn.is_none() {
            bail!("postgres dsn must be set");
        }

        if self.tls_cert.is_some() || self.tls_key.is_some() {
            bail!("TLS is not terminated by silentshrew-mono; run it behind a TLS-terminating proxy");
        }

        Ok(())
    }

    fn rpc_auth(&self) -> Auth {
        match &self.rpc_cookie {
            Some(cookie) => Auth::CookieFile(cookie.clone()),
            None => Auth::UserPass(
                self.rpc_user.clone().unwrap_or_default(),
                self.rpc_pass.clone().unwrap_or_default(),
            ),
        }
    }
}

struct AppState {
    service: Arc<ScalarService>,
}

async fn handle_jsonrpc(
    body: web::Json<JsonRpcRequest>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let response = handler::handle_request(&body.0, &state.service).await;
    if let jsonrpc::JsonRpcResponse::Error { ref error, .. } = response {
        if error.code == INTERNAL_ERROR {
            error!("{}: {}", body.0.method, error.message);
        }
    }
    HttpResponse::Ok().json(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder().format_timestamp_secs().init();

    let args = Args::parse();
    args.validate()?;
    info!("config OK (network: {})", args.network);

    let chain = Arc::new(BitcoinRpcAdapter::new(&args.rpc_host, args.rpc_auth())?);
    info!("chain source OK");

    let repo: Arc<dyn ScalarRepository> = match args.db_type {
        DbType::Rocksdb => Arc::new(RocksScalarRepository::open(&args.db_path)?),
        DbType::Postgres => {
            let dsn = args
                .postgres_dsn
                .as_deref()
                .ok_or_else(|| anyhow!("postgres dsn must be set"))?;
            Arc::new(PgScalarRepository::connect(dsn).await?)
        }
    };
    info!("db OK ({})", args.db_type);

    let sync_config = SyncConfig {
        start_height: args.start_height,
        taproot_activation_height: args.network.taproot_activation_height(),
        pipeline_size: args.pipeline_size,
    };
    let mut engine = ScalarSync::new(chain.clone(), repo.clone(), sync_config).await?;
    engine.start().await?;
    info!("syncer service OK");

    let service = Arc::new(ScalarService::new(repo, chain));
    let cors_origins = args.cors.clone();

    let server = HttpServer::new(move || {
        let cors = match &cors_origins {
            Some(origins) => origins
                .split(',')
                .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
                .allow_any_method()
                .allow_any_header(),
            None => Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header(),
        };

        App::new()
            .app_data(web::Data::new(AppState {
                service: service.clone(),
            }))
            .wrap(cors)
            .wrap(Logger::default())
            .route("/", web::post().to(handle_jsonrpc))
    })
    .bind((args.host.as_str(), args.port))?
    .run();

    info!("JSON-RPC server running at http://{}:{}", args.host, args.port);
    info!("available RPC methods: silentshrew_getblockscalars, silentshrew_getblockfilter, silentshrew_getchaintipheight");

    let server_handle = tokio::spawn(async move {
        if let Err(err) = server.await {
            error!("server error: {err}");
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
        result = server_handle => {
            if let Err(err) = result {
                error!("server task failed: {err}");
            }
        }
    }

    info!("shutting down service...");
    engine.stop().await?;
    Ok(())
}
