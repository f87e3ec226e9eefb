use clap::Parser;
use tracing::{error, info};

use tandem_lobby::cli::{Cli, Commands};
use tandem_lobby::config::Config;
use tandem_lobby::websocket::Lobby;

#[tokio::main]
async fn main() {
    // Default to INFO if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        user,
        name,
        secret,
        topic,
    }) = cli.command
    {
        if let Err(err) = tandem_lobby::cli::run_probe(url, user, name, secret, topic).await {
            error!("probe error: {err}");
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("starting tandem lobby on port {}", config.port);

    let lobby = Lobby::new(config.clone());
    let app = tandem_lobby::router(lobby);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    info!("tandem lobby listening on {addr}");

    axum::serve(listener, app)
        .await
        .expect("failed to start server");
}
