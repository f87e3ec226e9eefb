use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use tandem_proto::{ClientEnvelope, ServerEnvelope};

use crate::auth;

#[derive(Parser, Debug)]
#[command(name = "tandem-lobby")]
#[command(about = "Tandem lobby server and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run as server (default behavior if no command specified)
    #[arg(long)]
    pub server: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect as a throwaway participant, join the queue, and print every
    /// envelope received. Useful against a local lobby.
    Probe {
        /// Lobby URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Participant id to probe as
        #[arg(long, default_value_t = 0)]
        user: i64,

        /// Display name for the probe participant
        #[arg(long, default_value = "probe")]
        name: String,

        /// Secret used to mint the probe token; must match the server's
        #[arg(long, default_value = "tandem-dev-secret")]
        secret: String,

        /// Topic tag for the queue entry
        #[arg(short, long)]
        topic: Option<String>,
    },
}

pub async fn run_probe(
    url: String,
    user: i64,
    name: String,
    secret: String,
    topic: Option<String>,
) -> Result<()> {
    let token = auth::issue_token(user, &name, &secret, 3600)?;
    let ws_url = format!("{url}/ws?token={token}");
    debug!("connecting to {url}");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(anyhow::anyhow!("connection failed: {err}")),
        Err(_) => return Err(anyhow::anyhow!("connection timed out")),
    };
    let (mut sink, mut stream) = ws_stream.split();

    let join = serde_json::to_string(&ClientEnvelope::JoinQueue { topic })?;
    sink.send(Message::Text(join.into())).await?;

    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Text(text) => match serde_json::from_str::<ServerEnvelope>(text.as_str()) {
                Ok(envelope) => println!("{envelope:?}"),
                Err(err) => debug!("unparseable frame: {err}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
