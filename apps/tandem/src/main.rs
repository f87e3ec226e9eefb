use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use tandem_client_core::assist::AssistClient;
use tandem_client_core::media::SilentSource;
use tandem_client_core::session::{Command, Notice, SessionController, SessionHandles};
use tandem_client_core::signaling::WsConnector;

#[derive(Parser, Debug)]
#[command(name = "tandem", about = "Peer language-practice client")]
struct Cli {
    /// Lobby base URL.
    #[arg(long, env = "TANDEM_LOBBY_URL", default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Identity token issued at sign-in.
    #[arg(long, env = "TANDEM_TOKEN")]
    token: String,

    /// Assist endpoint for phrasing suggestions.
    #[arg(
        long,
        env = "TANDEM_ASSIST_URL",
        default_value = "http://127.0.0.1:8090/assist"
    )]
    assist_url: String,

    /// Seconds to wait for voice recovery before giving up on a call.
    #[arg(long, default_value_t = 10)]
    voice_grace_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let connector = WsConnector {
        url: cli.server,
        token: cli.token,
    };
    let (controller, handles) = SessionController::new(
        connector,
        Arc::new(SilentSource),
        AssistClient::new(cli.assist_url),
        Duration::from_secs(cli.voice_grace_seconds),
    );
    let SessionHandles {
        commands,
        mut notices,
    } = handles;
    tokio::spawn(controller.run());
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            print_notice(notice);
        }
    });

    println!(
        "commands: /match <topic>, /voice, /accept, /reject, /hangup, /assist <text>, /leave, /quit"
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let command = if let Some(topic) = line.strip_prefix("/match ") {
            Command::StartMatching {
                topic: topic.to_string(),
            }
        } else if let Some(text) = line.strip_prefix("/assist ") {
            Command::Assist(text.to_string())
        } else {
            match line {
                "/voice" => Command::RequestVoice,
                "/accept" => Command::AcceptVoice,
                "/reject" => Command::RejectVoice,
                "/hangup" => Command::HangUp,
                "/leave" => Command::Leave,
                "/quit" => break,
                other if other.starts_with('/') => {
                    println!("unknown command: {other}");
                    continue;
                }
                chat => Command::SendChat(chat.to_string()),
            }
        };
        if commands.send(command).is_err() {
            break;
        }
    }
    Ok(())
}

fn print_notice(notice: Notice) {
    match notice {
        Notice::Searching => println!("searching for a partner..."),
        Notice::Matched { partner, topic } => {
            println!("matched with {} on \"{topic}\"", partner.full_name)
        }
        Notice::Chat {
            from,
            content,
            timestamp,
        } => println!("[{}] {from}: {content}", timestamp.format("%H:%M:%S")),
        Notice::PartnerLeft(message) => println!("{message}"),
        Notice::VoiceRequested => println!("voice request sent, waiting for your partner"),
        Notice::VoiceIncoming => println!("incoming voice request (/accept or /reject)"),
        Notice::VoiceRejected => println!("voice request declined"),
        Notice::VoiceActive => println!("voice connected"),
        Notice::VoiceReconnecting => println!("voice connection degraded, attempting recovery"),
        Notice::VoiceEnded { reason } => println!("voice ended: {reason}"),
        Notice::AssistReply(reply) => println!("assist: {reply}"),
        Notice::Error(message) => eprintln!("error: {message}"),
        Notice::Left => println!("left the session"),
    }
}
