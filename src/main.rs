//! Demo driver: wire the real adapters into the engine and control
//! turns from stdin.
//!
//! Commands: `start`, `stop`, `cancel`, `quit`. Requires
//! `OPENAI_API_KEY` in the environment (a `.env` file works too).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use voiceloop::{
    Credentials, CpalCaptureDevice, CpalPlaybackSink, EngineNotification, EngineSettings,
    RealtimeTransport, VoiceConversationController,
};

#[tokio::main]
async fn main() {
    // Load .env if present; production uses real env vars
    let _ = dotenvy::dotenv();
    env_logger::init();

    let Some(credentials) = Credentials::from_env() else {
        eprintln!("OPENAI_API_KEY is not set");
        std::process::exit(1);
    };

    let settings = EngineSettings::load();
    let device = Arc::new(CpalCaptureDevice::new());
    let transport = Arc::new(RealtimeTransport::new(settings.session_config()));
    let sink = Arc::new(CpalPlaybackSink::new());

    let (controller, mut notifications) =
        VoiceConversationController::spawn(device, transport, sink, settings, credentials);

    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            match notification {
                EngineNotification::StateChanged(state) => println!("[state] {:?}", state),
                EngineNotification::Transcript { text, is_user } => {
                    let who = if is_user { "you" } else { "ai" };
                    println!("[{}] {}", who, text);
                }
                EngineNotification::Notice { kind, message } => {
                    println!("[notice] {:?}: {}", kind, message);
                }
                EngineNotification::InputLevel(_) => {}
            }
        }
    });

    println!("Commands: start | stop | cancel | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "start" => controller.start_turn().await,
            "stop" => controller.stop_turn().await,
            "cancel" => controller.cancel_turn().await,
            "quit" => break,
            "" => {}
            other => println!("Unknown command: {}", other),
        }
    }

    controller.cleanup().await;
}
