use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use chime::audio::{AudioEngine, OUTPUT_FRAME_SIZE, OUTPUT_SAMPLE_RATE};
use chime::protocol::{self, AbortReason, ListeningMode, SessionProtocol};
use chime::{Config, DeviceController, LogDisplay, NullRegistry, TransportKind};

/// Chime - voice assistant client
#[derive(Parser)]
#[command(name = "chime", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "CHIME_CONFIG")]
    config: Option<PathBuf>,

    /// Server WebSocket URL, overriding the configuration
    #[arg(long, env = "CHIME_SERVER_URL")]
    server_url: Option<String>,

    /// Access token for the server, overriding the configuration
    #[arg(long, env = "CHIME_TOKEN")]
    token: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,chime=info",
        1 => "info,chime=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
        };
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.server_url {
        config.network.websocket_url = url;
    }
    if let Some(token) = cli.token {
        config.network.access_token = Some(token);
    }

    let (event_tx, event_rx) = protocol::event_channel();
    let transport: Box<dyn SessionProtocol> = match config.transport {
        TransportKind::Websocket => Box::new(protocol::WebSocketProtocol::new(
            config.network.clone(),
            event_tx,
        )),
        TransportKind::Mqtt => {
            Box::new(protocol::MqttProtocol::new(config.mqtt.clone(), event_tx))
        }
    };

    let engine = AudioEngine::new()?;
    let mut controller = DeviceController::new(
        config,
        engine,
        transport,
        event_rx,
        Box::new(LogDisplay),
        Box::new(NullRegistry),
    );

    if let Err(e) = controller.initialize_audio() {
        tracing::warn!(error = %e, "audio hardware unavailable, running without audio");
    }
    controller.start_wake_word();

    let handle = controller.handle();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                handle.schedule(|c| {
                    c.shutdown();
                    Ok(())
                });
            }
        }
    });

    tokio::spawn(command_loop(handle));

    println!("chime ready - commands: start, stop, toggle, abort, quit");
    controller.run().await;

    Ok(())
}

/// Read commands from stdin and queue them onto the controller
async fn command_loop(handle: chime::ControllerHandle) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "start" => handle.schedule(|c| {
                c.start_listening(ListeningMode::Manual);
                Ok(())
            }),
            "stop" => handle.schedule(|c| {
                c.stop_listening();
                Ok(())
            }),
            "toggle" | "t" => handle.schedule(|c| {
                c.toggle_chat();
                Ok(())
            }),
            "abort" | "a" => handle.schedule(|c| {
                c.abort_speaking(AbortReason::None);
                Ok(())
            }),
            "quit" | "q" => {
                handle.schedule(|c| {
                    c.shutdown();
                    Ok(())
                });
                return;
            }
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut engine = AudioEngine::new()?;
    engine.initialize()?;

    let (tap_tx, mut tap_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<i16>>();
    engine.set_capture_tap(tap_tx);

    println!("---");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.tick().await;
    let mut second = 0_u64;
    let mut window: Vec<i16> = Vec::new();

    loop {
        tokio::select! {
            Some(samples) = tap_rx.recv() => window.extend(samples),
            _ = tick.tick() => {
                second += 1;
                let energy = calculate_rms(&window);
                let peak = window
                    .iter()
                    .map(|s| f32::from(s.saturating_abs()) / 32768.0)
                    .fold(0.0f32, f32::max);

                // Visual meter
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let meter_len = (energy * 100.0).min(50.0) as usize;
                let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

                println!("[{second:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]");
                window.clear();

                if tokio::time::Instant::now() >= deadline {
                    break;
                }
            }
        }
    }

    engine.clear_capture_tap();
    engine.close();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy of i16 samples
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let v = f32::from(s) / 32768.0;
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output by pushing a tone through the playback path
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let mut engine = AudioEngine::new()?;
    engine.initialize()?;

    // Two seconds of 440Hz sine, encoded frame by frame so the tone
    // travels the same queue the server's speech does
    let frequency = 440.0_f32;
    let num_samples = OUTPUT_SAMPLE_RATE as usize * 2;
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let samples: Vec<i16> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / OUTPUT_SAMPLE_RATE as f32;
            let v = (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3;
            (v * 32767.0) as i16
        })
        .collect();

    let mut encoder = opus::Encoder::new(
        OUTPUT_SAMPLE_RATE,
        opus::Channels::Mono,
        opus::Application::Audio,
    )?;

    for chunk in samples.chunks_exact(OUTPUT_FRAME_SIZE) {
        let data = encoder.encode_vec(chunk, 4000)?;
        engine.write_decoded_frame(chime::AudioFrame::new(data));
    }

    println!("Playing {num_samples} samples at {OUTPUT_SAMPLE_RATE} Hz...");
    while engine.has_pending_playback() {
        engine.drain_and_play();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // let the staged tail reach the speaker
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.close();

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
