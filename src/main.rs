use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use livecall::call::{CallController, CallSettings, ConnectionState, SystemDevices};
use livecall::chat::{ChatSession, GeminiChat};
use livecall::session::GeminiConnector;
use livecall::voice::{
    AudioBuffer, CpalOutput, MicrophoneCapture, OUTPUT_SAMPLE_RATE, PlaybackScheduler,
    samples_to_wav,
};
use livecall::{Config, Error};

/// livecall - Live voice and video calls with a generative AI assistant
#[derive(Parser)]
#[command(name = "livecall", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Audio only; never acquire the camera
    #[arg(long, env = "LIVECALL_NO_VIDEO", global = true)]
    no_video: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a live call (default); Ctrl-C hangs up
    Call,
    /// Text chat; reads from stdin when no message is given
    Chat {
        /// Message to send
        message: Option<String>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the captured audio as a WAV file
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Test speaker output through the playback scheduler
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,livecall=info",
        1 => "info,livecall=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
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
    let mut config = Config::load()?;
    if cli.no_video {
        config.video.enabled = false;
    }

    match cli.command.unwrap_or(Command::Call) {
        Command::Call => call(&config).await,
        Command::Chat { message } => chat(&config, message).await,
        Command::TestMic { duration, save } => test_mic(&config, duration, save).await,
        Command::TestSpeaker => test_speaker().await,
    }
}

/// Print the short message for an error and pass it on
fn report(e: Error) -> anyhow::Error {
    eprintln!("{}", e.user_message());
    e.into()
}

/// Run one live call until the remote side ends it or Ctrl-C
#[allow(clippy::future_not_send)]
async fn call(config: &Config) -> anyhow::Result<()> {
    let api_key = config.require_api_key().map_err(report)?;
    let connector = Arc::new(GeminiConnector::new(api_key));
    let mut controller =
        CallController::new(CallSettings::from_config(config), connector, SystemDevices);

    let mut states = controller.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            eprintln!("[{state}]");
        }
    });

    controller.start().map_err(report)?;
    println!("Calling... press Ctrl-C to hang up.");

    let state = controller
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "could not listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    if state == ConnectionState::Error {
        let message = controller.last_error().unwrap_or("The call failed.");
        eprintln!("{message}");
        anyhow::bail!("call ended with an error");
    }

    if let Some(stats) = controller.dispatch_stats() {
        tracing::info!(
            sent = stats.sent(),
            dropped = stats.dropped(),
            failed = stats.failed(),
            "call summary"
        );
    }
    println!("Call ended.");
    Ok(())
}

/// One-shot or interactive text chat
async fn chat(config: &Config, message: Option<String>) -> anyhow::Result<()> {
    let api_key = config.require_api_key().map_err(report)?;
    let backend = GeminiChat::new(api_key, config.chat.model.clone());
    let mut session = ChatSession::new(
        backend,
        &config.chat,
        config.session.system_instruction.clone(),
    );

    if let Some(message) = message {
        let reply = session.send(&message).await.map_err(report)?;
        println!("{reply}");
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match session.send(&line).await {
            Ok(reply) => println!("{reply}\n"),
            Err(e) => {
                tracing::debug!(error = %e, "chat turn failed");
                eprintln!("{}", e.user_message());
            }
        }
    }

    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64, save: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut capture = MicrophoneCapture::open(&config.audio, tx).map_err(report)?;

    println!(
        "Device rate: {} Hz, sending at {} Hz",
        capture.device_rate(),
        config.audio.input_sample_rate
    );
    println!("---");

    let mut recorded = Vec::new();
    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut samples = Vec::new();
        while let Ok(block) = rx.try_recv() {
            samples.extend(block);
        }
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );

        if save.is_some() {
            recorded.extend(samples);
        }
    }

    capture.stop();

    if let Some(path) = save {
        let wav = samples_to_wav(&recorded, config.audio.input_sample_rate)?;
        std::fs::write(&path, wav)?;
        println!("\nSaved {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output with a tone split into back-to-back chunks
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    const CHUNKS: usize = 4;
    const CHUNK_SECS: f32 = 0.5;

    println!("Testing speaker output...");
    println!("You should hear a steady 440Hz tone for 2 seconds\n");

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    let output = CpalOutput::open(ended_tx).map_err(report)?;
    println!("Device rate: {} Hz", output.sample_rate());
    let mut playback = PlaybackScheduler::new(output);

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let chunk_len = (OUTPUT_SAMPLE_RATE as f32 * CHUNK_SECS) as usize;
    let frequency = 440.0_f32;

    // Chunks are scheduled separately; any gap between them is audible
    for c in 0..CHUNKS {
        #[allow(clippy::cast_precision_loss)]
        let samples: Vec<f32> = (c * chunk_len..(c + 1) * chunk_len)
            .map(|i| {
                let t = i as f32 / OUTPUT_SAMPLE_RATE as f32;
                (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
            })
            .collect();
        let chunk = playback.schedule(AudioBuffer::new(samples, OUTPUT_SAMPLE_RATE))?;
        println!(
            "chunk {} at {:.3}s..{:.3}s",
            chunk.id,
            chunk.start,
            chunk.end()
        );
    }

    let wait = Duration::from_secs(3);
    let _ = tokio::time::timeout(wait, async {
        while playback.active_count() > 0 {
            match ended_rx.recv().await {
                Some(id) => {
                    playback.finished(id);
                }
                None => break,
            }
        }
    })
    .await;
    playback.close();

    println!("\n---");
    println!("If you heard one continuous tone, playback scheduling works!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
