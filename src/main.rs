use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use voxlink::audio::{AudioFrame, CapturePipeline, PlaybackPipeline, PlaybackSink, write_wav};
use voxlink::config::{CaptureConfig, Overrides, PlaybackConfig};
use voxlink::{CANONICAL_SAMPLE_RATE, ClientCommand, Config, SessionEvent, VisemeRelay, VisemeSink, VoiceClient};

/// Voxlink - real-time voice streaming client for conversational avatars
#[derive(Parser)]
#[command(name = "voxlink", version, about)]
struct Cli {
    /// Streaming service endpoint (ws://host:port/ws/audio)
    #[arg(long, env = "VOXLINK_ENDPOINT")]
    endpoint: Option<String>,

    /// Project identifier sent with every utterance
    #[arg(short, long, env = "VOXLINK_PROJECT")]
    project: Option<String>,

    /// Avatar/voice identifier
    #[arg(long, env = "VOXLINK_AVATAR")]
    avatar: Option<String>,

    /// Recognition language hint (e.g. "en")
    #[arg(long, env = "VOXLINK_LANGUAGE")]
    language: Option<String>,

    /// Input device name (defaults to the system microphone)
    #[arg(long, env = "VOXLINK_INPUT_DEVICE")]
    input_device: Option<String>,

    /// Output device name (defaults to the system speakers)
    #[arg(long, env = "VOXLINK_OUTPUT_DEVICE")]
    output_device: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input and write a WAV probe
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output with a short tone
    TestSpeaker,
}

/// Logs viseme intensity for renderers attached out of process
struct TraceViseme;

impl VisemeSink for TraceViseme {
    fn update(&self, value: f32) {
        tracing::trace!(value, "viseme");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,voxlink=info",
        1 => "info,voxlink=debug",
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

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => {
                test_mic(
                    CaptureConfig {
                        device: cli.input_device,
                        ..CaptureConfig::default()
                    },
                    duration,
                )
                .await
            }
            Command::TestSpeaker => test_speaker(PlaybackConfig {
                device: cli.output_device,
            }),
        };
    }

    let config = Config::resolve(Overrides {
        endpoint: cli.endpoint,
        project: cli.project,
        avatar: cli.avatar,
        language: cli.language,
        input_device: cli.input_device,
        output_device: cli.output_device,
    })?;

    talk(config).await
}

/// Interactive push-to-talk conversation loop
async fn talk(config: Config) -> anyhow::Result<()> {
    let playback = PlaybackPipeline::new(config.playback.clone());
    let viseme = VisemeRelay::new(Arc::new(TraceViseme));
    let client = VoiceClient::new(config, Box::new(playback), viseme);

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let runner = tokio::spawn(client.run(cmd_rx, ui_tx));

    println!("Enter to talk, Enter again to send, 'c' to cancel, 'q' to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut talking = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    let _ = cmd_tx.send(ClientCommand::Shutdown).await;
                    break;
                };
                match line.trim() {
                    "q" => {
                        let _ = cmd_tx.send(ClientCommand::Shutdown).await;
                        break;
                    }
                    "c" => {
                        if talking {
                            talking = false;
                            let _ = cmd_tx.send(ClientCommand::CancelTalking).await;
                        }
                    }
                    _ => {
                        if talking {
                            talking = false;
                            let _ = cmd_tx.send(ClientCommand::StopTalking).await;
                        } else {
                            talking = true;
                            println!("listening... press Enter to send");
                            let _ = cmd_tx.send(ClientCommand::StartTalking).await;
                        }
                    }
                }
            }
            event = ui_rx.recv() => {
                let Some(event) = event else { break };
                show_event(&event, &mut talking);
            }
        }
    }

    runner.await??;
    Ok(())
}

/// Render one session event for the terminal
fn show_event(event: &SessionEvent, talking: &mut bool) {
    match event {
        SessionEvent::Connected => println!("[connected]"),
        SessionEvent::Closed => println!("[disconnected]"),
        SessionEvent::Fatal { message } => {
            *talking = false;
            eprintln!("[session lost: {message}]");
        }
        SessionEvent::StreamingStarted | SessionEvent::SynthesisStarted => {}
        SessionEvent::Cancelled => println!("[cancelled]"),
        SessionEvent::RecognitionStarted => println!("[transcribing...]"),
        SessionEvent::TranscriptFinal { text } => println!("you: {text}"),
        SessionEvent::AssistantDelta { text } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        SessionEvent::AssistantDone { .. } => println!(),
        SessionEvent::SynthesisSkipped { reason } => println!("[no speech: {reason}]"),
        SessionEvent::Viseme { .. } => {}
        SessionEvent::SynthesisFinished => println!("[ready]"),
        SessionEvent::RemoteError { message } => eprintln!("[remote error: {message}]"),
    }
}

/// Record a few seconds from the capture pipeline to a WAV probe
async fn test_mic(config: CaptureConfig, duration: u64) -> anyhow::Result<()> {
    let mut capture = CapturePipeline::new(config);
    let (frames_tx, mut frames_rx) = mpsc::channel(32);
    capture.start(frames_tx)?;

    println!("recording for {duration}s...");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut samples: Vec<i16> = Vec::new();

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => break,
            frame = frames_rx.recv() => {
                let Some(frame) = frame else { break };
                print_level(frame.peak());
                samples.extend_from_slice(frame.samples());
            }
        }
    }
    capture.stop();

    if samples.is_empty() {
        anyhow::bail!("no audio captured");
    }

    let name = format!(
        "voxlink-mic-{}.wav",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    );
    write_wav(Path::new(&name), &samples)?;
    println!(
        "\nwrote {:.1}s of audio to {name}",
        samples.len() as f64 / f64::from(CANONICAL_SAMPLE_RATE)
    );
    Ok(())
}

/// Play a short tone through the playback pipeline
fn test_speaker(config: PlaybackConfig) -> anyhow::Result<()> {
    let mut playback = PlaybackPipeline::new(config);
    playback.start()?;

    println!("playing a 440 Hz tone...");
    let samples: Vec<i16> = (0..CANONICAL_SAMPLE_RATE)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f32 / CANONICAL_SAMPLE_RATE as f32;
            #[allow(clippy::cast_possible_truncation)]
            let sample = (0.4 * (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 32767.0) as i16;
            sample
        })
        .collect();

    for chunk in samples.chunks(1600) {
        playback.enqueue(&AudioFrame::new(chunk.to_vec()));
    }

    // Let the queue drain before releasing the device
    std::thread::sleep(Duration::from_millis(1500));
    playback.stop();
    Ok(())
}

/// Crude inline level meter for the mic probe
fn print_level(peak: f32) {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let bars = (peak * 20.0) as usize;
    print!("\r[{:<20}]", "#".repeat(bars.min(20)));
    let _ = std::io::stdout().flush();
}
