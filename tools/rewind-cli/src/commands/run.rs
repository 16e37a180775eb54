//! Run the capture engine and drive it from stdin.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use rewind_capture_engine::backend::{
    build_audio_components, AudioInput, GstContainerFactory, GstVideoEncoder, VideoEncoderSettings,
    VideoSource,
};
use rewind_capture_engine::dispatch::{AnalysisSink, JsonlQueueSink, LogSink};
use rewind_capture_engine::engine::{AudioFactory, ClipCaptureEngine, EngineConfig, EngineParts};
use rewind_capture_engine::pipeline::{build_voice_note_pipeline, missing_elements};
use rewind_capture_engine::voice::VoiceDeviceFactory;
use rewind_capture_engine::{SourceContext, StaticContext};
use rewind_common::clock::ms_to_us;
use rewind_common::config::AppConfig;
use rewind_common::error::RewindError;

use super::check::required_elements;
use super::control::{ControlCommand, HELP};

/// Capture sources picked on the command line.
#[derive(Debug, Clone, Default)]
pub struct Sources {
    pub display: Option<String>,
    pub pipewire_node: Option<u32>,
    pub test: bool,
}

impl Sources {
    pub fn video(&self) -> anyhow::Result<VideoSource> {
        if self.test {
            return Ok(VideoSource::TestPattern);
        }
        if let Some(node_id) = self.pipewire_node {
            return Ok(VideoSource::PipeWire { node_id });
        }
        if let Some(display) = &self.display {
            return Ok(VideoSource::X11 {
                display: Some(display.clone()),
                show_pointer: true,
            });
        }
        Ok(VideoSource::detect()?)
    }

    pub fn audio(&self) -> AudioInput {
        if self.test {
            AudioInput::TestTone
        } else {
            AudioInput::Pulse { device: None }
        }
    }
}

pub async fn run(config: AppConfig, sources: Sources) -> anyhow::Result<()> {
    let video_source = sources.video()?;
    let audio_input = sources.audio();

    let required = required_elements(&config, &video_source, &audio_input);
    let missing = missing_elements(&required)?;
    if !missing.is_empty() {
        anyhow::bail!(
            "Missing GStreamer elements: {} (run 'rewind check')",
            missing.join(", ")
        );
    }

    let context = Arc::new(StaticContext::default());
    let engine = build_engine(&config, video_source, audio_input, context.clone())?;
    engine.start_capture()?;

    let window = engine.window();
    println!("Buffering to {}", config.clips_dir.display());
    println!(
        "  Window: {}ms before, {}ms after",
        window.pre_roll_ms(),
        window.post_roll_ms()
    );
    println!("  Audio: {}", config.audio.enabled);
    println!("Type 'clip' to save, 'help' for commands, Ctrl+C to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<ControlCommand>() {
                    Ok(ControlCommand::Quit) => break,
                    Ok(command) => tokio::task::block_in_place(|| execute(&engine, &context, command)),
                    Err(e) => println!("{e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    tokio::task::block_in_place(|| engine.shutdown());
    println!("Stopped.");
    Ok(())
}

fn build_engine(
    config: &AppConfig,
    video_source: VideoSource,
    audio_input: AudioInput,
    context: Arc<StaticContext>,
) -> anyhow::Result<ClipCaptureEngine> {
    let video_encoder = GstVideoEncoder::new(VideoEncoderSettings::from_capture(
        video_source,
        &config.capture,
    ));

    let audio: Option<AudioFactory> = config.audio.enabled.then(|| {
        let input = audio_input.clone();
        let app = config.clone();
        Box::new(move || build_audio_components(&input, &app)) as AudioFactory
    });

    let rate = config.audio.sample_rate;
    let channels = config.audio.channels;
    let voice_device: VoiceDeviceFactory = Box::new(move |path: &Path| {
        build_voice_note_pipeline(&audio_input, path, rate, channels)
    });

    let analysis: Arc<dyn AnalysisSink> = match &config.analysis.queue_file {
        Some(path) => {
            let sink = JsonlQueueSink::open(path)?;
            tracing::info!(queue = %sink.path().display(), "Writing analysis jobs to queue file");
            Arc::new(sink)
        }
        None => Arc::new(LogSink),
    };

    let engine = ClipCaptureEngine::init(
        EngineConfig::from_app(config),
        EngineParts {
            video_encoder: Box::new(video_encoder),
            audio,
            containers: Arc::new(GstContainerFactory),
            voice_device,
            analysis,
            context,
        },
    )?;
    Ok(engine)
}

fn execute(engine: &ClipCaptureEngine, context: &StaticContext, command: ControlCommand) {
    match command {
        ControlCommand::Clip { pre_ms, post_ms } => {
            match engine.request_clip(pre_ms.map(ms_to_us), post_ms.map(ms_to_us)) {
                Ok(ticket) => println!(
                    "Saving {} ({}ms before, {}ms after)",
                    ticket.path.display(),
                    ticket.realized_pre_roll_us / 1_000,
                    ticket.window.post_roll_ms()
                ),
                Err(RewindError::Rejected(reason)) => println!("Rejected: {reason}"),
                Err(e) => println!("Clip failed: {e}"),
            }
        }
        ControlCommand::Window { pre_ms, post_ms } => {
            let window = engine.set_window(pre_ms, post_ms);
            println!(
                "Window: {}ms before, {}ms after",
                window.pre_roll_ms(),
                window.post_roll_ms()
            );
        }
        ControlCommand::Start => match engine.start_capture() {
            Ok(()) => println!("Capture enabled"),
            Err(e) => println!("Cannot start capture: {e}"),
        },
        ControlCommand::Stop => {
            engine.stop_capture(false);
            println!("Capture disabled");
        }
        ControlCommand::Flush => {
            engine.stop_capture(true);
            println!("Capture disabled; clip in progress finished");
        }
        ControlCommand::VoiceStart => match engine.start_voice_note() {
            Ok(note) => println!("Recording voice note {}", note.path.display()),
            Err(e) => println!("Cannot record voice note: {e}"),
        },
        ControlCommand::VoiceStop => match engine.stop_voice_note() {
            Some(note) => println!("Voice note saved to {}", note.path.display()),
            None => println!("No voice note recording"),
        },
        ControlCommand::Link(text) => match engine.observe_clipboard(&text) {
            Some(url) => println!("Next clip links to {url}"),
            None => println!("No link found"),
        },
        ControlCommand::Context { package, url } => {
            context.set(SourceContext {
                source_package: Some(package),
                source_url: url,
            });
        }
        ControlCommand::Status => match serde_json::to_string_pretty(&engine.status()) {
            Ok(json) => println!("{json}"),
            Err(e) => println!("Cannot encode status: {e}"),
        },
        ControlCommand::Help => println!("{HELP}"),
        ControlCommand::Quit => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_win_over_devices() {
        let sources = Sources {
            display: Some(":0".into()),
            pipewire_node: None,
            test: true,
        };
        assert_eq!(sources.video().unwrap(), VideoSource::TestPattern);
        assert_eq!(sources.audio(), AudioInput::TestTone);
    }

    #[test]
    fn test_pipewire_node_is_used_when_given() {
        let sources = Sources {
            pipewire_node: Some(42),
            ..Sources::default()
        };
        assert_eq!(sources.video().unwrap(), VideoSource::PipeWire { node_id: 42 });
        assert_eq!(sources.audio(), AudioInput::Pulse { device: None });
    }
}
