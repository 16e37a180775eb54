//! Check system capabilities.

use rewind_capture_engine::backend::{codec_elements, AudioInput, VideoSource, CORE_ELEMENTS};
use rewind_capture_engine::pipeline::missing_elements;
use rewind_common::config::AppConfig;

/// Every GStreamer element a run with these sources needs.
pub fn required_elements(
    config: &AppConfig,
    video: &VideoSource,
    audio: &AudioInput,
) -> Vec<&'static str> {
    let mut names: Vec<&'static str> = CORE_ELEMENTS.to_vec();
    names.extend_from_slice(video.required_elements());
    // Voice notes need the input even with clip audio off.
    names.extend_from_slice(audio.required_elements());
    if config.audio.enabled {
        names.extend_from_slice(codec_elements(&config.audio.codec));
    }
    names.dedup();
    names
}

pub fn run(config: &AppConfig, test_sources: bool) -> anyhow::Result<()> {
    println!("Rewind System Check");
    println!("{}", "=".repeat(50));

    // Display server
    let video = if test_sources {
        println!("[OK] Video source: test pattern");
        Some(VideoSource::TestPattern)
    } else {
        match VideoSource::detect() {
            Ok(source) => {
                println!("[OK] Video source: {source:?}");
                Some(source)
            }
            Err(e) => {
                println!("[WARN] {e}");
                None
            }
        }
    };
    let audio = if test_sources {
        AudioInput::TestTone
    } else {
        AudioInput::Pulse { device: None }
    };

    let video_for_check = video.clone().unwrap_or(VideoSource::TestPattern);
    let names = required_elements(config, &video_for_check, &audio);
    let missing = missing_elements(&names)?;

    println!();
    println!("GStreamer elements:");
    for name in &names {
        if missing.contains(name) {
            println!("[MISSING] {name}");
        } else {
            println!("[OK] {name}");
        }
    }

    println!();
    println!("Clips directory: {}", config.clips_dir.display());
    println!(
        "Audio: {} ({}, {} Hz, {} ch)",
        if config.audio.enabled { "on" } else { "off" },
        config.audio.codec,
        config.audio.sample_rate,
        config.audio.channels
    );

    println!();
    if missing.is_empty() && video.is_some() {
        println!("All required capabilities are available. Rewind is ready.");
    } else {
        println!("Some required capabilities are missing. See above for fixes.");
    }

    Ok(())
}
