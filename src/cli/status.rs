use std::time::Duration;

use crate::audio::AudioPlayer;
use crate::error::{DecodeError, DeviceError, ErrorSeverity, FilterError, PipelineError};
use crate::filters::StageInfo;
use crate::logging::{EventStatistics, LoggedEvent};

/// Status display formatter for the CLI
pub struct StatusDisplay;

impl StatusDisplay {
    /// Display pipeline status: sync state, device and buffering
    pub fn display_full_status(player: &AudioPlayer) {
        println!("┌─ Pipeline Status ───────────────────────────────────────┐");
        println!("│ Status: {}", player.status().as_str());
        if player.is_paused() {
            println!("│ Paused");
        }

        match player.chain() {
            Some(chain) => {
                println!("│ Input: {}", chain.graph.input_format());
                println!("│ Filtered: {}", chain.graph.filter_output());
                let buffer = chain.buffer.buffer_status(player.config().device.buffer_seconds);
                println!(
                    "│ Buffered: {} ({} samples), {}",
                    Self::format_seconds(buffer.buffered_duration.as_secs_f64()),
                    buffer.available_samples,
                    buffer.status_description().to_lowercase()
                );
                if buffer.underrun_count > 0 {
                    println!("│ Underruns: {}", buffer.underrun_count);
                }
            }
            None => println!("│ No track loaded"),
        }

        Self::display_device_info(player);
        Self::display_position_info(player);
        println!("└─────────────────────────────────────────────────────────┘");
    }

    fn display_device_info(player: &AudioPlayer) {
        println!("│");
        match player.device() {
            Some(device) => {
                println!("│ Device: {}", Self::truncate(device.name(), 49));
                println!("│ Format: {} ({})", device.format(), Self::channel_description(device.format().channel_count()));
                println!("│ Latency: {}", Self::format_seconds(device.delay()));
                println!("│ Space: {} samples", device.space_available());
            }
            None => println!("│ Device: closed"),
        }
    }

    fn display_position_info(player: &AudioPlayer) {
        let session = player.session();
        println!("│");
        println!("│ Speed: {:.2}x", player.audio_speed());
        if let Some(pts) = player.playing_pts() {
            println!("│ Position: {}", Self::format_seconds(pts));
        }
        println!("│ Written: {}", Self::format_seconds(session.written_audio));
        println!("│ Shown samples: {}", session.shown_samples);
        if session.delay.abs() > f64::EPSILON {
            println!("│ Pending A/V offset: {:+.3}s", session.delay);
        }
    }

    /// Display the filter chain, one stage per line
    pub fn display_chain(stages: &[StageInfo]) {
        println!("┌─ Filter Chain ──────────────────────────────────────────┐");
        if stages.is_empty() {
            println!("│ (empty)");
        }
        for (i, stage) in stages.iter().enumerate() {
            let label = stage
                .label
                .as_deref()
                .map(|l| format!(" @{}", l))
                .unwrap_or_default();
            let marker = if stage.auto_inserted { " [auto]" } else { "" };
            println!("│ {}. {}{}{}", i + 1, stage.name, label, marker);
            println!("│      {} -> {}", stage.fmt_in, stage.fmt_out);
        }
        println!("└─────────────────────────────────────────────────────────┘");
    }

    /// Display a compact one-line status (for live updates)
    pub fn display_position_update(player: &AudioPlayer) {
        let position = player
            .playing_pts()
            .map(Self::format_seconds)
            .unwrap_or_else(|| "--:--".to_string());
        let fill = player
            .chain()
            .map(|c| c.buffer.seconds())
            .unwrap_or_default();

        print!(
            "\r{:<9} {} buf {} x{:.2}   ",
            player.status().as_str(),
            position,
            Self::format_seconds(fill),
            player.audio_speed()
        );
        use std::io::Write;
        let _ = std::io::stdout().flush();
    }

    pub fn display_events(events: &[LoggedEvent]) {
        for logged in events {
            println!("{} {}", logged.timestamp.format("%H:%M:%S%.3f"), logged.event.as_str());
        }
    }

    pub fn display_statistics(stats: &EventStatistics) {
        println!("┌─ Session Statistics ────────────────────────────────────┐");
        println!("│ Events: {}", stats.total_events);
        println!("│ Format changes: {}", stats.format_changes);
        println!("│ Drops: {} ({} samples)", stats.drops, stats.dropped_samples);
        println!("│ Duplicates: {} ({} samples)", stats.duplicates, stats.duplicated_samples);
        println!("│ Seek requests: {}", stats.seek_requests);
        if stats.track_failures > 0 {
            println!("│ Track failures: {}", stats.track_failures);
        }
        println!("└─────────────────────────────────────────────────────────┘");
    }

    /// Display error message with formatting and recovery suggestions
    pub fn display_error(error: &PipelineError) {
        let severity = error.severity();
        let severity_icon = match severity {
            ErrorSeverity::Info => "ℹ",
            ErrorSeverity::Warning => "⚠",
            ErrorSeverity::Error => "✗",
            ErrorSeverity::Critical => "🔥",
        };

        eprintln!("┌─ {} {} ─────────────────────────────────────────────────┐",
            severity_icon, severity.as_str());

        for line in Self::wrap_text(&error.user_message(), 55) {
            eprintln!("│ {}", line);
        }

        let suggestions = error.recovery_suggestions();
        if !suggestions.is_empty() {
            eprintln!("│");
            eprintln!("│ Suggestions:");
            for suggestion in suggestions.iter().take(3) {
                for line in Self::wrap_text(&format!("• {}", suggestion), 53) {
                    eprintln!("│   {}", line);
                }
            }
        }

        Self::display_error_context(error);
        eprintln!("└─────────────────────────────────────────────────────────┘");
    }

    fn display_error_context(error: &PipelineError) {
        match error {
            PipelineError::Filter(FilterError::UnknownFilter { .. }) => {
                eprintln!("│");
                eprintln!("│ Use 'rpipe filters' to list available filters");
            }
            PipelineError::Filter(FilterError::NegotiationFailed { .. }) => {
                eprintln!("│");
                eprintln!("│ Try 'rpipe negotiate' to inspect the chain");
            }
            PipelineError::Device(DeviceError::OpenFailed(_)) => {
                eprintln!("│");
                eprintln!("│ Common rates: 44.1kHz, 48kHz, 96kHz, 192kHz");
            }
            PipelineError::Decode(DecodeError::UnsupportedFormat { .. }) => {
                eprintln!("│");
                eprintln!("│ Supported: FLAC, WAV, ALAC, MP3, OGG/Vorbis, AAC");
            }
            PipelineError::Config(_) => {
                eprintln!("│");
                eprintln!("│ Configuration will use default values");
            }
            _ => {}
        }
    }

    /// Display a simple error message for non-interactive contexts
    pub fn display_simple_error(error: &PipelineError) {
        eprintln!("[{}] {}", error.severity().as_str(), error.user_message());
        if let Some(suggestion) = error.recovery_suggestions().first() {
            eprintln!("Suggestion: {}", suggestion);
        }
    }

    fn wrap_text(text: &str, width: usize) -> Vec<String> {
        let mut lines = Vec::new();
        let mut current_line = String::new();

        for word in text.split_whitespace() {
            if current_line.is_empty() {
                current_line = word.to_string();
            } else if current_line.len() + word.len() < width {
                current_line.push(' ');
                current_line.push_str(word);
            } else {
                lines.push(std::mem::take(&mut current_line));
                current_line = word.to_string();
            }
        }

        if !current_line.is_empty() {
            lines.push(current_line);
        }
        lines
    }

    /// Format seconds as MM:SS.mmm, or HH:MM:SS.mmm for long positions
    pub fn format_seconds(seconds: f64) -> String {
        let sign = if seconds < 0.0 { "-" } else { "" };
        let duration = Duration::from_secs_f64(seconds.abs());
        let total_seconds = duration.as_secs();
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let secs = total_seconds % 60;
        let millis = duration.subsec_millis();

        if hours > 0 {
            format!("{}{:02}:{:02}:{:02}.{:03}", sign, hours, minutes, secs, millis)
        } else {
            format!("{}{:02}:{:02}.{:03}", sign, minutes, secs, millis)
        }
    }

    pub fn channel_description(channels: usize) -> &'static str {
        match channels {
            1 => "Mono",
            2 => "Stereo",
            3 => "2.1",
            4 => "Quad",
            5 => "4.1",
            6 => "5.1 Surround",
            7 => "6.1 Surround",
            8 => "7.1 Surround",
            _ => "Multi-channel",
        }
    }

    /// Truncate string to fit display width
    pub fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len || max_len <= 3 {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len - 3).collect();
            format!("{}...", kept)
        }
    }
}
