use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::models::{AudioFormat, PlaybackStatus};

const DEFAULT_MAX_EVENTS: usize = 1000;

/// Notifications emitted by the player for its host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PipelineEvent {
    /// The device was (re)opened or the filter chain renegotiated
    FormatChanged { device: String, format: AudioFormat },
    DeviceClosed,
    StatusChanged { from: PlaybackStatus, to: PlaybackStatus },
    PlaybackStarted,
    /// Device clock drift against wall time, in seconds
    Stats { drift: f64 },
    DropAudio { samples: usize },
    DuplicateAudio { samples: usize },
    /// The host should seek the audio track to this position
    SeekAudio { pts: Option<f64> },
    /// A timestamp reset asks the host to reset the whole playback position
    ResetPlayback,
    /// Buffered audio was thrown away; the host should seek to the current position
    RefreshSeek,
    /// Changing the playback speed failed and it was set back to 1.0
    SpeedReset,
    TrackFailed { reason: String },
    AudioEof,
}

impl PipelineEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineEvent::FormatChanged { .. } => "FORMAT_CHANGED",
            PipelineEvent::DeviceClosed => "DEVICE_CLOSED",
            PipelineEvent::StatusChanged { .. } => "STATUS_CHANGED",
            PipelineEvent::PlaybackStarted => "PLAYBACK_STARTED",
            PipelineEvent::Stats { .. } => "STATS",
            PipelineEvent::DropAudio { .. } => "DROP_AUDIO",
            PipelineEvent::DuplicateAudio { .. } => "DUPLICATE_AUDIO",
            PipelineEvent::SeekAudio { .. } => "SEEK_AUDIO",
            PipelineEvent::ResetPlayback => "RESET_PLAYBACK",
            PipelineEvent::RefreshSeek => "REFRESH_SEEK",
            PipelineEvent::SpeedReset => "SPEED_RESET",
            PipelineEvent::TrackFailed { .. } => "TRACK_FAILED",
            PipelineEvent::AudioEof => "AUDIO_EOF",
        }
    }
}

/// One entry of the event history
#[derive(Debug, Clone, Serialize)]
pub struct LoggedEvent {
    pub timestamp: DateTime<Utc>,
    pub event: PipelineEvent,
}

/// Initialize logging system with appropriate log level
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let log_level = std::env::var("HIRES_PIPELINE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    init_with_level(&log_level)
}

/// Initialize logging with an explicit level name
pub fn init_with_level(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = env_logger::Builder::new();

    builder.format(|buf, record| {
        use std::io::Write;
        writeln!(
            buf,
            "{} [{}] [{}:{}] {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    });

    match log_level.to_lowercase().as_str() {
        "trace" => builder.filter_level(log::LevelFilter::Trace),
        "debug" => builder.filter_level(log::LevelFilter::Debug),
        "info" => builder.filter_level(log::LevelFilter::Info),
        "warn" => builder.filter_level(log::LevelFilter::Warn),
        "error" => builder.filter_level(log::LevelFilter::Error),
        _ => builder.filter_level(log::LevelFilter::Info),
    };

    builder.try_init()?;

    info!("Pipeline logging initialized with level: {}", log_level);
    Ok(())
}

/// Bounded, shareable history of pipeline events
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<VecDeque<LoggedEvent>>>,
    max_events: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("events", &self.lock().len())
            .field("max_events", &self.max_events)
            .finish()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }

    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            max_events: max_events.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LoggedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an event and mirror it to the log facade
    pub fn record(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::FormatChanged { device, format } => {
                info!("[{}] {} {}", event.as_str(), device, format)
            }
            PipelineEvent::PlaybackStarted | PipelineEvent::AudioEof => {
                info!("[{}]", event.as_str())
            }
            PipelineEvent::StatusChanged { from, to } => {
                debug!("[{}] {} -> {}", event.as_str(), from, to)
            }
            PipelineEvent::Stats { drift } => {
                debug!(target: "stats", "value {:.6} ao-dev", drift)
            }
            PipelineEvent::DropAudio { samples } | PipelineEvent::DuplicateAudio { samples } => {
                debug!(target: "stats", "[{}] {} samples", event.as_str(), samples)
            }
            PipelineEvent::SeekAudio { pts } => debug!("[{}] {:?}", event.as_str(), pts),
            PipelineEvent::DeviceClosed | PipelineEvent::ResetPlayback | PipelineEvent::RefreshSeek => {
                debug!("[{}]", event.as_str())
            }
            PipelineEvent::SpeedReset => warn!("[{}] playback speed reset to 1.0", event.as_str()),
            PipelineEvent::TrackFailed { reason } => error!("[{}] {}", event.as_str(), reason),
        }

        let mut events = self.lock();
        events.push_back(LoggedEvent {
            timestamp: Utc::now(),
            event: event.clone(),
        });
        while events.len() > self.max_events {
            events.pop_front();
        }
    }

    /// Get recent events for debugging
    pub fn recent(&self, count: usize) -> Vec<LoggedEvent> {
        let events = self.lock();
        let skip = events.len().saturating_sub(count);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn statistics(&self) -> EventStatistics {
        let events = self.lock();
        let mut stats = EventStatistics {
            total_events: events.len(),
            ..EventStatistics::default()
        };

        for logged in events.iter() {
            match &logged.event {
                PipelineEvent::FormatChanged { .. } => stats.format_changes += 1,
                PipelineEvent::DropAudio { samples } => {
                    stats.drops += 1;
                    stats.dropped_samples += samples;
                }
                PipelineEvent::DuplicateAudio { samples } => {
                    stats.duplicates += 1;
                    stats.duplicated_samples += samples;
                }
                PipelineEvent::SeekAudio { .. } | PipelineEvent::RefreshSeek => stats.seek_requests += 1,
                PipelineEvent::TrackFailed { .. } => stats.track_failures += 1,
                _ => {}
            }
        }
        stats
    }
}

/// Statistics about logged events
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStatistics {
    pub total_events: usize,
    pub format_changes: usize,
    pub drops: usize,
    pub dropped_samples: usize,
    pub duplicates: usize,
    pub duplicated_samples: usize,
    pub seek_requests: usize,
    pub track_failures: usize,
}

/// Timer utility for measuring operation durations
pub struct OperationTimer {
    start_time: Instant,
    operation_name: String,
}

impl OperationTimer {
    pub fn new(operation_name: &str) -> Self {
        trace!("Starting operation: {}", operation_name);
        Self {
            start_time: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn finish_with_threshold(self, threshold: Duration) -> Duration {
        let duration = self.elapsed();
        if duration > threshold {
            warn!(
                "Operation '{}' took {:.2}ms (threshold: {:.2}ms)",
                self.operation_name,
                duration.as_secs_f64() * 1000.0,
                threshold.as_secs_f64() * 1000.0
            );
        } else {
            trace!(
                "Completed operation '{}' in {:.2}ms",
                self.operation_name,
                duration.as_secs_f64() * 1000.0
            );
        }
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_log_creation() {
        let log = EventLog::new();
        assert_eq!(log.max_events, 1000);
        assert!(log.recent(10).is_empty());
    }

    #[test]
    fn test_record_event() {
        let log = EventLog::new();
        log.record(&PipelineEvent::PlaybackStarted);

        let events = log.recent(1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, PipelineEvent::PlaybackStarted);
    }

    #[test]
    fn test_event_history_limit() {
        let log = EventLog::with_capacity(3);
        for samples in 0..5 {
            log.record(&PipelineEvent::DropAudio { samples });
        }

        let events = log.recent(10);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event, PipelineEvent::DropAudio { samples: 2 });
        assert_eq!(events[2].event, PipelineEvent::DropAudio { samples: 4 });
    }

    #[test]
    fn test_clones_share_history() {
        let log = EventLog::new();
        let other = log.clone();
        other.record(&PipelineEvent::AudioEof);
        assert_eq!(log.recent(5).len(), 1);

        log.clear();
        assert!(other.recent(5).is_empty());
    }

    #[test]
    fn test_event_statistics() {
        let log = EventLog::new();
        log.record(&PipelineEvent::DropAudio { samples: 960 });
        log.record(&PipelineEvent::DropAudio { samples: 960 });
        log.record(&PipelineEvent::DuplicateAudio { samples: 480 });
        log.record(&PipelineEvent::RefreshSeek);
        log.record(&PipelineEvent::TrackFailed {
            reason: "no device".to_string(),
        });

        let stats = log.statistics();
        assert_eq!(stats.total_events, 5);
        assert_eq!(stats.drops, 2);
        assert_eq!(stats.dropped_samples, 1920);
        assert_eq!(stats.duplicated_samples, 480);
        assert_eq!(stats.seek_requests, 1);
        assert_eq!(stats.track_failures, 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = PipelineEvent::StatusChanged {
            from: PlaybackStatus::Syncing,
            to: PlaybackStatus::Filling,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"status-changed\""));
        assert!(json.contains("Syncing"));
    }

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::new("negotiate");
        let elapsed = timer.finish_with_threshold(Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(10));
    }
}
