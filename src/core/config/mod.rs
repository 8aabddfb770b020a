use std::fs::File;
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

fn duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

fn duration_us<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let us = u64::deserialize(deserializer)?;
    Ok(Duration::from_micros(us))
}

fn as_ms<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(d.as_millis() as u64)
}

fn as_us<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(d.as_micros() as u64)
}

/*
  Every duration the link uses lives here. The defaults are the design
  point of the wire protocol; each value is a minimum guaranteed hold,
  so a slower table still interoperates with a faster peer.

  Microsecond fields: data_settle, clock_hold, inter_tick_gap.
  Millisecond fields: everything else.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkTiming {
    // TX tick shaping
    #[serde(deserialize_with = "duration_us", serialize_with = "as_us")]
    pub data_settle: Duration,
    #[serde(deserialize_with = "duration_us", serialize_with = "as_us")]
    pub clock_hold: Duration,
    #[serde(deserialize_with = "duration_us", serialize_with = "as_us")]
    pub inter_tick_gap: Duration,
    #[serde(deserialize_with = "duration_ms", serialize_with = "as_ms")]
    pub inter_byte_gap: Duration,

    // RX acknowledgement pulse shaping
    #[serde(deserialize_with = "duration_ms", serialize_with = "as_ms")]
    pub ack_pulse: Duration,
    #[serde(deserialize_with = "duration_ms", serialize_with = "as_ms")]
    pub ack_release: Duration,

    // Waits and watchdogs
    #[serde(deserialize_with = "duration_ms", serialize_with = "as_ms")]
    pub ack_wait: Duration,
    #[serde(deserialize_with = "duration_ms", serialize_with = "as_ms")]
    pub state_watchdog: Duration,

    // Retry discipline
    pub handshake_attempts: u32,
    #[serde(deserialize_with = "duration_ms", serialize_with = "as_ms")]
    pub handshake_pause: Duration,
    pub retry_limit: u32,
    #[serde(deserialize_with = "duration_ms", serialize_with = "as_ms")]
    pub backoff_base: Duration,
    #[serde(deserialize_with = "duration_ms", serialize_with = "as_ms")]
    pub backoff_step: Duration,

    // Line hygiene
    #[serde(deserialize_with = "duration_ms", serialize_with = "as_ms")]
    pub clock_debounce: Duration,
    #[serde(deserialize_with = "duration_ms", serialize_with = "as_ms")]
    pub ack_debounce: Duration,
    // Clock edges per second before the RX declares a burst. 0 disables.
    pub burst_limit: u32,
    pub max_invalid_ticks: u32,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            data_settle: Duration::from_micros(5),
            clock_hold: Duration::from_micros(5),
            inter_tick_gap: Duration::from_micros(5),
            inter_byte_gap: Duration::from_millis(2),
            ack_pulse: Duration::from_millis(5),
            ack_release: Duration::from_millis(1),
            ack_wait: Duration::from_millis(300),
            state_watchdog: Duration::from_millis(500),
            handshake_attempts: 5,
            handshake_pause: Duration::from_millis(80),
            retry_limit: 5,
            backoff_base: Duration::from_millis(50),
            backoff_step: Duration::from_millis(10),
            clock_debounce: Duration::from_millis(1),
            ack_debounce: Duration::from_millis(2),
            burst_limit: 1000,
            max_invalid_ticks: 10,
        }
    }
}

impl LinkTiming {
    /// Zero-delay profile with line hygiene relaxed. Keeps the retry and
    /// watchdog discipline meaningful while letting a test drive the bus
    /// as fast as the host allows.
    pub fn immediate() -> Self {
        Self {
            data_settle: Duration::ZERO,
            clock_hold: Duration::ZERO,
            inter_tick_gap: Duration::ZERO,
            inter_byte_gap: Duration::ZERO,
            ack_pulse: Duration::ZERO,
            ack_release: Duration::ZERO,
            ack_wait: Duration::from_millis(100),
            state_watchdog: Duration::from_millis(500),
            handshake_attempts: 5,
            handshake_pause: Duration::from_millis(1),
            retry_limit: 5,
            backoff_base: Duration::from_millis(1),
            backoff_step: Duration::ZERO,
            clock_debounce: Duration::ZERO,
            ack_debounce: Duration::ZERO,
            burst_limit: 0,
            max_invalid_ticks: 10,
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, String> {
        let file = File::open(path)
            .map_err(|e| format!("cannot open timing file {}: {}", path.display(), e))?;
        serde_yaml::from_reader(file)
            .map_err(|e| format!("invalid timing file {}: {}", path.display(), e))
    }

    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.backoff_base + self.backoff_step * retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_design_point() {
        let t = LinkTiming::default();
        assert_eq!(t.clock_hold, Duration::from_micros(5));
        assert_eq!(t.inter_byte_gap, Duration::from_millis(2));
        assert_eq!(t.ack_wait, Duration::from_millis(300));
        assert_eq!(t.state_watchdog, Duration::from_millis(500));
        assert_eq!(t.retry_limit, 5);
        assert_eq!(t.handshake_attempts, 5);
    }

    #[test]
    fn backoff_is_linear() {
        let t = LinkTiming::default();
        assert_eq!(t.backoff_for(1), Duration::from_millis(60));
        assert_eq!(t.backoff_for(4), Duration::from_millis(90));
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("epaper_timing_{}.yaml", std::process::id()));
        let mut f = File::create(&path).unwrap();
        writeln!(f, "ack_wait: 150").unwrap();
        writeln!(f, "retry_limit: 3").unwrap();
        drop(f);

        let t = LinkTiming::load_from_file(&path).unwrap();
        assert_eq!(t.ack_wait, Duration::from_millis(150));
        assert_eq!(t.retry_limit, 3);
        // untouched fields keep their defaults
        assert_eq!(t.state_watchdog, Duration::from_millis(500));
        std::fs::remove_file(&path).ok();
    }
}
