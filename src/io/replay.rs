//! Location provider replay from JSONL
//!
//! Each line is either a tagged provider update
//! (`{"type":"fix","ts":..,"lat":..,"lon":..}`, `{"type":"status","enabled":false}`)
//! or a bare fix (`{"ts":..,"lat":..,"lon":..}`). Fixes are paced by their
//! timestamps divided by the speed factor; a speed of 0 replays unpaced.

use crate::domain::types::{LocationSample, ProviderUpdate};
use anyhow::Context;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Longest pause between two replayed fixes
const MAX_GAP: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReplayStats {
    pub sent: usize,
    pub skipped: usize,
}

/// Parse one replay line; blank lines and `#` comments yield `None`
pub fn parse_line(line: &str) -> Result<Option<ProviderUpdate>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    match serde_json::from_str::<ProviderUpdate>(line) {
        Ok(update) => Ok(Some(update)),
        Err(tagged_err) => match serde_json::from_str::<LocationSample>(line) {
            Ok(sample) => Ok(Some(ProviderUpdate::Fix(sample))),
            Err(_) => Err(tagged_err),
        },
    }
}

/// Replay updates from `reader` into the provider channel until EOF or shutdown
pub async fn replay_reader<R>(
    reader: R,
    speed: f64,
    tx: mpsc::Sender<ProviderUpdate>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<ReplayStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = ReplayStats::default();
    let mut last_ts: Option<u64> = None;

    loop {
        let line = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            line = lines.next_line() => line.context("Failed to read replay input")?,
        };
        let Some(line) = line else {
            break;
        };

        let update = match parse_line(&line) {
            Ok(Some(update)) => update,
            Ok(None) => continue,
            Err(e) => {
                stats.skipped += 1;
                warn!(error = %e, "replay_line_invalid");
                continue;
            }
        };

        if let ProviderUpdate::Fix(sample) = &update {
            if let Some(prev) = last_ts {
                let gap = pacing_delay(prev, sample.timestamp, speed);
                if !gap.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(gap) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
            last_ts = Some(sample.timestamp);
        }

        if tx.send(update).await.is_err() {
            debug!("replay_receiver_closed");
            break;
        }
        stats.sent += 1;
    }

    info!(sent = %stats.sent, skipped = %stats.skipped, "replay_finished");
    Ok(stats)
}

/// Replay a JSONL file
pub async fn replay_file(
    path: &Path,
    speed: f64,
    tx: mpsc::Sender<ProviderUpdate>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<ReplayStats> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open replay file: {}", path.display()))?;
    info!(path = %path.display(), speed = %speed, "replay_started");
    replay_reader(BufReader::new(file), speed, tx, shutdown).await
}

#[inline]
fn pacing_delay(prev_ts: u64, ts: u64, speed: f64) -> Duration {
    if speed <= 0.0 || !speed.is_finite() || ts <= prev_ts {
        return Duration::ZERO;
    }
    Duration::from_secs_f64((ts - prev_ts) as f64 / 1000.0 / speed).min(MAX_GAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_and_bare() {
        let tagged = parse_line(r#"{"type":"fix","ts":1000,"lat":1.0,"lon":2.0}"#).unwrap().unwrap();
        let bare = parse_line(r#"{"ts":1000,"lat":1.0,"lon":2.0}"#).unwrap().unwrap();
        assert_eq!(tagged, bare);

        assert!(matches!(
            parse_line(r#"{"type":"status","enabled":false}"#).unwrap(),
            Some(ProviderUpdate::Status(_))
        ));
        assert_eq!(parse_line("  # comment").unwrap(), None);
        assert_eq!(parse_line("").unwrap(), None);
        assert!(parse_line("{broken").is_err());
    }

    #[test]
    fn test_pacing_delay() {
        assert_eq!(pacing_delay(1_000, 3_000, 1.0), Duration::from_secs(2));
        assert_eq!(pacing_delay(1_000, 3_000, 4.0), Duration::from_millis(500));
        assert_eq!(pacing_delay(3_000, 1_000, 1.0), Duration::ZERO);
        assert_eq!(pacing_delay(1_000, 3_000, 0.0), Duration::ZERO);
        assert_eq!(pacing_delay(0, 3_600_000, 1.0), MAX_GAP);
    }

    #[tokio::test]
    async fn test_replay_reader_sends_valid_lines() {
        let input = "{\"ts\":1000,\"lat\":1.0,\"lon\":2.0}\nnot json\n\n{\"type\":\"status\",\"enabled\":true}\n";
        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let stats = replay_reader(input.as_bytes(), 0.0, tx, shutdown_rx).await.unwrap();
        assert_eq!(stats, ReplayStats { sent: 2, skipped: 1 });
        assert!(matches!(rx.recv().await, Some(ProviderUpdate::Fix(_))));
        assert!(matches!(rx.recv().await, Some(ProviderUpdate::Status(_))));
        assert!(rx.recv().await.is_none());
    }
}
