//! Call quality assessment
//!
//! Turns transport statistics into a 0-100 score and a four-level state for
//! UI feedback. Scoring is pure: it depends only on the report passed in.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Four-level call quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityState {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityState {
    /// Bands: >=85 Excellent, 70..=84 Good, 50..=69 Fair, <50 Poor
    pub fn from_score(score: u8) -> Self {
        match score {
            85.. => QualityState::Excellent,
            70..=84 => QualityState::Good,
            50..=69 => QualityState::Fair,
            _ => QualityState::Poor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityState::Excellent => "excellent",
            QualityState::Good => "good",
            QualityState::Fair => "fair",
            QualityState::Poor => "poor",
        }
    }
}

/// One sample of connection quality
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Packet loss percentage (0-100)
    pub packet_loss_pct: f64,
    /// Current bitrate in bits per second
    pub bitrate_bps: f64,
    pub resolution_width: u32,
    pub resolution_height: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_encoded: u64,
    pub frames_decoded: u64,
}

impl QualityReport {
    pub fn quality_score(&self) -> u8 {
        calculate_quality_score(self)
    }

    pub fn quality_state(&self) -> QualityState {
        quality_state(self)
    }
}

fn rtt_penalty(rtt_ms: f64) -> u32 {
    if rtt_ms < 50.0 {
        0
    } else if rtt_ms < 100.0 {
        10
    } else if rtt_ms < 200.0 {
        30
    } else {
        50
    }
}

fn loss_penalty(loss_pct: f64) -> u32 {
    if loss_pct < 1.0 {
        0
    } else if loss_pct < 3.0 {
        10
    } else if loss_pct < 5.0 {
        20
    } else {
        40
    }
}

fn bitrate_penalty(bitrate_bps: f64) -> u32 {
    if bitrate_bps > 1_000_000.0 {
        0
    } else if bitrate_bps > 500_000.0 {
        5
    } else if bitrate_bps > 250_000.0 {
        15
    } else {
        25
    }
}

/// Score a report: 100 minus the RTT, loss and bitrate penalties, floored at 0.
///
/// NaN metrics fall through every comparison and take the worst penalty.
pub fn calculate_quality_score(report: &QualityReport) -> u8 {
    let penalty = rtt_penalty(report.rtt_ms)
        + loss_penalty(report.packet_loss_pct)
        + bitrate_penalty(report.bitrate_bps);
    100u32.saturating_sub(penalty) as u8
}

pub fn quality_state(report: &QualityReport) -> QualityState {
    QualityState::from_score(calculate_quality_score(report))
}

/// Raw statistics pulled from the engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Current round-trip time of the active candidate pair, in seconds
    pub rtt_secs: f64,
    pub packets_lost: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_encoded: u64,
    pub frames_decoded: u64,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Bitrate when the engine reports it directly
    pub bitrate_bps: Option<f64>,
}

/// Derives [`QualityReport`]s from successive snapshots.
///
/// Only the previous sample is retained, to compute a delta bitrate when the
/// engine does not report one.
#[derive(Debug, Default)]
pub struct StatsSampler {
    previous: Option<(Instant, u64)>,
}

impl StatsSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, snapshot: &StatsSnapshot, now: Instant) -> QualityReport {
        let total_packets = snapshot.packets_lost + snapshot.packets_received;
        let packet_loss_pct = if total_packets > 0 {
            snapshot.packets_lost as f64 / total_packets as f64 * 100.0
        } else {
            0.0
        };

        let total_bytes = snapshot.bytes_sent + snapshot.bytes_received;
        let bitrate_bps = match snapshot.bitrate_bps {
            Some(bps) => bps,
            None => match self.previous {
                Some((at, bytes)) => {
                    let elapsed = now.saturating_duration_since(at).as_secs_f64();
                    if elapsed > 0.0 {
                        total_bytes.saturating_sub(bytes) as f64 * 8.0 / elapsed
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            },
        };
        self.previous = Some((now, total_bytes));

        QualityReport {
            timestamp_ms: unix_millis(),
            rtt_ms: snapshot.rtt_secs * 1000.0,
            packet_loss_pct,
            bitrate_bps,
            resolution_width: snapshot.frame_width,
            resolution_height: snapshot.frame_height,
            bytes_sent: snapshot.bytes_sent,
            bytes_received: snapshot.bytes_received,
            frames_encoded: snapshot.frames_encoded,
            frames_decoded: snapshot.frames_decoded,
        }
    }

    /// Forget the previous sample
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn report(rtt_ms: f64, packet_loss_pct: f64, bitrate_bps: f64) -> QualityReport {
        QualityReport {
            timestamp_ms: 0,
            rtt_ms,
            packet_loss_pct,
            bitrate_bps,
            resolution_width: 1280,
            resolution_height: 720,
            bytes_sent: 0,
            bytes_received: 0,
            frames_encoded: 0,
            frames_decoded: 0,
        }
    }

    #[test]
    fn test_perfect_report_scores_100() {
        let r = report(20.0, 0.0, 2_000_000.0);
        assert_eq!(calculate_quality_score(&r), 100);
        assert_eq!(quality_state(&r), QualityState::Excellent);
    }

    #[test]
    fn test_worst_case_is_zero() {
        let r = report(1000.0, 100.0, 0.0);
        assert_eq!(calculate_quality_score(&r), 0);
        assert_eq!(quality_state(&r), QualityState::Poor);
    }

    #[test]
    fn test_penalty_band_edges() {
        assert_eq!(calculate_quality_score(&report(50.0, 0.0, 2e6)), 90);
        assert_eq!(calculate_quality_score(&report(100.0, 0.0, 2e6)), 70);
        assert_eq!(calculate_quality_score(&report(200.0, 0.0, 2e6)), 50);
        assert_eq!(calculate_quality_score(&report(0.0, 1.0, 2e6)), 90);
        assert_eq!(calculate_quality_score(&report(0.0, 3.0, 2e6)), 80);
        assert_eq!(calculate_quality_score(&report(0.0, 5.0, 2e6)), 60);
        assert_eq!(calculate_quality_score(&report(0.0, 0.0, 1_000_000.0)), 95);
        assert_eq!(calculate_quality_score(&report(0.0, 0.0, 500_000.0)), 85);
        assert_eq!(calculate_quality_score(&report(0.0, 0.0, 250_000.0)), 75);
    }

    #[test]
    fn test_penalties_are_additive() {
        // 10 (rtt) + 10 (loss) + 5 (bitrate)
        let r = report(75.0, 2.0, 750_000.0);
        assert_eq!(r.quality_score(), 75);
        assert_eq!(r.quality_state(), QualityState::Good);
    }

    #[test]
    fn test_state_bands_cover_every_score() {
        for score in 0..=100u8 {
            let expected = if score >= 85 {
                QualityState::Excellent
            } else if score >= 70 {
                QualityState::Good
            } else if score >= 50 {
                QualityState::Fair
            } else {
                QualityState::Poor
            };
            assert_eq!(QualityState::from_score(score), expected, "score {}", score);
        }
        assert_eq!(QualityState::from_score(84), QualityState::Good);
        assert_eq!(QualityState::from_score(69), QualityState::Fair);
        assert_eq!(QualityState::from_score(49), QualityState::Poor);
    }

    #[test]
    fn test_nan_metrics_take_worst_penalty() {
        let r = report(f64::NAN, f64::NAN, f64::NAN);
        assert_eq!(calculate_quality_score(&r), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_delta_bitrate() {
        let mut sampler = StatsSampler::new();
        let mut snap = StatsSnapshot {
            rtt_secs: 0.045,
            packets_lost: 2,
            packets_received: 98,
            bytes_sent: 10_000,
            bytes_received: 10_000,
            ..Default::default()
        };

        let t0 = Instant::now();
        let first = sampler.sample(&snap, t0);
        assert_eq!(first.bitrate_bps, 0.0);
        assert!((first.rtt_ms - 45.0).abs() < 1e-9);
        assert!((first.packet_loss_pct - 2.0).abs() < 1e-9);

        snap.bytes_sent += 125_000;
        snap.bytes_received += 125_000;
        let second = sampler.sample(&snap, t0 + Duration::from_secs(1));
        assert!((second.bitrate_bps - 2_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_sampler_prefers_engine_bitrate() {
        let mut sampler = StatsSampler::new();
        let snap = StatsSnapshot { bitrate_bps: Some(640_000.0), ..Default::default() };
        let r = sampler.sample(&snap, Instant::now());
        assert_eq!(r.bitrate_bps, 640_000.0);
        assert_eq!(r.packet_loss_pct, 0.0);
    }
}
