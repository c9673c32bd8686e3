//! Offset and skew estimation from exchange samples.
//!
//! Each completed exchange with a peer produces one [`Sample`]:
//!
//! ```text
//!   local   challenged ─────────────────────► received
//!                 \                        /
//!   peer           └──────► remote_sent ──┘
//! ```
//!
//! Both `(remote_sent, challenged)` and `(remote_sent, received)` enter an
//! ordinary least-squares fit of local time against peer time. The slope is
//! the rate of the local clock relative to the peer (`1.0` when they tick
//! together) and the intercept at "now" is the offset before the one-way lag
//! correction.

use chrono::{DateTime, Utc};

/// One round trip with a peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Peer's unsynchronized clock when it sent the response.
    pub remote_sent: DateTime<Utc>,
    /// Local clock when the query went out.
    pub challenged: DateTime<Utc>,
    /// Local clock when the response arrived.
    pub received: DateTime<Utc>,
}

/// Result of [`estimate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// Peer clock minus local clock.
    pub offset: chrono::Duration,
    /// Fitted slope; `1.0` means no relative drift.
    pub slope: f64,
    /// Estimated one-way network delay.
    pub lag: chrono::Duration,
}

impl Estimate {
    /// Drift stored in the clock table (`slope - 1`).
    pub fn skew(&self) -> f64 {
        self.slope - 1.0
    }
}

fn seconds_since(t: DateTime<Utc>, base: DateTime<Utc>) -> f64 {
    (t - base)
        .num_microseconds()
        .map_or(0.0, |us| us as f64 / 1_000_000.0)
}

fn from_seconds(secs: f64) -> chrono::Duration {
    chrono::Duration::microseconds((secs * 1_000_000.0).round() as i64)
}

/// Fits the history relative to `base` (normally the current local time).
///
/// Returns `None` for an empty history. A history with no spread in peer
/// time falls back to a slope of `1.0`.
pub fn estimate(samples: &[Sample], base: DateTime<Utc>) -> Option<Estimate> {
    if samples.is_empty() {
        return None;
    }

    let points: Vec<(f64, f64)> = samples
        .iter()
        .flat_map(|s| {
            let x = seconds_since(s.remote_sent, base);
            [
                (x, seconds_since(s.challenged, base)),
                (x, seconds_since(s.received, base)),
            ]
        })
        .collect();
    let n = points.len() as f64;

    let (sum_x, sum_y) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));

    // Challenge times count negative, receive times positive.
    let sum_lag: f64 = points
        .iter()
        .enumerate()
        .map(|(i, (_, y))| if i % 2 == 0 { -y } else { *y })
        .sum();
    let lag = sum_lag / n;

    let x_bar = sum_x / n;
    let y_bar = sum_y / n;

    let (sxy, sxx) = points.iter().fold((0.0, 0.0), |(sxy, sxx), (x, y)| {
        let dx = x - x_bar;
        let dy = y - y_bar;
        (sxy + dx * dy, sxx + dx * dx)
    });

    let slope = if sxx == 0.0 { 1.0 } else { sxy / sxx };
    let mut alpha = y_bar - slope * x_bar;
    if alpha <= 0.0 {
        alpha += lag;
    } else {
        alpha -= lag;
    }

    Some(Estimate {
        offset: from_seconds(-alpha),
        slope,
        lag: from_seconds(lag),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const EPSILON_US: i64 = 50;

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    /// Peer runs `delta` ahead and answers instantly.
    fn constant_offset_history(delta: Duration, count: i64) -> Vec<Sample> {
        (0..count)
            .map(|i| {
                let local = base() - Duration::seconds(10 * (count - i));
                Sample {
                    remote_sent: local + delta,
                    challenged: local,
                    received: local,
                }
            })
            .collect()
    }

    #[test]
    fn empty_history_has_no_estimate() {
        assert!(estimate(&[], base()).is_none());
    }

    #[test]
    fn recovers_known_positive_offset() {
        let delta = Duration::milliseconds(750);
        let est = estimate(&constant_offset_history(delta, 20), base()).unwrap();

        assert!((est.offset - delta).num_microseconds().unwrap().abs() < EPSILON_US);
        assert!((est.slope - 1.0).abs() < 1e-6);
        assert!(est.skew().abs() < 1e-6);
    }

    #[test]
    fn recovers_known_negative_offset() {
        let delta = Duration::milliseconds(-2300);
        let est = estimate(&constant_offset_history(delta, 20), base()).unwrap();
        assert!((est.offset - delta).num_microseconds().unwrap().abs() < EPSILON_US);
        assert!((est.slope - 1.0).abs() < 1e-6);
    }

    #[test]
    fn lag_is_half_the_mean_round_trip() {
        let samples: Vec<Sample> = (0..4)
            .map(|i| {
                let challenged = base() - Duration::seconds(40 - 10 * i);
                Sample {
                    remote_sent: challenged + Duration::milliseconds(5),
                    challenged,
                    received: challenged + Duration::milliseconds(10),
                }
            })
            .collect();
        let est = estimate(&samples, base()).unwrap();
        assert!((est.lag - Duration::milliseconds(5)).num_microseconds().unwrap().abs() < EPSILON_US);
    }

    #[test]
    fn zero_spread_falls_back_to_unit_slope() {
        let t = base() - Duration::seconds(1);
        let sample = Sample {
            remote_sent: t + Duration::seconds(2),
            challenged: t,
            received: t,
        };
        let est = estimate(&[sample, sample], base()).unwrap();
        assert_eq!(est.slope, 1.0);
        assert!((est.offset - Duration::seconds(2)).num_microseconds().unwrap().abs() < EPSILON_US);
    }
}
