//! Video quality tiers and network-driven tier selection

use std::fmt;
use std::time::Duration;

/// Enumerated video quality tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityTier {
    P144,
    P240,
    P360,
    P480,
}

/// Resolution, pacing and compression parameters of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityParams {
    pub width: u16,
    pub height: u16,
    pub fps: u32,
    pub jpeg_quality: u8,
}

impl QualityTier {
    pub fn params(&self) -> QualityParams {
        match self {
            QualityTier::P144 => QualityParams {
                width: 256,
                height: 144,
                fps: 5,
                jpeg_quality: 40,
            },
            QualityTier::P240 => QualityParams {
                width: 426,
                height: 240,
                fps: 10,
                jpeg_quality: 50,
            },
            QualityTier::P360 => QualityParams {
                width: 640,
                height: 360,
                fps: 15,
                jpeg_quality: 60,
            },
            QualityTier::P480 => QualityParams {
                width: 854,
                height: 480,
                fps: 20,
                jpeg_quality: 70,
            },
        }
    }

    /// Target interval between captured frames.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.params().fps as u64)
    }

    pub fn label(&self) -> &'static str {
        match self {
            QualityTier::P144 => "144p",
            QualityTier::P240 => "240p",
            QualityTier::P360 => "360p",
            QualityTier::P480 => "480p",
        }
    }

    /// Pick a tier from the current loss percentage and RTT.
    ///
    /// Thresholds are strict: exactly 2% loss still qualifies for the top
    /// tier (RTT permitting), exactly 15% still maps to 240p.
    pub fn select(loss_pct: f64, rtt_ms: f64) -> QualityTier {
        if loss_pct > 15.0 {
            QualityTier::P144
        } else if loss_pct > 10.0 {
            QualityTier::P240
        } else if loss_pct > 2.0 {
            QualityTier::P360
        } else if rtt_ms > 400.0 {
            QualityTier::P360
        } else {
            QualityTier::P480
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parameters() {
        let p = QualityTier::P480.params();
        assert_eq!((p.width, p.height, p.fps, p.jpeg_quality), (854, 480, 20, 70));
        let p = QualityTier::P144.params();
        assert_eq!((p.width, p.height, p.fps, p.jpeg_quality), (256, 144, 5, 40));
    }

    #[test]
    fn selection_boundaries_are_strict() {
        // Exactly at each threshold the higher tier wins
        assert_eq!(QualityTier::select(2.0, 100.0), QualityTier::P480);
        assert_eq!(QualityTier::select(10.0, 100.0), QualityTier::P360);
        assert_eq!(QualityTier::select(15.0, 100.0), QualityTier::P240);

        // Just above each threshold the lower tier wins
        assert_eq!(QualityTier::select(2.1, 100.0), QualityTier::P360);
        assert_eq!(QualityTier::select(10.1, 100.0), QualityTier::P240);
        assert_eq!(QualityTier::select(15.1, 100.0), QualityTier::P144);
    }

    #[test]
    fn high_rtt_caps_clean_links_at_360p() {
        assert_eq!(QualityTier::select(0.0, 400.0), QualityTier::P480);
        assert_eq!(QualityTier::select(0.0, 400.1), QualityTier::P360);
        // RTT only matters when loss is low
        assert_eq!(QualityTier::select(20.0, 500.0), QualityTier::P144);
    }

    #[test]
    fn frame_interval_follows_fps() {
        assert_eq!(
            QualityTier::P480.frame_interval(),
            Duration::from_micros(50_000)
        );
        assert_eq!(
            QualityTier::P144.frame_interval(),
            Duration::from_micros(200_000)
        );
    }
}
