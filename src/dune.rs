//! Dune confidence scoring.
//!
//! Pure arithmetic over readings that were taken elsewhere: a camera frame,
//! the ultrasonic range and the infrared obstacle flag. Nothing here talks
//! to hardware.

use serde::Serialize;

/// Range below which the ultrasonic sensor counts as "something close".
pub const DEFAULT_DISTANCE_THRESHOLD_M: f64 = 1.0;

const CAMERA_WEIGHT: f64 = 0.7;
const CLOSE_RANGE_BONUS: f64 = 0.25;
const OBSTACLE_BONUS: f64 = 0.15;

const BRIGHTNESS_WEIGHT: f64 = 0.6;
const TEXTURE_WEIGHT: f64 = 0.4;
/// Grey-level standard deviation at which a frame stops looking like sand.
const TEXTURE_SPREAD: f64 = 64.0;

/// One round of sensor readings. Missing readings are `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SensorReadings {
    pub distance_m: Option<f64>,
    pub obstacle: bool,
    /// Output of [`frame_confidence`].
    pub camera_confidence: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DuneAssessment {
    pub readings: SensorReadings,
    /// 0.0 to 1.0
    pub dune_confidence: f64,
}

/// Brightness/texture proxy for a frame of interleaved 8-bit samples.
///
/// Bright, smooth frames score high. `channels` is 1 for grey, 3 for RGB;
/// a trailing partial pixel is ignored.
pub fn frame_confidence(pixels: &[u8], channels: usize) -> f64 {
    let channels = channels.max(1);
    let grey: Vec<f64> = pixels
        .chunks_exact(channels)
        .map(|px| px.iter().map(|&v| f64::from(v)).sum::<f64>() / channels as f64)
        .collect();
    if grey.is_empty() {
        return 0.0;
    }

    let n = grey.len() as f64;
    let mean = grey.iter().sum::<f64>() / n;
    let variance = grey.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let brightness = mean / 255.0;
    let texture = 1.0 - clamp01(variance.sqrt() / TEXTURE_SPREAD);

    clamp01(BRIGHTNESS_WEIGHT * brightness + TEXTURE_WEIGHT * texture)
}

/// Weighted blend of the three readings.
pub fn dune_confidence(readings: &SensorReadings, distance_threshold_m: f64) -> f64 {
    let mut confidence = readings.camera_confidence.unwrap_or(0.0) * CAMERA_WEIGHT;
    if readings
        .distance_m
        .is_some_and(|distance| distance < distance_threshold_m)
    {
        confidence += CLOSE_RANGE_BONUS;
    }
    if readings.obstacle {
        confidence += OBSTACLE_BONUS;
    }
    clamp01(confidence)
}

pub fn assess(readings: SensorReadings, distance_threshold_m: f64) -> DuneAssessment {
    DuneAssessment {
        dune_confidence: dune_confidence(&readings, distance_threshold_m),
        readings,
    }
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn empty_frame_scores_zero() {
        assert_eq!(frame_confidence(&[], 3), 0.0);
    }

    #[test]
    fn flat_white_frame_is_maximal() {
        assert!(close(frame_confidence(&[255; 30], 3), 1.0));
    }

    #[test]
    fn flat_black_frame_only_scores_texture() {
        assert!(close(frame_confidence(&[0; 16], 1), 0.4));
    }

    #[test]
    fn high_contrast_frame_loses_texture_term() {
        // grey 0 and 255 alternating: mean 127.5, std 127.5
        let pixels: Vec<u8> = (0..64).map(|i| if i % 2 == 0 { 0 } else { 255 }).collect();
        assert!(close(frame_confidence(&pixels, 1), 0.6 * 0.5));
    }

    #[test]
    fn rgb_channels_are_averaged() {
        let rgb = [30u8, 60, 90, 30, 60, 90];
        let grey = [60u8, 60];
        assert!(close(frame_confidence(&rgb, 3), frame_confidence(&grey, 1)));
    }

    #[test]
    fn blend_adds_range_and_obstacle_bonuses() {
        let readings = SensorReadings {
            distance_m: Some(0.4),
            obstacle: true,
            camera_confidence: Some(0.5),
        };
        assert!(close(dune_confidence(&readings, 1.0), 0.35 + 0.25 + 0.15));
    }

    #[test]
    fn missing_readings_contribute_nothing() {
        assert_eq!(dune_confidence(&SensorReadings::default(), 1.0), 0.0);
        let far = SensorReadings {
            distance_m: Some(3.0),
            ..SensorReadings::default()
        };
        assert_eq!(dune_confidence(&far, 1.0), 0.0);
    }

    #[test]
    fn confidence_is_clamped() {
        let readings = SensorReadings {
            distance_m: Some(0.1),
            obstacle: true,
            camera_confidence: Some(1.0),
        };
        let assessment = assess(readings, DEFAULT_DISTANCE_THRESHOLD_M);
        assert_eq!(assessment.dune_confidence, 1.0);
    }
}
