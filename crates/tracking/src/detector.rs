//! Bridge between external detection backends and the tracking pipeline.
//!
//! Vision backends are opaque here: whatever produced them (Haar cascades,
//! TFLite, remote inference), detections arrive as bounding boxes through
//! [`DetectorBridge::on_detection`]. Only the largest box per callback is
//! tracked; its centroid is forwarded into the command pipeline through the
//! sink the bridge was built with.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::trace;

/// One detection reported by a vision backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub confidence: f32,
}

impl Detection {
    pub fn area(&self) -> f64 {
        self.w * self.h
    }

    pub fn centroid(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }
}

/// The single capability the tracking side consumes from a detector.
pub trait TargetSource: Send + Sync {
    /// Centroid and timestamp of the most recent target, if any was ever
    /// seen.
    fn recent_target(&self) -> Option<(f64, f64, Instant)>;
}

/// Callback sink receiving `(cx, cy, frame_w, frame_h, ts)` per tracked
/// centroid.
pub type TargetSink = Box<dyn Fn(f64, f64, u32, u32, Instant) + Send + Sync>;

/// Accepts detection callbacks from the video pipeline.
pub struct DetectorBridge {
    frame_w: u32,
    frame_h: u32,
    latest: Mutex<Option<(f64, f64, Instant)>>,
    sink: TargetSink,
}

impl DetectorBridge {
    pub fn new(frame_w: u32, frame_h: u32, sink: TargetSink) -> Self {
        Self {
            frame_w,
            frame_h,
            latest: Mutex::new(None),
            sink,
        }
    }

    /// Entry point for the video pipeline. Empty callbacks are ignored.
    pub fn on_detection(&self, detections: &[Detection]) {
        let Some(best) = detections
            .iter()
            .max_by(|a, b| a.area().total_cmp(&b.area()))
        else {
            return;
        };
        let (cx, cy) = best.centroid();
        let ts = Instant::now();
        trace!(kind = %best.kind, cx, cy, confidence = best.confidence, "detection selected");
        *self.latest.lock() = Some((cx, cy, ts));
        (self.sink)(cx, cy, self.frame_w, self.frame_h, ts);
    }
}

impl TargetSource for DetectorBridge {
    fn recent_target(&self) -> Option<(f64, f64, Instant)> {
        *self.latest.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn boxed(kind: &str, x: f64, y: f64, w: f64, h: f64) -> Detection {
        Detection {
            kind: kind.into(),
            x,
            y,
            w,
            h,
            confidence: 0.9,
        }
    }

    #[test]
    fn largest_box_wins() {
        let seen = Arc::new(Mutex::new(None));
        let sink_seen = seen.clone();
        let bridge = DetectorBridge::new(
            1920,
            1080,
            Box::new(move |cx, cy, _, _, _| {
                *sink_seen.lock() = Some((cx, cy));
            }),
        );

        bridge.on_detection(&[
            boxed("cat", 0.0, 0.0, 10.0, 10.0),
            boxed("person", 100.0, 200.0, 80.0, 120.0),
            boxed("bird", 50.0, 50.0, 20.0, 20.0),
        ]);

        assert_eq!(*seen.lock(), Some((140.0, 260.0)));
        let (cx, cy, _) = bridge.recent_target().unwrap();
        assert_eq!((cx, cy), (140.0, 260.0));
    }

    #[test]
    fn empty_callback_is_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink_calls = calls.clone();
        let bridge = DetectorBridge::new(
            640,
            480,
            Box::new(move |_, _, _, _, _| {
                sink_calls.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bridge.on_detection(&[]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(bridge.recent_target().is_none());
    }
}
