//! End-to-end latency probe
//!
//! A viewer starts a test; the next captured frame is followed through
//! capture and encode, and the wall-clock timestamps of each stage are
//! reported back as JSON. Stages advance strictly in order and are keyed by
//! frame id, so a probe never mixes timestamps from two frames.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LatencyTestStage {
    Inactive = 0,
    Started = 1,
    PreCapture = 2,
    PostCapture = 3,
    PreEncode = 4,
    PostEncode = 5,
    ResultsReady = 6,
}

impl LatencyTestStage {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Started,
            2 => Self::PreCapture,
            3 => Self::PostCapture,
            4 => Self::PreEncode,
            5 => Self::PostEncode,
            6 => Self::ResultsReady,
            _ => Self::Inactive,
        }
    }
}

/// Results sent to the viewer
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatencyResults {
    pub receipt_time_ms: i64,
    pub pre_capture_time_ms: i64,
    pub post_capture_time_ms: i64,
    pub pre_encode_time_ms: i64,
    pub post_encode_time_ms: i64,
    pub transmission_time_ms: i64,
}

#[derive(Debug, Default)]
struct Record {
    results: LatencyResults,
    frame_id: u32,
    requester: Option<String>,
}

/// Latency probe shared by the capturer, the encode pipeline and the streamer
#[derive(Debug)]
pub struct LatencyTester {
    stage: AtomicU8,
    record: Mutex<Record>,
}

impl LatencyTester {
    pub fn new() -> Self {
        Self {
            stage: AtomicU8::new(LatencyTestStage::Inactive as u8),
            record: Mutex::new(Record::default()),
        }
    }

    pub fn stage(&self) -> LatencyTestStage {
        LatencyTestStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        !matches!(
            self.stage(),
            LatencyTestStage::Inactive | LatencyTestStage::ResultsReady
        )
    }

    /// Start a probe for `requester`, recording the receipt time. Ignored
    /// while another probe is in progress.
    pub fn start(&self, requester: &str) -> bool {
        let mut record = self.record.lock();
        if self.stage() != LatencyTestStage::Inactive {
            return false;
        }
        *record = Record {
            results: LatencyResults {
                receipt_time_ms: now_ms(),
                ..Default::default()
            },
            frame_id: 0,
            requester: Some(requester.to_string()),
        };
        self.set_stage(LatencyTestStage::Started);
        debug!("Latency test started by {}", requester);
        true
    }

    pub fn record_pre_capture(&self, frame_id: u32) -> bool {
        let mut record = self.record.lock();
        if self.stage() != LatencyTestStage::Started {
            return false;
        }
        record.frame_id = frame_id;
        record.results.pre_capture_time_ms = now_ms();
        self.set_stage(LatencyTestStage::PreCapture);
        true
    }

    pub fn record_post_capture(&self, frame_id: u32) -> bool {
        self.advance(
            frame_id,
            LatencyTestStage::PreCapture,
            LatencyTestStage::PostCapture,
            |r, t| r.post_capture_time_ms = t,
        )
    }

    pub fn record_pre_encode(&self, frame_id: u32) -> bool {
        self.advance(
            frame_id,
            LatencyTestStage::PostCapture,
            LatencyTestStage::PreEncode,
            |r, t| r.pre_encode_time_ms = t,
        )
    }

    /// Last stage; the results become ready
    pub fn record_post_encode(&self, frame_id: u32) -> bool {
        self.advance(
            frame_id,
            LatencyTestStage::PreEncode,
            LatencyTestStage::ResultsReady,
            |r, t| r.post_encode_time_ms = t,
        )
    }

    /// Take finished results: (requester, JSON). Resets the probe.
    pub fn end(&self) -> Option<(String, String)> {
        let mut record = self.record.lock();
        if self.stage() != LatencyTestStage::ResultsReady {
            return None;
        }
        record.results.transmission_time_ms = now_ms();
        let json = serde_json::to_string(&record.results).ok()?;
        let requester = record.requester.take().unwrap_or_default();
        self.set_stage(LatencyTestStage::Inactive);
        Some((requester, json))
    }

    /// Abandon a running probe, e.g. when its viewer leaves
    pub fn cancel(&self) {
        let _record = self.record.lock();
        self.set_stage(LatencyTestStage::Inactive);
    }

    pub fn requester(&self) -> Option<String> {
        self.record.lock().requester.clone()
    }

    fn advance(
        &self,
        frame_id: u32,
        from: LatencyTestStage,
        to: LatencyTestStage,
        set: impl FnOnce(&mut LatencyResults, i64),
    ) -> bool {
        let mut record = self.record.lock();
        if self.stage() != from || record.frame_id != frame_id {
            return false;
        }
        set(&mut record.results, now_ms());
        self.set_stage(to);
        true
    }

    fn set_stage(&self, stage: LatencyTestStage) {
        self.stage.store(stage as u8, Ordering::Release);
    }
}

impl Default for LatencyTester {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
