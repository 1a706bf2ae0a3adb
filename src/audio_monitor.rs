use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    event::{EventSender, MeshEvent},
    signal::ParticipantId,
};

/// Source of time-domain audio data, amplitudes in `[-1.0, 1.0]`.
pub trait EnergyProbe: Send + Sync {
    fn time_domain_data(&self) -> Vec<f32>;
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Edge-triggered speaking classifier.
#[derive(Debug, Clone)]
pub struct SpeakingDetector {
    threshold: f32,
    speaking: bool,
}

impl SpeakingDetector {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            speaking: false,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Returns the new state only when this window flips it.
    pub fn observe(&mut self, samples: &[f32]) -> Option<bool> {
        let speaking = rms(samples) * 100.0 > self.threshold;
        if speaking == self.speaking {
            return None;
        }
        self.speaking = speaking;
        Some(speaking)
    }
}

/// Rolling window of the most recent amplitudes of one stream.
///
/// A meter built with [`LevelMeter::with_max_age`] forgets readings older than that age, so a stream
/// that stops delivering packets reads as silence instead of repeating its last window.
#[derive(Debug)]
pub struct LevelMeter {
    window: Mutex<VecDeque<(Instant, f32)>>,
    capacity: usize,
    max_age: Option<Duration>,
}

impl LevelMeter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            max_age: None,
        }
    }

    pub fn with_max_age(capacity: usize, max_age: Duration) -> Self {
        Self {
            max_age: Some(max_age),
            ..Self::new(capacity)
        }
    }

    pub fn push_samples(&self, samples: &[f32]) {
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        for sample in samples.iter().rev().take(self.capacity).rev() {
            if window.len() == self.capacity {
                window.pop_front();
            }
            window.push_back((now, *sample));
        }
    }

    /// Records an RFC 6464 audio level, given in -dBov (0 is loudest, 127 is silence).
    pub fn push_audio_level(&self, level: u8) {
        let amplitude = if level >= 127 {
            0.0
        } else {
            10f32.powf(-(level as f32) / 20.0)
        };
        self.push_samples(&[amplitude]);
    }

    pub fn clear(&self) {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EnergyProbe for LevelMeter {
    fn time_domain_data(&self) -> Vec<f32> {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(max_age) = self.max_age {
            let now = Instant::now();
            while let Some((at, _)) = window.front() {
                if now.duration_since(*at) <= max_age {
                    break;
                }
                window.pop_front();
            }
        }
        window.iter().map(|(_, sample)| *sample).collect()
    }
}

/// Periodically samples one stream and reports speaking edges. The task stops when this is dropped.
#[derive(Debug)]
pub struct AudioMonitor {
    participant: ParticipantId,
    handle: JoinHandle<()>,
}

impl AudioMonitor {
    pub fn spawn(
        participant: ParticipantId,
        probe: Arc<dyn EnergyProbe>,
        interval: Duration,
        threshold: f32,
        events: EventSender,
    ) -> Self {
        let id = participant.clone();
        let handle = tokio::spawn(async move {
            let mut detector = SpeakingDetector::new(threshold);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(is_speaking) = detector.observe(&probe.time_domain_data()) else {
                    continue;
                };
                tracing::trace!("participant {} speaking={}", id, is_speaking);
                let event = MeshEvent::SpeakingStatus {
                    id: id.clone(),
                    is_speaking,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });

        tracing::debug!("AudioMonitor for {} is started", participant);
        Self {
            participant,
            handle,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for AudioMonitor {
    fn drop(&mut self) {
        self.handle.abort();
        tracing::debug!("AudioMonitor for {} is dropped", self.participant);
    }
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc;

    use super::*;

    fn constant(amplitude: f32) -> Vec<f32> {
        vec![amplitude; 128]
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_detector_reports_only_crossings() {
        let mut detector = SpeakingDetector::new(5.0);
        // RMS x 100 oscillates around the threshold: 3, 7, 8, 2, 1, 9, 4, 6, 6, 6
        let levels = [0.03, 0.07, 0.08, 0.02, 0.01, 0.09, 0.04, 0.06, 0.06, 0.06];

        let mut expected_crossings = 0;
        let mut above = false;
        let mut events = vec![];
        for level in levels {
            let now_above = level * 100.0 > 5.0;
            if now_above != above {
                expected_crossings += 1;
                above = now_above;
            }
            if let Some(state) = detector.observe(&constant(level)) {
                events.push(state);
            }
        }

        assert_eq!(events.len(), expected_crossings);
        assert_eq!(events, vec![true, false, true, false, true]);
        assert!(detector.is_speaking());
    }

    #[test]
    fn test_detector_below_threshold_is_silent() {
        let mut detector = SpeakingDetector::new(5.0);
        assert_eq!(detector.observe(&constant(0.049)), None);
        assert_eq!(detector.observe(&constant(0.051)), Some(true));
    }

    #[test]
    fn test_level_meter_keeps_latest_window() {
        let meter = LevelMeter::new(3);
        meter.push_samples(&[0.1, 0.2]);
        meter.push_samples(&[0.3, 0.4]);
        assert_eq!(meter.time_domain_data(), vec![0.2, 0.3, 0.4]);

        meter.clear();
        assert!(meter.time_domain_data().is_empty());
    }

    #[test]
    fn test_audio_level_conversion() {
        let meter = LevelMeter::new(4);
        meter.push_audio_level(0);
        meter.push_audio_level(127);
        meter.push_audio_level(20);

        let data = meter.time_domain_data();
        assert!((data[0] - 1.0).abs() < 1e-6);
        assert_eq!(data[1], 0.0);
        assert!((data[2] - 0.1).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_meter_forgets_old_readings() {
        let meter = LevelMeter::with_max_age(4, Duration::from_millis(200));
        meter.push_audio_level(20);
        meter.push_audio_level(20);
        assert_eq!(meter.time_domain_data().len(), 2);

        tokio::time::advance(Duration::from_millis(150)).await;
        meter.push_audio_level(127);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(meter.time_domain_data(), vec![0.0]);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(meter.time_domain_data().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_falls_silent_when_packets_stop() {
        let meter = Arc::new(LevelMeter::with_max_age(10, Duration::from_millis(200)));
        for _ in 0..10 {
            meter.push_audio_level(20);
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = AudioMonitor::spawn(
            "id-b".into(),
            meter.clone(),
            Duration::from_millis(200),
            5.0,
            tx,
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(monitor);

        let mut states = vec![];
        while let Ok(event) = rx.try_recv() {
            if let MeshEvent::SpeakingStatus { is_speaking, .. } = event {
                states.push(is_speaking);
            }
        }
        assert_eq!(states, vec![true, false]);
    }

    struct Script {
        frames: Mutex<VecDeque<Vec<f32>>>,
    }

    impl EnergyProbe for Script {
        fn time_domain_data(&self) -> Vec<f32> {
            self.frames
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_emits_edges() {
        let frames = [0.01, 0.2, 0.2, 0.2, 0.01, 0.01, 0.3]
            .into_iter()
            .map(constant)
            .collect();
        let probe = Arc::new(Script {
            frames: Mutex::new(frames),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = AudioMonitor::spawn(
            "id-a".into(),
            probe,
            Duration::from_millis(200),
            5.0,
            tx,
        );

        tokio::time::sleep(Duration::from_millis(200 * 10)).await;
        drop(monitor);

        let mut states = vec![];
        while let Ok(event) = rx.try_recv() {
            match event {
                MeshEvent::SpeakingStatus { id, is_speaking } => {
                    assert_eq!(id, ParticipantId::from("id-a"));
                    states.push(is_speaking);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(states, vec![true, false, true, false]);
    }
}
