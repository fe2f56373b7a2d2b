//! 基于加速度计的运动检测，设备晃动时跳过当前帧

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 滑动窗口长度，同时限制样本的有效期
const WINDOW: Duration = Duration::from_millis(500);
/// 平均抖动超过该值时认为设备在晃动，单位为 g
const JITTER_THRESHOLD: f32 = 0.08;
/// 窗口内至少需要的样本数量
const MIN_SAMPLES: usize = 3;

/// 一个加速度计样本
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    /// 采样时间，只要求单调递增
    pub timestamp: Duration,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl MotionSample {
    pub fn new(timestamp: Duration, x: f32, y: f32, z: f32) -> Self {
        Self { timestamp, x, y, z }
    }

    fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// 只使用最近一个窗口内收到的样本，长时间没有新样本时不再抑制
#[derive(Debug, Clone, Default)]
pub struct MotionGate {
    samples: VecDeque<(Instant, MotionSample)>,
}

impl MotionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_sample(&mut self, sample: MotionSample) {
        self.push_sample_at(sample, Instant::now());
    }

    /// 加入在 received 时刻收到的样本，并丢弃窗口之外的旧样本
    ///
    /// 时间戳早于最新样本的样本会被忽略
    pub fn push_sample_at(&mut self, sample: MotionSample, received: Instant) {
        if self.samples.back().is_some_and(|(_, last)| sample.timestamp < last.timestamp) {
            return;
        }
        self.samples.push_back((received, sample));
        while let Some((_, front)) = self.samples.front() {
            if sample.timestamp - front.timestamp > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn jitter(&self) -> Option<f32> {
        self.jitter_at(Instant::now())
    }

    /// now 之前一个窗口内收到的样本中，相邻样本加速度大小变化的平均值
    pub fn jitter_at(&self, now: Instant) -> Option<f32> {
        let magnitudes = self
            .samples
            .iter()
            .filter(|(received, _)| now.saturating_duration_since(*received) <= WINDOW)
            .map(|(_, sample)| sample.magnitude())
            .collect::<Vec<_>>();
        if magnitudes.len() < MIN_SAMPLES {
            return None;
        }
        let total: f32 = magnitudes.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        Some(total / (magnitudes.len() - 1) as f32)
    }

    /// 设备是否正在晃动
    pub fn should_suppress(&self) -> bool {
        self.should_suppress_at(Instant::now())
    }

    pub fn should_suppress_at(&self, now: Instant) -> bool {
        self.jitter_at(now).is_some_and(|j| j > JITTER_THRESHOLD)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64, z: f32) -> MotionSample {
        MotionSample::new(Duration::from_millis(ms), 0.0, 0.0, z)
    }

    /// 样本按自身时间戳在 base 之后收到
    fn push(gate: &mut MotionGate, base: Instant, sample: MotionSample) {
        gate.push_sample_at(sample, base + sample.timestamp);
    }

    #[test]
    fn test_needs_enough_samples() {
        let base = Instant::now();
        let mut gate = MotionGate::new();
        push(&mut gate, base, at(0, 1.0));
        push(&mut gate, base, at(10, 2.0));
        assert!(!gate.should_suppress_at(base + Duration::from_millis(10)));
        push(&mut gate, base, at(20, 1.0));
        assert!(gate.should_suppress_at(base + Duration::from_millis(20)));
    }

    #[test]
    fn test_suppress_then_recover() {
        let base = Instant::now();
        let mut gate = MotionGate::new();
        for i in 0..20 {
            let z = if i % 2 == 0 { 1.3 } else { 0.7 };
            push(&mut gate, base, at(i * 20, z));
        }
        assert!(gate.should_suppress_at(base + Duration::from_millis(380)));

        // 静止超过一个窗口后恢复
        for i in 0..40 {
            push(&mut gate, base, at(400 + i * 20, 1.0));
        }
        let now = base + Duration::from_millis(1180);
        assert!(!gate.should_suppress_at(now));
        assert!(gate.jitter_at(now).unwrap() < 1e-6);
    }

    #[test]
    fn test_stale_burst_expires() {
        let base = Instant::now();
        let mut gate = MotionGate::new();
        for i in 0..10 {
            let z = if i % 2 == 0 { 1.5 } else { 0.5 };
            push(&mut gate, base, at(i * 10, z));
        }
        let last = base + Duration::from_millis(90);
        assert!(gate.should_suppress_at(last));
        // 之后不再有样本，窗口过去后不应继续抑制
        assert!(!gate.should_suppress_at(last + Duration::from_millis(600)));
        assert_eq!(gate.jitter_at(last + Duration::from_millis(600)), None);
    }

    #[test]
    fn test_out_of_order_sample_ignored() {
        let base = Instant::now();
        let mut gate = MotionGate::new();
        push(&mut gate, base, at(100, 1.0));
        push(&mut gate, base, at(50, 5.0));
        push(&mut gate, base, at(110, 1.0));
        push(&mut gate, base, at(120, 1.0));
        assert_eq!(gate.jitter_at(base + Duration::from_millis(120)), Some(0.0));
    }
}
