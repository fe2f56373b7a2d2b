use std::sync::LazyLock;

use prometheus::*;

static METRIC_FRAME_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("vs_frame_count", "count of the submitted frames by outcome", &["outcome"]).unwrap()
});

static METRIC_MATCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!("vs_match_duration", "duration of the per-frame image match in seconds", &["size"])
        .unwrap()
});

static METRIC_MATCH_MAX_SCORE: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "vs_match_max_score",
        "max score of the per-frame image match",
        &["size"],
        (0..=10).map(|x| x as f64).collect()
    )
    .unwrap()
});

static METRIC_DECODED_CODES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("vs_decoded_codes", "count of the decoded codes", &["symbology"]).unwrap()
});

static METRIC_POOL_IMAGES: LazyLock<IntGauge> =
    LazyLock::new(|| register_int_gauge!("vs_pool_images", "number of images in the pool").unwrap());

/// 帧的处理结果
#[derive(Debug, Clone, Copy)]
pub enum FrameOutcome {
    Processed,
    /// 被更新的帧替换
    Dropped,
    /// 被运动检测过滤
    Suppressed,
    /// 处理失败
    Skipped,
}

impl FrameOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Dropped => "dropped",
            Self::Suppressed => "suppressed",
            Self::Skipped => "skipped",
        }
    }
}

pub fn inc_frame_count(outcome: FrameOutcome) {
    METRIC_FRAME_COUNT.with_label_values(&[outcome.as_str()]).inc();
}

pub fn inc_match_duration(size: (u32, u32), duration: f32) {
    METRIC_MATCH_DURATION.with_label_values(&[to_fixed_size(size)]).observe(duration as f64);
}

pub fn inc_match_max_score(size: (u32, u32), score: f32) {
    METRIC_MATCH_MAX_SCORE.with_label_values(&[to_fixed_size(size)]).observe(score as f64);
}

pub fn inc_decoded_codes(symbology: &str) {
    METRIC_DECODED_CODES.with_label_values(&[symbology]).inc();
}

pub fn set_pool_images(n: usize) {
    METRIC_POOL_IMAGES.set(n as i64);
}

/// 将图像面积范围调整到几个固定值
fn to_fixed_size((width, height): (u32, u32)) -> &'static str {
    let area = width as u64 * height as u64;
    if area <= 128 * 128 {
        "128"
    } else if area <= 256 * 256 {
        "256"
    } else if area <= 512 * 512 {
        "512"
    } else if area <= 1024 * 1024 {
        "1024"
    } else {
        "1024+"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_size() {
        assert_eq!(to_fixed_size((250, 180)), "256");
        assert_eq!(to_fixed_size((100, 100)), "128");
        assert_eq!(to_fixed_size((4096, 4096)), "1024+");
    }

    #[test]
    fn test_frame_counter() {
        let before = METRIC_FRAME_COUNT.with_label_values(&["dropped"]).get();
        inc_frame_count(FrameOutcome::Dropped);
        assert!(METRIC_FRAME_COUNT.with_label_values(&["dropped"]).get() > before);
    }
}
