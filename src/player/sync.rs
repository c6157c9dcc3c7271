//! 音视频同步的纯计算部分
//!
//! 这里的函数只依赖入参，不碰共享状态，显示循环和音频回调各取所需。

use crate::player::{
    AUDIO_DIFF_AVG_NB, AV_SYNC_FRAMEDUP_THRESHOLD, AV_SYNC_THRESHOLD_MAX, AV_SYNC_THRESHOLD_MIN,
    AV_NOSYNC_THRESHOLD, EXTERNAL_CLOCK_MAX_FRAMES, EXTERNAL_CLOCK_MIN_FRAMES,
    EXTERNAL_CLOCK_SPEED_MAX, EXTERNAL_CLOCK_SPEED_MIN, EXTERNAL_CLOCK_SPEED_STEP,
    SAMPLE_CORRECTION_PERCENT_MAX,
};

/// 计算下一视频帧的目标延时
///
/// delay 是上一帧的名义时长，diff 是视频时钟与主时钟的差值
/// （视频自身为主时钟时传 NaN，跳过全部校正）。
pub fn compute_target_delay(delay: f64, diff: f64, max_frame_duration: f64) -> f64 {
    let mut delay = delay;
    // 同步阈值被限制在 40ms ~ 100ms 之间
    let sync_threshold = AV_SYNC_THRESHOLD_MIN.max(AV_SYNC_THRESHOLD_MAX.min(delay));

    if !diff.is_nan() && diff.abs() < max_frame_duration {
        if diff <= -sync_threshold {
            // 视频落后：缩短显示时间，必要时立即切到下一帧
            delay = 0.0f64.max(delay + diff);
        } else if diff >= sync_threshold && delay > AV_SYNC_FRAMEDUP_THRESHOLD {
            // 视频超前且当前帧本来就长：直接顺延
            delay += diff;
        } else if diff >= sync_threshold {
            // 视频超前且帧较短：重复显示一帧
            delay *= 2.0;
        }
    }

    log::trace!("video: delay={:.3} A-V={:.3}", delay, -diff);
    delay
}

/// 实时源的外部时钟速度微调
///
/// 包队列快空则减速，充足则加速，居中则向 1.0 回拢。
/// 返回调整后的速度。
pub fn external_clock_speed(
    video_packets: Option<usize>,
    audio_packets: Option<usize>,
    speed: f64,
) -> f64 {
    let low = |n: Option<usize>| n.map_or(false, |n| n <= EXTERNAL_CLOCK_MIN_FRAMES);
    let high = |n: Option<usize>| n.map_or(true, |n| n > EXTERNAL_CLOCK_MAX_FRAMES);

    if low(video_packets) || low(audio_packets) {
        EXTERNAL_CLOCK_SPEED_MIN.max(speed - EXTERNAL_CLOCK_SPEED_STEP)
    } else if high(video_packets) && high(audio_packets) {
        EXTERNAL_CLOCK_SPEED_MAX.min(speed + EXTERNAL_CLOCK_SPEED_STEP)
    } else if speed != 1.0 {
        speed + EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs()
    } else {
        speed
    }
}

/// 音频偏差的指数滑动平均
///
/// 音频不是主时钟时，根据平均偏差微调重采样的期望采样数，
/// 幅度不超过名义值的 ±10%。
pub struct AudioSyncFilter {
    diff_cum: f64,
    avg_coef: f64,
    threshold: f64,
    avg_count: u32,
}

impl AudioSyncFilter {
    /// threshold 取硬件缓冲时长（秒）：低于一个缓冲的偏差测不准，不校正
    pub fn new(threshold: f64) -> Self {
        Self {
            diff_cum: 0.0,
            avg_coef: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            threshold,
            avg_count: 0,
        }
    }

    /// 根据本次偏差计算期望采样数
    pub fn wanted_nb_samples(&mut self, nb_samples: usize, diff: f64, src_freq: u32) -> usize {
        if diff.is_nan() || diff.abs() >= AV_NOSYNC_THRESHOLD {
            // 偏差过大，可能是起始 PTS 异常，重置滤波器
            self.reset();
            return nb_samples;
        }
        self.diff_cum = diff + self.avg_coef * self.diff_cum;
        if self.avg_count < AUDIO_DIFF_AVG_NB {
            // 样本不足，估计还不可信
            self.avg_count += 1;
            return nb_samples;
        }
        let avg_diff = self.diff_cum * (1.0 - self.avg_coef);
        if avg_diff.abs() >= self.threshold {
            let wanted = nb_samples as i64 + (diff * src_freq as f64) as i64;
            let min = nb_samples as i64 * (100 - SAMPLE_CORRECTION_PERCENT_MAX) as i64 / 100;
            let max = nb_samples as i64 * (100 + SAMPLE_CORRECTION_PERCENT_MAX) as i64 / 100;
            wanted.clamp(min, max) as usize
        } else {
            nb_samples
        }
    }

    pub fn reset(&mut self) {
        self.diff_cum = 0.0;
        self.avg_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_FRAME_DURATION: f64 = 10.0;

    #[test]
    fn delay_unchanged_when_in_sync() {
        let d = compute_target_delay(0.04, 0.0, MAX_FRAME_DURATION);
        assert_eq!(d, 0.04);
    }

    #[test]
    fn delay_shortened_when_video_behind() {
        // diff = -0.06，低于 -sync_threshold(0.04)
        let d = compute_target_delay(0.04, -0.06, MAX_FRAME_DURATION);
        assert!((d - 0.0).abs() < 1e-9);
        let d = compute_target_delay(0.08, -0.05, MAX_FRAME_DURATION);
        assert!((d - 0.03).abs() < 1e-9);
    }

    #[test]
    fn long_frame_extends_by_diff() {
        // delay 超过帧复制阈值时直接顺延 diff
        let d = compute_target_delay(0.2, 0.15, MAX_FRAME_DURATION);
        assert!((d - 0.35).abs() < 1e-9);
    }

    #[test]
    fn short_frame_duplicates() {
        let d = compute_target_delay(0.04, 0.05, MAX_FRAME_DURATION);
        assert!((d - 0.08).abs() < 1e-9);
    }

    #[test]
    fn nan_or_huge_diff_ignored() {
        assert_eq!(compute_target_delay(0.04, f64::NAN, MAX_FRAME_DURATION), 0.04);
        assert_eq!(compute_target_delay(0.04, 20.0, MAX_FRAME_DURATION), 0.04);
    }

    #[test]
    fn external_speed_slows_on_starvation() {
        let s = external_clock_speed(Some(1), Some(50), 1.0);
        assert!((s - 0.999).abs() < 1e-9);
        // 不低于下限
        let s = external_clock_speed(Some(0), None, EXTERNAL_CLOCK_SPEED_MIN);
        assert_eq!(s, EXTERNAL_CLOCK_SPEED_MIN);
    }

    #[test]
    fn external_speed_rises_when_buffers_full() {
        let s = external_clock_speed(Some(20), Some(20), 1.0);
        assert!((s - 1.001).abs() < 1e-9);
        let s = external_clock_speed(Some(20), Some(20), EXTERNAL_CLOCK_SPEED_MAX);
        assert_eq!(s, EXTERNAL_CLOCK_SPEED_MAX);
    }

    #[test]
    fn external_speed_converges_to_unity() {
        let s = external_clock_speed(Some(5), Some(5), 0.95);
        assert!(s > 0.95 && s < 1.0);
        let s = external_clock_speed(Some(5), Some(5), 1.005);
        assert!(s < 1.005 && s > 1.0);
    }

    #[test]
    fn audio_filter_needs_warmup() {
        let mut f = AudioSyncFilter::new(0.02);
        for _ in 0..AUDIO_DIFF_AVG_NB {
            assert_eq!(f.wanted_nb_samples(1024, 0.5, 48000), 1024);
        }
        // 预热完成后开始校正
        let w = f.wanted_nb_samples(1024, 0.5, 48000);
        assert_ne!(w, 1024);
    }

    #[test]
    fn audio_correction_clamped_to_ten_percent() {
        let mut f = AudioSyncFilter::new(0.0);
        let mut w = 1024;
        for _ in 0..=AUDIO_DIFF_AVG_NB {
            w = f.wanted_nb_samples(1024, 1.0, 48000);
        }
        assert_eq!(w, 1024 * 110 / 100);
        let mut w = 1024;
        for _ in 0..=AUDIO_DIFF_AVG_NB {
            w = f.wanted_nb_samples(1024, -1.0, 48000);
        }
        assert_eq!(w, 1024 * 90 / 100);
    }

    #[test]
    fn huge_diff_resets_filter() {
        let mut f = AudioSyncFilter::new(0.0);
        for _ in 0..=AUDIO_DIFF_AVG_NB {
            f.wanted_nb_samples(1024, 0.5, 48000);
        }
        // 偏差爆表后滤波器重置，重新进入预热
        assert_eq!(f.wanted_nb_samples(1024, 100.0, 48000), 1024);
        assert_eq!(f.wanted_nb_samples(1024, 0.5, 48000), 1024);
    }
}
