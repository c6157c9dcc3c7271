use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// 进程内相对时间（秒）- 所有时钟共用同一个基准
pub fn now_secs() -> f64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// 播放时钟 - 用于音视频同步
///
/// 读时钟是纯函数：pts_drift + now - (now - last_updated) * (1 - speed)。
/// 时钟记录的 serial 与所属包队列的 serial 不一致时（seek 之后），读出 NaN，
/// 同步控制器据此跳过本次校正。
#[derive(Clone)]
pub struct Clock {
    inner: Arc<Mutex<ClockInner>>,
    queue_serial: Arc<AtomicI32>, // 指向所属包队列的 serial
    self_serial: bool,            // 外部时钟：serial 校验指向自身，永远有效
}

struct ClockInner {
    pts: f64,          // 最近一次 set 的时间戳（秒）
    pts_drift: f64,    // pts 与系统时钟的差值
    last_updated: f64, // 最后一次更新的系统时间
    speed: f64,
    serial: i32, // 播放序列，seek 会改变
    paused: bool,
}

impl Clock {
    /// 创建时钟并绑定包队列的 serial
    pub fn new(queue_serial: Arc<AtomicI32>) -> Self {
        Self::build(queue_serial, false)
    }

    /// 创建不受任何包队列约束的时钟（外部时钟）
    pub fn standalone() -> Self {
        Self::build(Arc::new(AtomicI32::new(-1)), true)
    }

    fn build(queue_serial: Arc<AtomicI32>, self_serial: bool) -> Self {
        let clock = Self {
            inner: Arc::new(Mutex::new(ClockInner {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: 0.0,
                speed: 1.0,
                serial: -1,
                paused: false,
            })),
            queue_serial,
            self_serial,
        };
        clock.set(f64::NAN, -1);
        clock
    }

    /// 读取当前时钟值（秒）；serial 失配时返回 NaN
    pub fn get(&self) -> f64 {
        let inner = self.inner.lock();
        self.get_locked(&inner)
    }

    /// 以指定系统时间设置时钟
    pub fn set_at(&self, pts: f64, serial: i32, time: f64) {
        let mut inner = self.inner.lock();
        inner.pts = pts;
        inner.serial = serial;
        inner.last_updated = time;
        inner.pts_drift = pts - time;
    }

    pub fn set(&self, pts: f64, serial: i32) {
        self.set_at(pts, serial, now_secs());
    }

    /// 调整时钟速度；先以当前值重新锚定，保证连续
    pub fn set_speed(&self, speed: f64) {
        let (pts, serial) = {
            let inner = self.inner.lock();
            (self.get_locked(&inner), inner.serial)
        };
        self.set(pts, serial);
        self.inner.lock().speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.inner.lock().speed
    }

    pub fn serial(&self) -> i32 {
        self.inner.lock().serial
    }

    pub fn paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.lock().paused = paused;
    }

    /// 最后一次更新时钟的系统时间（秒）
    pub fn last_updated(&self) -> f64 {
        self.inner.lock().last_updated
    }

    /// pts 字段本身（不外推），字幕到期判断使用
    pub fn pts(&self) -> f64 {
        self.inner.lock().pts
    }

    /// 偏差超过失步阈值时，将本时钟对齐到 slave
    pub fn sync_to_slave(&self, slave: &Clock, nosync_threshold: f64) {
        let clock = self.get();
        let slave_clock = slave.get();
        if !slave_clock.is_nan()
            && (clock.is_nan() || (clock - slave_clock).abs() > nosync_threshold)
        {
            self.set(slave_clock, slave.serial());
        }
    }

    fn get_locked(&self, inner: &ClockInner) -> f64 {
        if !self.self_serial && self.queue_serial.load(Ordering::Acquire) != inner.serial {
            return f64::NAN;
        }
        if inner.paused {
            inner.pts
        } else {
            let time = now_secs();
            inner.pts_drift + time - (time - inner.last_updated) * (1.0 - inner.speed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn clock_tracks_wall_time() {
        let serial = Arc::new(AtomicI32::new(3));
        let clock = Clock::new(serial);
        clock.set(10.0, 3);
        thread::sleep(Duration::from_millis(50));
        let v = clock.get();
        assert!((v - 10.05).abs() < 0.02, "clock = {}", v);
    }

    #[test]
    fn paused_clock_holds_pts() {
        let serial = Arc::new(AtomicI32::new(0));
        let clock = Clock::new(serial);
        clock.set(5.0, 0);
        clock.set_paused(true);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(clock.get(), 5.0);
    }

    #[test]
    fn serial_mismatch_reads_nan() {
        let serial = Arc::new(AtomicI32::new(0));
        let clock = Clock::new(serial.clone());
        clock.set(2.0, 0);
        assert!(!clock.get().is_nan());
        // 模拟 seek：队列 serial 前进，时钟 serial 还停在旧值
        serial.store(1, Ordering::Release);
        assert!(clock.get().is_nan());
        clock.set(7.0, 1);
        assert!(!clock.get().is_nan());
    }

    #[test]
    fn standalone_clock_never_invalidates() {
        let clock = Clock::standalone();
        clock.set(1.0, 42);
        assert!(!clock.get().is_nan());
    }

    #[test]
    fn speed_scales_elapsed_time() {
        let serial = Arc::new(AtomicI32::new(0));
        let clock = Clock::new(serial);
        clock.set(0.0, 0);
        clock.set_speed(2.0);
        thread::sleep(Duration::from_millis(50));
        let v = clock.get();
        assert!(v > 0.07 && v < 0.2, "clock = {}", v);
    }

    #[test]
    fn sync_to_slave_adopts_large_offset() {
        let master = Clock::standalone();
        let slave_serial = Arc::new(AtomicI32::new(1));
        let slave = Clock::new(slave_serial);
        master.set(0.0, 0);
        slave.set(30.0, 1);
        master.sync_to_slave(&slave, 10.0);
        assert!((master.get() - 30.0).abs() < 0.01);
    }
}
