use crate::core::{Clock, MediaInfo, PlayerEvent, StreamKind, SyncMaster};
use crate::player::audio::{AudioOutput, AudioParams};
use crate::player::frame_queue::{
    audio_queue, subtitle_queue, video_queue, AudioSample, FrameQueue, SubtitlePicture,
    VideoPicture,
};
use crate::player::packet_queue::PacketQueue;
use crate::player::AV_NOSYNC_THRESHOLD;
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// 唤醒读线程的条件：解码器断粮或 seek 完成时敲它
pub struct ReadWaker {
    lock: Mutex<()>,
    cond: Condvar,
}

impl ReadWaker {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn wake(&self) {
        let _g = self.lock.lock();
        self.cond.notify_one();
    }

    /// 带超时等待；读线程在队列吃饱后每 10ms 醒一次查状态
    pub fn wait_timeout(&self, timeout: Duration) {
        let mut g = self.lock.lock();
        self.cond.wait_for(&mut g, timeout);
    }
}

impl Default for ReadWaker {
    fn default() -> Self {
        Self::new()
    }
}

/// 一个已打开流的解码线程句柄
pub struct ComponentHandle {
    pub stream_index: usize,
    pub thread: JoinHandle<()>,
}

/// 读线程打开的各路流组件
#[derive(Default)]
pub struct StreamComponents {
    pub audio: Option<ComponentHandle>,
    pub video: Option<ComponentHandle>,
    pub subtitle: Option<ComponentHandle>,
    pub audio_output: Option<AudioOutput>,
}

/// 播放会话的全部共享状态
///
/// 由 open 构造、stop 析构。读线程、解码线程、显示循环和音频回调
/// 各自持有 Arc 引用；标量用原子量发布，队列元数据由各队列自己的锁保护。
pub struct VideoState {
    pub filename: String,

    pub abort_request: AtomicBool,
    /// stop_finished 事件只发一次（自然播完与用户 stop 汇合点）
    pub stop_notified: AtomicBool,
    pub paused: AtomicBool,
    pub step: AtomicBool,
    pub eof: AtomicBool,
    pub force_refresh: AtomicBool,
    pub realtime: AtomicBool,

    // seek 请求（µs，AV_TIME_BASE 单位）
    pub seek_req: AtomicBool,
    pub seek_pos: AtomicI64,
    pub seek_rel: AtomicI64,

    /// 专辑封面这类附带图片流的一次性入队请求
    pub queue_attachments_req: AtomicBool,

    /// 换流请求，由读线程消费
    pub cycle_req: Mutex<Option<StreamKind>>,

    // 包队列
    pub audioq: Arc<PacketQueue>,
    pub videoq: Arc<PacketQueue>,
    pub subtitleq: Arc<PacketQueue>,

    // 帧队列
    pub pictq: FrameQueue<VideoPicture>,
    pub sampq: FrameQueue<AudioSample>,
    pub subpq: FrameQueue<SubtitlePicture>,

    // 三个时钟
    pub audclk: Clock,
    pub vidclk: Clock,
    pub extclk: Clock,

    pub continue_read: ReadWaker,

    // 流索引，-1 表示未打开
    pub audio_stream: AtomicI32,
    pub video_stream: AtomicI32,
    pub subtitle_stream: AtomicI32,
    pub last_audio_stream: AtomicI32,
    pub last_video_stream: AtomicI32,
    pub last_subtitle_stream: AtomicI32,

    // 解码器排空状态（finished == 队列 serial 时该路已播完）
    pub audio_finished: Arc<AtomicI32>,
    pub video_finished: Arc<AtomicI32>,

    /// 时间戳跳变阈值（秒），f64 以位存放
    max_frame_duration_bits: AtomicU64,
    /// 显示循环的帧基准时刻；暂停恢复时需要补偿，所以共享
    pub frame_timer: Mutex<f64>,

    pub frame_drops_early: AtomicI32,
    pub frame_drops_late: AtomicI32,

    /// 音量 [0, MAX_VOLUME]，facade 写、音频回调读
    pub audio_volume: AtomicI32,
    /// 播放倍率（f32 位存放）与变化标志
    playback_rate_bits: AtomicU32,
    pub playback_rate_changed: AtomicBool,
    /// 视频 pts 来源：None = 解码器重排时间戳，Some(false) = 包 DTS
    pub reorder_video_pts: Option<bool>,

    /// 音频输出的实际参数（打开音频流后可用）
    pub audio_tgt: Mutex<Option<AudioParams>>,
    pub audio_hw_buf_size: AtomicUsize,

    // 容器信息
    pub duration_us: AtomicI64,
    pub start_time_us: AtomicI64,
    pub media_info: Mutex<MediaInfo>,

    pub components: Mutex<StreamComponents>,
    pub events: Sender<PlayerEvent>,
}

impl VideoState {
    pub fn new(
        filename: String,
        events: Sender<PlayerEvent>,
        startup_volume: i32,
        reorder_video_pts: Option<bool>,
    ) -> Arc<Self> {
        let audioq = Arc::new(PacketQueue::new());
        let videoq = Arc::new(PacketQueue::new());
        let subtitleq = Arc::new(PacketQueue::new());

        let pictq = video_queue(videoq.clone());
        let sampq = audio_queue(audioq.clone());
        let subpq = subtitle_queue(subtitleq.clone());

        let audclk = Clock::new(audioq.serial_handle());
        let vidclk = Clock::new(videoq.serial_handle());
        let extclk = Clock::standalone();

        Arc::new(Self {
            filename,
            abort_request: AtomicBool::new(false),
            stop_notified: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            step: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            force_refresh: AtomicBool::new(false),
            realtime: AtomicBool::new(false),
            seek_req: AtomicBool::new(false),
            seek_pos: AtomicI64::new(0),
            seek_rel: AtomicI64::new(0),
            queue_attachments_req: AtomicBool::new(false),
            cycle_req: Mutex::new(None),
            audioq,
            videoq,
            subtitleq,
            pictq,
            sampq,
            subpq,
            audclk,
            vidclk,
            extclk,
            continue_read: ReadWaker::new(),
            audio_stream: AtomicI32::new(-1),
            video_stream: AtomicI32::new(-1),
            subtitle_stream: AtomicI32::new(-1),
            last_audio_stream: AtomicI32::new(-1),
            last_video_stream: AtomicI32::new(-1),
            last_subtitle_stream: AtomicI32::new(-1),
            audio_finished: Arc::new(AtomicI32::new(-1)),
            video_finished: Arc::new(AtomicI32::new(-1)),
            max_frame_duration_bits: AtomicU64::new(3600.0f64.to_bits()),
            frame_timer: Mutex::new(0.0),
            frame_drops_early: AtomicI32::new(0),
            frame_drops_late: AtomicI32::new(0),
            audio_volume: AtomicI32::new(startup_volume),
            playback_rate_bits: AtomicU32::new(1.0f32.to_bits()),
            playback_rate_changed: AtomicBool::new(false),
            reorder_video_pts,
            audio_tgt: Mutex::new(None),
            audio_hw_buf_size: AtomicUsize::new(0),
            duration_us: AtomicI64::new(0),
            start_time_us: AtomicI64::new(i64::MIN),
            media_info: Mutex::new(MediaInfo::default()),
            components: Mutex::new(StreamComponents::default()),
            events,
        })
    }

    pub fn playback_rate(&self) -> f32 {
        f32::from_bits(self.playback_rate_bits.load(Ordering::Acquire))
    }

    pub fn set_playback_rate(&self, rate: f32) {
        self.playback_rate_bits
            .store(rate.to_bits(), Ordering::Release);
        self.playback_rate_changed.store(true, Ordering::Release);
    }

    pub fn max_frame_duration(&self) -> f64 {
        f64::from_bits(self.max_frame_duration_bits.load(Ordering::Acquire))
    }

    pub fn set_max_frame_duration(&self, secs: f64) {
        self.max_frame_duration_bits
            .store(secs.to_bits(), Ordering::Release);
    }

    /// 当前主时钟类型：有音频用音频，其次视频，最后外部时钟
    pub fn master_sync(&self) -> SyncMaster {
        if self.audio_stream.load(Ordering::Acquire) >= 0 {
            SyncMaster::Audio
        } else if self.video_stream.load(Ordering::Acquire) >= 0 {
            SyncMaster::Video
        } else {
            SyncMaster::External
        }
    }

    /// 读主时钟当前值
    pub fn master_clock(&self) -> f64 {
        match self.master_sync() {
            SyncMaster::Audio => self.audclk.get(),
            SyncMaster::Video => self.vidclk.get(),
            SyncMaster::External => self.extclk.get(),
        }
    }

    /// 暂停/恢复切换
    ///
    /// 恢复时把暂停期间流逝的时间补到 frame_timer 上，
    /// 并以当前值重新锚定视频时钟，避免恢复后猛追。
    pub fn toggle_pause_internal(&self) {
        if self.paused.load(Ordering::Acquire) {
            let now = crate::core::now_secs();
            {
                let mut timer = self.frame_timer.lock();
                *timer += now - self.vidclk.last_updated();
            }
            // 暂停态下 get() 返回冻结的 pts，先以它重新锚定再解除暂停
            self.vidclk.set(self.vidclk.get(), self.vidclk.serial());
        }
        self.extclk.set(self.extclk.get(), self.extclk.serial());
        let paused = !self.paused.load(Ordering::Acquire);
        self.paused.store(paused, Ordering::Release);
        self.audclk.set_paused(paused);
        self.vidclk.set_paused(paused);
        self.extclk.set_paused(paused);
    }

    /// 单步：暂停态下先恢复，播完一帧后由显示循环重新暂停
    pub fn step_to_next_frame(&self) {
        if self.paused.load(Ordering::Acquire) {
            self.toggle_pause_internal();
        }
        self.step.store(true, Ordering::Release);
    }

    /// 发起一次 seek 请求（µs）；已有请求未消费时忽略
    pub fn stream_seek(&self, pos: i64, rel: i64) {
        if !self.seek_req.load(Ordering::Acquire) {
            self.seek_pos.store(pos, Ordering::Release);
            self.seek_rel.store(rel, Ordering::Release);
            self.seek_req.store(true, Ordering::Release);
            self.continue_read.wake();
        }
    }

    /// 外部时钟对齐到从时钟（音频回调、视频刷新后调用）
    pub fn sync_ext_to(&self, slave: &Clock) {
        self.extclk.sync_to_slave(slave, AV_NOSYNC_THRESHOLD);
    }

    pub fn send_event(&self, ev: PlayerEvent) {
        let _ = self.events.send(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn state() -> Arc<VideoState> {
        let (tx, _rx) = unbounded();
        VideoState::new("test.mp4".into(), tx, 96, None)
    }

    #[test]
    fn master_defaults_follow_open_streams() {
        let vs = state();
        assert_eq!(vs.master_sync(), SyncMaster::External);
        vs.video_stream.store(0, Ordering::Release);
        assert_eq!(vs.master_sync(), SyncMaster::Video);
        vs.audio_stream.store(1, Ordering::Release);
        assert_eq!(vs.master_sync(), SyncMaster::Audio);
    }

    #[test]
    fn seek_request_is_latched_until_consumed() {
        let vs = state();
        vs.stream_seek(5_000_000, 0);
        // 第二次请求在前一次被消费前被忽略
        vs.stream_seek(9_000_000, 0);
        assert_eq!(vs.seek_pos.load(Ordering::Acquire), 5_000_000);
        assert!(vs.seek_req.load(Ordering::Acquire));
    }

    #[test]
    fn pause_toggle_round_trip_keeps_clock() {
        let vs = state();
        vs.videoq.start();
        vs.vidclk.set(3.0, vs.videoq.serial());
        vs.toggle_pause_internal();
        assert!(vs.paused.load(Ordering::Acquire));
        std::thread::sleep(std::time::Duration::from_millis(30));
        let paused_at = vs.vidclk.get();
        vs.toggle_pause_internal();
        assert!(!vs.paused.load(Ordering::Acquire));
        let resumed = vs.vidclk.get();
        assert!((resumed - paused_at).abs() < 0.02, "暂停往返漂移 {}", resumed - paused_at);
    }

    #[test]
    fn playback_rate_round_trips_through_bits() {
        let vs = state();
        vs.set_playback_rate(1.75);
        assert_eq!(vs.playback_rate(), 1.75);
        assert!(vs.playback_rate_changed.load(Ordering::Acquire));
    }
}
