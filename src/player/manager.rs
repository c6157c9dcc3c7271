use crate::core::{MediaInfo, PlaybackState, PlayerError, PlayerEvent, Result, StreamKind};
use crate::player::reader::run_reader;
use crate::player::render::{run_presentation_loop, VideoOutput};
use crate::player::state::VideoState;
use crate::player::{
    MAX_VOLUME, PLAYBACK_RATE_MAX, PLAYBACK_RATE_MIN, PLAYBACK_RATE_STEP, SEEK_STEP_SECS,
    VOLUME_STEP_DB,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use ffmpeg_next as ffmpeg;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const AV_TIME_BASE: i64 = ffmpeg::ffi::AV_TIME_BASE as i64;

// 解码库有进程级状态，同一时刻只允许一个引擎实例
static ENGINE_LIVE: AtomicBool = AtomicBool::new(false);

/// 一次播放会话：共享状态加三类线程句柄
struct Session {
    vs: Arc<VideoState>,
    reader: Option<JoinHandle<()>>,
    loop_thread: Option<JoinHandle<()>>,
    loop_exit: Arc<AtomicBool>,
}

/// 播放管理器 - 引擎对外的唯一入口
///
/// 命令是即发即弃的方法调用；进度与状态通过事件通道送回 GUI。
pub struct PlaybackManager {
    session: Option<Session>,
    events_tx: Sender<PlayerEvent>,
    /// 会话间保持的音量 [0, MAX_VOLUME]
    volume: i32,
    /// 会话间保持的播放倍率
    playback_rate: f32,
    /// 视频 pts 来源：None = 解码器重排时间戳，Some(false) = 包 DTS
    reorder_video_pts: Option<bool>,
    ever_played: bool,
}

impl PlaybackManager {
    /// 初始化引擎。进程里已有活着的实例时拒绝
    pub fn new() -> Result<(Self, Receiver<PlayerEvent>)> {
        if ENGINE_LIVE.swap(true, Ordering::SeqCst) {
            return Err(PlayerError::EngineAlreadyLive);
        }
        if let Err(e) = ffmpeg::init() {
            ENGINE_LIVE.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        info!("🎮 播放引擎初始化完成");
        let (tx, rx) = unbounded();
        Ok((
            Self {
                session: None,
                events_tx: tx,
                volume: MAX_VOLUME * 30 / 100,
                playback_rate: 1.0,
                reorder_video_pts: None,
                ever_played: false,
            },
            rx,
        ))
    }

    /// 打开并开始播放；已在播放时先停掉旧会话
    pub fn start_play(&mut self, path: &str, output: Box<dyn VideoOutput>) -> Result<()> {
        self.stop();
        info!("🎬 开始播放: {}", path);
        let _ = self.events_tx.send(PlayerEvent::StartPlay(path.to_string()));

        let vs = VideoState::new(
            path.to_string(),
            self.events_tx.clone(),
            self.volume,
            self.reorder_video_pts,
        );
        vs.set_playback_rate(self.playback_rate);
        vs.send_event(PlayerEvent::Volume(self.volume as f64 / MAX_VOLUME as f64));
        vs.send_event(PlayerEvent::Paused(false));

        let reader = {
            let vs = vs.clone();
            thread::spawn(move || run_reader(vs))
        };
        let loop_exit = Arc::new(AtomicBool::new(false));
        let loop_thread = {
            let vs = vs.clone();
            let exit = loop_exit.clone();
            thread::spawn(move || run_presentation_loop(vs, output, exit))
        };

        self.session = Some(Session {
            vs,
            reader: Some(reader),
            loop_thread: Some(loop_thread),
            loop_exit,
        });
        self.ever_played = true;
        Ok(())
    }

    /// 停止播放并等所有工作线程退出
    pub fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        info!("⏹ 停止播放");
        session.loop_exit.store(true, Ordering::Release);
        let vs = &session.vs;
        vs.abort_request.store(true, Ordering::Release);
        // 把所有可能睡着的等待者都敲醒
        vs.audioq.abort();
        vs.videoq.abort();
        vs.subtitleq.abort();
        vs.pictq.signal();
        vs.sampq.signal();
        vs.subpq.signal();
        vs.continue_read.wake();

        // 读线程会依次 join 各解码线程并关掉音频设备
        if let Some(reader) = session.reader.take() {
            let _ = reader.join();
        }
        if let Some(h) = session.loop_thread.take() {
            let _ = h.join();
        }
        info!("✅ 停止完成，所有线程已清理");
    }

    /// 暂停/恢复切换
    pub fn pause_toggle(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        session.vs.toggle_pause_internal();
        session.vs.step.store(false, Ordering::Release);
        let paused = session.vs.paused.load(Ordering::Acquire);
        info!("🎬 {}", if paused { "暂停" } else { "恢复播放" });
        session.vs.send_event(PlayerEvent::Paused(paused));
    }

    /// 按总时长的比例定位
    pub fn seek_to_fraction(&mut self, fraction: f64) {
        let Some(session) = &self.session else {
            return;
        };
        let vs = &session.vs;
        let duration = vs.duration_us.load(Ordering::Acquire);
        if duration <= 0 {
            return;
        }
        let mut ts = (fraction.clamp(0.0, 1.0) * duration as f64) as i64;
        let start_time = vs.start_time_us.load(Ordering::Acquire);
        if start_time != ffmpeg::ffi::AV_NOPTS_VALUE && start_time != i64::MIN {
            ts += start_time;
        }
        vs.stream_seek(ts, 0);
    }

    pub fn seek_forward(&mut self) {
        self.seek_relative(SEEK_STEP_SECS);
    }

    pub fn seek_back(&mut self) {
        self.seek_relative(-SEEK_STEP_SECS);
    }

    /// 以当前主时钟为基准前后跳转
    fn seek_relative(&mut self, incr: f64) {
        let Some(session) = &self.session else {
            return;
        };
        let vs = &session.vs;
        let mut pos = vs.master_clock() * vs.playback_rate() as f64;
        if pos.is_nan() {
            // 时钟还没定义（刚 seek 完），退回到请求位置
            pos = vs.seek_pos.load(Ordering::Acquire) as f64 / AV_TIME_BASE as f64;
        }
        pos += incr;
        let start_time = vs.start_time_us.load(Ordering::Acquire);
        if start_time != ffmpeg::ffi::AV_NOPTS_VALUE
            && start_time != i64::MIN
            && pos < start_time as f64 / AV_TIME_BASE as f64
        {
            pos = start_time as f64 / AV_TIME_BASE as f64;
        }
        vs.stream_seek((pos * AV_TIME_BASE as f64) as i64, (incr * AV_TIME_BASE as f64) as i64);
    }

    /// 设置音量（归一化 [0, 1]），会话间保持
    pub fn set_volume_fraction(&mut self, fraction: f64) {
        self.volume = ((fraction.clamp(0.0, 1.0) * MAX_VOLUME as f64) as i32).clamp(0, MAX_VOLUME);
        if let Some(session) = &self.session {
            session.vs.audio_volume.store(self.volume, Ordering::Release);
        }
    }

    pub fn add_volume(&mut self) {
        self.nudge_volume(1);
    }

    pub fn sub_volume(&mut self) {
        self.nudge_volume(-1);
    }

    /// 按 0.75 dB 步进调音量；取整不动时补 ±1 保证有感
    fn nudge_volume(&mut self, sign: i32) {
        let Some(session) = &self.session else {
            return;
        };
        let current = session.vs.audio_volume.load(Ordering::Acquire);
        let new = nudged_volume(current, sign, VOLUME_STEP_DB);
        self.volume = new;
        session.vs.audio_volume.store(new, Ordering::Release);
        session
            .vs
            .send_event(PlayerEvent::Volume(new as f64 / MAX_VOLUME as f64));
    }

    /// 播放倍率循环：0.25 步进，超过 3.0 回绕到 0.25
    pub fn cycle_rate(&mut self) {
        self.playback_rate = next_rate(self.playback_rate);
        if let Some(session) = &self.session {
            session.vs.set_playback_rate(self.playback_rate);
        }
        let _ = self.events_tx.send(PlayerEvent::Rate(self.playback_rate));
        info!("⏩ 播放倍率: {}", self.playback_rate);
    }

    pub fn playback_rate(&self) -> f32 {
        self.playback_rate
    }

    /// 个别封装的重排时间戳不可信，可改用包 DTS 显示。下次打开生效
    pub fn set_prefer_packet_dts(&mut self, prefer: bool) {
        self.reorder_video_pts = if prefer { Some(false) } else { None };
    }

    /// 切换同类型的下一路流（音频/视频/字幕）
    pub fn cycle_stream(&mut self, kind: StreamKind) {
        let Some(session) = &self.session else {
            return;
        };
        *session.vs.cycle_req.lock() = Some(kind);
        session.vs.continue_read.wake();
    }

    /// 单步播放一帧
    pub fn step_frame(&mut self) {
        if let Some(session) = &self.session {
            session.vs.step_to_next_frame();
        }
    }

    /// 当前播放位置（秒，按倍率换算后的内容时间）
    pub fn position_secs(&self) -> Option<f64> {
        let session = self.session.as_ref()?;
        let pos = session.vs.master_clock() * session.vs.playback_rate() as f64;
        pos.is_finite().then_some(pos)
    }

    pub fn duration_secs(&self) -> Option<i64> {
        let session = self.session.as_ref()?;
        Some(session.vs.duration_us.load(Ordering::Acquire) / AV_TIME_BASE)
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        let session = self.session.as_ref()?;
        Some(session.vs.media_info.lock().clone())
    }

    pub fn is_paused(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |s| s.vs.paused.load(Ordering::Acquire))
    }

    /// 当前播放状态（由会话与标志派生）
    pub fn state(&self) -> PlaybackState {
        match &self.session {
            None if self.ever_played => PlaybackState::Stopped,
            None => PlaybackState::Idle,
            Some(s) if s.vs.abort_request.load(Ordering::Acquire) => PlaybackState::Stopped,
            Some(s) if s.vs.paused.load(Ordering::Acquire) => PlaybackState::Paused,
            Some(s) if s.vs.duration_us.load(Ordering::Acquire) == 0 => PlaybackState::Opening,
            Some(_) => PlaybackState::Playing,
        }
    }

    /// 丢帧统计 (进队列前丢弃, 显示时丢弃)
    pub fn frame_drops(&self) -> (i32, i32) {
        self.session.as_ref().map_or((0, 0), |s| {
            (
                s.vs.frame_drops_early.load(Ordering::Relaxed),
                s.vs.frame_drops_late.load(Ordering::Relaxed),
            )
        })
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        self.stop();
        ENGINE_LIVE.store(false, Ordering::SeqCst);
    }
}

/// dB 阶梯音量：0 视作 -1000 dB；取整后没变化就直接挪一格
fn nudged_volume(current: i32, sign: i32, step_db: f64) -> i32 {
    let level = if current > 0 {
        20.0 * (current as f64 / MAX_VOLUME as f64).log10()
    } else {
        -1000.0
    };
    let new = (MAX_VOLUME as f64 * 10f64.powf((level + sign as f64 * step_db) / 20.0)).round() as i32;
    let v = if current == new { current + sign } else { new };
    v.clamp(0, MAX_VOLUME)
}

fn next_rate(rate: f32) -> f32 {
    let next = rate + PLAYBACK_RATE_STEP;
    if next > PLAYBACK_RATE_MAX {
        PLAYBACK_RATE_MIN
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_nudge_stays_in_range_at_bounds() {
        assert_eq!(nudged_volume(0, -1, VOLUME_STEP_DB), 0);
        assert_eq!(nudged_volume(MAX_VOLUME, 1, VOLUME_STEP_DB), MAX_VOLUME);
        // 从 0 往上至少有动静
        assert_eq!(nudged_volume(0, 1, VOLUME_STEP_DB), 1);
    }

    #[test]
    fn volume_steps_down_strictly_from_max() {
        let mut v = MAX_VOLUME;
        let mut seen = Vec::new();
        for _ in 0..4 {
            v = nudged_volume(v, -1, VOLUME_STEP_DB);
            seen.push(v);
        }
        for w in seen.windows(2) {
            assert!(w[1] < w[0], "音量应严格递减: {:?}", seen);
        }
        assert!(seen.iter().all(|&x| (0..=MAX_VOLUME).contains(&x)));
    }

    #[test]
    fn rate_cycles_and_wraps() {
        let mut rate = 1.0f32;
        let mut seen = vec![rate];
        for _ in 0..16 {
            rate = next_rate(rate);
            seen.push(rate);
        }
        assert!(seen.contains(&3.0));
        assert!(seen.contains(&PLAYBACK_RATE_MIN));
        // 3.0 之后回绕到 0.25
        assert_eq!(next_rate(3.0), PLAYBACK_RATE_MIN);
        assert!(seen.iter().all(|&r| (PLAYBACK_RATE_MIN..=PLAYBACK_RATE_MAX).contains(&r)));
    }
}
