// 播放器核心模块

pub mod audio;
pub mod decoder;
pub mod frame_queue;
pub mod manager;
pub mod packet_queue;
pub mod reader;
pub mod render;
pub mod state;
pub mod sync;
pub mod tempo;

pub use frame_queue::{AudioSample, FrameQueue, SubtitlePicture, VideoPicture};
pub use manager::PlaybackManager;
pub use packet_queue::{PacketPull, PacketQueue, QueuedPacket};
pub use render::{DisplayRect, VideoOutput};

/// 三个包队列字节总量的全局上限
pub const MAX_QUEUE_SIZE: usize = 15 * 1024 * 1024;
/// 单个队列的包数下限：超过且缓冲时长超过 1 秒即认为充足
pub const MIN_FRAMES: usize = 25;

pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;

/// 音频硬件缓冲下限（采样数）
pub const AUDIO_MIN_BUFFER_SIZE: u32 = 512;
/// 每秒音频回调次数上限，决定请求的缓冲大小
pub const AUDIO_MAX_CALLBACKS_PER_SEC: u32 = 30;

/// 音量调节步长（dB）
pub const VOLUME_STEP_DB: f64 = 0.75;
/// 音量满刻度
pub const MAX_VOLUME: i32 = 128;

/// 低于该阈值不做同步校正
pub const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
/// 高于该阈值必做同步校正
pub const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;
/// 帧时长超过该值时不用重复显示来补偿
pub const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;
/// 偏差过大时放弃校正
pub const AV_NOSYNC_THRESHOLD: f64 = 10.0;

/// 音频采样数校正的最大百分比
pub const SAMPLE_CORRECTION_PERCENT_MAX: i32 = 10;
/// 音频偏差滑动平均的样本数
pub const AUDIO_DIFF_AVG_NB: u32 = 20;

// 实时流根据缓冲水位微调外部时钟速度
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;

/// 显示循环的轮询间隔（秒），需小于 1/fps
pub const REFRESH_RATE: f64 = 0.01;

pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
pub const SAMPLE_QUEUE_SIZE: usize = 9;
pub const SUBPICTURE_QUEUE_SIZE: usize = 16;

pub const PLAYBACK_RATE_MIN: f32 = 0.25;
pub const PLAYBACK_RATE_MAX: f32 = 3.0;
pub const PLAYBACK_RATE_STEP: f32 = 0.25;

/// 前进/后退一次的跨度（秒）
pub const SEEK_STEP_SECS: f64 = 5.0;
