use serde::{Deserialize, Serialize};

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Opening,
    Playing,
    Paused,
    Stopped,
}

/// 媒体信息（打开成功后缓存）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_secs: i64, // 总时长（秒）
    pub width: u32,
    pub height: u32,
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// 流类型（切换流命令使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
    Subtitle,
}

/// 主时钟类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMaster {
    /// 默认以音频为基准
    Audio,
    Video,
    External,
}

/// 引擎对外事件（GUI 消费）
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// 打开成功，总时长（秒）
    TotalSeconds(i64),
    /// 当前播放位置（秒），按播放倍率换算
    PlaySeconds(f64),
    /// 音量归一化到 [0, 1]
    Volume(f64),
    /// 暂停状态变化
    Paused(bool),
    /// 播放倍率变化
    Rate(f32),
    /// 首帧或换流后视频尺寸变化
    FrameDimensionsChanged(u32, u32),
    /// 播放自然结束或 stop() 完成
    StopFinished,
    /// 开始播放某个文件
    StartPlay(String),
    /// 打开/设备失败
    Error(String),
}
