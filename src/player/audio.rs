use crate::core::{now_secs, PlayerError, Result, SyncMaster};
use crate::player::frame_queue::AudioSample;
use crate::player::state::VideoState;
use crate::player::sync::AudioSyncFilter;
use crate::player::tempo::TempoStream;
use crate::player::{AUDIO_MAX_CALLBACKS_PER_SEC, AUDIO_MIN_BUFFER_SIZE, MAX_VOLUME};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleRate, StreamConfig, SupportedStreamConfigRange};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::software::resampling;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format::sample::{Sample, Type};
use ffmpeg_next::util::frame;
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// 音频参数：源（解码帧）与目标（设备）两套，重采样在二者之间转换
#[derive(Debug, Clone, Copy)]
pub struct AudioParams {
    pub freq: u32,
    pub channels: u16,
    pub channel_layout: ChannelLayout,
    pub fmt: Sample,
    /// 一个采样时刻全部声道的字节数
    pub frame_size: usize,
    pub bytes_per_sec: usize,
}

impl AudioParams {
    fn target(freq: u32, channels: u16) -> Self {
        Self {
            freq,
            channels,
            channel_layout: ChannelLayout::default(channels as i32),
            fmt: Sample::F32(Type::Packed),
            frame_size: channels as usize * 4,
            bytes_per_sec: freq as usize * channels as usize * 4,
        }
    }
}

/// 音频输出 - cpal 设备与回调的持有者
pub struct AudioOutput {
    _stream: cpal::Stream,
    params: AudioParams,
    hw_buf_size: usize, // 字节
}

// cpal::Stream 不是 Send，但它只在创建后被整体持有、析构，
// 不会有跨线程的并发访问
unsafe impl Send for AudioOutput {}

impl AudioOutput {
    pub fn params(&self) -> AudioParams {
        self.params
    }

    /// 设备缓冲大小（字节）
    pub fn hw_buf_size(&self) -> usize {
        self.hw_buf_size
    }
}

/// 打开音频设备并启动回调
///
/// 先按解码参数申请，不支持时在 {1,2,4,6} 声道与
/// {44100, 48000, 96000, 192000} Hz 里退避搜索。
pub fn audio_open(vs: &Arc<VideoState>, wanted_rate: u32, wanted_channels: u16) -> Result<AudioOutput> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
    debug!("使用音频设备: {}", device.name().unwrap_or_default());

    let (freq, channels) = negotiate(&device, wanted_rate, wanted_channels)?;

    // 缓冲请求：不小于 512 采样，且对齐到 2 的幂，控制回调频率
    let per_callback = (freq / AUDIO_MAX_CALLBACKS_PER_SEC).max(1);
    let samples = AUDIO_MIN_BUFFER_SIZE.max(1u32 << per_callback.ilog2());

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(freq),
        buffer_size: BufferSize::Fixed(samples),
    };
    let params = AudioParams::target(freq, channels);
    let hw_buf_size = samples as usize * params.frame_size;

    let mut cb = CallbackState::new(vs.clone(), params, hw_buf_size);
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| cb.fill(data),
            move |err| error!("音频流错误: {}", err),
            None,
        )
        .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;
    stream
        .play()
        .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;

    info!(
        "✅ 音频输出: {} Hz, {} 声道, 缓冲 {} 采样",
        freq, channels, samples
    );
    Ok(AudioOutput {
        _stream: stream,
        params,
        hw_buf_size,
    })
}

/// 在设备支持的配置里找可用的 (采样率, 声道数)
fn negotiate(device: &Device, wanted_rate: u32, wanted_channels: u16) -> Result<(u32, u16)> {
    // 声道退避表：c -> 下一个候选声道数，0 表示该路走完换采样率
    const NEXT_NB_CHANNELS: [u16; 8] = [0, 0, 1, 6, 2, 6, 4, 6];
    const NEXT_SAMPLE_RATES: [u32; 4] = [44100, 48000, 96000, 192000];

    let mut rate_idx = NEXT_SAMPLE_RATES.len() as isize - 1;
    while rate_idx > 0 && NEXT_SAMPLE_RATES[rate_idx as usize] >= wanted_rate {
        rate_idx -= 1;
    }

    let mut freq = wanted_rate.max(1);
    let mut channels = wanted_channels.max(1);
    loop {
        if is_supported(device, freq, channels)? {
            return Ok((freq, channels));
        }
        warn!("⚠️ 设备不支持 {} Hz / {} 声道，继续退避", freq, channels);
        channels = NEXT_NB_CHANNELS[(channels as usize).min(7)];
        if channels == 0 {
            if rate_idx < 0 {
                return Err(PlayerError::AudioError(
                    "所有采样率/声道组合都不可用，音频打开失败".to_string(),
                ));
            }
            freq = NEXT_SAMPLE_RATES[rate_idx as usize];
            rate_idx -= 1;
            channels = wanted_channels.max(1);
        }
    }
}

fn is_supported(device: &Device, freq: u32, channels: u16) -> Result<bool> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?;
    for c in configs {
        if config_compatible(freq, channels, &c) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn config_compatible(freq: u32, channels: u16, supported: &SupportedStreamConfigRange) -> bool {
    supported.channels() == channels
        && freq >= supported.min_sample_rate().0
        && freq <= supported.max_sample_rate().0
        && supported.sample_format() == cpal::SampleFormat::F32
}

fn is_normal_rate(rate: f32) -> bool {
    rate > 0.99 && rate < 1.01
}

/// 音频回调的全部可变状态；只在设备回调线程上使用
struct CallbackState {
    vs: Arc<VideoState>,
    tgt: AudioParams,
    hw_buf_size: usize, // 字节

    // 源参数，变化时重建重采样器
    src_fmt: Sample,
    src_layout: ChannelLayout,
    src_rate: u32,
    resampler: Option<resampling::Context>,
    sync_filter: AudioSyncFilter,

    tempo: Option<TempoStream>,
    tempo_pts: i64,

    /// 当前待播数据（目标格式的交错 f32）与消费游标
    audio_buf: Vec<f32>,
    buf_index: usize,
    /// 当前帧尾部的时间戳（af.pts + 帧时长）
    audio_clock: f64,
    audio_clock_serial: i32,
}

// 回调状态只活在 cpal 的音频线程上，cpal 要求闭包 Send 才做此标记
unsafe impl Send for CallbackState {}

impl CallbackState {
    fn new(vs: Arc<VideoState>, tgt: AudioParams, hw_buf_size: usize) -> Self {
        // 偏差低于一个硬件缓冲的时长时测不准，不做校正
        let threshold = hw_buf_size as f64 / tgt.bytes_per_sec as f64;
        Self {
            vs,
            tgt,
            hw_buf_size,
            src_fmt: tgt.fmt,
            src_layout: tgt.channel_layout,
            src_rate: tgt.freq,
            resampler: None,
            sync_filter: AudioSyncFilter::new(threshold),
            tempo: None,
            tempo_pts: 0,
            audio_buf: Vec::new(),
            buf_index: 0,
            audio_clock: f64::NAN,
            audio_clock_serial: -1,
        }
    }

    /// 设备要数据了：填满 data
    fn fill(&mut self, data: &mut [f32]) {
        let callback_time = now_secs();
        let mut offset = 0;

        while offset < data.len() {
            if self.buf_index >= self.audio_buf.len() {
                if self.refill(callback_time) {
                    self.apply_rate_change();
                } else {
                    // 暂停/断流：输出一小段静音
                    self.audio_buf.clear();
                    self.audio_buf.resize(
                        AUDIO_MIN_BUFFER_SIZE as usize * self.tgt.channels as usize,
                        0.0,
                    );
                }
                self.buf_index = 0;
                if self.audio_buf.is_empty() {
                    // 变速滤镜还在攒数据，继续取下一帧
                    continue;
                }
            }

            let len1 = (self.audio_buf.len() - self.buf_index).min(data.len() - offset);
            let chunk = &self.audio_buf[self.buf_index..self.buf_index + len1];
            let vol = self
                .vs
                .audio_volume
                .load(Ordering::Acquire)
                .clamp(0, MAX_VOLUME);
            if vol == MAX_VOLUME {
                data[offset..offset + len1].copy_from_slice(chunk);
            } else {
                let f = vol as f32 / MAX_VOLUME as f32;
                for (dst, s) in data[offset..offset + len1].iter_mut().zip(chunk) {
                    *dst = s * f;
                }
            }
            offset += len1;
            self.buf_index += len1;
        }

        // 补偿硬件缓冲延迟后更新音频时钟：按两个设备缓冲加本块未写出的余量
        if !self.audio_clock.is_nan() {
            let rate = self.vs.playback_rate() as f64;
            let write_remaining = (self.audio_buf.len() - self.buf_index) * 4;
            let delay = (2 * self.hw_buf_size + write_remaining) as f64 / self.tgt.bytes_per_sec as f64;
            self.vs.audclk.set_at(
                self.audio_clock / rate - delay,
                self.audio_clock_serial,
                callback_time,
            );
            self.vs.sync_ext_to(&self.vs.audclk);
        }
    }

    /// 取一帧音频、重采样进 audio_buf；没有可播数据时返回 false
    fn refill(&mut self, callback_time: f64) -> bool {
        if self.vs.paused.load(Ordering::Acquire) {
            return false;
        }
        let vs = self.vs.clone();
        loop {
            // 回调线程不能无限期阻塞：半个硬件缓冲时间内等不到帧就先给静音
            while vs.sampq.nb_remaining() == 0 {
                if vs.audioq.is_aborted() {
                    return false;
                }
                let half_buf = self.hw_buf_size as f64 / self.tgt.bytes_per_sec as f64 / 2.0;
                if now_secs() - callback_time > half_buf {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(1));
            }

            let ok = vs.sampq.peek_readable(|af| {
                if af.serial != vs.audioq.serial() {
                    return false; // seek 前的过期帧
                }
                self.process_frame(af)
            });
            match ok {
                None => return false, // 队列已停用
                Some(false) => {
                    vs.sampq.next();
                    continue;
                }
                Some(true) => {
                    vs.sampq.next();
                    return true;
                }
            }
        }
    }

    /// 把一帧解码音频转换成目标格式写入 audio_buf
    fn process_frame(&mut self, af: &mut AudioSample) -> bool {
        let nb_samples = af.frame.samples();
        let rate = af.frame.rate();
        let fmt = af.frame.format();
        let frame_channels = af.frame.channels();
        let layout = {
            let l = af.frame.channel_layout();
            if l.channels() == frame_channels as i32 && l.bits() != 0 {
                l
            } else {
                ChannelLayout::default(frame_channels as i32)
            }
        };

        // 音频不是主时钟时按平均偏差微调期望采样数
        let wanted = if self.vs.master_sync() != SyncMaster::Audio {
            let diff = self.vs.audclk.get() - self.vs.master_clock();
            self.sync_filter.wanted_nb_samples(nb_samples, diff, rate)
        } else {
            nb_samples
        };

        if fmt != self.src_fmt
            || layout != self.src_layout
            || rate != self.src_rate
            || (wanted != nb_samples && self.resampler.is_none())
        {
            debug!(
                "🔧 重建音频重采样器: {}Hz/{:?} -> {}Hz/{:?}",
                rate, fmt, self.tgt.freq, self.tgt.fmt
            );
            self.resampler = match resampling::Context::get(
                fmt,
                layout,
                rate,
                self.tgt.fmt,
                self.tgt.channel_layout,
                self.tgt.freq,
            ) {
                Ok(ctx) => Some(ctx),
                Err(e) => {
                    error!("创建重采样器失败: {}", e);
                    return false;
                }
            };
            self.src_fmt = fmt;
            self.src_layout = layout;
            self.src_rate = rate;
        }

        if let Some(swr) = self.resampler.as_mut() {
            if wanted != nb_samples {
                // 通过重采样补偿把偏差摊到这一帧里
                let delta =
                    (wanted as i64 - nb_samples as i64) * self.tgt.freq as i64 / rate as i64;
                let distance = wanted as i64 * self.tgt.freq as i64 / rate as i64;
                let ret = unsafe {
                    ffmpeg::ffi::swr_set_compensation(
                        swr.as_mut_ptr(),
                        delta as i32,
                        distance as i32,
                    )
                };
                if ret < 0 {
                    error!("swr_set_compensation 失败");
                    return false;
                }
            }
            let mut out = frame::Audio::empty();
            if let Err(e) = swr.run(&af.frame, &mut out) {
                error!("重采样失败: {}", e);
                return false;
            }
            self.audio_buf.clear();
            append_packed_f32(&out, out.samples(), self.tgt.channels as usize, &mut self.audio_buf);
        } else {
            // 源与目标一致，直接拷贝
            self.audio_buf.clear();
            append_packed_f32(&af.frame, nb_samples, self.tgt.channels as usize, &mut self.audio_buf);
        }
        self.buf_index = 0;

        // 时钟记录到帧尾，按原始帧计，与重采样无关
        self.audio_clock = if af.pts.is_nan() {
            f64::NAN
        } else {
            af.pts + nb_samples as f64 / rate as f64
        };
        self.audio_clock_serial = af.serial;
        true
    }

    /// 倍率变化时重建变速滤镜；非 1.0x 时把 audio_buf 整块过一遍滤镜
    fn apply_rate_change(&mut self) {
        if self.vs.playback_rate_changed.swap(false, Ordering::AcqRel) {
            self.tempo = None;
            let rate = self.vs.playback_rate();
            if !is_normal_rate(rate) {
                match TempoStream::new(rate, self.tgt.freq, self.tgt.channel_layout, self.tgt.fmt) {
                    Ok(t) => self.tempo = Some(t),
                    Err(e) => error!("创建变速滤镜失败: {}", e),
                }
            }
        }
        let Some(tempo) = self.tempo.as_mut() else {
            return;
        };
        if self.audio_buf.is_empty() {
            return;
        }

        let channels = self.tgt.channels as usize;
        let samples = self.audio_buf.len() / channels;
        let mut inframe = frame::Audio::new(self.tgt.fmt, samples, self.tgt.channel_layout);
        inframe.set_rate(self.tgt.freq);
        inframe.set_pts(Some(self.tempo_pts));
        self.tempo_pts += samples as i64;
        {
            let bytes = unsafe {
                std::slice::from_raw_parts(self.audio_buf.as_ptr() as *const u8, self.audio_buf.len() * 4)
            };
            inframe.data_mut(0)[..bytes.len()].copy_from_slice(bytes);
        }

        if let Err(e) = tempo.send(&inframe) {
            warn!("变速滤镜写入失败: {}", e);
            self.tempo = None;
            return;
        }
        let mut stretched = Vec::new();
        let mut out = frame::Audio::empty();
        while tempo.receive(&mut out) {
            append_packed_f32(&out, out.samples(), channels, &mut stretched);
            out = frame::Audio::empty();
        }
        self.audio_buf = stretched;
        self.buf_index = 0;
    }
}

/// 把 packed f32 帧的 plane 0 追加进缓冲
fn append_packed_f32(frame: &frame::Audio, samples: usize, channels: usize, out: &mut Vec<f32>) {
    let count = samples * channels;
    let data = frame.data(0);
    let floats = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const f32, count) };
    out.extend_from_slice(floats);
}
