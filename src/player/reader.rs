use crate::core::{PlayerError, PlayerEvent, Result, StreamKind};
use crate::player::audio::audio_open;
use crate::player::decoder::{run_audio_decoder, run_subtitle_decoder, run_video_decoder, Decoder};
use crate::player::state::{ComponentHandle, VideoState};
use crate::player::{MAX_QUEUE_SIZE, MIN_FRAMES};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::{self, context::Input};
use ffmpeg_next::media;
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const AV_TIME_BASE: i64 = ffmpeg::ffi::AV_TIME_BASE as i64;
const AV_NOPTS: i64 = ffmpeg::ffi::AV_NOPTS_VALUE;

/// 读取线程入口
///
/// 读循环退出后（用户 stop、播放结束或打开失败）由本线程统一收尾：
/// 关闭三路流组件（join 各解码线程）、通知显示循环退出、发一次 stop 事件。
pub fn run_reader(vs: Arc<VideoState>) {
    info!("📖 读取线程启动: {}", vs.filename);
    if let Err(e) = read_loop(&vs) {
        error!("打开媒体失败: {}", e);
        vs.send_event(PlayerEvent::Error(format!("打开失败: {}", e)));
    }

    stream_component_close(&vs, StreamKind::Audio);
    stream_component_close(&vs, StreamKind::Video);
    stream_component_close(&vs, StreamKind::Subtitle);
    vs.abort_request.store(true, Ordering::Release);
    if !vs.stop_notified.swap(true, Ordering::AcqRel) {
        vs.send_event(PlayerEvent::StopFinished);
    }
    info!("📖 读取线程退出");
}

fn is_realtime(format_name: &str, url: &str) -> bool {
    format_name == "rtp"
        || format_name == "rtsp"
        || format_name == "sdp"
        || url.starts_with("rtp:")
        || url.starts_with("udp:")
}

fn is_network_url(url: &str) -> bool {
    url.starts_with("http://")
        || url.starts_with("https://")
        || url.starts_with("rtsp://")
        || url.starts_with("rtmp://")
        || url.starts_with("rtp://")
        || url.starts_with("udp://")
}

fn open_input(path: &str) -> Result<Input> {
    if is_network_url(path) {
        info!("🌐 检测到网络流，应用网络选项");
        let mut options = ffmpeg::Dictionary::new();
        options.set("fflags", "+discardcorrupt+genpts");
        options.set("reconnect", "1");
        options.set("reconnect_streamed", "1");
        options.set("reconnect_delay_max", "4");
        format::input_with_dictionary(&path, options)
            .map_err(|e| PlayerError::OpenError(format!("无法打开网络流: {}", e)))
    } else {
        format::input(&path).map_err(|e| PlayerError::OpenError(format!("无法打开文件: {}", e)))
    }
}

/// 解封装层的中断回调：abort 置位后让阻塞中的网络读尽快返回
unsafe extern "C" fn decode_interrupt_cb(opaque: *mut std::os::raw::c_void) -> std::os::raw::c_int {
    let vs = &*(opaque as *const VideoState);
    vs.abort_request.load(Ordering::Acquire) as std::os::raw::c_int
}

fn read_loop(vs: &Arc<VideoState>) -> Result<()> {
    let mut ic = open_input(&vs.filename)?;
    unsafe {
        (*ic.as_mut_ptr()).interrupt_callback = ffmpeg::ffi::AVIOInterruptCB {
            callback: Some(decode_interrupt_cb),
            opaque: Arc::as_ptr(vs) as *mut std::os::raw::c_void,
        };
    }

    let format_name = ic.format().name().to_string();
    let ts_discont =
        unsafe { ((*(*ic.as_ptr()).iformat).flags & ffmpeg::ffi::AVFMT_TS_DISCONT as i32) != 0 };
    vs.set_max_frame_duration(if ts_discont { 10.0 } else { 3600.0 });
    vs.realtime
        .store(is_realtime(&format_name, &vs.filename), Ordering::Release);

    let duration = ic.duration(); // µs
    vs.duration_us.store(duration, Ordering::Release);
    vs.start_time_us
        .store(unsafe { (*ic.as_ptr()).start_time }, Ordering::Release);
    vs.send_event(PlayerEvent::TotalSeconds((duration / AV_TIME_BASE).max(0)));

    let st_video = ic.streams().best(media::Type::Video).map(|s| s.index());
    let st_audio = ic.streams().best(media::Type::Audio).map(|s| s.index());
    let st_subtitle = ic.streams().best(media::Type::Subtitle).map(|s| s.index());
    debug!(
        "流探测: video={:?} audio={:?} subtitle={:?}",
        st_video, st_audio, st_subtitle
    );

    fill_media_info(vs, &ic, st_video, st_audio);

    if let Some(idx) = st_audio {
        if let Err(e) = stream_component_open(vs, &mut ic, idx) {
            // 音频设备打不开时退化为纯视频播放
            warn!("打开音频流失败: {}，继续无声播放", e);
        }
    }
    if let Some(idx) = st_video {
        if let Err(e) = stream_component_open(vs, &mut ic, idx) {
            warn!("打开视频流失败: {}", e);
        }
    }
    if let Some(idx) = st_subtitle {
        if let Err(e) = stream_component_open(vs, &mut ic, idx) {
            warn!("打开字幕流失败: {}，继续播放（无字幕）", e);
        }
    }

    if vs.audio_stream.load(Ordering::Acquire) < 0 && vs.video_stream.load(Ordering::Acquire) < 0 {
        return Err(PlayerError::NoPlayableStream);
    }

    let infinite_buffer = vs.realtime.load(Ordering::Acquire);
    let mut last_paused = false;

    loop {
        if vs.abort_request.load(Ordering::Acquire) {
            break;
        }

        // 暂停状态变化时通知解封装层（网络协议靠这个停流）
        let paused = vs.paused.load(Ordering::Acquire);
        if paused != last_paused {
            last_paused = paused;
            if paused {
                let _ = ic.pause();
            } else {
                let _ = ic.play();
            }
        }

        // 换流请求
        let cycle = vs.cycle_req.lock().take();
        if let Some(kind) = cycle {
            stream_cycle_channel(vs, &mut ic, kind);
        }

        // seek 请求
        if vs.seek_req.load(Ordering::Acquire) {
            handle_seek(vs, &mut ic);
        }

        // 专辑封面：一次性入队附带图片与空包
        if vs.queue_attachments_req.swap(false, Ordering::AcqRel) {
            queue_attached_picture(vs, &ic);
        }

        // 背压：总字节数超限，或所有在放的队列都已吃饱
        if !infinite_buffer
            && (vs.audioq.size() + vs.videoq.size() + vs.subtitleq.size() > MAX_QUEUE_SIZE
                || (has_enough_packets(vs, &ic, StreamKind::Audio)
                    && has_enough_packets(vs, &ic, StreamKind::Video)
                    && has_enough_packets(vs, &ic, StreamKind::Subtitle)))
        {
            vs.continue_read.wait_timeout(Duration::from_millis(10));
            continue;
        }

        // 全部解码器排空且未暂停：播放自然结束，退出读循环自行收尾
        if !paused && playback_drained(vs) {
            info!("⏹ 播放自然结束");
            break;
        }

        match ic.packets().next() {
            Some((stream, packet)) => {
                vs.eof.store(false, Ordering::Release);
                let attached_pic = stream
                    .disposition()
                    .contains(ffmpeg::format::stream::Disposition::ATTACHED_PIC);
                route_packet(vs, stream.index(), attached_pic, packet);
            }
            None => {
                // EOF：给每个在放的流补一个空包，让解码器排空
                if !vs.eof.swap(true, Ordering::AcqRel) {
                    let a = vs.audio_stream.load(Ordering::Acquire);
                    let v = vs.video_stream.load(Ordering::Acquire);
                    let s = vs.subtitle_stream.load(Ordering::Acquire);
                    if v >= 0 {
                        vs.videoq.put_null(v as usize);
                    }
                    if a >= 0 {
                        vs.audioq.put_null(a as usize);
                    }
                    if s >= 0 {
                        vs.subtitleq.put_null(s as usize);
                    }
                }
                vs.continue_read.wait_timeout(Duration::from_millis(10));
            }
        }
    }

    Ok(())
}

fn fill_media_info(vs: &Arc<VideoState>, ic: &Input, st_video: Option<usize>, st_audio: Option<usize>) {
    let mut info = vs.media_info.lock();
    info.duration_secs = (ic.duration() / AV_TIME_BASE).max(0);
    if let Some(idx) = st_video {
        if let Some(st) = ic.stream(idx) {
            info.video_codec = st.parameters().id().name().to_string();
            if let Ok(ctx) = ffmpeg::codec::context::Context::from_parameters(st.parameters()) {
                if let Ok(v) = ctx.decoder().video() {
                    info.width = v.width();
                    info.height = v.height();
                }
            }
        }
    }
    if let Some(idx) = st_audio {
        if let Some(st) = ic.stream(idx) {
            info.audio_codec = st.parameters().id().name().to_string();
            if let Ok(ctx) = ffmpeg::codec::context::Context::from_parameters(st.parameters()) {
                if let Ok(a) = ctx.decoder().audio() {
                    info.sample_rate = a.rate();
                    info.channels = a.channels();
                }
            }
        }
    }
}

/// 带范围的 seek，成功后冲刷全部队列并重置外部时钟
fn handle_seek(vs: &Arc<VideoState>, ic: &mut Input) {
    let seek_target = vs.seek_pos.load(Ordering::Acquire);
    let seek_rel = vs.seek_rel.load(Ordering::Acquire);
    // +-2 补偿 seek_pos/seek_rel 取整方向的误差
    let seek_min = if seek_rel > 0 {
        seek_target - seek_rel + 2
    } else {
        i64::MIN
    };
    let seek_max = if seek_rel < 0 {
        seek_target - seek_rel - 2
    } else {
        i64::MAX
    };

    match ic.seek(seek_target, seek_min..=seek_max) {
        Err(e) => error!("{}: seek 失败: {}", vs.filename, e),
        Ok(()) => {
            if vs.audio_stream.load(Ordering::Acquire) >= 0 {
                vs.audioq.flush();
                vs.audioq.put_flush();
            }
            if vs.subtitle_stream.load(Ordering::Acquire) >= 0 {
                vs.subtitleq.flush();
                vs.subtitleq.put_flush();
            }
            if vs.video_stream.load(Ordering::Acquire) >= 0 {
                vs.videoq.flush();
                vs.videoq.put_flush();
            }
            vs.extclk.set(seek_target as f64 / AV_TIME_BASE as f64, 0);
        }
    }
    vs.seek_req.store(false, Ordering::Release);
    vs.queue_attachments_req.store(true, Ordering::Release);
    vs.eof.store(false, Ordering::Release);
    // 暂停状态下 seek 后步进一帧，让新画面显示出来
    if vs.paused.load(Ordering::Acquire) {
        vs.step_to_next_frame();
    }
}

/// 专辑封面是单帧"视频流"：入队附带图片再补一个空包
fn queue_attached_picture(vs: &Arc<VideoState>, ic: &Input) {
    let v = vs.video_stream.load(Ordering::Acquire);
    if v < 0 {
        return;
    }
    if let Some(st) = ic.stream(v as usize) {
        if st
            .disposition()
            .contains(ffmpeg::format::stream::Disposition::ATTACHED_PIC)
        {
            let mut pkt = ffmpeg::Packet::empty();
            let ret = unsafe {
                ffmpeg::ffi::av_packet_ref(pkt.as_mut_ptr(), &(*st.as_ptr()).attached_pic)
            };
            if ret >= 0 {
                vs.videoq.put(pkt);
                vs.videoq.put_null(v as usize);
            }
        }
    }
}

fn stream_index_of(vs: &VideoState, kind: StreamKind) -> i32 {
    match kind {
        StreamKind::Audio => vs.audio_stream.load(Ordering::Acquire),
        StreamKind::Video => vs.video_stream.load(Ordering::Acquire),
        StreamKind::Subtitle => vs.subtitle_stream.load(Ordering::Acquire),
    }
}

/// 队列吃饱判定：未打开、已停用、附带图片流，或包数和时长双双充足
fn has_enough_packets(vs: &VideoState, ic: &Input, kind: StreamKind) -> bool {
    let idx = stream_index_of(vs, kind);
    if idx < 0 {
        return true;
    }
    let queue = match kind {
        StreamKind::Audio => &vs.audioq,
        StreamKind::Video => &vs.videoq,
        StreamKind::Subtitle => &vs.subtitleq,
    };
    if queue.is_aborted() {
        return true;
    }
    let st = match ic.stream(idx as usize) {
        Some(st) => st,
        None => return true,
    };
    if st
        .disposition()
        .contains(ffmpeg::format::stream::Disposition::ATTACHED_PIC)
    {
        return true;
    }
    let tb = st.time_base();
    let tb_f64 = tb.numerator() as f64 / tb.denominator() as f64;
    queue.nb_packets() > MIN_FRAMES
        && (queue.duration() == 0 || tb_f64 * queue.duration() as f64 > 1.0)
}

/// 全部在放的解码器都到达当前 serial 的末尾且帧队列已空
fn playback_drained(vs: &VideoState) -> bool {
    let audio_open_ = vs.audio_stream.load(Ordering::Acquire) >= 0;
    let video_open_ = vs.video_stream.load(Ordering::Acquire) >= 0;
    if !audio_open_ && !video_open_ {
        return false;
    }
    let audio_done = !audio_open_
        || (vs.audio_finished.load(Ordering::Acquire) == vs.audioq.serial()
            && vs.sampq.nb_remaining() == 0);
    let video_done = !video_open_
        || (vs.video_finished.load(Ordering::Acquire) == vs.videoq.serial()
            && vs.pictq.nb_remaining() == 0);
    audio_done && video_done
}

fn route_packet(vs: &Arc<VideoState>, index: usize, attached_pic: bool, packet: ffmpeg::Packet) {
    let a = vs.audio_stream.load(Ordering::Acquire);
    let v = vs.video_stream.load(Ordering::Acquire);
    let s = vs.subtitle_stream.load(Ordering::Acquire);
    if a >= 0 && index == a as usize {
        vs.audioq.put(packet);
    } else if v >= 0 && index == v as usize && !attached_pic {
        // 附带图片只通过 queue_attachments_req 一次性入队
        vs.videoq.put(packet);
    } else if s >= 0 && index == s as usize {
        vs.subtitleq.put(packet);
    }
    // 其余流的包直接丢弃
}

/// 打开一路流：建解码器、帧队列簿记、解码线程；音频还要开设备
pub fn stream_component_open(vs: &Arc<VideoState>, ic: &mut Input, stream_index: usize) -> Result<()> {
    let (parameters, time_base, start_time, avg_frame_rate) = {
        let st = ic
            .stream(stream_index)
            .ok_or_else(|| PlayerError::Other(format!("流索引越界: {}", stream_index)))?;
        (
            st.parameters(),
            st.time_base(),
            st.start_time(),
            st.avg_frame_rate(),
        )
    };

    let mut ctx = ffmpeg::codec::context::Context::from_parameters(parameters)?;
    // 解码器要用流的时间基换算 pts
    unsafe {
        (*ctx.as_mut_ptr()).pkt_timebase = ffmpeg::ffi::AVRational {
            num: time_base.numerator(),
            den: time_base.denominator(),
        };
    }

    let medium = ctx.medium();
    vs.eof.store(false, Ordering::Release);

    match medium {
        media::Type::Audio => {
            let decoder = ctx.decoder().audio()?;
            let output = audio_open(vs, decoder.rate(), decoder.channels())?;
            vs.audio_hw_buf_size
                .store(output.hw_buf_size(), Ordering::Release);
            *vs.audio_tgt.lock() = Some(output.params());

            vs.last_audio_stream.store(stream_index as i32, Ordering::Release);
            vs.audio_stream.store(stream_index as i32, Ordering::Release);

            let mut d = Decoder::new(vs.audioq.clone(), vs.audio_finished.clone());
            // 不支持回退定位的封装要以流起点作外推基准
            let no_seek_fallback = unsafe {
                ((*(*ic.as_ptr()).iformat).flags
                    & (ffmpeg::ffi::AVFMT_NOBINSEARCH
                        | ffmpeg::ffi::AVFMT_NOGENSEARCH
                        | ffmpeg::ffi::AVFMT_NO_BYTE_SEEK) as i32)
                    != 0
            };
            if no_seek_fallback && start_time != AV_NOPTS {
                d.set_start_pts(start_time, time_base);
            }
            vs.audioq.start();

            let vs2 = vs.clone();
            let handle = thread::spawn(move || run_audio_decoder(vs2, decoder, d, time_base));
            let mut comps = vs.components.lock();
            comps.audio_output = Some(output);
            comps.audio = Some(ComponentHandle {
                stream_index,
                thread: handle,
            });
        }
        media::Type::Video => {
            let decoder = ctx.decoder().video()?;
            vs.last_video_stream.store(stream_index as i32, Ordering::Release);
            vs.video_stream.store(stream_index as i32, Ordering::Release);

            let d = Decoder::new(vs.videoq.clone(), vs.video_finished.clone());
            vs.videoq.start();

            let vs2 = vs.clone();
            let handle = thread::spawn(move || {
                run_video_decoder(vs2, decoder, d, time_base, avg_frame_rate)
            });
            vs.components.lock().video = Some(ComponentHandle {
                stream_index,
                thread: handle,
            });
            vs.queue_attachments_req.store(true, Ordering::Release);
        }
        media::Type::Subtitle => {
            let decoder = ctx.decoder().subtitle()?;
            vs.last_subtitle_stream.store(stream_index as i32, Ordering::Release);
            vs.subtitle_stream.store(stream_index as i32, Ordering::Release);

            let d = Decoder::new(vs.subtitleq.clone(), Arc::new(std::sync::atomic::AtomicI32::new(-1)));
            vs.subtitleq.start();

            let vs2 = vs.clone();
            let handle = thread::spawn(move || run_subtitle_decoder(vs2, decoder, d));
            vs.components.lock().subtitle = Some(ComponentHandle {
                stream_index,
                thread: handle,
            });
        }
        _ => {}
    }
    Ok(())
}

/// 关闭一路流：停队列、唤醒等待者、join 解码线程、清队列
pub fn stream_component_close(vs: &Arc<VideoState>, kind: StreamKind) {
    let handle = {
        let mut comps = vs.components.lock();
        match kind {
            StreamKind::Audio => comps.audio.take(),
            StreamKind::Video => comps.video.take(),
            StreamKind::Subtitle => comps.subtitle.take(),
        }
    };
    let Some(handle) = handle else {
        return;
    };

    match kind {
        StreamKind::Audio => {
            vs.audioq.abort();
            vs.sampq.signal();
        }
        StreamKind::Video => {
            vs.videoq.abort();
            vs.pictq.signal();
        }
        StreamKind::Subtitle => {
            vs.subtitleq.abort();
            vs.subpq.signal();
        }
    }
    let _ = handle.thread.join();

    match kind {
        StreamKind::Audio => {
            vs.audioq.flush();
            // 关设备
            vs.components.lock().audio_output.take();
            *vs.audio_tgt.lock() = None;
            vs.audio_stream.store(-1, Ordering::Release);
        }
        StreamKind::Video => {
            vs.videoq.flush();
            vs.video_stream.store(-1, Ordering::Release);
        }
        StreamKind::Subtitle => {
            vs.subtitleq.flush();
            vs.subtitle_stream.store(-1, Ordering::Release);
        }
    }
}

fn kind_of(medium: media::Type) -> Option<StreamKind> {
    match medium {
        media::Type::Audio => Some(StreamKind::Audio),
        media::Type::Video => Some(StreamKind::Video),
        media::Type::Subtitle => Some(StreamKind::Subtitle),
        _ => None,
    }
}

/// 切到下一路同类型的流；字幕可以循环到"无"
fn stream_cycle_channel(vs: &Arc<VideoState>, ic: &mut Input, kind: StreamKind) {
    let nb_streams = ic.streams().count() as i32;
    if nb_streams == 0 {
        return;
    }
    let (start_index, old_index) = match kind {
        StreamKind::Audio => (
            vs.last_audio_stream.load(Ordering::Acquire),
            vs.audio_stream.load(Ordering::Acquire),
        ),
        StreamKind::Video => (
            vs.last_video_stream.load(Ordering::Acquire),
            vs.video_stream.load(Ordering::Acquire),
        ),
        StreamKind::Subtitle => (
            vs.last_subtitle_stream.load(Ordering::Acquire),
            vs.subtitle_stream.load(Ordering::Acquire),
        ),
    };

    let mut stream_index = start_index;
    let target = loop {
        stream_index += 1;
        if stream_index >= nb_streams {
            if kind == StreamKind::Subtitle {
                // 字幕转完一圈后关掉
                vs.last_subtitle_stream.store(-1, Ordering::Release);
                break None;
            }
            if start_index == -1 {
                return;
            }
            stream_index = 0;
        }
        if stream_index == start_index {
            return; // 转了一圈没有候选
        }
        let Some(st) = ic.stream(stream_index as usize) else {
            continue;
        };
        if kind_of(st.parameters().medium()) != Some(kind) {
            continue;
        }
        // 音频流要有有效参数才能开
        if kind == StreamKind::Audio {
            if let Ok(ctx) = ffmpeg::codec::context::Context::from_parameters(st.parameters()) {
                match ctx.decoder().audio() {
                    Ok(a) if a.rate() != 0 && a.channels() != 0 => break Some(stream_index),
                    _ => continue,
                }
            }
            continue;
        }
        break Some(stream_index);
    };

    info!(
        "🔄 切换{:?}流: #{} -> {:?}",
        kind, old_index, target
    );
    if old_index >= 0 {
        stream_component_close(vs, kind);
    }
    if let Some(idx) = target {
        if let Err(e) = stream_component_open(vs, ic, idx as usize) {
            warn!("切换流失败: {}", e);
        }
    }
}
