use crate::player::frame_queue::{AudioSample, SubtitlePicture, SubtitleRect, VideoPicture};
use crate::player::packet_queue::{PacketPull, PacketQueue, QueuedPacket};
use crate::player::state::{ReadWaker, VideoState};
use crate::player::AV_NOSYNC_THRESHOLD;
use crate::core::SyncMaster;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::decoder;
use ffmpeg_next::ffi::AVSubtitleType;
use ffmpeg_next::util::frame;
use ffmpeg_next::{Rational, Rescale};
use log::{debug, info, warn};
use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// 从包队列取出的下一项
pub enum Fetched {
    /// 冲刷哨兵：解码器需要重置
    Flush,
    Data(ffmpeg::Packet),
    /// 空包：进入排空模式
    Null,
}

/// 解码器状态 - 绑定一个包队列，跟踪播放序列与排空进度
///
/// codec context 归解码线程独占，这里只管队列一侧的簿记。
pub struct Decoder {
    queue: Arc<PacketQueue>,
    finished: Arc<AtomicI32>,
    pub pkt_serial: i32,
    start_pts: Option<i64>,
    start_pts_tb: Rational,
    next_pts: Option<i64>,
    next_pts_tb: Rational,
}

impl Decoder {
    pub fn new(queue: Arc<PacketQueue>, finished: Arc<AtomicI32>) -> Self {
        Self {
            queue,
            finished,
            pkt_serial: -1,
            start_pts: None,
            start_pts_tb: Rational::new(0, 1),
            next_pts: None,
            next_pts_tb: Rational::new(0, 1),
        }
    }

    /// 某些无法回退定位的封装格式需要以流的起始 pts 作外推起点
    pub fn set_start_pts(&mut self, pts: i64, tb: Rational) {
        self.start_pts = Some(pts);
        self.start_pts_tb = tb;
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    /// 阻塞取下一个属于当前播放序列的包；队列停用时返回 None。
    /// 队列见空先唤醒读线程。
    pub fn fetch(&mut self, waker: &ReadWaker) -> Option<Fetched> {
        loop {
            if self.queue.nb_packets() == 0 {
                waker.wake();
            }
            match self.queue.get(true) {
                PacketPull::Aborted => return None,
                PacketPull::Empty => continue,
                PacketPull::Item { pkt, serial } => {
                    self.pkt_serial = serial;
                    if serial != self.queue.serial() {
                        debug!("丢弃过期包: serial {} != {}", serial, self.queue.serial());
                        continue;
                    }
                    return Some(match pkt {
                        QueuedPacket::Flush => Fetched::Flush,
                        QueuedPacket::Data(p) => Fetched::Data(p),
                        QueuedPacket::Null { .. } => Fetched::Null,
                    });
                }
            }
        }
    }

    /// 冲刷哨兵之后的簿记：清除排空标记，预测 pts 回到起点
    pub fn on_flush(&mut self) {
        self.finished.store(0, Ordering::Release);
        self.next_pts = self.start_pts;
        self.next_pts_tb = self.start_pts_tb;
    }

    pub fn mark_finished(&self) {
        self.finished.store(self.pkt_serial, Ordering::Release);
    }
}

const AV_NOPTS: i64 = ffmpeg::ffi::AV_NOPTS_VALUE;

/// 视频解码线程
pub fn run_video_decoder(
    vs: Arc<VideoState>,
    mut dec: decoder::Video,
    mut d: Decoder,
    tb: Rational,
    frame_rate: Rational,
) {
    info!("🎞 视频解码线程启动");
    let tb_f64 = tb.numerator() as f64 / tb.denominator() as f64;
    // 一帧的名义时长由帧率决定
    let nominal_duration = if frame_rate.numerator() != 0 && frame_rate.denominator() != 0 {
        frame_rate.denominator() as f64 / frame_rate.numerator() as f64
    } else {
        0.0
    };
    let mut frame = frame::Video::empty();

    'outer: loop {
        // 播放序列连续时先把解码器里攒的帧收干净
        if d.pkt_serial == d.queue().serial() {
            loop {
                if d.queue().is_aborted() {
                    break 'outer;
                }
                match dec.receive_frame(&mut frame) {
                    Ok(()) => {
                        let pts = match vs.reorder_video_pts {
                            // 按包 DTS 显示（个别封装的重排时间戳不可信）
                            Some(false) => {
                                let dts = unsafe { (*frame.as_ptr()).pkt_dts };
                                (dts != AV_NOPTS).then_some(dts)
                            }
                            _ => frame.timestamp(),
                        };
                        frame.set_pts(pts);
                        let dpts = pts.map_or(f64::NAN, |p| p as f64 * tb_f64);

                        // 已经落后主时钟的帧不必进队列
                        if vs.master_sync() != SyncMaster::Video && pts.is_some() {
                            let diff = dpts - vs.master_clock();
                            if !diff.is_nan()
                                && diff.abs() < AV_NOSYNC_THRESHOLD
                                && diff < 0.0
                                && d.pkt_serial == vs.vidclk.serial()
                                && vs.videoq.nb_packets() > 0
                            {
                                vs.frame_drops_early.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                        }

                        let picture = VideoPicture {
                            width: frame.width(),
                            height: frame.height(),
                            sar: frame.aspect_ratio(),
                            pts: dpts,
                            duration: nominal_duration,
                            pos: -1,
                            serial: d.pkt_serial,
                            uploaded: false,
                            converted: None,
                            frame: mem::replace(&mut frame, frame::Video::empty()),
                        };
                        if !vs.pictq.push_blocking(picture) {
                            break 'outer;
                        }
                    }
                    Err(ffmpeg::Error::Eof) => {
                        d.mark_finished();
                        dec.flush();
                        break;
                    }
                    Err(ffmpeg::Error::Other { errno: 11 }) => break, // EAGAIN，继续喂包
                    Err(e) => {
                        warn!("视频解码错误（已跳过）: {}", e);
                        break;
                    }
                }
            }
        }

        match d.fetch(&vs.continue_read) {
            None => break,
            Some(Fetched::Flush) => {
                dec.flush();
                d.on_flush();
            }
            Some(Fetched::Data(pkt)) => match dec.send_packet(&pkt) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => dec.flush(),
                Err(e) => warn!("视频包送解码器失败（已跳过）: {}", e),
            },
            Some(Fetched::Null) => {
                let _ = dec.send_eof();
            }
        }
    }
    info!("🎞 视频解码线程退出");
}

/// 音频解码线程
pub fn run_audio_decoder(vs: Arc<VideoState>, mut dec: decoder::Audio, mut d: Decoder, tb: Rational) {
    info!("🔊 音频解码线程启动");
    let mut frame = frame::Audio::empty();

    'outer: loop {
        if d.pkt_serial == d.queue().serial() {
            loop {
                if d.queue().is_aborted() {
                    break 'outer;
                }
                match dec.receive_frame(&mut frame) {
                    Ok(()) => {
                        let rate = frame.rate();
                        let out_tb = Rational::new(1, rate as i32);
                        // pts 换算到 {1, sample_rate}；缺失时用上一帧的采样数外推
                        let pts = match frame.pts() {
                            Some(p) => Some(p.rescale(tb, out_tb)),
                            None => d.next_pts.map(|np| np.rescale(d.next_pts_tb, out_tb)),
                        };
                        if let Some(p) = pts {
                            d.next_pts = Some(p + frame.samples() as i64);
                            d.next_pts_tb = out_tb;
                        }

                        let sample = AudioSample {
                            pts: pts.map_or(f64::NAN, |p| p as f64 / rate as f64),
                            duration: frame.samples() as f64 / rate as f64,
                            pos: -1,
                            serial: d.pkt_serial,
                            frame: mem::replace(&mut frame, frame::Audio::empty()),
                        };
                        if !vs.sampq.push_blocking(sample) {
                            break 'outer;
                        }
                    }
                    Err(ffmpeg::Error::Eof) => {
                        d.mark_finished();
                        dec.flush();
                        break;
                    }
                    Err(ffmpeg::Error::Other { errno: 11 }) => break, // EAGAIN
                    Err(e) => {
                        warn!("音频解码错误（已跳过）: {}", e);
                        break;
                    }
                }
            }
        }

        match d.fetch(&vs.continue_read) {
            None => break,
            Some(Fetched::Flush) => {
                dec.flush();
                d.on_flush();
            }
            Some(Fetched::Data(pkt)) => match dec.send_packet(&pkt) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => dec.flush(),
                Err(e) => warn!("音频包送解码器失败（已跳过）: {}", e),
            },
            Some(Fetched::Null) => {
                let _ = dec.send_eof();
            }
        }
    }
    info!("🔊 音频解码线程退出");
}

/// 字幕解码线程 - 只处理位图字幕，文本字幕不在本引擎职责内
pub fn run_subtitle_decoder(vs: Arc<VideoState>, mut dec: decoder::Subtitle, mut d: Decoder) {
    info!("💬 字幕解码线程启动");
    loop {
        let fetched = match d.fetch(&vs.continue_read) {
            None => break,
            Some(f) => f,
        };
        match fetched {
            Fetched::Flush => {
                dec.flush();
                d.on_flush();
            }
            Fetched::Data(pkt) => {
                if !decode_one_subtitle(&vs, &mut dec, &mut d, &pkt, false) {
                    break;
                }
            }
            Fetched::Null => {
                let empty = ffmpeg::Packet::empty();
                if !decode_one_subtitle(&vs, &mut dec, &mut d, &empty, true) {
                    break;
                }
            }
        }
    }
    info!("💬 字幕解码线程退出");
}

/// 解码一个字幕包并在成功时入队；返回 false 表示帧队列已停用
fn decode_one_subtitle(
    vs: &VideoState,
    dec: &mut decoder::Subtitle,
    d: &mut Decoder,
    pkt: &ffmpeg::Packet,
    draining: bool,
) -> bool {
    let mut sub = ffmpeg::codec::subtitle::Subtitle::default();
    let got = match dec.decode(pkt, &mut sub) {
        Ok(got) => got,
        Err(e) => {
            warn!("字幕解码错误（已跳过）: {}", e);
            return true;
        }
    };
    if !got {
        if draining {
            d.mark_finished();
        }
        return true;
    }

    let picture = unsafe { extract_bitmap_subtitle(&mut sub, dec, d.pkt_serial) };
    // AVSubtitle 的矩形内存必须显式释放，ffmpeg-next 不会代劳
    unsafe { ffmpeg::ffi::avsubtitle_free(sub.as_mut_ptr()) };

    match picture {
        Some(p) => vs.subpq.push_blocking(p),
        None => true,
    }
}

/// 从 AVSubtitle 中拷出位图矩形（format == 0 才有）
unsafe fn extract_bitmap_subtitle(
    sub: &mut ffmpeg::codec::subtitle::Subtitle,
    dec: &decoder::Subtitle,
    serial: i32,
) -> Option<SubtitlePicture> {
    let raw = sub.as_ptr();
    if (*raw).format != 0 {
        return None; // 文本/ASS 字幕不处理
    }

    let mut rects = Vec::new();
    for i in 0..(*raw).num_rects as usize {
        let r = *(*raw).rects.add(i);
        if (*r).type_ != AVSubtitleType::SUBTITLE_BITMAP {
            continue;
        }
        let w = (*r).w;
        let h = (*r).h;
        if w <= 0 || h <= 0 || (*r).data[0].is_null() || (*r).data[1].is_null() {
            continue;
        }
        // 像素按行折叠拷出，调色板固定 256 项 BGRA
        let linesize = (*r).linesize[0] as usize;
        let mut data = Vec::with_capacity((w * h) as usize);
        for row in 0..h as usize {
            let line = std::slice::from_raw_parts((*r).data[0].add(row * linesize), w as usize);
            data.extend_from_slice(line);
        }
        let nb_colors = ((*r).nb_colors as usize).min(256);
        let mut palette = vec![0u8; 256 * 4];
        let pal = std::slice::from_raw_parts((*r).data[1], nb_colors * 4);
        palette[..pal.len()].copy_from_slice(pal);

        rects.push(SubtitleRect {
            x: (*r).x,
            y: (*r).y,
            w,
            h,
            data,
            palette,
        });
    }
    if rects.is_empty() {
        return None;
    }

    let ctx = dec.as_ptr();
    let pts = sub.pts().map_or(0.0, |p| p as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE));
    Some(SubtitlePicture {
        rects,
        pts,
        serial,
        width: (*ctx).width.max(0) as u32,
        height: (*ctx).height.max(0) as u32,
        start_display: (*raw).start_display_time as f64 / 1000.0,
        end_display: (*raw).end_display_time as f64 / 1000.0,
        uploaded: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::packet_queue::PacketQueue;

    #[test]
    fn fetch_skips_stale_serials() {
        let q = Arc::new(PacketQueue::new());
        q.start(); // serial = 1，队首是哨兵
        q.put(ffmpeg::Packet::new(8)); // serial 1
        q.put_flush(); // serial = 2
        q.put(ffmpeg::Packet::new(8)); // serial 2

        let waker = ReadWaker::new();
        let mut d = Decoder::new(q.clone(), Arc::new(AtomicI32::new(-1)));

        // serial 1 的哨兵和数据包都属于过期序列，直接跳到 serial 2 的哨兵
        match d.fetch(&waker) {
            Some(Fetched::Flush) => {}
            _ => panic!("应先拿到新序列的哨兵"),
        }
        assert_eq!(d.pkt_serial, 2);
        match d.fetch(&waker) {
            Some(Fetched::Data(_)) => {}
            _ => panic!("应拿到新序列的数据包"),
        }
    }

    #[test]
    fn fetch_returns_none_on_abort() {
        let q = Arc::new(PacketQueue::new());
        q.start();
        q.abort();
        let waker = ReadWaker::new();
        let mut d = Decoder::new(q, Arc::new(AtomicI32::new(-1)));
        assert!(d.fetch(&waker).is_none());
    }

    #[test]
    fn flush_resets_finished_and_next_pts() {
        let q = Arc::new(PacketQueue::new());
        let finished = Arc::new(AtomicI32::new(-1));
        let mut d = Decoder::new(q, finished.clone());
        d.set_start_pts(100, Rational::new(1, 1000));
        d.pkt_serial = 3;
        d.mark_finished();
        assert_eq!(finished.load(Ordering::Acquire), 3);
        d.on_flush();
        assert_eq!(finished.load(Ordering::Acquire), 0);
        assert_eq!(d.next_pts, Some(100));
    }
}
