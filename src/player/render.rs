use crate::core::{now_secs, PlayerEvent, Result, SyncMaster};
use crate::player::state::VideoState;
use crate::player::sync::{compute_target_delay, external_clock_speed};
use crate::player::{AV_SYNC_THRESHOLD_MAX, REFRESH_RATE};
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::format::Pixel;
use ffmpeg_next::util::frame;
use ffmpeg_next::Rational;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 视频在输出区域内的目标矩形（按 SAR 居中等比）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayRect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

/// 交给宿主渲染器的一帧画面
pub struct RenderPicture<'a> {
    /// BGRA 像素（字幕已合成）
    pub data: &'a [u8],
    /// 每行字节数
    pub stride: usize,
    pub width: u32,
    pub height: u32,
    pub rect: DisplayRect,
}

/// 宿主提供的视频输出
///
/// 引擎负责解码、格式转换与字幕合成；窗口、纹理与呈现由宿主实现。
/// 推荐硬件加速渲染，软件渲染亦可。
pub trait VideoOutput: Send {
    /// 当前输出区域大小（像素）
    fn viewport(&self) -> (u32, u32);
    /// 呈现一帧
    fn render(&mut self, picture: &RenderPicture<'_>) -> Result<()>;
}

/// 计算显示矩形：SAR 为 0 按 1 处理，宽高取偶并至少为 1，双轴居中
pub fn calculate_display_rect(
    scr_width: u32,
    scr_height: u32,
    pic_width: u32,
    pic_height: u32,
    sar: Rational,
) -> DisplayRect {
    let mut aspect_ratio = if sar.numerator() == 0 {
        0.0
    } else {
        sar.numerator() as f64 / sar.denominator() as f64
    };
    if aspect_ratio <= 0.0 {
        aspect_ratio = 1.0;
    }
    aspect_ratio *= pic_width.max(1) as f64 / pic_height.max(1) as f64;

    let mut height = scr_height as i64;
    let mut width = (height as f64 * aspect_ratio).round() as i64 & !1;
    if width > scr_width as i64 {
        width = scr_width as i64;
        height = (width as f64 / aspect_ratio).round() as i64 & !1;
    }
    let x = (scr_width as i64 - width) / 2;
    let y = (scr_height as i64 - height) / 2;
    DisplayRect {
        x: x as i32,
        y: y as i32,
        w: width.max(1) as u32,
        h: height.max(1) as u32,
    }
}

/// 帧的标量快照，避免同时借两个队列元素
#[derive(Clone, Copy)]
struct FrameSnap {
    pts: f64,
    duration: f64,
    serial: i32,
}

/// 视频帧时长：相邻两帧 pts 差；跨 serial 返回 0，seek 后的首帧立即显示
fn vp_duration(vp: FrameSnap, nextvp: FrameSnap, max_frame_duration: f64, rate: f64) -> f64 {
    if vp.serial == nextvp.serial {
        let duration = nextvp.pts - vp.pts;
        if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
            vp.duration / rate
        } else {
            duration / rate
        }
    } else {
        0.0
    }
}

/// swscale 上下文缓存与尺寸事件去重，显示循环线程独占
struct RenderState {
    convert_ctx: Option<scaling::Context>,
    convert_key: (u32, u32, Pixel),
    announced_dims: (u32, u32),
}

impl RenderState {
    fn new() -> Self {
        Self {
            convert_ctx: None,
            convert_key: (0, 0, Pixel::None),
            announced_dims: (0, 0),
        }
    }
}

/// 显示循环线程：以不超过 100Hz 的节奏驱动 video_refresh
pub fn run_presentation_loop(vs: Arc<VideoState>, mut output: Box<dyn VideoOutput>, exit: Arc<AtomicBool>) {
    info!("🖥 显示循环启动");
    let mut st = RenderState::new();
    let mut remaining_time = 0.0f64;

    while !exit.load(Ordering::Acquire) && !vs.abort_request.load(Ordering::Acquire) {
        if remaining_time > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(remaining_time));
        }
        remaining_time = REFRESH_RATE;
        if !vs.paused.load(Ordering::Acquire) || vs.force_refresh.load(Ordering::Acquire) {
            video_refresh(&vs, output.as_mut(), &mut st, &mut remaining_time);
        }
    }
    info!("🖥 显示循环退出");
}

/// 决定此刻该显示哪一帧并交给渲染器
fn video_refresh(
    vs: &Arc<VideoState>,
    output: &mut dyn VideoOutput,
    st: &mut RenderState,
    remaining_time: &mut f64,
) {
    // 实时源且外部时钟为主时，按缓冲水位微调外部时钟速度
    if !vs.paused.load(Ordering::Acquire)
        && vs.master_sync() == SyncMaster::External
        && vs.realtime.load(Ordering::Acquire)
    {
        let vq = (vs.video_stream.load(Ordering::Acquire) >= 0).then(|| vs.videoq.nb_packets());
        let aq = (vs.audio_stream.load(Ordering::Acquire) >= 0).then(|| vs.audioq.nb_packets());
        vs.extclk
            .set_speed(external_clock_speed(vq, aq, vs.extclk.speed()));
    }

    if vs.video_stream.load(Ordering::Acquire) >= 0 {
        let rate = vs.playback_rate() as f64;
        loop {
            let mut v = vs.pictq.view();
            if v.nb_remaining() == 0 {
                break;
            }

            let last = v
                .peek_last()
                .map(|p| FrameSnap { pts: p.pts, duration: p.duration, serial: p.serial });
            let cur = v
                .peek()
                .map(|p| FrameSnap { pts: p.pts, duration: p.duration, serial: p.serial })
                .expect("nb_remaining > 0 时必有待显示帧");

            // 过期序列的帧直接跳过
            if cur.serial != vs.videoq.serial() {
                v.next();
                continue;
            }

            // 跨 serial：seek 后的首帧，重置基准时刻
            if last.map_or(true, |l| l.serial != cur.serial) {
                *vs.frame_timer.lock() = now_secs();
            }

            if vs.paused.load(Ordering::Acquire) {
                break;
            }

            let last_duration = last
                .map(|l| vp_duration(l, cur, vs.max_frame_duration(), rate))
                .unwrap_or(0.0);
            let diff = if vs.master_sync() == SyncMaster::Video {
                f64::NAN // 自己是主时钟，不做校正
            } else {
                vs.vidclk.get() - vs.master_clock()
            };
            let delay = compute_target_delay(last_duration, diff, vs.max_frame_duration());

            let time = now_secs();
            let frame_deadline = *vs.frame_timer.lock() + delay;
            if time < frame_deadline {
                // 还没到点，睡到该显示为止（上限 REFRESH_RATE）
                *remaining_time = (frame_deadline - time).min(*remaining_time);
                break;
            }

            {
                let mut timer = vs.frame_timer.lock();
                *timer += delay;
                // 基准落后太多就直接贴齐当前时刻
                if delay > 0.0 && time - *timer > AV_SYNC_THRESHOLD_MAX {
                    *timer = time;
                }
            }

            if !cur.pts.is_nan() {
                vs.vidclk.set(cur.pts / rate, cur.serial);
                vs.sync_ext_to(&vs.vidclk);
            }

            // 丢帧：下一帧都该播了还没播完当前帧
            if v.nb_remaining() > 1 {
                let next = v
                    .peek_next()
                    .map(|p| FrameSnap { pts: p.pts, duration: p.duration, serial: p.serial })
                    .expect("nb_remaining > 1 时必有下一帧");
                let duration = vp_duration(cur, next, vs.max_frame_duration(), rate);
                if !vs.step.load(Ordering::Acquire)
                    && vs.master_sync() != SyncMaster::Video
                    && time > *vs.frame_timer.lock() + duration
                {
                    let n = vs.frame_drops_late.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!("丢弃迟到帧，累计 {}", n);
                    v.next();
                    continue;
                }
            }
            drop(v);

            // 字幕出队：过期的、被下一条顶掉的、过期序列的都丢
            advance_subtitles(vs);

            vs.pictq.next();
            vs.force_refresh.store(true, Ordering::Release);

            // 单步模式：显示完一帧就重新暂停
            if vs.step.load(Ordering::Acquire) && !vs.paused.load(Ordering::Acquire) {
                vs.toggle_pause_internal();
                vs.step.store(false, Ordering::Release);
            }
            break;
        }

        // 呈现
        if vs.force_refresh.load(Ordering::Acquire) {
            let shown = vs.pictq.view().rindex_shown();
            if shown {
                if let Err(e) = video_display(vs, output, st) {
                    warn!("渲染失败: {}", e);
                }
            }
        }
    }
    vs.force_refresh.store(false, Ordering::Release);

    let pos = vs.master_clock() * vs.playback_rate() as f64;
    if pos.is_finite() {
        vs.send_event(PlayerEvent::PlaySeconds(pos));
    }
}

fn advance_subtitles(vs: &Arc<VideoState>) {
    if vs.subtitle_stream.load(Ordering::Acquire) < 0 {
        return;
    }
    loop {
        let mut sv = vs.subpq.view();
        if sv.nb_remaining() == 0 {
            break;
        }
        let sp = sv
            .peek()
            .map(|s| (s.serial, s.pts + s.end_display))
            .expect("nb_remaining > 0 时必有字幕");
        let next_start = sv.peek_next().map(|s| s.pts + s.start_display);
        let vid_pts = vs.vidclk.pts();

        let stale = sp.0 != vs.subtitleq.serial()
            || vid_pts > sp.1
            || next_start.map_or(false, |ns| vid_pts > ns);
        if stale {
            sv.next();
        } else {
            break;
        }
    }
}

/// 把最近一帧转换成 BGRA、合成字幕并交给渲染器
fn video_display(vs: &Arc<VideoState>, output: &mut dyn VideoOutput, st: &mut RenderState) -> Result<()> {
    let (scr_w, scr_h) = output.viewport();
    if scr_w == 0 || scr_h == 0 {
        return Ok(());
    }

    let mut v = vs.pictq.view();
    let Some(vp) = v.peek_last() else {
        return Ok(());
    };

    if !vp.uploaded {
        let key = (vp.width, vp.height, vp.frame.format());
        if st.convert_ctx.is_none() || st.convert_key != key {
            st.convert_ctx = Some(scaling::Context::get(
                vp.frame.format(),
                vp.width,
                vp.height,
                Pixel::BGRA,
                vp.width,
                vp.height,
                scaling::Flags::BILINEAR,
            )?);
            st.convert_key = key;
        }
        let mut bgra = frame::Video::empty();
        st.convert_ctx
            .as_mut()
            .expect("转换上下文刚刚建好")
            .run(&vp.frame, &mut bgra)?;

        // 可见字幕合成到视频帧上（裁剪到视频矩形内）
        {
            let mut sv = vs.subpq.view();
            if let Some(sp) = sv.peek() {
                if vp.pts >= sp.pts + sp.start_display {
                    if sp.width == 0 || sp.height == 0 {
                        sp.width = vp.width;
                        sp.height = vp.height;
                    }
                    let (vw, vh) = (vp.width, vp.height);
                    let stride = bgra.stride(0);
                    composite_subtitle(sp, bgra.data_mut(0), stride, vw, vh);
                    sp.uploaded = true;
                }
            }
        }

        vp.converted = Some(bgra);
        vp.uploaded = true;

        if st.announced_dims != (vp.width, vp.height) {
            st.announced_dims = (vp.width, vp.height);
            vs.send_event(PlayerEvent::FrameDimensionsChanged(vp.width, vp.height));
        }
    }

    let rect = calculate_display_rect(scr_w, scr_h, vp.width, vp.height, vp.sar);
    let converted = vp.converted.as_ref().expect("uploaded 帧必有转换结果");
    output.render(&RenderPicture {
        data: converted.data(0),
        stride: converted.stride(0),
        width: vp.width,
        height: vp.height,
        rect,
    })
}

/// 把 PAL8 字幕矩形按画布比例缩放后 alpha 混合进 BGRA 帧
fn composite_subtitle(
    sp: &crate::player::frame_queue::SubtitlePicture,
    dst: &mut [u8],
    dst_stride: usize,
    dst_w: u32,
    dst_h: u32,
) {
    let sx = dst_w as f64 / sp.width.max(1) as f64;
    let sy = dst_h as f64 / sp.height.max(1) as f64;

    for rect in &sp.rects {
        // 先按字幕画布裁剪，再映射到视频坐标
        let rx = rect.x.clamp(0, sp.width as i32);
        let ry = rect.y.clamp(0, sp.height as i32);
        let rw = rect.w.clamp(0, sp.width as i32 - rx);
        let rh = rect.h.clamp(0, sp.height as i32 - ry);
        if rw <= 0 || rh <= 0 {
            continue;
        }

        let dx0 = (rx as f64 * sx) as i64;
        let dy0 = (ry as f64 * sy) as i64;
        let dx1 = ((rx + rw) as f64 * sx) as i64;
        let dy1 = ((ry + rh) as f64 * sy) as i64;

        for dy in dy0.max(0)..dy1.min(dst_h as i64) {
            // 最近邻回采样到源矩形
            let sy_px = (((dy - dy0) as f64 / sy) as i64).clamp(0, rh as i64 - 1) as usize;
            for dx in dx0.max(0)..dx1.min(dst_w as i64) {
                let sx_px = (((dx - dx0) as f64 / sx) as i64).clamp(0, rw as i64 - 1) as usize;
                let idx = rect.data[sy_px * rect.w as usize + sx_px] as usize;
                let pal = &rect.palette[idx * 4..idx * 4 + 4];
                let a = pal[3] as u32;
                if a == 0 {
                    continue;
                }
                let off = dy as usize * dst_stride + dx as usize * 4;
                let px = &mut dst[off..off + 4];
                for c in 0..3 {
                    px[c] = ((pal[c] as u32 * a + px[c] as u32 * (255 - a)) / 255) as u8;
                }
                px[3] = 255;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(sw: u32, sh: u32, pw: u32, ph: u32, num: i32, den: i32) -> DisplayRect {
        calculate_display_rect(sw, sh, pw, ph, Rational::new(num, den))
    }

    #[test]
    fn square_pixels_fill_matching_viewport() {
        let r = rect(1920, 1080, 1920, 1080, 0, 1);
        assert_eq!(r, DisplayRect { x: 0, y: 0, w: 1920, h: 1080 });
    }

    #[test]
    fn wide_video_letterboxes_in_tall_viewport() {
        let r = rect(1280, 1024, 1920, 1080, 0, 1);
        // 宽度顶满，高度按比例缩小并取偶，垂直居中
        assert_eq!(r.w, 1280);
        assert_eq!(r.h, 720);
        assert_eq!(r.x, 0);
        assert_eq!(r.y, (1024 - 720) / 2);
    }

    #[test]
    fn narrow_video_pillarboxes() {
        let r = rect(1920, 1080, 720, 1080, 0, 1);
        assert_eq!(r.h, 1080);
        assert_eq!(r.w, 720);
        assert_eq!(r.x, (1920 - 720) / 2);
    }

    #[test]
    fn sar_stretches_width() {
        // 4:3 采样比把 720x576 拉宽
        let a = rect(1920, 576, 720, 576, 4, 3);
        let b = rect(1920, 576, 720, 576, 1, 1);
        assert!(a.w > b.w);
    }

    #[test]
    fn rect_never_collapses_to_zero() {
        let r = rect(2, 2, 1920, 1080, 0, 1);
        assert!(r.w >= 1 && r.h >= 1);
    }

    #[test]
    fn width_rounds_down_to_even_when_unclamped() {
        // 1919 宽的视频在足够宽的视口里按高度放大，宽度取偶
        let r = rect(4000, 1080, 1919, 1080, 0, 1);
        assert_eq!(r.w % 2, 0);
        assert_eq!(r.w, 1918);
    }

    fn snap(pts: f64, duration: f64, serial: i32) -> FrameSnap {
        FrameSnap { pts, duration, serial }
    }

    #[test]
    fn vp_duration_uses_pts_delta_within_serial() {
        assert!((vp_duration(snap(1.0, 0.04, 5), snap(1.05, 0.04, 5), 10.0, 1.0) - 0.05).abs() < 1e-9);
        // 倍速播放时长按倍率缩短
        assert!((vp_duration(snap(1.0, 0.04, 5), snap(1.05, 0.04, 5), 10.0, 2.0) - 0.025).abs() < 1e-9);
    }

    #[test]
    fn vp_duration_zero_across_serials() {
        assert_eq!(vp_duration(snap(1.0, 0.04, 5), snap(9.0, 0.04, 6), 10.0, 1.0), 0.0);
    }

    #[test]
    fn vp_duration_falls_back_on_discontinuity() {
        // 超过 max_frame_duration，视作时间戳跳变
        assert!((vp_duration(snap(1.0, 0.04, 5), snap(100.0, 0.04, 5), 10.0, 1.0) - 0.04).abs() < 1e-9);
    }

    #[test]
    fn subtitle_blend_respects_alpha() {
        use crate::player::frame_queue::{SubtitlePicture, SubtitleRect};
        let mut palette = vec![0u8; 256 * 4];
        // 索引 1：不透明白色；索引 2：半透明红色(BGRA)
        palette[4..8].copy_from_slice(&[255, 255, 255, 255]);
        palette[8..12].copy_from_slice(&[0, 0, 255, 128]);
        let sp = SubtitlePicture {
            rects: vec![SubtitleRect {
                x: 0,
                y: 0,
                w: 2,
                h: 1,
                data: vec![1, 2],
                palette,
            }],
            pts: 0.0,
            serial: 0,
            width: 2,
            height: 1,
            start_display: 0.0,
            end_display: 1.0,
            uploaded: false,
        };
        let mut dst = vec![0u8; 2 * 4];
        composite_subtitle(&sp, &mut dst, 8, 2, 1);
        // 不透明：直接覆盖
        assert_eq!(&dst[0..4], &[255, 255, 255, 255]);
        // 半透明：与黑底混合
        assert_eq!(dst[6], (255 * 128 / 255) as u8);
        assert_eq!(dst[7], 255);
    }
}
