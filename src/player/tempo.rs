//! 变速不变调
//!
//! 用 ffmpeg 的 atempo 滤镜做时域伸缩：速度 = 播放倍率，音调、节奏保持不变。
//! 倍率变化时整条滤镜流重建。

use crate::core::{PlayerError, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format::Sample;
use ffmpeg_next::util::frame;
use log::debug;

/// atempo 单级范围是 [0.5, 100]，低于 0.5 需要级联
fn tempo_chain(rate: f32) -> String {
    let mut r = rate as f64;
    let mut parts = Vec::new();
    while r < 0.5 {
        parts.push("atempo=0.5".to_string());
        r /= 0.5;
    }
    parts.push(format!("atempo={:.4}", r));
    parts.join(",")
}

fn sample_fmt_name(fmt: Sample) -> &'static str {
    match fmt {
        Sample::F32(_) => "flt",
        Sample::I16(_) => "s16",
        _ => "flt",
    }
}

/// 一条 abuffer -> atempo... -> abuffersink 滤镜流
pub struct TempoStream {
    graph: ffmpeg::filter::Graph,
    rate: f32,
}

impl TempoStream {
    pub fn new(
        rate: f32,
        sample_rate: u32,
        channel_layout: ChannelLayout,
        fmt: Sample,
    ) -> Result<Self> {
        let mut graph = ffmpeg::filter::Graph::new();
        let args = format!(
            "time_base=1/{rate_}:sample_rate={rate_}:sample_fmt={fmt}:channel_layout=0x{layout:x}",
            rate_ = sample_rate,
            fmt = sample_fmt_name(fmt),
            layout = channel_layout.bits(),
        );
        let abuffer = ffmpeg::filter::find("abuffer")
            .ok_or_else(|| PlayerError::Other("找不到 abuffer 滤镜".to_string()))?;
        let abuffersink = ffmpeg::filter::find("abuffersink")
            .ok_or_else(|| PlayerError::Other("找不到 abuffersink 滤镜".to_string()))?;
        graph.add(&abuffer, "in", &args)?;
        graph.add(&abuffersink, "out", "")?;

        let chain = tempo_chain(rate);
        debug!("变速滤镜: {} ({}Hz)", chain, sample_rate);
        graph.output("in", 0)?.input("out", 0)?.parse(&chain)?;
        graph.validate()?;

        Ok(Self { graph, rate })
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    /// 送入一帧待伸缩的音频
    pub fn send(&mut self, frame: &frame::Audio) -> Result<()> {
        self.graph
            .get("in")
            .ok_or_else(|| PlayerError::Other("滤镜流缺少输入端".to_string()))?
            .source()
            .add(frame)?;
        Ok(())
    }

    /// 取出一帧伸缩后的音频；没有更多数据时返回 false
    pub fn receive(&mut self, out: &mut frame::Audio) -> bool {
        match self
            .graph
            .get("out")
            .map(|mut ctx| ctx.sink().frame(out))
        {
            Some(Ok(())) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_stage_within_atempo_range() {
        assert_eq!(tempo_chain(2.0), "atempo=2.0000");
        assert_eq!(tempo_chain(3.0), "atempo=3.0000");
        assert_eq!(tempo_chain(0.5), "atempo=0.5000");
    }

    #[test]
    fn quarter_speed_cascades_two_stages() {
        assert_eq!(tempo_chain(0.25), "atempo=0.5,atempo=0.5000");
    }

    #[test]
    fn sample_format_names() {
        use ffmpeg_next::util::format::sample::Type;
        assert_eq!(sample_fmt_name(Sample::F32(Type::Packed)), "flt");
        assert_eq!(sample_fmt_name(Sample::I16(Type::Packed)), "s16");
    }
}
