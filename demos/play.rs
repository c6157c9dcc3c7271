//! 命令行试播：不开窗口，渲染回调丢弃画面，事件打到终端
//!
//! 用法: cargo run --example play -- <媒体文件或 URL>

use player_core::{PlaybackManager, PlayerEvent, RenderPicture, VideoOutput};

struct NullOutput;

impl VideoOutput for NullOutput {
    fn viewport(&self) -> (u32, u32) {
        (1280, 720)
    }

    fn render(&mut self, picture: &RenderPicture<'_>) -> player_core::Result<()> {
        log::trace!("渲染 {}x{} -> {:?}", picture.width, picture.height, picture.rect);
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let path = std::env::args()
        .nth(1)
        .expect("用法: play <媒体文件或 URL>");

    let (mut player, events) = PlaybackManager::new()?;
    player.start_play(&path, Box::new(NullOutput))?;

    let mut last_reported = -1.0f64;
    while let Ok(ev) = events.recv() {
        match ev {
            PlayerEvent::TotalSeconds(t) => println!("总时长: {}s", t),
            PlayerEvent::FrameDimensionsChanged(w, h) => println!("视频尺寸: {}x{}", w, h),
            PlayerEvent::PlaySeconds(p) if p - last_reported >= 1.0 => {
                last_reported = p;
                println!("进度: {:.1}s", p);
            }
            PlayerEvent::Error(e) => {
                eprintln!("错误: {}", e);
                break;
            }
            PlayerEvent::StopFinished => {
                println!("播放结束");
                break;
            }
            _ => {}
        }
    }
    player.stop();
    Ok(())
}
