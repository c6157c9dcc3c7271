//! 桌面播放器的媒体播放引擎
//!
//! 负责解封装、解码、音视频同步、seek/暂停/音量/倍速等播放控制。
//! 窗口、控件与播放列表由宿主程序实现：渲染通过 [`VideoOutput`]
//! 回调对接，进度与状态通过事件通道送回。
//!
//! ```no_run
//! use player_core::{PlaybackManager, PlayerEvent, RenderPicture, VideoOutput};
//!
//! # struct MyRenderer;
//! # impl VideoOutput for MyRenderer {
//! #     fn viewport(&self) -> (u32, u32) { (1280, 720) }
//! #     fn render(&mut self, _: &RenderPicture<'_>) -> player_core::Result<()> { Ok(()) }
//! # }
//! let (mut player, events) = PlaybackManager::new()?;
//! player.start_play("demo.mp4", Box::new(MyRenderer))?;
//! while let Ok(ev) = events.recv() {
//!     match ev {
//!         PlayerEvent::PlaySeconds(secs) => println!("{:.1}s", secs),
//!         PlayerEvent::StopFinished => break,
//!         _ => {}
//!     }
//! }
//! # Ok::<(), player_core::PlayerError>(())
//! ```

pub mod core;
pub mod player;

pub use crate::core::{MediaInfo, PlaybackState, PlayerError, PlayerEvent, Result, StreamKind};
pub use crate::player::render::RenderPicture;
pub use crate::player::{DisplayRect, PlaybackManager, VideoOutput};
