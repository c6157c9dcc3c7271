use crate::player::packet_queue::PacketQueue;
use ffmpeg_next::util::frame;
use ffmpeg_next::Rational;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;

/// 解码后的视频帧
pub struct VideoPicture {
    pub frame: frame::Video,
    /// 已转换好的 BGRA 帧缓存；置位后重绘不再走 swscale
    pub converted: Option<frame::Video>,
    pub pts: f64,      // 秒
    pub duration: f64, // 秒
    pub pos: i64,      // 源文件中的字节位置
    pub serial: i32,
    pub width: u32,
    pub height: u32,
    pub sar: Rational,
    pub uploaded: bool,
}

/// 解码后的音频帧
pub struct AudioSample {
    pub frame: frame::Audio,
    pub pts: f64,
    pub duration: f64,
    pub pos: i64,
    pub serial: i32,
}

/// 位图字幕的一个矩形区域（已从 AVSubtitle 中拷出）
pub struct SubtitleRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    /// PAL8 像素索引，按行连续存放（linesize 已折叠）
    pub data: Vec<u8>,
    /// 调色板，每项 4 字节 BGRA
    pub palette: Vec<u8>,
}

/// 解码后的字幕帧
pub struct SubtitlePicture {
    pub rects: Vec<SubtitleRect>,
    pub pts: f64, // 秒
    pub serial: i32,
    pub width: u32,
    pub height: u32,
    /// 相对 pts 的显示起止（秒）
    pub start_display: f64,
    pub end_display: f64,
    pub uploaded: bool,
}

// AVFrame 的数据缓冲只会在单一生产者/单一消费者之间交接，
// 队列互斥量保证交接点之外不存在并发访问。
unsafe impl Send for VideoPicture {}
unsafe impl Send for AudioSample {}

struct Ring<T> {
    queue: Vec<Option<T>>,
    rindex: usize,
    windex: usize,
    size: usize,
    rindex_shown: usize,
}

/// 帧队列 - 小型有界环形缓冲
///
/// keep_last 打开时，next() 消费的最后一帧仍保留在 rindex 上，
/// 暂停重绘、窗口变化时无需重新解码。生产者在队列满时阻塞，
/// 消费者在队列空时阻塞，二者都观察所属包队列的 abort。
pub struct FrameQueue<T> {
    inner: Mutex<Ring<T>>,
    cond: Condvar,
    pktq: Arc<PacketQueue>,
    max_size: usize,
    keep_last: bool,
}

impl<T> FrameQueue<T> {
    pub fn new(pktq: Arc<PacketQueue>, max_size: usize, keep_last: bool) -> Self {
        let mut queue = Vec::with_capacity(max_size);
        queue.resize_with(max_size, || None);
        Self {
            inner: Mutex::new(Ring {
                queue,
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
            pktq,
            max_size,
            keep_last,
        }
    }

    /// 等待出现空位后写入一帧；队列停用时返回 false 并丢弃该帧
    pub fn push_blocking(&self, frame: T) -> bool {
        let mut ring = self.inner.lock();
        while ring.size >= self.max_size && !self.pktq.is_aborted() {
            self.cond.wait(&mut ring);
        }
        if self.pktq.is_aborted() {
            return false;
        }
        let windex = ring.windex;
        ring.queue[windex] = Some(frame);
        ring.windex = (ring.windex + 1) % self.max_size;
        ring.size += 1;
        self.cond.notify_all();
        true
    }

    /// 阻塞等待可读帧，并在持锁状态下访问它；队列停用时返回 None。
    /// 调用方随后用 next() 推进读索引。
    pub fn peek_readable<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut ring = self.inner.lock();
        while ring.size - ring.rindex_shown == 0 && !self.pktq.is_aborted() {
            self.cond.wait(&mut ring);
        }
        if self.pktq.is_aborted() {
            return None;
        }
        let idx = (ring.rindex + ring.rindex_shown) % self.max_size;
        Some(f(ring.queue[idx].as_mut().expect("可读帧位置为空")))
    }

    /// 取得持锁视图，供显示循环一次性 peek 多个帧
    pub fn view(&self) -> FrameQueueView<'_, T> {
        FrameQueueView {
            q: self,
            ring: self.inner.lock(),
        }
    }

    /// 未显示的帧数
    pub fn nb_remaining(&self) -> usize {
        let ring = self.inner.lock();
        ring.size - ring.rindex_shown
    }

    /// 推进读索引；keep_last 打开时第一次调用只是标记 rindex_shown
    pub fn next(&self) {
        let mut ring = self.inner.lock();
        self.next_locked(&mut ring);
    }

    fn next_locked(&self, ring: &mut Ring<T>) {
        if self.keep_last && ring.rindex_shown == 0 {
            ring.rindex_shown = 1;
            return;
        }
        let rindex = ring.rindex;
        ring.queue[rindex] = None;
        ring.rindex = (ring.rindex + 1) % self.max_size;
        ring.size -= 1;
        self.cond.notify_all();
    }

    /// 唤醒所有等待者（配合包队列 abort 终止生产/消费）
    pub fn signal(&self) {
        let _ring = self.inner.lock();
        self.cond.notify_all();
    }

    /// 清空全部帧并复位索引（stop 之后复用）
    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        for slot in ring.queue.iter_mut() {
            *slot = None;
        }
        ring.rindex = 0;
        ring.windex = 0;
        ring.size = 0;
        ring.rindex_shown = 0;
        self.cond.notify_all();
    }

    pub fn pktq(&self) -> &PacketQueue {
        &self.pktq
    }
}

/// 帧队列的持锁视图
pub struct FrameQueueView<'a, T> {
    q: &'a FrameQueue<T>,
    ring: MutexGuard<'a, Ring<T>>,
}

impl<'a, T> FrameQueueView<'a, T> {
    pub fn nb_remaining(&self) -> usize {
        self.ring.size - self.ring.rindex_shown
    }

    /// 当前待显示的帧
    pub fn peek(&mut self) -> Option<&mut T> {
        if self.nb_remaining() == 0 {
            return None;
        }
        let idx = (self.ring.rindex + self.ring.rindex_shown) % self.q.max_size;
        self.ring.queue[idx].as_mut()
    }

    /// 待显示帧的下一帧
    pub fn peek_next(&mut self) -> Option<&mut T> {
        if self.nb_remaining() < 2 {
            return None;
        }
        let idx = (self.ring.rindex + self.ring.rindex_shown + 1) % self.q.max_size;
        self.ring.queue[idx].as_mut()
    }

    /// 最近显示过的一帧（keep_last 保留位）
    pub fn peek_last(&mut self) -> Option<&mut T> {
        let idx = self.ring.rindex;
        self.ring.queue[idx].as_mut()
    }

    pub fn rindex_shown(&self) -> bool {
        self.ring.rindex_shown != 0
    }

    /// 推进读索引（语义同 FrameQueue::next）
    pub fn next(&mut self) {
        self.q.next_locked(&mut self.ring);
    }
}

/// 便捷构造：按各自的规格建三个帧队列
pub fn video_queue(pktq: Arc<PacketQueue>) -> FrameQueue<VideoPicture> {
    FrameQueue::new(pktq, crate::player::VIDEO_PICTURE_QUEUE_SIZE, true)
}

pub fn audio_queue(pktq: Arc<PacketQueue>) -> FrameQueue<AudioSample> {
    FrameQueue::new(pktq, crate::player::SAMPLE_QUEUE_SIZE, true)
}

pub fn subtitle_queue(pktq: Arc<PacketQueue>) -> FrameQueue<SubtitlePicture> {
    FrameQueue::new(pktq, crate::player::SUBPICTURE_QUEUE_SIZE, false)
}

// 便于测试的最小帧类型在测试模块里定义
#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    struct TestFrame(i32);

    fn queue(max: usize, keep_last: bool) -> (Arc<PacketQueue>, FrameQueue<TestFrame>) {
        let pktq = Arc::new(PacketQueue::new());
        pktq.start();
        let fq = FrameQueue::new(pktq.clone(), max, keep_last);
        (pktq, fq)
    }

    #[test]
    fn keep_last_retains_consumed_frame() {
        let (_p, fq) = queue(3, true);
        assert!(fq.push_blocking(TestFrame(1)));
        assert!(fq.push_blocking(TestFrame(2)));
        assert_eq!(fq.nb_remaining(), 2);

        // 第一次 next 只标记 rindex_shown，帧 1 仍可作为 last 取到
        fq.next();
        assert_eq!(fq.nb_remaining(), 1);
        {
            let mut v = fq.view();
            assert_eq!(v.peek_last().unwrap().0, 1);
            assert_eq!(v.peek().unwrap().0, 2);
        }

        // 第二次 next 真正丢弃帧 1，last 变成帧 2
        fq.next();
        assert_eq!(fq.nb_remaining(), 0);
        let mut v = fq.view();
        assert_eq!(v.peek_last().unwrap().0, 2);
        assert!(v.peek().is_none());
    }

    #[test]
    fn no_keep_last_drops_immediately() {
        let (_p, fq) = queue(4, false);
        fq.push_blocking(TestFrame(7));
        fq.next();
        assert_eq!(fq.nb_remaining(), 0);
        let mut v = fq.view();
        assert!(v.peek_last().is_none());
    }

    #[test]
    fn ring_wraps_around() {
        let (_p, fq) = queue(3, false);
        for i in 0..3 {
            fq.push_blocking(TestFrame(i));
        }
        fq.next();
        fq.next();
        fq.push_blocking(TestFrame(3));
        fq.push_blocking(TestFrame(4));
        let mut got = Vec::new();
        while fq.nb_remaining() > 0 {
            got.push(fq.peek_readable(|f| f.0).unwrap());
            fq.next();
        }
        assert_eq!(got, vec![2, 3, 4]);
    }

    #[test]
    fn producer_blocks_until_space_or_abort() {
        let (p, fq) = queue(2, false);
        let fq = Arc::new(fq);
        fq.push_blocking(TestFrame(0));
        fq.push_blocking(TestFrame(1));
        let fq2 = fq.clone();
        let handle = thread::spawn(move || fq2.push_blocking(TestFrame(2)));
        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());
        p.abort();
        fq.signal();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn peek_readable_returns_none_on_abort() {
        let (p, fq) = queue(2, false);
        p.abort();
        assert!(fq.peek_readable(|f| f.0).is_none());
    }
}
