use ffmpeg_next as ffmpeg;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// 包队列中的元素
///
/// 冲刷哨兵不再用全局包的指针身份表示，直接建模成枚举变体。
pub enum QueuedPacket {
    /// 解封装得到的压缩数据包
    Data(ffmpeg::Packet),
    /// 冲刷哨兵：入队时 serial + 1，命令下游解码器重置内部状态
    Flush,
    /// 空包：EOF 时入队，通知解码器排空缓冲帧
    Null { stream_index: usize },
}

/// get() 的三种结果
pub enum PacketPull {
    /// 队列已停用
    Aborted,
    /// 非阻塞调用且队列为空
    Empty,
    /// 数据包及其入队时的 serial
    Item { pkt: QueuedPacket, serial: i32 },
}

struct Entry {
    pkt: QueuedPacket,
    serial: i32,
}

struct Inner {
    list: VecDeque<Entry>,
    nb_packets: usize,
    size: usize,   // 所有元素的数据大小总和（字节）
    duration: i64, // 所有元素的播放持续时间（流时间基 ticks）
}

/// 数据包队列
///
/// serial 单调递增，只在冲刷哨兵入队时 +1；每个包携带入队时刻的 serial，
/// 消费端据此识别 seek 前的过期数据。abort 置位后所有阻塞等待立即返回。
pub struct PacketQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    abort: AtomicBool,
    serial: Arc<AtomicI32>,
}

impl PacketQueue {
    /// 新建队列，初始为停用状态，start() 后才可用
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                list: VecDeque::new(),
                nb_packets: 0,
                size: 0,
                duration: 0,
            }),
            cond: Condvar::new(),
            abort: AtomicBool::new(true),
            serial: Arc::new(AtomicI32::new(0)),
        }
    }

    /// 启用队列，并放入一个冲刷哨兵触发解码器的初始重置
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        self.abort.store(false, Ordering::Release);
        self.put_locked(&mut inner, QueuedPacket::Flush);
    }

    /// 入队数据包；队列停用时丢弃并返回 false
    pub fn put(&self, pkt: ffmpeg::Packet) -> bool {
        let mut inner = self.inner.lock();
        if self.abort.load(Ordering::Acquire) {
            return false;
        }
        self.put_locked(&mut inner, QueuedPacket::Data(pkt));
        true
    }

    /// 入队空包（EOF 信号）
    pub fn put_null(&self, stream_index: usize) -> bool {
        let mut inner = self.inner.lock();
        if self.abort.load(Ordering::Acquire) {
            return false;
        }
        self.put_locked(&mut inner, QueuedPacket::Null { stream_index });
        true
    }

    /// 入队冲刷哨兵并递增 serial
    pub fn put_flush(&self) {
        let mut inner = self.inner.lock();
        self.put_locked(&mut inner, QueuedPacket::Flush);
    }

    fn put_locked(&self, inner: &mut Inner, pkt: QueuedPacket) {
        let (bytes, dur, serial) = match &pkt {
            QueuedPacket::Data(p) => (p.size(), p.duration(), self.serial.load(Ordering::Acquire)),
            QueuedPacket::Flush => {
                // 新播放序列从哨兵开始
                let s = self.serial.fetch_add(1, Ordering::AcqRel) + 1;
                (0, 0, s)
            }
            QueuedPacket::Null { .. } => (0, 0, self.serial.load(Ordering::Acquire)),
        };
        inner.list.push_back(Entry { pkt, serial });
        inner.nb_packets += 1;
        inner.size += bytes + mem::size_of::<Entry>();
        inner.duration += dur;
        self.cond.notify_one();
    }

    /// 出队；block 为真时等待到有包或 abort
    pub fn get(&self, block: bool) -> PacketPull {
        let mut inner = self.inner.lock();
        loop {
            if self.abort.load(Ordering::Acquire) {
                return PacketPull::Aborted;
            }
            if let Some(entry) = inner.list.pop_front() {
                inner.nb_packets -= 1;
                let bytes = match &entry.pkt {
                    QueuedPacket::Data(p) => p.size(),
                    _ => 0,
                };
                inner.size -= bytes + mem::size_of::<Entry>();
                if let QueuedPacket::Data(p) = &entry.pkt {
                    inner.duration -= p.duration();
                }
                return PacketPull::Item {
                    pkt: entry.pkt,
                    serial: entry.serial,
                };
            }
            if !block {
                return PacketPull::Empty;
            }
            self.cond.wait(&mut inner);
        }
    }

    /// 清空所有排队的包（seek 时由读线程调用）
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.list.clear();
        inner.nb_packets = 0;
        inner.size = 0;
        inner.duration = 0;
    }

    /// 停用队列并唤醒所有等待者
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
        let _inner = self.inner.lock();
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn serial(&self) -> i32 {
        self.serial.load(Ordering::Acquire)
    }

    /// serial 的共享句柄，时钟用它做失效检测
    pub fn serial_handle(&self) -> Arc<AtomicI32> {
        self.serial.clone()
    }

    pub fn nb_packets(&self) -> usize {
        self.inner.lock().nb_packets
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// 排队数据的总时长（流时间基 ticks）
    pub fn duration(&self) -> i64 {
        self.inner.lock().duration
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn data_packet(size: usize) -> ffmpeg::Packet {
        ffmpeg::Packet::new(size)
    }

    #[test]
    fn start_enqueues_flush_and_bumps_serial() {
        let q = PacketQueue::new();
        assert!(q.is_aborted());
        q.start();
        assert_eq!(q.serial(), 1);
        match q.get(false) {
            PacketPull::Item { pkt: QueuedPacket::Flush, serial } => assert_eq!(serial, 1),
            _ => panic!("第一个包应是冲刷哨兵"),
        }
    }

    #[test]
    fn packets_before_flush_carry_lower_serial() {
        let q = PacketQueue::new();
        q.start();
        q.put(data_packet(16));
        q.put_flush();
        q.put(data_packet(16));

        let mut serials = Vec::new();
        loop {
            match q.get(false) {
                PacketPull::Item { serial, .. } => serials.push(serial),
                _ => break,
            }
        }
        // start 的哨兵、旧包、新哨兵、新包
        assert_eq!(serials, vec![1, 1, 2, 2]);
        assert_eq!(q.serial(), 2);
    }

    #[test]
    fn size_and_duration_accounting() {
        let q = PacketQueue::new();
        q.start();
        let _ = q.get(false); // 取走哨兵
        let mut p = data_packet(100);
        p.set_duration(40);
        q.put(p);
        assert_eq!(q.nb_packets(), 1);
        assert!(q.size() >= 100);
        assert_eq!(q.duration(), 40);
        let _ = q.get(false);
        assert_eq!(q.nb_packets(), 0);
        assert_eq!(q.duration(), 0);
    }

    #[test]
    fn abort_wakes_blocked_consumer() {
        let q = Arc::new(PacketQueue::new());
        q.start();
        let _ = q.get(false); // 清掉哨兵
        let q2 = q.clone();
        let handle = thread::spawn(move || matches!(q2.get(true), PacketPull::Aborted));
        thread::sleep(Duration::from_millis(30));
        q.abort();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn put_after_abort_is_rejected() {
        let q = PacketQueue::new();
        q.start();
        q.abort();
        assert!(!q.put(data_packet(8)));
        assert!(!q.put_null(0));
    }

    #[test]
    fn nonblocking_get_on_empty_returns_empty() {
        let q = PacketQueue::new();
        q.start();
        let _ = q.get(false);
        assert!(matches!(q.get(false), PacketPull::Empty));
    }
}
