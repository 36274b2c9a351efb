//! Cord：接收数据的分段字节绳。
//!
//! 接收路径上的每个 buffer ring 页面以 [`bytes::Bytes`] 片段的形式挂入
//! Cord，页面的归还由片段的所有者守卫在析构时完成；除非调用方显式
//! `to_bytes` 合并，数据不发生拷贝。

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// 分段字节绳。
#[derive(Default)]
pub struct Cord {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl Cord {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个片段；空片段被忽略。
    pub fn append(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push_back(segment);
    }

    /// 把另一条 Cord 的全部片段接到尾部。
    pub fn append_cord(&mut self, mut other: Cord) {
        self.len += other.len;
        self.segments.append(&mut other.segments);
        other.len = 0;
    }

    /// 总字节数。
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 片段视图，按到达次序。
    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }

    /// 取走开头的片段。
    pub fn pop_front(&mut self) -> Option<Bytes> {
        let segment = self.segments.pop_front()?;
        self.len -= segment.len();
        Some(segment)
    }

    /// 合并为一段连续字节；单片段时仅克隆引用，多片段时做一次拷贝。
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments[0].clone(),
            _ => {
                let mut merged = BytesMut::with_capacity(self.len);
                for segment in &self.segments {
                    merged.extend_from_slice(segment);
                }
                merged.freeze()
            }
        }
    }

    /// 清空并释放全部片段（页面随所有者守卫归还）。
    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }
}

impl From<Bytes> for Cord {
    fn from(segment: Bytes) -> Self {
        let mut cord = Cord::new();
        cord.append(segment);
        cord
    }
}

impl core::fmt::Debug for Cord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cord")
            .field("segments", &self.segments.len())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_coalesce() {
        let mut cord = Cord::new();
        cord.append(Bytes::from_static(b"hello "));
        cord.append(Bytes::new());
        cord.append(Bytes::from_static(b"ember"));
        assert_eq!(11, cord.len());
        assert_eq!(2, cord.segments().count(), "空片段不应入链");
        assert_eq!(Bytes::from_static(b"hello ember"), cord.to_bytes());
    }

    #[test]
    fn append_cord_moves_segments() {
        let mut left = Cord::from(Bytes::from_static(b"ab"));
        let right = Cord::from(Bytes::from_static(b"cd"));
        left.append_cord(right);
        assert_eq!(4, left.len());
        assert_eq!(Bytes::from_static(b"abcd"), left.to_bytes());
    }

    #[test]
    fn clear_resets() {
        let mut cord = Cord::from(Bytes::from_static(b"xyz"));
        cord.clear();
        assert!(cord.is_empty());
        assert_eq!(Bytes::new(), cord.to_bytes());
    }
}
