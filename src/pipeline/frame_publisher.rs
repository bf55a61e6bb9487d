// src/pipeline/frame_publisher.rs
//
// Holds exactly one encoded frame: the latest annotated one. The loop
// overwrites it every frame; streaming clients read it at their own pace.

use bytes::Bytes;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub jpeg: Bytes,
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Default)]
pub struct FramePublisher {
    latest: RwLock<Option<Arc<EncodedFrame>>>,
}

impl FramePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: EncodedFrame) {
        let frame = Arc::new(frame);
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    /// Most recent frame, if any has been published yet.
    pub fn latest(&self) -> Option<Arc<EncodedFrame>> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u64) -> EncodedFrame {
        EncodedFrame {
            jpeg: Bytes::from(vec![0xFF, 0xD8, id as u8]),
            frame_id: id,
            width: 4,
            height: 4,
        }
    }

    #[test]
    fn test_serves_latest_without_blocking() {
        let publisher = FramePublisher::new();
        assert!(publisher.latest().is_none());

        publisher.publish(frame(1));
        let held = publisher.latest().unwrap();
        publisher.publish(frame(2));

        // a reader holding an old frame does not block the writer
        assert_eq!(held.frame_id, 1);
        assert_eq!(publisher.latest().unwrap().frame_id, 2);
    }
}
