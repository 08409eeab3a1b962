//! Decoded-frame holders handed from the media pipeline to the renderer.

use std::sync::Arc;

use super::StreamStats;

/// Where a decoded frame's pixels live.
#[derive(Debug)]
pub enum FramePixels {
    /// Hardware decode path. The texture name is a borrow owned by the
    /// decoder; it stays valid until the next frame overwrites it.
    Texture { id: u32, target: u32 },
    /// Software decode path: exclusively owned RGB bytes, `width * height * 3`.
    Cpu(Vec<u8>),
}

/// One eye's latest decoded frame plus its statistics.
#[derive(Debug)]
pub struct VideoFrame {
    pub stats: Arc<StreamStats>,
    pub width: u32,
    pub height: u32,
    pub pixels: FramePixels,
}

impl VideoFrame {
    /// Allocate a zero-filled CPU frame for the given resolution with fresh
    /// statistics. Called at pipeline (re)configuration time.
    pub fn allocate(width: u32, height: u32) -> Self {
        Self {
            stats: Arc::new(StreamStats::new()),
            width,
            height,
            pixels: FramePixels::Cpu(vec![0u8; (width * height * 3) as usize]),
        }
    }

    pub fn buffer_size(&self) -> usize {
        (self.width * self.height * 3) as usize
    }

    /// Copy decoded RGB bytes into the owned buffer. Short input is skipped
    /// rather than leaving a partially stale frame.
    pub fn store_cpu(&mut self, data: &[u8]) {
        let size = self.buffer_size();
        if data.len() < size {
            return;
        }
        match &mut self.pixels {
            FramePixels::Cpu(buf) => buf.copy_from_slice(&data[..size]),
            pixels @ FramePixels::Texture { .. } => {
                *pixels = FramePixels::Cpu(data[..size].to_vec());
            }
        }
    }

    /// Record a hardware-decoded texture handle.
    pub fn store_texture(&mut self, id: u32, target: u32) {
        self.pixels = FramePixels::Texture { id, target };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_zero_fills_cpu_buffer() {
        let frame = VideoFrame::allocate(4, 2);
        match &frame.pixels {
            FramePixels::Cpu(buf) => {
                assert_eq!(buf.len(), 4 * 2 * 3);
                assert!(buf.iter().all(|&b| b == 0));
            }
            _ => panic!("expected cpu pixels"),
        }
    }

    #[test]
    fn store_cpu_ignores_short_input() {
        let mut frame = VideoFrame::allocate(4, 2);
        frame.store_cpu(&[1u8; 5]);
        match &frame.pixels {
            FramePixels::Cpu(buf) => assert!(buf.iter().all(|&b| b == 0)),
            _ => panic!("expected cpu pixels"),
        }
    }

    #[test]
    fn texture_replaces_cpu_path() {
        let mut frame = VideoFrame::allocate(4, 2);
        frame.store_texture(42, 0x0DE1);
        assert!(matches!(frame.pixels, FramePixels::Texture { id: 42, .. }));
    }
}
