//! JPEG frame extraction from a raw MJPEG byte stream
//!
//! The camera producer writes concatenated JPEG images with no length
//! prefix; frames are delimited only by the SOI/EOI marker pairs. The
//! extractor keeps at most one partial trailing fragment between calls,
//! so feeding the same bytes in arbitrary chunk splits yields the same
//! frame sequence.

use bytes::{Buf, Bytes, BytesMut};

/// JPEG start-of-image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Accumulates raw producer bytes and yields complete frames
#[derive(Debug, Default)]
pub struct FrameExtractor {
    buf: BytesMut,
}

impl FrameExtractor {
    /// Create new FrameExtractor
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Append a chunk and return every complete frame it completes.
    ///
    /// Each returned frame is a maximal SOI..=EOI byte run. Bytes before
    /// the first SOI are discarded; a trailing fragment (including a lone
    /// 0xFF that may be the first half of a split marker) is retained for
    /// the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            let Some(start) = find_marker(&self.buf, &SOI, 0) else {
                // No frame start anywhere in the buffer. Keep a trailing
                // 0xFF in case the SOI was split across this chunk boundary.
                if self.buf.last() == Some(&0xFF) {
                    let tail = self.buf.len() - 1;
                    self.buf.advance(tail);
                } else {
                    self.buf.clear();
                }
                break;
            };
            if start > 0 {
                self.buf.advance(start);
            }

            let Some(end) = find_marker(&self.buf, &EOI, SOI.len()) else {
                // Partial frame - wait for more bytes.
                break;
            };

            frames.push(self.buf.split_to(end + EOI.len()).freeze());
        }

        frames
    }

    /// Bytes currently held as a partial fragment
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Discard the retained partial fragment. Used when the byte stream
    /// restarts and does not continue the old one.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Find a two-byte marker at or after `from`
fn find_marker(buf: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    if buf.len() < from + 2 {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut f = SOI.to_vec();
        f.extend_from_slice(payload);
        f.extend_from_slice(&EOI);
        f
    }

    #[test]
    fn test_single_frame_one_chunk() {
        let mut ex = FrameExtractor::new();
        let frames = ex.push(&frame(b"A"));
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame(b"A")[..]);
        assert_eq!(ex.pending_len(), 0);
    }

    #[test]
    fn test_two_frames_all_split_points() {
        // [SOI, A, EOI, SOI, B, EOI] fed in every two-way split must yield
        // exactly frames A then B, same as one chunk.
        let mut stream = frame(b"A");
        stream.extend_from_slice(&frame(b"B"));

        for split in 0..=stream.len() {
            let mut ex = FrameExtractor::new();
            let mut frames = ex.push(&stream[..split]);
            frames.extend(ex.push(&stream[split..]));

            assert_eq!(frames.len(), 2, "split at {}", split);
            assert_eq!(&frames[0][..], &frame(b"A")[..], "split at {}", split);
            assert_eq!(&frames[1][..], &frame(b"B")[..], "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time_matches_single_chunk() {
        let mut stream = frame(&[0x01, 0xFF, 0x02]);
        stream.extend_from_slice(&frame(&[0xD9, 0xFF]));
        stream.extend_from_slice(&frame(b"xyz"));

        let mut whole = FrameExtractor::new();
        let expected = whole.push(&stream);

        let mut ex = FrameExtractor::new();
        let mut got = Vec::new();
        for b in &stream {
            got.extend(ex.push(std::slice::from_ref(b)));
        }

        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected.iter()) {
            assert_eq!(&g[..], &e[..]);
        }
    }

    #[test]
    fn test_garbage_before_soi_discarded() {
        let mut ex = FrameExtractor::new();
        let mut stream = b"not jpeg".to_vec();
        stream.extend_from_slice(&frame(b"A"));
        let frames = ex.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame(b"A")[..]);
    }

    #[test]
    fn test_split_soi_marker_across_chunks() {
        let mut ex = FrameExtractor::new();
        assert!(ex.push(&[0xFF]).is_empty());
        let mut rest = vec![0xD8, b'A'];
        rest.extend_from_slice(&EOI);
        let frames = ex.push(&rest);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame(b"A")[..]);
    }

    #[test]
    fn test_partial_frame_retained() {
        let mut ex = FrameExtractor::new();
        let f = frame(b"payload");
        assert!(ex.push(&f[..5]).is_empty());
        assert_eq!(ex.pending_len(), 5);
        let frames = ex.push(&f[5..]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_pure_garbage_does_not_accumulate() {
        let mut ex = FrameExtractor::new();
        assert!(ex.push(b"abcdefgh").is_empty());
        assert_eq!(ex.pending_len(), 0);
    }
}
