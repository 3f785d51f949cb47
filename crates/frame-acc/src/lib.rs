#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Reassembles frames whose length is implied by their leading tag byte.
//!
//! There is no delimiter and no length prefix on the wire: the first byte of
//! every frame names its kind, and the kind fixes the total frame size. The
//! accumulator therefore only needs a "tag -> size" lookup to carve a byte
//! stream into frames, however the stream happens to be split across reads.

use core::ops::DerefMut;

/// Maps a tag byte to the total size of the frame it starts, tag included.
pub type FrameSizer = fn(u8) -> Option<usize>;

/// Reassembly state for one byte stream.
pub struct FrameAccumulator<B: DerefMut<Target = [u8]>> {
    buf: B,
    idx: usize,
    expected: Option<usize>,
    sizer: FrameSizer,
}

/// What one call to `feed` produced.
#[derive(Debug)]
pub enum FeedResult<'input, 'buf> {
    /// Every byte was taken, no frame is complete yet.
    Consumed,

    /// The tag at the start of a frame is not known to the sizer. The
    /// accumulator has been reset; the stream is out of sync.
    UnknownTag {
        tag: u8,
        remaining: &'input [u8],
    },

    /// The tag is known but its frame would not fit in the storage buffer.
    /// The accumulator has been reset.
    OverFull {
        tag: u8,
        remaining: &'input [u8],
    },

    /// A frame was completed. The data is currently stored in our storage
    /// buffer.
    Success {
        /// The whole frame, tag included.
        data: &'buf [u8],

        /// Remaining data left in the input after this frame.
        remaining: &'input [u8],
    },

    /// A frame was completed without touching the storage buffer, because
    /// the input held all of it.
    SuccessInput {
        /// The whole frame, tag included.
        data: &'input [u8],

        /// Remaining data left in the input after this frame.
        remaining: &'input [u8],
    },
}

#[cfg(any(feature = "std", test))]
impl FrameAccumulator<Box<[u8]>> {
    pub fn new_boxslice(len: usize, sizer: FrameSizer) -> Self {
        Self::new(vec![0u8; len].into_boxed_slice(), sizer)
    }
}

impl<B: DerefMut<Target = [u8]>> FrameAccumulator<B> {
    /// An empty accumulator.
    pub fn new(buf: B, sizer: FrameSizer) -> Self {
        FrameAccumulator {
            buf,
            idx: 0,
            expected: None,
            sizer,
        }
    }

    /// Forget any partially collected frame.
    pub fn reset(&mut self) {
        self.idx = 0;
        self.expected = None;
    }

    /// Is a frame partially collected?
    pub fn in_frame(&self) -> bool {
        self.expected.is_some()
    }

    /// How many bytes of the current frame are buffered.
    pub fn collected(&self) -> usize {
        self.idx
    }

    /// Appends data to the current frame, returning at most one frame.
    ///
    /// Callers loop, feeding `remaining` back in, until `Consumed`.
    pub fn feed<'me, 'input>(&'me mut self, input: &'input [u8]) -> FeedResult<'input, 'me> {
        // No input? No work!
        let Some(&first) = input.first() else {
            return FeedResult::Consumed;
        };

        let size = match self.expected {
            Some(size) => size,
            None => {
                // Start of a frame, the first byte decides its length.
                let Some(size) = (self.sizer)(first) else {
                    self.reset();
                    return FeedResult::UnknownTag {
                        tag: first,
                        remaining: &input[1..],
                    };
                };

                // If the whole frame is already here, hand it out without a
                // copy.
                if input.len() >= size {
                    let (take, release) = input.split_at(size);
                    return FeedResult::SuccessInput {
                        data: take,
                        remaining: release,
                    };
                }

                if size > self.buf.len() {
                    self.reset();
                    return FeedResult::OverFull {
                        tag: first,
                        remaining: &input[1..],
                    };
                }
                self.expected = Some(size);
                size
            }
        };

        // Only read up to the frame boundary.
        let want = size - self.idx;
        let (take, release) = input.split_at(want.min(input.len()));
        self.buf[self.idx..self.idx + take.len()].copy_from_slice(take);
        self.idx += take.len();

        if self.idx < size {
            return FeedResult::Consumed;
        }

        self.idx = 0;
        self.expected = None;
        FeedResult::Success {
            data: &self.buf[..size],
            remaining: release,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{FeedResult, FrameAccumulator};

    fn sizer(tag: u8) -> Option<usize> {
        match tag {
            0 => Some(8),
            1 => Some(3),
            2 => Some(1),
            9 => Some(64),
            _ => None,
        }
    }

    fn frames() -> Vec<Vec<u8>> {
        vec![
            vec![0, 1, 2, 3, 4, 5, 6, 7],
            vec![1, 0xAA, 0xBB],
            vec![2],
            vec![0, 9, 9, 9, 9, 9, 9, 9],
        ]
    }

    fn collect(acc: &mut FrameAccumulator<Box<[u8]>>, stream: &[u8], chsz: usize) -> Vec<Vec<u8>> {
        let mut out = vec![];
        for mut ch in stream.chunks(chsz) {
            'feed: loop {
                match acc.feed(ch) {
                    FeedResult::Consumed => break 'feed,
                    FeedResult::Success { data, remaining } => {
                        out.push(data.to_vec());
                        ch = remaining;
                    }
                    FeedResult::SuccessInput { data, remaining } => {
                        out.push(data.to_vec());
                        ch = remaining;
                    }
                    e => panic!("{e:?}"),
                }
            }
        }
        out
    }

    #[test]
    fn smoke() {
        let mut acc = FrameAccumulator::new_boxslice(16, sizer);
        let expected = frames();
        let stream: Vec<u8> = expected.concat();

        // No matter the stride of the input, we get the expected frames out
        for chsz in 1..=stream.len() {
            let got = collect(&mut acc, &stream, chsz);
            assert_eq!(got, expected, "stride {chsz}");
            assert!(!acc.in_frame());
        }
    }

    #[test]
    fn partial_frame_is_held() {
        let mut acc = FrameAccumulator::new_boxslice(16, sizer);
        assert!(matches!(acc.feed(&[0, 1, 2]), FeedResult::Consumed));
        assert!(acc.in_frame());
        assert_eq!(acc.collected(), 3);

        acc.reset();
        assert!(!acc.in_frame());
        let got = collect(&mut acc, &[1, 5, 6], 1);
        assert_eq!(got, vec![vec![1, 5, 6]]);
    }

    #[test]
    fn unknown_tag() {
        let mut acc = FrameAccumulator::new_boxslice(16, sizer);
        assert!(matches!(acc.feed(&[0, 1]), FeedResult::Consumed));
        // a finished frame followed by garbage
        match acc.feed(&[2, 3, 4, 5, 6, 7, 0x7F, 1]) {
            FeedResult::Success { data, remaining } => {
                assert_eq!(data, &[0, 1, 2, 3, 4, 5, 6, 7]);
                assert_eq!(remaining, &[0x7F, 1]);
            }
            e => panic!("{e:?}"),
        }
        match acc.feed(&[0x7F, 1]) {
            FeedResult::UnknownTag { tag, remaining } => {
                assert_eq!(tag, 0x7F);
                assert_eq!(remaining, &[1]);
            }
            e => panic!("{e:?}"),
        }
        assert!(!acc.in_frame());
    }

    #[test]
    fn overflow() {
        let mut acc = FrameAccumulator::new_boxslice(16, sizer);
        // Tag 9 is 64 bytes, it only fits when delivered in a single read
        let mut big = vec![9u8];
        big.extend_from_slice(&[0x55; 63]);
        match acc.feed(&big) {
            FeedResult::SuccessInput { data, remaining } => {
                assert_eq!(data.len(), 64);
                assert!(remaining.is_empty());
            }
            e => panic!("{e:?}"),
        }
        match acc.feed(&big[..10]) {
            FeedResult::OverFull { tag, remaining } => {
                assert_eq!(tag, 9);
                assert_eq!(remaining.len(), 9);
            }
            e => panic!("{e:?}"),
        }
        assert!(!acc.in_frame());
    }
}
