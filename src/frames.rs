use std::sync::Arc;

use log::warn;

use crate::error::ViewerError;

/// Linear mapping from stored sample values to physical intensity units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rescale {
    pub slope: f32,
    pub intercept: f32,
}

impl Default for Rescale {
    fn default() -> Self {
        Self {
            slope: 1.0,
            intercept: 0.0,
        }
    }
}

impl Rescale {
    pub fn new(slope: f32, intercept: f32) -> Self {
        // A zero slope would collapse every frame onto one value.
        let slope = if slope == 0.0 || !slope.is_finite() {
            1.0
        } else {
            slope
        };
        let intercept = if intercept.is_finite() { intercept } else { 0.0 };
        Self { slope, intercept }
    }

    pub fn apply(&self, stored: i32) -> f32 {
        (stored as f32).mul_add(self.slope, self.intercept)
    }

    pub fn is_identity(&self) -> bool {
        self.slope == 1.0 && self.intercept == 0.0
    }
}

/// Stored samples for every frame of one multi-frame image, frame after frame,
/// row-major within a frame.
#[derive(Debug, Clone)]
pub struct MultiFrameBuffer {
    pub width: usize,
    pub height: usize,
    pub bits_allocated: u16,
    pub signed: bool,
    samples: Arc<[i32]>,
    declared_frame_count: Option<usize>,
    rescale: Rescale,
}

impl MultiFrameBuffer {
    pub fn from_samples(
        width: usize,
        height: usize,
        bits_allocated: u16,
        signed: bool,
        samples: Vec<i32>,
    ) -> Self {
        Self {
            width,
            height,
            bits_allocated,
            signed,
            samples: Arc::from(samples.into_boxed_slice()),
            declared_frame_count: None,
            rescale: Rescale::default(),
        }
    }

    /// Unpacks little-endian stored values. `bits_stored` below the allocation is
    /// masked, and sign-extended when `signed` is set.
    pub fn from_le_bytes(
        bytes: &[u8],
        width: usize,
        height: usize,
        bits_allocated: u16,
        bits_stored: u16,
        signed: bool,
    ) -> Result<Self, ViewerError> {
        let bytes_per_sample = match bits_allocated {
            8 => 1,
            16 => 2,
            32 => 4,
            other => {
                return Err(ViewerError::CorruptBuffer {
                    width,
                    height,
                    total_samples: 0,
                    reason: format!("unsupported BitsAllocated={other}"),
                })
            }
        };
        if bytes.len() % bytes_per_sample != 0 {
            return Err(ViewerError::CorruptBuffer {
                width,
                height,
                total_samples: bytes.len() / bytes_per_sample,
                reason: format!(
                    "{} bytes is not a whole number of {}-bit samples",
                    bytes.len(),
                    bits_allocated
                ),
            });
        }

        let bits_stored = bits_stored.clamp(1, bits_allocated) as u32;
        let samples = bytes
            .chunks_exact(bytes_per_sample)
            .map(|chunk| {
                let raw = match chunk {
                    [b0] => u32::from(*b0),
                    [b0, b1] => u32::from(u16::from_le_bytes([*b0, *b1])),
                    [b0, b1, b2, b3] => u32::from_le_bytes([*b0, *b1, *b2, *b3]),
                    _ => 0,
                };
                unpack_stored(raw, bits_stored, signed)
            })
            .collect::<Vec<_>>();

        Ok(Self::from_samples(
            width,
            height,
            bits_allocated,
            signed,
            samples,
        ))
    }

    pub fn with_declared_frame_count(mut self, declared: Option<usize>) -> Self {
        self.declared_frame_count = declared;
        self
    }

    pub fn with_rescale(mut self, rescale: Rescale) -> Self {
        self.rescale = rescale;
        self
    }

    pub fn rescale(&self) -> Rescale {
        self.rescale
    }

    pub fn declared_frame_count(&self) -> Option<usize> {
        self.declared_frame_count
    }

    pub fn total_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[i32] {
        &self.samples
    }

    pub fn frame_len(&self) -> usize {
        self.width.saturating_mul(self.height)
    }

    /// Frame count implied by the samples actually present.
    pub fn frame_count(&self) -> Result<usize, ViewerError> {
        let frame_len = self.frame_len();
        if frame_len == 0 {
            return Err(self.corrupt("frame has zero width or height"));
        }
        if self.samples.is_empty() {
            return Err(self.corrupt("buffer holds no samples"));
        }
        if self.samples.len() % frame_len != 0 {
            return Err(self.corrupt(&format!(
                "sample count is not a multiple of the frame size {frame_len}"
            )));
        }

        let computed = self.samples.len() / frame_len;
        if let Some(declared) = self.declared_frame_count {
            if declared != computed {
                warn!(
                    "Declared frame count {declared} disagrees with {computed} frames present in a {}x{} buffer; using {computed}",
                    self.width, self.height
                );
            }
        }
        Ok(computed)
    }

    fn corrupt(&self, reason: &str) -> ViewerError {
        ViewerError::CorruptBuffer {
            width: self.width,
            height: self.height,
            total_samples: self.samples.len(),
            reason: reason.to_string(),
        }
    }
}

fn unpack_stored(raw: u32, bits_stored: u32, signed: bool) -> i32 {
    if bits_stored >= 32 {
        return if signed { raw as i32 } else { raw.min(i32::MAX as u32) as i32 };
    }
    let mask = (1u32 << bits_stored) - 1;
    let value = raw & mask;
    if signed && value & (1 << (bits_stored - 1)) != 0 {
        (value | !mask) as i32
    } else {
        value as i32
    }
}

/// One 2D slice of a [`MultiFrameBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: usize,
    pub width: usize,
    pub height: usize,
    samples: Arc<[i32]>,
    rescale: Rescale,
}

impl Frame {
    pub fn new(index: usize, width: usize, height: usize, samples: Vec<i32>) -> Self {
        Self {
            index,
            width,
            height,
            samples: Arc::from(samples.into_boxed_slice()),
            rescale: Rescale::default(),
        }
    }

    pub fn with_rescale(mut self, rescale: Rescale) -> Self {
        self.rescale = rescale;
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[i32] {
        &self.samples
    }

    pub fn rescale(&self) -> Rescale {
        self.rescale
    }

    /// Physical intensity of sample `i`.
    pub fn value_at(&self, i: usize) -> f32 {
        self.rescale.apply(self.samples[i])
    }

    pub fn values(&self) -> impl Iterator<Item = f32> + '_ {
        self.samples.iter().map(|&stored| self.rescale.apply(stored))
    }
}

pub fn decode_frame(buffer: &MultiFrameBuffer, index: usize) -> Result<Frame, ViewerError> {
    let frame_count = buffer.frame_count()?;
    if index >= frame_count {
        return Err(ViewerError::IndexOutOfRange { index, frame_count });
    }

    let frame_len = buffer.frame_len();
    let start = index * frame_len;
    let samples = buffer.samples[start..start + frame_len].to_vec();
    Ok(Frame::new(index, buffer.width, buffer.height, samples).with_rescale(buffer.rescale))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_buffer(width: usize, height: usize, frames: usize) -> MultiFrameBuffer {
        let samples = (0..width * height * frames)
            .map(|i| (i % 4096) as i32)
            .collect::<Vec<_>>();
        MultiFrameBuffer::from_samples(width, height, 16, false, samples)
    }

    #[test]
    fn every_frame_has_exact_sample_count() {
        let buffer = ramp_buffer(8, 6, 5);
        let frame_count = buffer.frame_count().expect("geometry is consistent");
        assert_eq!(frame_count, 5);
        for index in 0..frame_count {
            let frame = decode_frame(&buffer, index).expect("index in range");
            assert_eq!(frame.len(), 8 * 6);
            assert_eq!(frame.index, index);
        }
    }

    #[test]
    fn index_past_last_frame_is_out_of_range() {
        let buffer = ramp_buffer(4, 4, 3);
        let err = decode_frame(&buffer, 3).expect_err("index 3 should be rejected");
        assert_eq!(
            err,
            ViewerError::IndexOutOfRange {
                index: 3,
                frame_count: 3
            }
        );
    }

    #[test]
    fn frames_are_not_identical() {
        let buffer = ramp_buffer(16, 16, 96);
        let first = decode_frame(&buffer, 0).expect("frame 0");
        let middle = decode_frame(&buffer, 50).expect("frame 50");
        assert_ne!(first.samples(), middle.samples());
    }

    #[test]
    fn partial_frame_is_corrupt() {
        let buffer = MultiFrameBuffer::from_samples(4, 4, 16, false, vec![0; 17]);
        match decode_frame(&buffer, 0) {
            Err(ViewerError::CorruptBuffer { total_samples, .. }) => {
                assert_eq!(total_samples, 17)
            }
            other => panic!("expected CorruptBuffer, got {other:?}"),
        }
    }

    #[test]
    fn zero_geometry_is_corrupt() {
        let buffer = MultiFrameBuffer::from_samples(0, 4, 8, false, vec![1, 2, 3]);
        assert!(matches!(
            buffer.frame_count(),
            Err(ViewerError::CorruptBuffer { .. })
        ));
        let empty = MultiFrameBuffer::from_samples(2, 2, 8, false, Vec::new());
        assert!(matches!(
            empty.frame_count(),
            Err(ViewerError::CorruptBuffer { .. })
        ));
    }

    #[test]
    fn computed_frame_count_wins_over_declared() {
        let buffer = ramp_buffer(4, 4, 6).with_declared_frame_count(Some(10));
        assert_eq!(buffer.frame_count().expect("consistent samples"), 6);
        assert!(decode_frame(&buffer, 5).is_ok());
        assert!(decode_frame(&buffer, 6).is_err());
    }

    #[test]
    fn unpacks_signed_twelve_bit_samples() {
        // 0x0FFF in 12 stored bits is -1; 0x0800 is the most negative value.
        let bytes = [0xFF, 0x0F, 0x00, 0x08, 0x10, 0x00, 0x00, 0x00];
        let buffer =
            MultiFrameBuffer::from_le_bytes(&bytes, 2, 2, 16, 12, true).expect("16-bit data");
        assert_eq!(buffer.samples(), &[-1, -2048, 16, 0]);

        let unsigned =
            MultiFrameBuffer::from_le_bytes(&bytes, 2, 2, 16, 12, false).expect("16-bit data");
        assert_eq!(unsigned.samples(), &[4095, 2048, 16, 0]);
    }

    #[test]
    fn odd_byte_count_is_rejected_for_sixteen_bit_data() {
        let err = MultiFrameBuffer::from_le_bytes(&[1, 2, 3], 1, 1, 16, 16, false)
            .expect_err("three bytes cannot hold 16-bit samples");
        assert!(matches!(err, ViewerError::CorruptBuffer { .. }));
    }

    #[test]
    fn frame_values_apply_rescale() {
        let buffer = MultiFrameBuffer::from_samples(2, 1, 16, false, vec![0, 1000])
            .with_rescale(Rescale::new(1.0, -1024.0));
        let frame = decode_frame(&buffer, 0).expect("frame 0");
        assert_eq!(frame.values().collect::<Vec<_>>(), vec![-1024.0, -24.0]);
        assert_eq!(frame.samples(), &[0, 1000]);
    }

    #[test]
    fn zero_slope_falls_back_to_identity() {
        assert!(Rescale::new(0.0, 0.0).is_identity());
        assert_eq!(Rescale::new(2.0, 1.0).apply(3), 7.0);
    }
}
