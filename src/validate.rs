// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Format and size checks run before a task descriptor is built.

use std::fmt;
use std::fmt::Display;

use remain::sorted;
use thiserror::Error as ThisError;

use crate::descriptor::PixelFormat;

/// Where a picture is used, since each hardware block accepts a different set of formats.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    DecodeOutput,
    EncodeInput,
    TransformInput,
    TransformOutput,
    JpegDecodeOutput,
    JpegEncodeInput,
    /// The compressed output of a JPEG encode, sized from the input picture.
    JpegEncodeOutput,
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Stage::*;

        let string = match self {
            DecodeOutput => "decode output",
            EncodeInput => "encode input",
            TransformInput => "transform input",
            TransformOutput => "transform output",
            JpegDecodeOutput => "jpeg decode output",
            JpegEncodeInput => "jpeg encode input",
            JpegEncodeOutput => "jpeg encode output",
        };

        write!(f, "{}", string)
    }
}

#[sorted]
#[derive(ThisError, Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{size} byte buffer is too small, {needed} bytes are needed")]
    BufferTooSmall { size: u32, needed: u32 },
    #[error("encode input is {size} bytes, expected at least {min} and less than {max}")]
    InputSizeOutOfRange { size: u32, min: u32, max: u32 },
    #[error("{width}x{height} is not a valid picture size")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("pixel format {format:?} is not supported as {stage}")]
    UnsupportedFormat { stage: Stage, format: PixelFormat },
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Format and size rules of a hardware generation.
pub trait FormatValidator: Send + Sync {
    /// Accepts or rejects `format` for `stage`.
    fn check_format(&self, stage: Stage, format: PixelFormat) -> Result<()>;

    /// Predicts the size of the buffer `stage` produces or consumes for a `width`x`height`
    /// picture in `format`.
    fn predict_size(&self, stage: Stage, format: PixelFormat, width: u32, height: u32)
        -> Result<u32>;

    /// Checks an encoder input: the buffer must hold at least one full picture and less than two.
    fn check_encode_input(
        &self,
        format: PixelFormat,
        width: u32,
        height: u32,
        size: u32,
    ) -> Result<()> {
        self.check_format(Stage::EncodeInput, format)?;
        let min = self.predict_size(Stage::EncodeInput, format, width, height)?;
        let max = min.saturating_mul(2);
        if size < min || size >= max {
            return Err(ValidationError::InputSizeOutOfRange { size, min, max });
        }
        Ok(())
    }
}

/// Extra room a JPEG encoder needs on top of the raw picture for headers.
const JPEG_HEADER_RESERVE: u32 = 4096;

fn align16(value: u32) -> u32 {
    value.saturating_add(15) & !15
}

/// Rules of the current hardware generation.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultValidator;

impl FormatValidator for DefaultValidator {
    fn check_format(&self, stage: Stage, format: PixelFormat) -> Result<()> {
        use PixelFormat::*;

        let supported = match stage {
            Stage::DecodeOutput | Stage::EncodeInput => matches!(format, Nv12 | Nv21),
            Stage::TransformInput | Stage::TransformOutput => matches!(
                format,
                Yuv400 | Nv12 | Nv21 | Yuv422Sp | Yvu422Sp | Yuyv422Packed | Rgb888 | Bgr888
            ),
            Stage::JpegDecodeOutput => matches!(format, Yuv400 | Nv12 | Nv21 | Yuv422Sp),
            Stage::JpegEncodeInput | Stage::JpegEncodeOutput => {
                matches!(format, Nv12 | Nv21 | Yuyv422Packed | Uyvy422Packed)
            }
        };
        if supported {
            Ok(())
        } else {
            Err(ValidationError::UnsupportedFormat { stage, format })
        }
    }

    fn predict_size(
        &self,
        stage: Stage,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<u32> {
        use PixelFormat::*;

        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(ValidationError::InvalidDimensions { width, height });
        }
        let pixels = u64::from(width) * u64::from(height);
        let bytes = match format {
            Yuv400 => pixels,
            Nv12 | Nv21 => pixels * 3 / 2,
            Yuv422Sp | Yvu422Sp | Yuyv422Packed | Uyvy422Packed => pixels * 2,
            Rgb888 | Bgr888 => pixels * 3,
            Argb8888 | Rgba8888 => pixels * 4,
        };
        let bytes = if stage == Stage::JpegEncodeOutput {
            u64::from(align16(width)) * u64::from(align16(height)) * 3 / 2
                + u64::from(JPEG_HEADER_RESERVE)
        } else {
            bytes
        };
        u32::try_from(bytes).map_err(|_| ValidationError::InvalidDimensions { width, height })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_input_size_window() {
        let v = DefaultValidator;
        let min = 64 * 48 * 3 / 2;
        assert!(v.check_encode_input(PixelFormat::Nv12, 64, 48, min).is_ok());
        assert!(v
            .check_encode_input(PixelFormat::Nv12, 64, 48, 2 * min - 1)
            .is_ok());
        assert_eq!(
            v.check_encode_input(PixelFormat::Nv12, 64, 48, 2 * min),
            Err(ValidationError::InputSizeOutOfRange {
                size: 2 * min,
                min,
                max: 2 * min
            })
        );
        assert!(v
            .check_encode_input(PixelFormat::Nv12, 64, 48, min - 1)
            .is_err());
        assert!(matches!(
            v.check_encode_input(PixelFormat::Rgb888, 64, 48, min),
            Err(ValidationError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn rejects_odd_dimensions() {
        assert_eq!(
            DefaultValidator.predict_size(Stage::TransformOutput, PixelFormat::Nv12, 63, 48),
            Err(ValidationError::InvalidDimensions {
                width: 63,
                height: 48
            })
        );
    }

    #[test]
    fn jpeg_encode_bound_rounds_up() {
        let size = DefaultValidator
            .predict_size(Stage::JpegEncodeOutput, PixelFormat::Nv12, 34, 18)
            .unwrap();
        assert_eq!(size, 48 * 32 * 3 / 2 + 4096);
    }

    #[test]
    fn decode_output_is_yuv420_only() {
        assert!(DefaultValidator
            .check_format(Stage::DecodeOutput, PixelFormat::Nv21)
            .is_ok());
        assert!(DefaultValidator
            .check_format(Stage::DecodeOutput, PixelFormat::Rgb888)
            .is_err());
    }
}
