// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Channel configuration.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::descriptor::PixelFormat;
use crate::descriptor::StreamFormat;
use crate::error::Error;
use crate::error::Result;

/// Highest hardware decode channel slot.
pub const MAX_VDEC_HW_CHANNEL: u32 = 31;
/// Most reference frames a decode channel may keep.
pub const MAX_REF_FRAMES: u32 = 16;
/// Largest picture edge the codecs accept.
pub const MAX_PICTURE_EDGE: u32 = 4096;

fn is_video(codec: StreamFormat) -> bool {
    !matches!(codec, StreamFormat::Jpeg | StreamFormat::Png)
}

fn check_picture_size(what: &str, width: u32, height: u32) -> Result<()> {
    if width == 0
        || height == 0
        || width % 2 != 0
        || height % 2 != 0
        || width > MAX_PICTURE_EDGE
        || height > MAX_PICTURE_EDGE
    {
        return Err(Error::InvalidArgument(format!(
            "{} size {}x{} must be even and at most {}",
            what, width, height, MAX_PICTURE_EDGE
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VdecConfig {
    /// Hardware decode channel slot.
    pub hw_channel: u32,
    pub codec: StreamFormat,
    pub out_format: PixelFormat,
    /// Output size; zero keeps the stream's own size.
    pub out_width: u32,
    pub out_height: u32,
    /// Reference frames to keep; zero lets the device decide.
    pub ref_frames: u32,
    /// Whether the channel completes work through completion signals.
    pub with_signal: bool,
    /// Bound on the end-of-stream wait. `None` waits for as long as the device takes.
    pub eos_timeout_ms: Option<u64>,
}

impl Default for VdecConfig {
    fn default() -> Self {
        VdecConfig {
            hw_channel: 0,
            codec: StreamFormat::H264High,
            out_format: PixelFormat::Nv12,
            out_width: 0,
            out_height: 0,
            ref_frames: 0,
            with_signal: true,
            eos_timeout_ms: None,
        }
    }
}

impl VdecConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hw_channel > MAX_VDEC_HW_CHANNEL {
            return Err(Error::InvalidArgument(format!(
                "decode channel {} is above {}",
                self.hw_channel, MAX_VDEC_HW_CHANNEL
            )));
        }
        if !is_video(self.codec) {
            return Err(Error::InvalidArgument(format!(
                "{:?} is not a video codec",
                self.codec
            )));
        }
        if self.ref_frames > MAX_REF_FRAMES {
            return Err(Error::InvalidArgument(format!(
                "{} reference frames is above {}",
                self.ref_frames, MAX_REF_FRAMES
            )));
        }
        if self.out_width != 0 || self.out_height != 0 {
            check_picture_size("decode output", self.out_width, self.out_height)?;
        }
        Ok(())
    }

    pub fn eos_timeout(&self) -> Option<Duration> {
        self.eos_timeout_ms.map(Duration::from_millis)
    }
}

/// Rate control modes of the encoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum RateControl {
    Vbr = 1,
    Cbr = 2,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VencConfig {
    pub codec: StreamFormat,
    pub pic_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub rate_control: RateControl,
    /// Input frame rate.
    pub src_rate: u32,
    /// Bit rate ceiling in kbit/s.
    pub max_bit_rate: u32,
    /// Distance between I frames.
    pub ip_prop: u32,
}

impl Default for VencConfig {
    fn default() -> Self {
        VencConfig {
            codec: StreamFormat::H264Main,
            pic_format: PixelFormat::Nv12,
            width: 1280,
            height: 720,
            rate_control: RateControl::Cbr,
            src_rate: 30,
            max_bit_rate: 2000,
            ip_prop: 30,
        }
    }
}

impl VencConfig {
    pub fn validate(&self) -> Result<()> {
        if !is_video(self.codec) {
            return Err(Error::InvalidArgument(format!(
                "{:?} is not a video codec",
                self.codec
            )));
        }
        check_picture_size("encode input", self.width, self.height)?;
        if self.src_rate == 0 || self.max_bit_rate == 0 {
            return Err(Error::InvalidArgument(
                "frame rate and bit rate must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hardware blocks a transform channel can drive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Vpc,
    Jpegd,
    Jpege,
    Pngd,
}

impl Engine {
    /// Bit of this engine in the channel record's mode mask.
    pub fn bit(self) -> u32 {
        match self {
            Engine::Vpc => 1,
            Engine::Jpegd => 1 << 1,
            Engine::Jpege => 1 << 2,
            Engine::Pngd => 1 << 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformConfig {
    pub engines: Vec<Engine>,
    /// Whether the channel completes work through a completion signal.
    pub with_signal: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        TransformConfig {
            engines: vec![Engine::Vpc, Engine::Jpegd, Engine::Jpege],
            with_signal: true,
        }
    }
}

impl TransformConfig {
    pub fn validate(&self) -> Result<()> {
        if self.engines.is_empty() {
            return Err(Error::InvalidArgument(
                "a transform channel needs at least one engine".to_string(),
            ));
        }
        Ok(())
    }

    /// The engines as the mode mask of the channel record.
    pub fn mode(&self) -> u32 {
        self.engines.iter().fold(0, |mode, engine| mode | engine.bit())
    }

    pub fn has_engine(&self, engine: Engine) -> bool {
        self.engines.contains(&engine)
    }
}

/// Channel settings for one run of the `accel_codec` tool, read from a JSON file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub decode: VdecConfig,
    pub encode: VencConfig,
    pub transform: TransformConfig,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        self.decode.validate()?;
        self.encode.validate()?;
        self.transform.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vdec_defaults_are_valid() {
        let config: VdecConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, VdecConfig::default());
        config.validate().unwrap();
        assert_eq!(config.eos_timeout(), None);
    }

    #[test]
    fn vdec_rejects_channel_above_ceiling() {
        let config = VdecConfig {
            hw_channel: 32,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn vdec_reads_timeout_and_output_size() {
        let config: VdecConfig = serde_json::from_str(
            r#"{"out_width": 640, "out_height": 480, "eos_timeout_ms": 250, "codec": "h265_main"}"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.codec, StreamFormat::H265Main);
        assert_eq!(config.eos_timeout(), Some(Duration::from_millis(250)));
        assert!(serde_json::from_str::<VdecConfig>(r#"{"colour": 1}"#).is_err());
    }

    #[test]
    fn venc_rejects_odd_size() {
        let config = VencConfig {
            width: 641,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(VencConfig {
            codec: StreamFormat::Jpeg,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn transform_mode_mask() {
        let config = TransformConfig {
            engines: vec![Engine::Vpc, Engine::Pngd],
            with_signal: false,
        };
        assert_eq!(config.mode(), 0b1001);
        assert!(config.has_engine(Engine::Pngd));
        assert!(TransformConfig {
            engines: Vec::new(),
            with_signal: true
        }
        .validate()
        .is_err());
    }

    #[test]
    fn session_config_fills_missing_sections() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"decode": {"hw_channel": 7}}"#).unwrap();
        assert_eq!(config.decode.hw_channel, 7);
        assert_eq!(config.encode, VencConfig::default());
        assert_eq!(config.transform, TransformConfig::default());
        config.validate().unwrap();
        assert!(serde_json::from_str::<SessionConfig>(r#"{"scale": {}}"#).is_err());
    }
}
