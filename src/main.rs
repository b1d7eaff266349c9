// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs a decode, encode and transform session against the in-process accelerator simulator and
//! prints a JSON report of what each channel produced.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use accel_codec::config::SessionConfig;
use accel_codec::config::TransformConfig;
use accel_codec::config::VdecConfig;
use accel_codec::config::VencConfig;
use accel_codec::descriptor::PicDesc;
use accel_codec::descriptor::PicInfo;
use accel_codec::descriptor::PixelFormat;
use accel_codec::descriptor::StreamDesc;
use accel_codec::descriptor::StreamFormat;
use accel_codec::descriptor::StreamInfo;
use accel_codec::device::fake::FakeDevice;
use accel_codec::device::fake::LiveResources;
use accel_codec::validate::DefaultValidator;
use accel_codec::validate::FormatValidator;
use accel_codec::validate::Stage;
use accel_codec::Capability;
use accel_codec::CapabilityProbe;
use accel_codec::Channel;
use accel_codec::ChannelLifecycleManager;
use accel_codec::DecodedFrame;
use accel_codec::Device;
use accel_codec::EncodedFrame;
use anyhow::Context;
use argh::FromArgs;
use base::info;
use base::syslog;
use base::syslog::Priority;
use serde::Serialize;

fn default_frames() -> u64 {
    8
}

fn default_kernel_version() -> u32 {
    200
}

fn default_log_level() -> Priority {
    Priority::Info
}

fn parse_log_level(value: &str) -> Result<Priority, String> {
    Priority::try_from(value).map_err(|e| e.to_string())
}

#[derive(Debug, FromArgs)]
/// accel_codec
struct Args {
    /// JSON file with `decode`, `encode` and `transform` sections. (default: built-in settings)
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
    /// frames to push through the decoder and the encoder. (default: 8)
    #[argh(option, short = 'n', default = "default_frames()")]
    frames: u64,
    /// version the simulated device reports, e.g. 100, 200 or 100003. (default: 200)
    #[argh(option, default = "default_kernel_version()")]
    kernel_version: u32,
    /// open the transform channel without a completion signal
    #[argh(switch)]
    no_signal: bool,
    /// log level: error, warning, info, debug or trace. (default: info)
    #[argh(option, default = "default_log_level()", from_str_fn(parse_log_level))]
    log_level: Priority,
}

#[derive(Debug, Serialize)]
struct DecodeReport {
    frame_ids: Vec<u64>,
    width: u32,
    height: u32,
}

#[derive(Debug, Serialize)]
struct EncodeReport {
    frames: usize,
    bytes: u64,
}

#[derive(Debug, Serialize)]
struct TransformReport {
    resized: (u32, u32),
    jpeg_bytes: u32,
}

#[derive(Debug, Serialize)]
struct Report {
    capability: Capability,
    decode: DecodeReport,
    encode: EncodeReport,
    transform: TransformReport,
    /// Device handles still held once every channel is closed.
    leaked: LiveResources,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SessionConfig> {
    let config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => SessionConfig::default(),
    };
    config.validate().context("invalid session config")?;
    Ok(config)
}

fn run_decode(
    manager: &ChannelLifecycleManager,
    config: &VdecConfig,
    frames: u64,
) -> anyhow::Result<DecodeReport> {
    let device = manager.device();
    let (tx, rx) = mpsc::channel();
    let channel = manager
        .open_decoder(config, move |frame: DecodedFrame<()>| {
            let info = frame.output.info();
            // The receiver outlives the channel.
            let _ = tx.send((frame.frame_id, info.width, info.height));
        })
        .context("failed to open decode channel")?;
    for _ in 0..frames {
        let input = StreamDesc::new(
            device,
            StreamInfo {
                size: 4096,
                format: config.codec,
                ..Default::default()
            },
        )?;
        let output = PicDesc::new(
            device,
            PicInfo {
                format: config.out_format,
                ..Default::default()
            },
        )?;
        channel.send_frame(Arc::new(input), Arc::new(output), ())?;
    }
    channel.drain()?;
    channel.close().context("failed to close decode channel")?;

    let decoded: Vec<(u64, u32, u32)> = rx.try_iter().collect();
    let (width, height) = decoded
        .last()
        .map_or((0, 0), |&(_, width, height)| (width, height));
    Ok(DecodeReport {
        frame_ids: decoded.into_iter().map(|(id, _, _)| id).collect(),
        width,
        height,
    })
}

fn run_encode(
    manager: &ChannelLifecycleManager,
    config: &VencConfig,
    frames: u64,
) -> anyhow::Result<EncodeReport> {
    let device = manager.device();
    let size = DefaultValidator.predict_size(
        Stage::EncodeInput,
        config.pic_format,
        config.width,
        config.height,
    )?;
    let (tx, rx) = mpsc::channel();
    let channel = manager
        .open_encoder(config, move |frame: EncodedFrame<()>| {
            let _ = tx.send(frame.output.info().size);
        })
        .context("failed to open encode channel")?;
    for i in 0..frames {
        let input = PicDesc::new(
            device,
            PicInfo {
                size,
                format: config.pic_format,
                width: config.width,
                height: config.height,
                width_stride: config.width,
                height_stride: config.height,
                ..Default::default()
            },
        )?;
        channel.send_frame(Arc::new(input), i == 0, ())?;
    }
    channel.send_eos()?;
    channel.close().context("failed to close encode channel")?;

    let sizes: Vec<u32> = rx.try_iter().collect();
    Ok(EncodeReport {
        frames: sizes.len(),
        bytes: sizes.iter().map(|&size| u64::from(size)).sum(),
    })
}

fn run_transform(
    manager: &ChannelLifecycleManager,
    config: &TransformConfig,
) -> anyhow::Result<TransformReport> {
    let device = manager.device();
    let channel = manager
        .open_transform(config)
        .context("failed to open transform channel")?;
    let picture = |width: u32, height: u32| -> anyhow::Result<PicDesc> {
        let size = DefaultValidator.predict_size(
            Stage::TransformInput,
            PixelFormat::Nv12,
            width,
            height,
        )?;
        Ok(PicDesc::new(
            device,
            PicInfo {
                size,
                format: PixelFormat::Nv12,
                width,
                height,
                width_stride: width,
                height_stride: height,
                ..Default::default()
            },
        )?)
    };
    let input = picture(1280, 720)?;
    let resized = picture(640, 360)?;
    channel.resize(&input, &resized)?;
    let info = resized.info();

    let needed = DefaultValidator.predict_size(
        Stage::JpegEncodeOutput,
        info.format,
        info.width,
        info.height,
    )?;
    let jpeg = StreamDesc::new(
        device,
        StreamInfo {
            size: needed,
            format: StreamFormat::Jpeg,
            ..Default::default()
        },
    )?;
    channel.jpeg_encode(&resized, &jpeg, 90)?;
    channel.close().context("failed to close transform channel")?;

    Ok(TransformReport {
        resized: (info.width, info.height),
        jpeg_bytes: jpeg.info().size,
    })
}

fn run(args: Args) -> anyhow::Result<Report> {
    let mut config = load_config(args.config.as_deref())?;
    if args.no_signal {
        config.transform.with_signal = false;
    }
    let fake = FakeDevice::new(args.kernel_version);
    let device: Arc<dyn Device> = fake.clone();
    let probe = Arc::new(CapabilityProbe::new());
    let capability = probe
        .capability(&device)
        .context("failed to probe the accelerator")?;
    info!("simulated accelerator reports {:?}", capability);
    let manager = ChannelLifecycleManager::new(device, probe)?;

    let decode = run_decode(&manager, &config.decode, args.frames)?;
    let encode = run_encode(&manager, &config.encode, args.frames)?;
    let transform = run_transform(&manager, &config.transform)?;
    drop(manager);

    Ok(Report {
        capability,
        decode,
        encode,
        transform,
        leaked: fake.live(),
    })
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();
    syslog::init_with_priority(args.log_level).context("failed to initialize syslog")?;
    let report = run(args)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn args(config: Option<PathBuf>, kernel_version: u32) -> Args {
        Args {
            config,
            frames: 3,
            kernel_version,
            no_signal: false,
            log_level: Priority::Info,
        }
    }

    #[test]
    fn config_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"decode": {{"hw_channel": 9, "out_width": 320, "out_height": 240}}}}"#
        )
        .unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.decode.hw_channel, 9);
        assert_eq!(config.encode, VencConfig::default());
    }

    #[test]
    fn bad_config_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"decode": {{"hw_channel": 99}}}}"#).unwrap();
        assert!(load_config(Some(file.path())).is_err());
        assert!(load_config(Some(Path::new("/nonexistent/accel.json"))).is_err());
    }

    #[test]
    fn session_runs_on_every_signal_variant() {
        for version in [100, 200, 100_003] {
            let report = run(args(None, version)).unwrap();
            assert_eq!(report.decode.frame_ids, vec![1, 2, 3], "version {}", version);
            assert_eq!(report.encode.frames, 3);
            assert_eq!(report.transform.resized, (640, 360));
            assert!(report.transform.jpeg_bytes > 0);
            assert!(report.leaked.is_empty(), "version {}", version);
        }
    }

    #[test]
    fn log_level_parses_names() {
        assert_eq!(parse_log_level("debug"), Ok(Priority::Debug));
        assert!(parse_log_level("loud").is_err());
    }
}
