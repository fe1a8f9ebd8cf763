//! FFmpeg decode session for continuous capture.
//!
//! Opens files, network streams (RTSP transport chosen per source) and V4L2
//! devices, decodes the best video stream and converts frames to RGB24.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::{BackendOptions, SourceDescriptor, SourceInfo};
use crate::frame::{Frame, CHANNELS};

pub(crate) struct FfmpegCapture {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    info: SourceInfo,
    frame_count: u64,
    eof_sent: bool,
}

impl FfmpegCapture {
    pub(crate) fn open(descriptor: &SourceDescriptor, options: &BackendOptions) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let address = descriptor.media_address();
        let input = open_input(descriptor, options, &address)?;

        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video stream", address))?;
        let stream_index = input_stream.index();
        let fps = f64::from(input_stream.avg_frame_rate());
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let info = SourceInfo {
            fps: if fps.is_finite() { fps } else { 0.0 },
            width: decoder.width(),
            height: decoder.height(),
        };

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            info,
            frame_count: 0,
            eof_sent: false,
        })
    }

    pub(crate) fn info(&self) -> SourceInfo {
        self.info
    }

    pub(crate) fn next_frame(&mut self) -> Result<Frame> {
        let mut decoded = ffmpeg::frame::Video::empty();

        if self.decoder.receive_frame(&mut decoded).is_ok() {
            return self.convert(&decoded);
        }

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded);
            }
        }

        if !self.eof_sent {
            self.eof_sent = true;
            self.decoder.send_eof().ok();
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded);
            }
        }
        anyhow::bail!("stream ended without more frames")
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        self.frame_count += 1;
        Frame::new(pixels, width, height, self.frame_count)
    }
}

fn open_input(
    descriptor: &SourceDescriptor,
    options: &BackendOptions,
    address: &str,
) -> Result<ffmpeg::format::context::Input> {
    let mut dictionary = ffmpeg::Dictionary::new();
    if descriptor.is_rtsp() {
        let transport = if options.rtsp_tcp { "tcp" } else { "udp" };
        dictionary.set("rtsp_transport", transport);
    }

    if let SourceDescriptor::Usb { .. } = descriptor {
        ffmpeg::device::register_all();
        let format = ffmpeg::device::input::video()
            .find(|format| format.name().split(',').any(|n| n == "video4linux2" || n == "v4l2"))
            .ok_or_else(|| anyhow!("ffmpeg was built without v4l2 input support"))?;
        let context = ffmpeg::format::open_with(
            &address,
            &ffmpeg::format::Format::Input(format),
            dictionary,
        )
        .with_context(|| format!("failed to open capture device '{}'", address))?;
        return Ok(context.input());
    }

    ffmpeg::format::input_with_dictionary(&address, dictionary)
        .with_context(|| format!("failed to open '{}' with ffmpeg", address))
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * CHANNELS;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let pixels = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
