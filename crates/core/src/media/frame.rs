use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::{BridgeError, Result};

/// Raw pixel layout of a decoded [`Frame`].
///
/// Names follow ffmpeg's `-pix_fmt` vocabulary so the same value can be
/// handed to the decoder command line and parsed back from configuration.
///
/// | Format | Layout | Accepted by transport |
/// |--------|--------|-----------------------|
/// | `yuv420p` | planar Y, U, V (4:2:0) | yes (canonical) |
/// | `nv12` | planar Y, interleaved UV (4:2:0) | yes |
/// | `rgb24` | packed R G B | no |
/// | `bgr24` | packed B G R | no |
/// | `yuyv422` | packed Y0 U Y1 V | no |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    Rgb24,
    Bgr24,
    Yuyv422,
}

impl PixelFormat {
    /// ffmpeg `-pix_fmt` name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Yuv420p => "yuv420p",
            Self::Nv12 => "nv12",
            Self::Rgb24 => "rgb24",
            Self::Bgr24 => "bgr24",
            Self::Yuyv422 => "yuyv422",
        }
    }

    /// Whether the outbound transport consumes this layout as-is.
    pub fn is_transport_ready(&self) -> bool {
        matches!(self, Self::Yuv420p | Self::Nv12)
    }

    /// Exact buffer size of one picture of `width` x `height`.
    ///
    /// Chroma planes of 4:2:0 and 4:2:2 layouts round odd dimensions up.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        match self {
            Self::Yuv420p | Self::Nv12 => w * h + 2 * cw * ch,
            Self::Rgb24 | Self::Bgr24 => w * h * 3,
            Self::Yuyv422 => cw * 4 * h,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yuv420p" | "i420" => Ok(Self::Yuv420p),
            "nv12" => Ok(Self::Nv12),
            "rgb24" => Ok(Self::Rgb24),
            "bgr24" => Ok(Self::Bgr24),
            "yuyv422" | "yuy2" => Ok(Self::Yuyv422),
            other => Err(BridgeError::Validation(format!(
                "unsupported pixel format: {other}"
            ))),
        }
    }
}

/// One decoded video picture.
///
/// The buffer is a reference-counted [`Bytes`], so handing the same frame to
/// the fallback cache and to the transport does not copy pixel data. The
/// buffer length always equals [`PixelFormat::frame_size`] for the frame's
/// dimensions; [`Frame::new`] rejects anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    format: PixelFormat,
    width: u32,
    height: u32,
    pts: u64,
    data: Bytes,
}

impl Frame {
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        pts: u64,
        data: Bytes,
    ) -> Result<Self> {
        let expected = format.frame_size(width, height);
        if data.len() != expected || expected == 0 {
            return Err(BridgeError::InvalidFrame {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            format,
            width,
            height,
            pts,
            data,
        })
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Presentation index assigned by the decoder (frames since open).
    pub fn pts(&self) -> u64 {
        self.pts
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Return a frame the transport accepts, converting non-planar layouts
    /// to `yuv420p`. Transport-ready frames are returned unchanged.
    pub fn normalized(self) -> Frame {
        if self.format.is_transport_ready() {
            return self;
        }
        let (w, h) = (self.width, self.height);
        let converted = match self.format {
            PixelFormat::Rgb24 => packed_rgb_to_i420(&self.data, w, h, [0, 1, 2]),
            PixelFormat::Bgr24 => packed_rgb_to_i420(&self.data, w, h, [2, 1, 0]),
            PixelFormat::Yuyv422 => yuyv_to_i420(&self.data, w, h),
            PixelFormat::Yuv420p | PixelFormat::Nv12 => {
                unreachable!("transport-ready formats return early")
            }
        };
        tracing::trace!(
            from = %self.format,
            width = self.width,
            height = self.height,
            "frame converted to yuv420p"
        );
        Frame {
            format: PixelFormat::Yuv420p,
            width: self.width,
            height: self.height,
            pts: self.pts,
            data: Bytes::from(converted),
        }
    }
}

/// BT.601 limited-range RGB → YUV, integer approximation.
fn rgb_to_y(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

fn rgb_to_uv(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

/// Convert packed 24-bit RGB (channel order given by `order` as indices of
/// R, G, B within a pixel) to planar I420. Chroma is the average of each
/// 2x2 block; blocks on odd edges average the pixels that exist.
fn packed_rgb_to_i420(src: &[u8], width: u32, height: u32, order: [usize; 3]) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let mut out = vec![0u8; w * h + 2 * cw * ch];
    let (y_plane, chroma) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    let pixel = |x: usize, y: usize| -> (i32, i32, i32) {
        let i = (y * w + x) * 3;
        (
            src[i + order[0]] as i32,
            src[i + order[1]] as i32,
            src[i + order[2]] as i32,
        )
    };

    for y in 0..h {
        for x in 0..w {
            let (r, g, b) = pixel(x, y);
            y_plane[y * w + x] = rgb_to_y(r, g, b);
        }
    }

    for cy in 0..ch {
        for cx in 0..cw {
            let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
            for y in (cy * 2)..((cy * 2 + 2).min(h)) {
                for x in (cx * 2)..((cx * 2 + 2).min(w)) {
                    let (pr, pg, pb) = pixel(x, y);
                    r += pr;
                    g += pg;
                    b += pb;
                    n += 1;
                }
            }
            let (u, v) = rgb_to_uv(r / n, g / n, b / n);
            u_plane[cy * cw + cx] = u;
            v_plane[cy * cw + cx] = v;
        }
    }

    out
}

/// Convert packed YUYV 4:2:2 to planar I420 by averaging chroma of each
/// pair of rows.
fn yuyv_to_i420(src: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let stride = cw * 4;
    let mut out = vec![0u8; w * h + 2 * cw * ch];
    let (y_plane, chroma) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    for y in 0..h {
        let row = &src[y * stride..(y + 1) * stride];
        for x in 0..w {
            let macro_pixel = &row[(x / 2) * 4..(x / 2) * 4 + 4];
            y_plane[y * w + x] = if x % 2 == 0 { macro_pixel[0] } else { macro_pixel[2] };
        }
    }

    for cy in 0..ch {
        let top = cy * 2;
        let bottom = (top + 1).min(h - 1);
        for cx in 0..cw {
            let a = &src[top * stride + cx * 4..top * stride + cx * 4 + 4];
            let b = &src[bottom * stride + cx * 4..bottom * stride + cx * 4 + 4];
            u_plane[cy * cw + cx] = ((a[1] as u16 + b[1] as u16 + 1) / 2) as u8;
            v_plane[cy * cw + cx] = ((a[3] as u16 + b[3] as u16 + 1) / 2) as u8;
        }
    }

    out
}
