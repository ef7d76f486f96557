//! Binary wire codec for render requests and responses.
//!
//! All multi-byte fields are big-endian.
//!
//! Request:
//! ```text
//! [u8 mode][i32 width][i32 height][i32 image_len][image_len bytes PNG]
//! [i32 rotation_x][i32 rotation_y][i32 leg_rotation][u8 flipped][u8 slim]
//! ```
//!
//! Response:
//! ```text
//! [u8 status 1=ok 0=error][u16 len + UTF-8 worker name][u64 elapsed ms, v2 only]
//!   ok:    [PNG bytes until end]
//!   error: [u16 len + kind][u32 len + message][u32 count][u32 len + frame]*
//! ```

use crate::error::{ErrorRecord, FailureKind};
use crate::job::{JobOutcome, RenderMode, RenderRequest};
use bytes::{Buf, BufMut, BytesMut};
use resvg::tiny_skia::Pixmap;
use std::time::Duration;

const STATUS_FAILURE: u8 = 0;
const STATUS_SUCCESS: u8 = 1;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Protocol generation. Carried out-of-band in the broker envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    /// Responses carry no timing metadata.
    V1,
    /// Responses carry elapsed milliseconds after the worker name.
    #[default]
    V2,
}

impl ProtocolVersion {
    /// Parses the version tag carried in a request envelope.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProtocolVersion::V1),
            2 => Some(ProtocolVersion::V2),
            _ => None,
        }
    }

    /// Version tag as written into request envelopes.
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        }
    }

    /// Whether responses carry the elapsed milliseconds field.
    pub fn has_elapsed(self) -> bool {
        matches!(self, ProtocolVersion::V2)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("unknown render mode ordinal {0}")]
    UnknownMode(u8),

    #[error("negative {field}: {value}")]
    Negative { field: &'static str, value: i32 },

    #[error("unknown response status {0}")]
    UnknownStatus(u8),

    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 {
        field: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("texture is not a valid PNG image")]
    Image(#[source] BoxError),
}

impl DecodeError {
    /// Image failures are reported apart from protocol failures.
    pub fn kind(&self) -> FailureKind {
        match self {
            DecodeError::Image(_) => FailureKind::ImageDecode,
            _ => FailureKind::ProtocolDecode,
        }
    }

    /// Converts the error into the record sent back to the requester.
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord::from_error(self.kind(), self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("{field} is {len} bytes, limit is {limit}")]
    TooLong {
        field: &'static str,
        len: usize,
        limit: usize,
    },

    #[error("{field} {value} does not fit a signed 32-bit field")]
    OutOfRange { field: &'static str, value: u32 },

    #[error("failed to encode PNG")]
    Image(#[source] BoxError),
}

/// Parsed response, as seen by the requesting side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResponse {
    pub worker_name: String,
    pub elapsed_ms: Option<u64>,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// PNG-encoded raster.
    Image(Vec<u8>),
    Failure(ErrorRecord),
}

impl RenderResponse {
    /// True for a status 1 response.
    pub fn is_success(&self) -> bool {
        matches!(self.body, ResponseBody::Image(_))
    }

    /// Decodes the PNG payload of a successful response.
    pub fn image(&self) -> Option<Result<Pixmap, DecodeError>> {
        match &self.body {
            ResponseBody::Image(png) => Some(decode_png(png)),
            ResponseBody::Failure(_) => None,
        }
    }
}

/// Decodes a request. Either every field is read or an error is returned.
pub fn decode_request(bytes: &[u8]) -> Result<RenderRequest, DecodeError> {
    let mut reader = Reader::new(bytes);

    let ordinal = reader.u8("mode")?;
    let mode = RenderMode::from_ordinal(ordinal).ok_or(DecodeError::UnknownMode(ordinal))?;
    let width = reader.non_negative("width")?;
    let height = reader.non_negative("height")?;
    let image_len = reader.non_negative("image length")? as usize;
    let png = reader.bytes("image", image_len)?;
    let rotation_x = reader.i32("rotation_x")?;
    let rotation_y = reader.i32("rotation_y")?;
    let leg_rotation = reader.i32("leg_rotation")?;
    let flipped = reader.u8("flipped")? != 0;
    let slim = reader.u8("slim")? != 0;

    // Every protocol field has been read; only now is the texture decoded.
    let source_image = decode_png(png)?;

    Ok(RenderRequest {
        mode,
        width,
        height,
        source_image,
        rotation_x,
        rotation_y,
        leg_rotation,
        flipped,
        slim,
    })
}

/// Encodes a request in the layout `decode_request` reads.
pub fn encode_request(request: &RenderRequest) -> Result<Vec<u8>, EncodeError> {
    let png = encode_png(&request.source_image)?;
    let mut buf = BytesMut::with_capacity(32 + png.len());

    buf.put_u8(request.mode.ordinal());
    buf.put_i32(signed("width", request.width)?);
    buf.put_i32(signed("height", request.height)?);
    buf.put_i32(length("image", png.len(), i32::MAX as usize)? as i32);
    buf.put_slice(&png);
    buf.put_i32(request.rotation_x);
    buf.put_i32(request.rotation_y);
    buf.put_i32(request.leg_rotation);
    buf.put_u8(request.flipped as u8);
    buf.put_u8(request.slim as u8);

    Ok(buf.to_vec())
}

/// Encodes the response for a resolved job.
///
/// The elapsed field is written only when `version` carries timing metadata.
pub fn encode_response(
    outcome: &JobOutcome,
    worker_name: &str,
    elapsed: Duration,
    version: ProtocolVersion,
) -> Result<Vec<u8>, EncodeError> {
    let mut buf = BytesMut::new();

    buf.put_u8(match outcome {
        Ok(_) => STATUS_SUCCESS,
        Err(_) => STATUS_FAILURE,
    });
    put_short_str(&mut buf, "worker name", worker_name)?;
    if version.has_elapsed() {
        buf.put_u64(elapsed.as_millis().min(u64::MAX as u128) as u64);
    }

    match outcome {
        Ok(image) => buf.put_slice(&encode_png(image)?),
        Err(record) => put_error_record(&mut buf, record)?,
    }

    Ok(buf.to_vec())
}

/// Decodes a response produced by `encode_response`.
pub fn decode_response(
    bytes: &[u8],
    version: ProtocolVersion,
) -> Result<RenderResponse, DecodeError> {
    let mut reader = Reader::new(bytes);

    let status = reader.u8("status")?;
    let worker_name = reader.short_str("worker name")?;
    let elapsed_ms = if version.has_elapsed() {
        Some(reader.u64("elapsed")?)
    } else {
        None
    };

    let body = match status {
        STATUS_SUCCESS => ResponseBody::Image(reader.rest().to_vec()),
        STATUS_FAILURE => {
            let kind = reader.short_str("error kind")?;
            let message = reader.long_str("error message")?;
            let count = reader.u32("stack frame count")? as usize;
            let mut stack_frames = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                stack_frames.push(reader.long_str("stack frame")?);
            }
            ResponseBody::Failure(ErrorRecord {
                kind,
                message,
                stack_frames,
            })
        }
        other => return Err(DecodeError::UnknownStatus(other)),
    };

    Ok(RenderResponse {
        worker_name,
        elapsed_ms,
        body,
    })
}

/// Decodes PNG bytes into a premultiplied raster.
pub fn decode_png(bytes: &[u8]) -> Result<Pixmap, DecodeError> {
    Pixmap::decode_png(bytes).map_err(|e| DecodeError::Image(Box::new(e)))
}

/// Encodes a raster as PNG.
pub fn encode_png(image: &Pixmap) -> Result<Vec<u8>, EncodeError> {
    image
        .encode_png()
        .map_err(|e| EncodeError::Image(Box::new(e)))
}

fn put_error_record(buf: &mut BytesMut, record: &ErrorRecord) -> Result<(), EncodeError> {
    put_short_str(buf, "error kind", &record.kind)?;
    put_long_str(buf, "error message", &record.message)?;
    buf.put_u32(length("stack frames", record.stack_frames.len(), u32::MAX as usize)? as u32);
    for frame in &record.stack_frames {
        put_long_str(buf, "stack frame", frame)?;
    }
    Ok(())
}

fn put_short_str(buf: &mut BytesMut, field: &'static str, value: &str) -> Result<(), EncodeError> {
    buf.put_u16(length(field, value.len(), u16::MAX as usize)? as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_long_str(buf: &mut BytesMut, field: &'static str, value: &str) -> Result<(), EncodeError> {
    buf.put_u32(length(field, value.len(), u32::MAX as usize)? as u32);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn length(field: &'static str, len: usize, limit: usize) -> Result<usize, EncodeError> {
    if len > limit {
        return Err(EncodeError::TooLong { field, len, limit });
    }
    Ok(len)
}

fn signed(field: &'static str, value: u32) -> Result<i32, EncodeError> {
    i32::try_from(value).map_err(|_| EncodeError::OutOfRange { field, value })
}

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, field: &'static str, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                field,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        self.need(field, 1)?;
        Ok(self.buf.get_u8())
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, DecodeError> {
        self.need(field, 4)?;
        Ok(self.buf.get_i32())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        self.need(field, 4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        self.need(field, 8)?;
        Ok(self.buf.get_u64())
    }

    fn non_negative(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let value = self.i32(field)?;
        u32::try_from(value).map_err(|_| DecodeError::Negative { field, value })
    }

    fn bytes(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], DecodeError> {
        self.need(field, len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self, field: &'static str, len: usize) -> Result<String, DecodeError> {
        let raw = self.bytes(field, len)?;
        String::from_utf8(raw.to_vec()).map_err(|source| DecodeError::InvalidUtf8 { field, source })
    }

    fn short_str(&mut self, field: &'static str) -> Result<String, DecodeError> {
        self.need(field, 2)?;
        let len = self.buf.get_u16() as usize;
        self.string(field, len)
    }

    fn long_str(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.u32(field)? as usize;
        self.string(field, len)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}
