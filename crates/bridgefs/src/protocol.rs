//! Wire protocol for the bridge connection.
//!
//! Every message is a self-delimited frame: a fixed header followed by an
//! operation-specific payload. Requests carry {opcode, request id, payload
//! length}; responses echo the opcode and id and add a one-byte status.
//! All integers are big-endian; strings and byte blobs inside payloads are
//! `u32`-length-prefixed.
//!
//! Decoding is resumable: the [`RequestFrameCodec`] keeps partial bytes
//! between reads and only yields complete frames. A frame whose declared
//! payload length exceeds the configured maximum is reported and its payload
//! skipped without desynchronizing the stream.

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Protocol version, exchanged nowhere yet but stamped into logs.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request frame header: opcode (1) + request id (8) + payload length (4)
pub const REQUEST_HEADER_LEN: usize = 13;

/// Response frame header: opcode echo (1) + request id (8) + status (1) + payload length (4)
pub const RESPONSE_HEADER_LEN: usize = 14;

/// Operation tags, one per filesystem call the engine understands.
///
/// The set is closed: the wire protocol fixes it, and exhaustive matching
/// catches unhandled cases at compile time.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Resolve a name inside a parent directory to attributes
    Lookup = 1,
    /// Attributes by path (lstat semantics)
    Stat = 2,
    /// Open a file, returns a handle
    Open = 3,
    /// Open a directory for streaming reads, returns a handle
    Opendir = 4,
    /// Read a byte range from a file handle
    Read = 5,
    /// Write a byte range to a file handle
    Write = 6,
    /// Truncate a file by path
    Truncate = 7,
    /// Flush buffered writes on a file handle
    Flush = 8,
    /// Release a handle
    Release = 9,
    /// Next chunk of directory entries from a directory handle
    Readdir = 10,
    /// Create an empty regular file
    Create = 11,
    /// Create a directory
    Mkdir = 12,
    /// Remove an empty directory
    Rmdir = 13,
    /// Remove a file
    Unlink = 14,
    /// Rename a file or directory
    Rename = 15,
}

impl TryFrom<u8> for Opcode {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Opcode::Lookup),
            2 => Ok(Opcode::Stat),
            3 => Ok(Opcode::Open),
            4 => Ok(Opcode::Opendir),
            5 => Ok(Opcode::Read),
            6 => Ok(Opcode::Write),
            7 => Ok(Opcode::Truncate),
            8 => Ok(Opcode::Flush),
            9 => Ok(Opcode::Release),
            10 => Ok(Opcode::Readdir),
            11 => Ok(Opcode::Create),
            12 => Ok(Opcode::Mkdir),
            13 => Ok(Opcode::Rmdir),
            14 => Ok(Opcode::Unlink),
            15 => Ok(Opcode::Rename),
            _ => Err(Error::UnknownOperation(value)),
        }
    }
}

/// Error-kind codes carried in the response status byte (0 means success).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Undecodable frame body or oversized declared length
    MalformedFrame = 1,
    /// Request id reused while still in flight
    DuplicateRequestId = 2,
    /// Operation tag not recognized
    UnknownOperation = 3,
    /// Handle id not issued or already released
    HandleNotFound = 4,
    /// Session hit its open-handle limit
    HandleExhausted = 5,
    /// Path resolved outside the shared root
    PathEscape = 6,
    /// No such file or directory
    NotFound = 7,
    /// Permission denied
    PermissionDenied = 8,
    /// File/directory type mismatch
    WrongType = 9,
    /// Target already exists
    NameConflict = 10,
    /// Directory not empty
    NotEmpty = 11,
    /// No space left on device
    NoSpace = 12,
    /// Unclassified I/O failure
    Io = 13,
    /// Per-operation deadline exceeded
    OperationTimeout = 14,
    /// Operation not supported
    Unsupported = 15,
    /// Handle degraded after a timeout
    StaleHandle = 16,
    /// Path component too long
    NameTooLong = 17,
}

impl TryFrom<u8> for ErrorCode {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ErrorCode::MalformedFrame),
            2 => Ok(ErrorCode::DuplicateRequestId),
            3 => Ok(ErrorCode::UnknownOperation),
            4 => Ok(ErrorCode::HandleNotFound),
            5 => Ok(ErrorCode::HandleExhausted),
            6 => Ok(ErrorCode::PathEscape),
            7 => Ok(ErrorCode::NotFound),
            8 => Ok(ErrorCode::PermissionDenied),
            9 => Ok(ErrorCode::WrongType),
            10 => Ok(ErrorCode::NameConflict),
            11 => Ok(ErrorCode::NotEmpty),
            12 => Ok(ErrorCode::NoSpace),
            13 => Ok(ErrorCode::Io),
            14 => Ok(ErrorCode::OperationTimeout),
            15 => Ok(ErrorCode::Unsupported),
            16 => Ok(ErrorCode::StaleHandle),
            17 => Ok(ErrorCode::NameTooLong),
            _ => Err(Error::malformed(format!("unknown error code {value}"))),
        }
    }
}

/// File open flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x0000_0001;
    pub const WRITE: u32 = 0x0000_0002;
    pub const APPEND: u32 = 0x0000_0004;
    pub const CREAT: u32 = 0x0000_0008;
    pub const TRUNC: u32 = 0x0000_0010;
    pub const EXCL: u32 = 0x0000_0020;

    pub fn has_read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn has_write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn has_append(&self) -> bool {
        self.0 & Self::APPEND != 0
    }

    pub fn has_creat(&self) -> bool {
        self.0 & Self::CREAT != 0
    }

    pub fn has_trunc(&self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    pub fn has_excl(&self) -> bool {
        self.0 & Self::EXCL != 0
    }
}

/// Seconds + nanoseconds timestamp, as the device filesystem reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSpec {
    pub secs: i64,
    pub nanos: u32,
}

/// What kind of entry a handle or directory record refers to
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File = 0,
    Directory = 1,
    Symlink = 2,
    Other = 3,
}

impl From<u8> for EntryKind {
    fn from(value: u8) -> Self {
        match value {
            0 => EntryKind::File,
            1 => EntryKind::Directory,
            2 => EntryKind::Symlink,
            _ => EntryKind::Other,
        }
    }
}

/// File attributes as carried in stat/lookup responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attrs {
    pub size: u64,
    pub links: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
    pub ctime: TimeSpec,
}

impl Attrs {
    /// Encode attributes into a response payload
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.size);
        buf.put_u32(self.links);
        buf.put_u32(self.mode);
        buf.put_u32(self.uid);
        buf.put_u32(self.gid);
        for time in [self.atime, self.mtime, self.ctime] {
            buf.put_i64(time.secs);
            buf.put_u32(time.nanos);
        }
    }

    /// Decode attributes from a payload
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 60 {
            return Err(Error::malformed("insufficient data for attributes"));
        }

        let size = buf.get_u64();
        let links = buf.get_u32();
        let mode = buf.get_u32();
        let uid = buf.get_u32();
        let gid = buf.get_u32();

        let mut times = [TimeSpec::default(); 3];
        for time in &mut times {
            time.secs = buf.get_i64();
            time.nanos = buf.get_u32();
        }

        Ok(Attrs {
            size,
            links,
            mode,
            uid,
            gid,
            atime: times[0],
            mtime: times[1],
            ctime: times[2],
        })
    }
}

/// One record in a streamed directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: TimeSpec,
}

/// A decoded filesystem operation request.
///
/// Immutable once decoded; owned by the multiplexer until a response is
/// produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Lookup { parent: String, name: String },
    Stat { path: String },
    Open { path: String, flags: OpenFlags, mode: u32 },
    Opendir { path: String },
    Read { handle: u64, offset: i64, len: u32 },
    Write { handle: u64, offset: i64, data: Bytes },
    Truncate { path: String, size: u64 },
    Flush { handle: u64 },
    Release { handle: u64 },
    Readdir { handle: u64, rewind: bool },
    Create { path: String, mode: u32 },
    Mkdir { path: String, mode: u32 },
    Rmdir { path: String },
    Unlink { path: String },
    Rename { from: String, to: String },
}

impl Request {
    /// The operation tag this request travels under
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Lookup { .. } => Opcode::Lookup,
            Request::Stat { .. } => Opcode::Stat,
            Request::Open { .. } => Opcode::Open,
            Request::Opendir { .. } => Opcode::Opendir,
            Request::Read { .. } => Opcode::Read,
            Request::Write { .. } => Opcode::Write,
            Request::Truncate { .. } => Opcode::Truncate,
            Request::Flush { .. } => Opcode::Flush,
            Request::Release { .. } => Opcode::Release,
            Request::Readdir { .. } => Opcode::Readdir,
            Request::Create { .. } => Opcode::Create,
            Request::Mkdir { .. } => Opcode::Mkdir,
            Request::Rmdir { .. } => Opcode::Rmdir,
            Request::Unlink { .. } => Opcode::Unlink,
            Request::Rename { .. } => Opcode::Rename,
        }
    }

    /// The handle this request is ordered against, if any.
    ///
    /// Handle-keyed operations are serialized per handle; path-keyed
    /// operations (`None`) may execute concurrently.
    pub fn target_handle(&self) -> Option<u64> {
        match self {
            Request::Read { handle, .. }
            | Request::Write { handle, .. }
            | Request::Flush { handle }
            | Request::Release { handle }
            | Request::Readdir { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    /// Decode a request body for a known opcode.
    ///
    /// The whole payload must be consumed; trailing bytes are malformed.
    pub fn decode_body(opcode: Opcode, mut buf: &[u8]) -> Result<Self> {
        let buf = &mut buf;
        let request = match opcode {
            Opcode::Lookup => Request::Lookup {
                parent: codec::get_string(buf)?,
                name: codec::get_string(buf)?,
            },
            Opcode::Stat => Request::Stat {
                path: codec::get_string(buf)?,
            },
            Opcode::Open => Request::Open {
                path: codec::get_string(buf)?,
                flags: OpenFlags(codec::get_u32(buf)?),
                mode: codec::get_u32(buf)?,
            },
            Opcode::Opendir => Request::Opendir {
                path: codec::get_string(buf)?,
            },
            Opcode::Read => Request::Read {
                handle: codec::get_u64(buf)?,
                offset: codec::get_i64(buf)?,
                len: codec::get_u32(buf)?,
            },
            Opcode::Write => Request::Write {
                handle: codec::get_u64(buf)?,
                offset: codec::get_i64(buf)?,
                data: Bytes::from(codec::get_bytes(buf)?),
            },
            Opcode::Truncate => Request::Truncate {
                path: codec::get_string(buf)?,
                size: codec::get_u64(buf)?,
            },
            Opcode::Flush => Request::Flush {
                handle: codec::get_u64(buf)?,
            },
            Opcode::Release => Request::Release {
                handle: codec::get_u64(buf)?,
            },
            Opcode::Readdir => Request::Readdir {
                handle: codec::get_u64(buf)?,
                rewind: codec::get_u8(buf)? != 0,
            },
            Opcode::Create => Request::Create {
                path: codec::get_string(buf)?,
                mode: codec::get_u32(buf)?,
            },
            Opcode::Mkdir => Request::Mkdir {
                path: codec::get_string(buf)?,
                mode: codec::get_u32(buf)?,
            },
            Opcode::Rmdir => Request::Rmdir {
                path: codec::get_string(buf)?,
            },
            Opcode::Unlink => Request::Unlink {
                path: codec::get_string(buf)?,
            },
            Opcode::Rename => Request::Rename {
                from: codec::get_string(buf)?,
                to: codec::get_string(buf)?,
            },
        };

        if !buf.is_empty() {
            return Err(Error::malformed("trailing bytes after request body"));
        }

        Ok(request)
    }

    /// Encode the request body (without the frame header)
    pub fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Request::Lookup { parent, name } => {
                codec::put_string(buf, parent);
                codec::put_string(buf, name);
            }
            Request::Stat { path } | Request::Opendir { path } | Request::Rmdir { path } | Request::Unlink { path } => {
                codec::put_string(buf, path);
            }
            Request::Open { path, flags, mode } => {
                codec::put_string(buf, path);
                buf.put_u32(flags.0);
                buf.put_u32(*mode);
            }
            Request::Read { handle, offset, len } => {
                buf.put_u64(*handle);
                buf.put_i64(*offset);
                buf.put_u32(*len);
            }
            Request::Write { handle, offset, data } => {
                buf.put_u64(*handle);
                buf.put_i64(*offset);
                codec::put_bytes(buf, data);
            }
            Request::Truncate { path, size } => {
                codec::put_string(buf, path);
                buf.put_u64(*size);
            }
            Request::Flush { handle } | Request::Release { handle } => {
                buf.put_u64(*handle);
            }
            Request::Readdir { handle, rewind } => {
                buf.put_u64(*handle);
                buf.put_u8(u8::from(*rewind));
            }
            Request::Create { path, mode } | Request::Mkdir { path, mode } => {
                codec::put_string(buf, path);
                buf.put_u32(*mode);
            }
            Request::Rename { from, to } => {
                codec::put_string(buf, from);
                codec::put_string(buf, to);
            }
        }
    }
}

/// Encode a full request frame (header + body). Client side and tests.
pub fn encode_request(request_id: u64, request: &Request, buf: &mut BytesMut) {
    let mut body = BytesMut::new();
    request.encode_body(&mut body);

    buf.put_u8(request.opcode() as u8);
    buf.put_u64(request_id);
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
}

/// Success payload of a response, shaped by the operation kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// No payload (mkdir, rmdir, unlink, rename, create, truncate, flush, release)
    Empty,
    /// Attributes (lookup, stat)
    Attrs(Attrs),
    /// Newly issued handle id (open, opendir)
    Handle(u64),
    /// Bytes read (read)
    Data(Bytes),
    /// Bytes accepted (write)
    Written(u64),
    /// One bounded chunk of a directory listing (readdir)
    Dirents { entries: Vec<DirEntry>, eof: bool },
}

/// One response frame, produced exactly once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Echo of the request opcode; 0 when the opcode was unrecognizable
    pub opcode: u8,
    pub request_id: u64,
    pub result: std::result::Result<ResponseBody, (ErrorCode, String)>,
}

impl Response {
    /// Success response for a completed operation
    pub fn ok(opcode: Opcode, request_id: u64, body: ResponseBody) -> Self {
        Self {
            opcode: opcode as u8,
            request_id,
            result: Ok(body),
        }
    }

    /// Error response; the detail string travels to the client
    pub fn error(opcode: u8, request_id: u64, err: &Error) -> Self {
        Self {
            opcode,
            request_id,
            result: Err((err.wire_code(), err.to_string())),
        }
    }

    /// Encode into a full response frame
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::new();
        let status = match &self.result {
            Ok(payload) => {
                encode_response_body(payload, &mut body);
                0u8
            }
            Err((code, detail)) => {
                codec::put_string(&mut body, detail);
                *code as u8
            }
        };

        buf.put_u8(self.opcode);
        buf.put_u64(self.request_id);
        buf.put_u8(status);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
    }

    /// Decode a response body given the opcode it echoes.
    ///
    /// The client side demultiplexes by request id; the opcode echo tells it
    /// which payload shape to expect.
    pub fn decode(opcode: u8, request_id: u64, status: u8, mut payload: &[u8]) -> Result<Self> {
        let buf = &mut payload;

        if status != 0 {
            let code = ErrorCode::try_from(status)?;
            let detail = codec::get_string(buf)?;
            return Ok(Self {
                opcode,
                request_id,
                result: Err((code, detail)),
            });
        }

        let body = match Opcode::try_from(opcode)? {
            Opcode::Lookup | Opcode::Stat => ResponseBody::Attrs(Attrs::decode(buf)?),
            Opcode::Open | Opcode::Opendir => ResponseBody::Handle(codec::get_u64(buf)?),
            Opcode::Read => ResponseBody::Data(Bytes::from(codec::get_bytes(buf)?)),
            Opcode::Write => ResponseBody::Written(codec::get_u64(buf)?),
            Opcode::Readdir => {
                let count = codec::get_u32(buf)? as usize;
                let mut entries = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let name = codec::get_string(buf)?;
                    let kind = EntryKind::from(codec::get_u8(buf)?);
                    let size = codec::get_u64(buf)?;
                    let mtime = TimeSpec {
                        secs: codec::get_i64(buf)?,
                        nanos: codec::get_u32(buf)?,
                    };
                    entries.push(DirEntry { name, kind, size, mtime });
                }
                let eof = codec::get_u8(buf)? != 0;
                ResponseBody::Dirents { entries, eof }
            }
            _ => ResponseBody::Empty,
        };

        Ok(Self {
            opcode,
            request_id,
            result: Ok(body),
        })
    }
}

fn encode_response_body(body: &ResponseBody, buf: &mut BytesMut) {
    match body {
        ResponseBody::Empty => {}
        ResponseBody::Attrs(attrs) => attrs.encode(buf),
        ResponseBody::Handle(id) => buf.put_u64(*id),
        ResponseBody::Data(data) => codec::put_bytes(buf, data),
        ResponseBody::Written(n) => buf.put_u64(*n),
        ResponseBody::Dirents { entries, eof } => {
            buf.put_u32(entries.len() as u32);
            for entry in entries {
                codec::put_string(buf, &entry.name);
                buf.put_u8(entry.kind as u8);
                buf.put_u64(entry.size);
                buf.put_i64(entry.mtime.secs);
                buf.put_u32(entry.mtime.nanos);
            }
            buf.put_u8(u8::from(*eof));
        }
    }
}

/// What the request decoder hands to the multiplexer for each frame.
#[derive(Debug)]
pub enum FrameEvent {
    /// A complete, well-formed request
    Request { request_id: u64, request: Request },
    /// Frame dropped: unknown opcode or undecodable body. The stream stays
    /// in sync; the multiplexer answers with a protocol error.
    Invalid {
        opcode: u8,
        request_id: u64,
        error: Error,
    },
    /// Declared payload length exceeded the maximum; the payload is being
    /// skipped as it arrives.
    Oversized {
        opcode: u8,
        request_id: u64,
        declared: usize,
    },
}

enum DecodeState {
    Header,
    Payload {
        opcode: u8,
        request_id: u64,
        len: usize,
    },
    Skip {
        remaining: usize,
    },
}

/// Resumable request-frame decoder.
pub struct RequestFrameCodec {
    max_payload: usize,
    state: DecodeState,
}

impl RequestFrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            state: DecodeState::Header,
        }
    }
}

impl Decoder for RequestFrameCodec {
    type Item = FrameEvent;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FrameEvent>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < REQUEST_HEADER_LEN {
                        src.reserve(REQUEST_HEADER_LEN - src.len());
                        return Ok(None);
                    }

                    let opcode = src.get_u8();
                    let request_id = src.get_u64();
                    let len = src.get_u32() as usize;

                    if len > self.max_payload {
                        self.state = DecodeState::Skip { remaining: len };
                        return Ok(Some(FrameEvent::Oversized {
                            opcode,
                            request_id,
                            declared: len,
                        }));
                    }

                    self.state = DecodeState::Payload {
                        opcode,
                        request_id,
                        len,
                    };
                }
                DecodeState::Payload {
                    opcode,
                    request_id,
                    len,
                } => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }

                    let payload = src.split_to(len);
                    self.state = DecodeState::Header;

                    let event = match Opcode::try_from(opcode) {
                        Ok(op) => match Request::decode_body(op, &payload) {
                            Ok(request) => FrameEvent::Request {
                                request_id,
                                request,
                            },
                            Err(error) => FrameEvent::Invalid {
                                opcode,
                                request_id,
                                error,
                            },
                        },
                        Err(error) => FrameEvent::Invalid {
                            opcode,
                            request_id,
                            error,
                        },
                    };

                    return Ok(Some(event));
                }
                DecodeState::Skip { remaining } => {
                    let take = remaining.min(src.len());
                    src.advance(take);
                    if take == remaining {
                        self.state = DecodeState::Header;
                    } else {
                        self.state = DecodeState::Skip {
                            remaining: remaining - take,
                        };
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Response-frame encoder for the server's write half.
#[derive(Debug, Default)]
pub struct ResponseFrameCodec;

impl Encoder<Response> for ResponseFrameCodec {
    type Error = Error;

    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> Result<()> {
        response.encode(dst);
        Ok(())
    }
}

impl Decoder for ResponseFrameCodec {
    type Item = Response;
    type Error = Error;

    // Client-side decoding, used by tests and by a future mount adapter.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>> {
        if src.len() < RESPONSE_HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..RESPONSE_HEADER_LEN];
        let opcode = header.get_u8();
        let request_id = header.get_u64();
        let status = header.get_u8();
        let len = header.get_u32() as usize;

        if src.len() < RESPONSE_HEADER_LEN + len {
            src.reserve(RESPONSE_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(RESPONSE_HEADER_LEN);
        let payload = src.split_to(len);

        Response::decode(opcode, request_id, status, &payload).map(Some)
    }
}

/// Helpers for encoding/decoding payload primitives
pub mod codec {
    use crate::{Error, Result};
    use bytes::{Buf, BufMut, BytesMut};

    /// Encode a string as length + UTF-8 data
    pub fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_u32(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    /// Decode a length-prefixed string
    pub fn get_string(buf: &mut &[u8]) -> Result<String> {
        let bytes = get_bytes(buf)?;
        String::from_utf8(bytes).map_err(|e| Error::malformed(format!("invalid UTF-8 string: {e}")))
    }

    /// Encode bytes as length + data
    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    /// Decode length-prefixed bytes
    pub fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
        let len = get_u32(buf)? as usize;
        if buf.remaining() < len {
            return Err(Error::malformed("insufficient data for bytes"));
        }

        let bytes = buf[..len].to_vec();
        buf.advance(len);
        Ok(bytes)
    }

    pub fn get_u8(buf: &mut &[u8]) -> Result<u8> {
        if buf.remaining() < 1 {
            return Err(Error::malformed("insufficient data for u8"));
        }
        Ok(buf.get_u8())
    }

    pub fn get_u32(buf: &mut &[u8]) -> Result<u32> {
        if buf.remaining() < 4 {
            return Err(Error::malformed("insufficient data for u32"));
        }
        Ok(buf.get_u32())
    }

    pub fn get_u64(buf: &mut &[u8]) -> Result<u64> {
        if buf.remaining() < 8 {
            return Err(Error::malformed("insufficient data for u64"));
        }
        Ok(buf.get_u64())
    }

    pub fn get_i64(buf: &mut &[u8]) -> Result<i64> {
        if buf.remaining() < 8 {
            return Err(Error::malformed("insufficient data for i64"));
        }
        Ok(buf.get_i64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for value in 1u8..=15 {
            let op = Opcode::try_from(value).unwrap();
            assert_eq!(op as u8, value);
        }
        assert!(Opcode::try_from(0).is_err());
        assert!(Opcode::try_from(16).is_err());
        assert!(Opcode::try_from(255).is_err());
    }

    #[test]
    fn test_partial_header_needs_more_data() {
        let mut codec = RequestFrameCodec::new(1024);
        let mut buf = BytesMut::from(&[5u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_fragmented_frame_is_resumable() {
        let request = Request::Stat {
            path: "/data/app".into(),
        };
        let mut frame = BytesMut::new();
        encode_request(42, &request, &mut frame);

        let mut codec = RequestFrameCodec::new(1024);
        let mut buf = BytesMut::new();

        // Feed one byte at a time; only the final byte completes the frame.
        for (i, byte) in frame.iter().enumerate() {
            buf.put_u8(*byte);
            let out = codec.decode(&mut buf).unwrap();
            if i + 1 < frame.len() {
                assert!(out.is_none(), "frame completed early at byte {i}");
            } else {
                match out {
                    Some(FrameEvent::Request {
                        request_id,
                        request: decoded,
                    }) => {
                        assert_eq!(request_id, 42);
                        assert_eq!(decoded, request);
                    }
                    other => panic!("expected request, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn test_oversized_frame_then_next_frame() {
        let max = 64;
        let mut codec = RequestFrameCodec::new(max);
        let mut buf = BytesMut::new();

        // Oversized frame: declared length max + 1.
        buf.put_u8(Opcode::Write as u8);
        buf.put_u64(7);
        buf.put_u32((max + 1) as u32);
        buf.put_slice(&vec![0u8; max + 1]);

        // Followed by a valid frame.
        let request = Request::Release { handle: 3 };
        encode_request(8, &request, &mut buf);

        match codec.decode(&mut buf).unwrap() {
            Some(FrameEvent::Oversized {
                request_id,
                declared,
                ..
            }) => {
                assert_eq!(request_id, 7);
                assert_eq!(declared, max + 1);
            }
            other => panic!("expected oversized, got {other:?}"),
        }

        match codec.decode(&mut buf).unwrap() {
            Some(FrameEvent::Request {
                request_id,
                request: decoded,
            }) => {
                assert_eq!(request_id, 8);
                assert_eq!(decoded, request);
            }
            other => panic!("expected request after skip, got {other:?}"),
        }
    }

    #[test]
    fn test_payload_at_limit_is_accepted() {
        // A write whose body is exactly max_payload long decodes fine.
        let data = vec![0xabu8; 100];
        let request = Request::Write {
            handle: 1,
            offset: 0,
            data: Bytes::from(data),
        };
        let mut body = BytesMut::new();
        request.encode_body(&mut body);

        let mut codec = RequestFrameCodec::new(body.len());
        let mut buf = BytesMut::new();
        encode_request(1, &request, &mut buf);

        match codec.decode(&mut buf).unwrap() {
            Some(FrameEvent::Request { request: decoded, .. }) => assert_eq!(decoded, request),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_opcode_is_recoverable() {
        let mut codec = RequestFrameCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.put_u8(200);
        buf.put_u64(9);
        buf.put_u32(0);

        match codec.decode(&mut buf).unwrap() {
            Some(FrameEvent::Invalid { opcode, error, .. }) => {
                assert_eq!(opcode, 200);
                assert!(matches!(error, Error::UnknownOperation(200)));
            }
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let mut body = BytesMut::new();
        codec::put_string(&mut body, "/x");
        body.put_u32(0); // stat takes no more fields

        let err = Request::decode_body(Opcode::Stat, &body).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn test_attrs_round_trip() {
        let attrs = Attrs {
            size: 4096,
            links: 2,
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            atime: TimeSpec { secs: 1_700_000_000, nanos: 12 },
            mtime: TimeSpec { secs: 1_700_000_100, nanos: 34 },
            ctime: TimeSpec { secs: 1_700_000_200, nanos: 56 },
        };

        let mut buf = BytesMut::new();
        attrs.encode(&mut buf);
        let decoded = Attrs::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, attrs);
    }

    #[test]
    fn test_response_round_trip_all_variants() {
        let entries = vec![
            DirEntry {
                name: "a.txt".into(),
                kind: EntryKind::File,
                size: 10,
                mtime: TimeSpec { secs: 1, nanos: 2 },
            },
            DirEntry {
                name: "sub".into(),
                kind: EntryKind::Directory,
                size: 0,
                mtime: TimeSpec::default(),
            },
        ];

        let cases = vec![
            Response::ok(Opcode::Mkdir, 1, ResponseBody::Empty),
            Response::ok(Opcode::Stat, 2, ResponseBody::Attrs(Attrs::default())),
            Response::ok(Opcode::Open, 3, ResponseBody::Handle(17)),
            Response::ok(Opcode::Read, 4, ResponseBody::Data(Bytes::from_static(b"hello"))),
            Response::ok(Opcode::Write, 5, ResponseBody::Written(5)),
            Response::ok(Opcode::Readdir, 6, ResponseBody::Dirents { entries, eof: true }),
            Response::error(Opcode::Unlink as u8, 7, &Error::NotFound("/gone".into())),
        ];

        for response in cases {
            let mut buf = BytesMut::new();
            response.encode(&mut buf);

            let mut codec = ResponseFrameCodec;
            let decoded = codec.decode(&mut buf).unwrap().expect("complete frame");
            assert_eq!(decoded, response);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_request_round_trip_all_variants() {
        let cases = vec![
            Request::Lookup { parent: "/d".into(), name: "f".into() },
            Request::Stat { path: "/d/f".into() },
            Request::Open {
                path: "/d/f".into(),
                flags: OpenFlags(OpenFlags::READ | OpenFlags::WRITE),
                mode: 0o644,
            },
            Request::Opendir { path: "/d".into() },
            Request::Read { handle: 1, offset: -1, len: 4096 },
            Request::Write { handle: 1, offset: 100, data: Bytes::from_static(b"xyz") },
            Request::Truncate { path: "/d/f".into(), size: 0 },
            Request::Flush { handle: 1 },
            Request::Release { handle: 1 },
            Request::Readdir { handle: 2, rewind: true },
            Request::Create { path: "/d/new".into(), mode: 0o600 },
            Request::Mkdir { path: "/d/sub".into(), mode: 0o755 },
            Request::Rmdir { path: "/d/sub".into() },
            Request::Unlink { path: "/d/f".into() },
            Request::Rename { from: "/d/f".into(), to: "/d/g".into() },
        ];

        for request in cases {
            let mut body = BytesMut::new();
            request.encode_body(&mut body);
            let decoded = Request::decode_body(request.opcode(), &body).unwrap();
            assert_eq!(decoded, request);
        }
    }
}
