//! File-transfer protocol messages.
//!
//! Defines the wire format used between client and server: a `u32` length
//! prefix, a message-type byte, a `u32` correlation id (on everything except
//! Init/Version), and a type-specific payload. All integers are big-endian;
//! strings are `u32`-length-prefixed byte runs.

use super::types::{DirEntry, FileAttributes, FileOpenFlags, StatusCode};
use skiff_platform::{SkiffError, SkiffResult};

/// Protocol version spoken by this client (v3).
pub const PROTOCOL_VERSION: u32 = 3;

/// Upper bound on a single frame body.
///
/// Frames larger than this indicate a corrupt length prefix or a
/// misbehaving peer.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Protocol message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// SSH_FXP_INIT - Initialize session
    Init = 1,
    /// SSH_FXP_VERSION - Version response
    Version = 2,
    /// SSH_FXP_OPEN - Open file
    Open = 3,
    /// SSH_FXP_CLOSE - Close file/directory handle
    Close = 4,
    /// SSH_FXP_READ - Read from file
    Read = 5,
    /// SSH_FXP_WRITE - Write to file
    Write = 6,
    /// SSH_FXP_OPENDIR - Open directory
    OpenDir = 11,
    /// SSH_FXP_READDIR - Read directory entries
    ReadDir = 12,
    /// SSH_FXP_REMOVE - Remove file
    Remove = 13,
    /// SSH_FXP_MKDIR - Create directory
    MkDir = 14,
    /// SSH_FXP_RMDIR - Remove directory
    RmDir = 15,
    /// SSH_FXP_STAT - Get file attributes
    Stat = 17,
    /// SSH_FXP_RENAME - Rename file/directory
    Rename = 18,

    // Response messages
    /// SSH_FXP_STATUS - Status response
    Status = 101,
    /// SSH_FXP_HANDLE - File handle response
    Handle = 102,
    /// SSH_FXP_DATA - Data response
    Data = 103,
    /// SSH_FXP_NAME - Name response
    Name = 104,
    /// SSH_FXP_ATTRS - Attributes response
    Attrs = 105,
}

impl MessageType {
    /// Convert from u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Init),
            2 => Some(Self::Version),
            3 => Some(Self::Open),
            4 => Some(Self::Close),
            5 => Some(Self::Read),
            6 => Some(Self::Write),
            11 => Some(Self::OpenDir),
            12 => Some(Self::ReadDir),
            13 => Some(Self::Remove),
            14 => Some(Self::MkDir),
            15 => Some(Self::RmDir),
            17 => Some(Self::Stat),
            18 => Some(Self::Rename),
            101 => Some(Self::Status),
            102 => Some(Self::Handle),
            103 => Some(Self::Data),
            104 => Some(Self::Name),
            105 => Some(Self::Attrs),
            _ => None,
        }
    }
}

/// A request issued by the client, correlated by id.
#[derive(Debug, Clone)]
pub enum Request {
    /// Open a file at `path` with the given flags and attributes.
    Open {
        /// Remote path
        path: String,
        /// Open flags (read/write/create/truncate)
        flags: FileOpenFlags,
        /// Initial attributes (permissions) for created files
        attrs: FileAttributes,
    },
    /// Release a remote handle.
    Close {
        /// Handle returned by a previous Open/OpenDir
        handle: Vec<u8>,
    },
    /// Read `length` bytes from `handle` at `offset`.
    Read {
        /// Open file handle
        handle: Vec<u8>,
        /// Absolute byte offset
        offset: u64,
        /// Maximum bytes to read
        length: u32,
    },
    /// Write `data` to `handle` at `offset`.
    Write {
        /// Open file handle
        handle: Vec<u8>,
        /// Absolute byte offset
        offset: u64,
        /// Bytes to write
        data: Vec<u8>,
    },
    /// Get attributes of the file at `path`.
    Stat {
        /// Remote path
        path: String,
    },
    /// Rename `old_path` to `new_path`.
    Rename {
        /// Current remote path
        old_path: String,
        /// New remote path
        new_path: String,
    },
    /// Remove the file at `path`.
    Remove {
        /// Remote path
        path: String,
    },
    /// Create a directory at `path`.
    MkDir {
        /// Remote path
        path: String,
        /// Directory attributes (permissions)
        attrs: FileAttributes,
    },
    /// Remove the directory at `path`.
    RmDir {
        /// Remote path
        path: String,
    },
    /// Open a directory for listing.
    OpenDir {
        /// Remote path
        path: String,
    },
    /// Read the next batch of entries from a directory handle.
    ReadDir {
        /// Open directory handle
        handle: Vec<u8>,
    },
}

impl Request {
    /// Returns the wire message type for this request.
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Open { .. } => MessageType::Open,
            Request::Close { .. } => MessageType::Close,
            Request::Read { .. } => MessageType::Read,
            Request::Write { .. } => MessageType::Write,
            Request::Stat { .. } => MessageType::Stat,
            Request::Rename { .. } => MessageType::Rename,
            Request::Remove { .. } => MessageType::Remove,
            Request::MkDir { .. } => MessageType::MkDir,
            Request::RmDir { .. } => MessageType::RmDir,
            Request::OpenDir { .. } => MessageType::OpenDir,
            Request::ReadDir { .. } => MessageType::ReadDir,
        }
    }

    /// Encodes this request as a complete frame carrying `id`.
    pub fn encode(&self, id: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&id.to_be_bytes());

        match self {
            Request::Open { path, flags, attrs } => {
                put_string(&mut body, path.as_bytes());
                body.extend_from_slice(&flags.0.to_be_bytes());
                body.extend_from_slice(&attrs.to_bytes());
            }
            Request::Close { handle } => {
                put_string(&mut body, handle);
            }
            Request::Read {
                handle,
                offset,
                length,
            } => {
                put_string(&mut body, handle);
                body.extend_from_slice(&offset.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
            }
            Request::Write {
                handle,
                offset,
                data,
            } => {
                put_string(&mut body, handle);
                body.extend_from_slice(&offset.to_be_bytes());
                put_string(&mut body, data);
            }
            Request::Stat { path }
            | Request::Remove { path }
            | Request::RmDir { path }
            | Request::OpenDir { path } => {
                put_string(&mut body, path.as_bytes());
            }
            Request::Rename { old_path, new_path } => {
                put_string(&mut body, old_path.as_bytes());
                put_string(&mut body, new_path.as_bytes());
            }
            Request::MkDir { path, attrs } => {
                put_string(&mut body, path.as_bytes());
                body.extend_from_slice(&attrs.to_bytes());
            }
            Request::ReadDir { handle } => {
                put_string(&mut body, handle);
            }
        }

        frame(self.message_type(), &body)
    }
}

/// A response from the server, correlated by id.
#[derive(Debug, Clone)]
pub enum Response {
    /// Status of a completed (or failed) request.
    Status {
        /// Numeric status code
        code: StatusCode,
        /// Server-provided message, may be empty
        message: String,
    },
    /// Opaque handle from Open/OpenDir.
    Handle(Vec<u8>),
    /// File data from Read.
    Data(Vec<u8>),
    /// Directory entries from ReadDir.
    Name(Vec<DirEntry>),
    /// Attributes from Stat.
    Attrs(FileAttributes),
}

impl Response {
    /// Encodes this response as a complete frame carrying `id`.
    pub fn encode(&self, id: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&id.to_be_bytes());

        let msg_type = match self {
            Response::Status { code, message } => {
                body.extend_from_slice(&(*code as u32).to_be_bytes());
                put_string(&mut body, message.as_bytes());
                put_string(&mut body, b""); // language tag
                MessageType::Status
            }
            Response::Handle(handle) => {
                put_string(&mut body, handle);
                MessageType::Handle
            }
            Response::Data(data) => {
                put_string(&mut body, data);
                MessageType::Data
            }
            Response::Name(entries) => {
                body.extend_from_slice(&(entries.len() as u32).to_be_bytes());
                for entry in entries {
                    put_string(&mut body, entry.filename.as_bytes());
                    put_string(&mut body, entry.longname.as_bytes());
                    body.extend_from_slice(&entry.attrs.to_bytes());
                }
                MessageType::Name
            }
            Response::Attrs(attrs) => {
                body.extend_from_slice(&attrs.to_bytes());
                MessageType::Attrs
            }
        };

        frame(msg_type, &body)
    }
}

/// Encodes the Init frame sent during the connect handshake.
pub fn encode_init() -> Vec<u8> {
    frame(MessageType::Init, &PROTOCOL_VERSION.to_be_bytes())
}

/// Encodes the Version frame a server answers the handshake with.
pub fn encode_version(version: u32) -> Vec<u8> {
    frame(MessageType::Version, &version.to_be_bytes())
}

/// Decodes a Version frame body (type byte onward), returning the version.
pub fn decode_version(body: &[u8]) -> SkiffResult<u32> {
    let mut reader = ByteReader::new(body);
    let msg_type = reader.read_u8()?;
    if MessageType::from_u8(msg_type) != Some(MessageType::Version) {
        return Err(SkiffError::Protocol(format!(
            "Expected VERSION, got type {}",
            msg_type
        )));
    }
    reader.read_u32()
}

/// Decodes a response frame body (type byte onward) into its id and payload.
pub fn decode_response(body: &[u8]) -> SkiffResult<(u32, Response)> {
    let mut reader = ByteReader::new(body);
    let raw_type = reader.read_u8()?;
    let msg_type = MessageType::from_u8(raw_type)
        .ok_or_else(|| SkiffError::Protocol(format!("Unknown message type: {}", raw_type)))?;
    let id = reader.read_u32()?;

    let response = match msg_type {
        MessageType::Status => {
            let raw_code = reader.read_u32()?;
            let code = StatusCode::from_u32(raw_code).ok_or_else(|| {
                SkiffError::Protocol(format!("Unknown status code: {}", raw_code))
            })?;
            let message = String::from_utf8_lossy(&reader.read_string()?).into_owned();
            // Trailing language tag is optional in practice
            let _ = reader.read_string();
            Response::Status { code, message }
        }
        MessageType::Handle => Response::Handle(reader.read_string()?),
        MessageType::Data => Response::Data(reader.read_string()?),
        MessageType::Name => {
            let count = reader.read_u32()? as usize;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let filename = String::from_utf8_lossy(&reader.read_string()?).into_owned();
                let longname = String::from_utf8_lossy(&reader.read_string()?).into_owned();
                let (attrs, consumed) = FileAttributes::from_bytes(reader.remaining())?;
                reader.advance(consumed)?;
                entries.push(DirEntry {
                    filename,
                    longname,
                    attrs,
                });
            }
            Response::Name(entries)
        }
        MessageType::Attrs => {
            let (attrs, _) = FileAttributes::from_bytes(reader.remaining())?;
            Response::Attrs(attrs)
        }
        other => {
            return Err(SkiffError::Protocol(format!(
                "Unexpected message kind in response position: {:?}",
                other
            )));
        }
    };

    Ok((id, response))
}

/// Decodes a request frame body (type byte onward) into its id and payload.
///
/// The server side of the codec; used by test fixtures and any embedded
/// responder.
pub fn decode_request(body: &[u8]) -> SkiffResult<(u32, Request)> {
    let mut reader = ByteReader::new(body);
    let raw_type = reader.read_u8()?;
    let msg_type = MessageType::from_u8(raw_type)
        .ok_or_else(|| SkiffError::Protocol(format!("Unknown message type: {}", raw_type)))?;
    let id = reader.read_u32()?;

    let request = match msg_type {
        MessageType::Open => {
            let path = reader.read_utf8()?;
            let flags = FileOpenFlags(reader.read_u32()?);
            let (attrs, consumed) = FileAttributes::from_bytes(reader.remaining())?;
            reader.advance(consumed)?;
            Request::Open { path, flags, attrs }
        }
        MessageType::Close => Request::Close {
            handle: reader.read_string()?,
        },
        MessageType::Read => Request::Read {
            handle: reader.read_string()?,
            offset: reader.read_u64()?,
            length: reader.read_u32()?,
        },
        MessageType::Write => Request::Write {
            handle: reader.read_string()?,
            offset: reader.read_u64()?,
            data: reader.read_string()?,
        },
        MessageType::Stat => Request::Stat {
            path: reader.read_utf8()?,
        },
        MessageType::Rename => Request::Rename {
            old_path: reader.read_utf8()?,
            new_path: reader.read_utf8()?,
        },
        MessageType::Remove => Request::Remove {
            path: reader.read_utf8()?,
        },
        MessageType::MkDir => {
            let path = reader.read_utf8()?;
            let (attrs, consumed) = FileAttributes::from_bytes(reader.remaining())?;
            reader.advance(consumed)?;
            Request::MkDir { path, attrs }
        }
        MessageType::RmDir => Request::RmDir {
            path: reader.read_utf8()?,
        },
        MessageType::OpenDir => Request::OpenDir {
            path: reader.read_utf8()?,
        },
        MessageType::ReadDir => Request::ReadDir {
            handle: reader.read_string()?,
        },
        other => {
            return Err(SkiffError::Protocol(format!(
                "Unexpected message kind in request position: {:?}",
                other
            )));
        }
    };

    Ok((id, request))
}

/// Wraps a message body in the length-prefixed frame format.
fn frame(msg_type: MessageType, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + body.len());
    let length = (body.len() + 1) as u32;
    buf.extend_from_slice(&length.to_be_bytes());
    buf.push(msg_type as u8);
    buf.extend_from_slice(body);
    buf
}

/// Appends a length-prefixed byte string.
fn put_string(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

/// Bounds-checked cursor over a frame body.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn advance(&mut self, count: usize) -> SkiffResult<()> {
        if self.data.len() - self.pos < count {
            return Err(SkiffError::Protocol("Frame truncated".to_string()));
        }
        self.pos += count;
        Ok(())
    }

    fn read_u8(&mut self) -> SkiffResult<u8> {
        if self.pos >= self.data.len() {
            return Err(SkiffError::Protocol("Frame truncated".to_string()));
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u32(&mut self) -> SkiffResult<u32> {
        if self.data.len() - self.pos < 4 {
            return Err(SkiffError::Protocol("Frame truncated".to_string()));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_be_bytes(raw))
    }

    fn read_u64(&mut self) -> SkiffResult<u64> {
        if self.data.len() - self.pos < 8 {
            return Err(SkiffError::Protocol("Frame truncated".to_string()));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_be_bytes(raw))
    }

    fn read_string(&mut self) -> SkiffResult<Vec<u8>> {
        let length = self.read_u32()? as usize;
        if self.data.len() - self.pos < length {
            return Err(SkiffError::Protocol("String overruns frame".to_string()));
        }
        let value = self.data[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(value)
    }

    fn read_utf8(&mut self) -> SkiffResult<String> {
        let raw = self.read_string()?;
        String::from_utf8(raw)
            .map_err(|_| SkiffError::Protocol("Path is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(1), Some(MessageType::Init));
        assert_eq!(MessageType::from_u8(101), Some(MessageType::Status));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_init_frame_layout() {
        let bytes = encode_init();

        // length (4) + type (1) + version (4) = 9 bytes
        assert_eq!(bytes.len(), 9);

        let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(length, 5);
        assert_eq!(bytes[4], MessageType::Init as u8);
    }

    #[test]
    fn test_version_decode() {
        let frame = encode_version(3);
        let version = decode_version(&frame[4..]).unwrap();
        assert_eq!(version, 3);
    }

    #[test]
    fn test_write_request_carries_id_and_offset() {
        let request = Request::Write {
            handle: b"h1".to_vec(),
            offset: 65536,
            data: b"chunk".to_vec(),
        };
        let bytes = request.encode(42);

        let (id, decoded) = decode_request(&bytes[4..]).unwrap();
        assert_eq!(id, 42);
        match decoded {
            Request::Write {
                handle,
                offset,
                data,
            } => {
                assert_eq!(handle, b"h1");
                assert_eq!(offset, 65536);
                assert_eq!(data, b"chunk");
            }
            other => panic!("Expected Write, got {:?}", other),
        }
    }

    #[test]
    fn test_status_response_decode() {
        let response = Response::Status {
            code: StatusCode::NoSuchFile,
            message: "No such file".to_string(),
        };
        let bytes = response.encode(7);

        let (id, decoded) = decode_response(&bytes[4..]).unwrap();
        assert_eq!(id, 7);
        match decoded {
            Response::Status { code, message } => {
                assert_eq!(code, StatusCode::NoSuchFile);
                assert_eq!(message, "No such file");
            }
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let body = vec![200u8, 0, 0, 0, 1];
        assert!(decode_response(&body).is_err());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let request = Request::Stat {
            path: "/srv/file.txt".to_string(),
        };
        let bytes = request.encode(1);
        assert!(decode_request(&bytes[4..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_request_in_response_position_rejected() {
        let request = Request::Stat {
            path: "/srv/file.txt".to_string(),
        };
        let bytes = request.encode(1);
        assert!(decode_response(&bytes[4..]).is_err());
    }
}
