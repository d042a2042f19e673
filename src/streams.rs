//! Byte-stream protocols.
//!
//! Encoded audio reaches the engine through a [`ByteStream`]: a seekable
//! (or not) byte source resolved from a `(protocol, path, options)` triple.
//! The crate ships the `file` protocol and in-memory streams; user streams
//! enter through [`StreamHandleObject`], which wraps a stream in a handle so
//! it can be passed to buffer and generator factories.

use crate::error::{Result, SonanceError};
use crate::object::{BaseObject, ObjectHeader, ObjectType};
use crate::properties::{Property, PropertyValue};
use std::any::Any;
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A source of encoded bytes. `Read`/`Seek` do the transport; the two
/// extra methods describe what the transport can actually do, which
/// decoders use to decide whether looping by seek is possible.
pub trait ByteStream: Read + Seek + Send + Sync {
    /// Whether `seek` works. Non-seekable streams still implement `Seek`
    /// but fail at runtime.
    fn is_seekable(&self) -> bool;

    /// Total size in bytes, when known.
    fn size(&self) -> Option<u64>;
}

/// `file://` protocol: a plain file on disk.
pub struct FileStream {
    file: File,
    len: u64,
}

impl FileStream {
    pub fn open(path: &str) -> Result<Self> {
        let file = File::open(Path::new(path))?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for FileStream {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ByteStream for FileStream {
    fn is_seekable(&self) -> bool {
        true
    }

    fn size(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// An owned in-memory blob, used by buffer-from-encoded-data.
pub struct MemoryStream {
    cursor: Cursor<Vec<u8>>,
}

impl MemoryStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl ByteStream for MemoryStream {
    fn is_seekable(&self) -> bool {
        true
    }

    fn size(&self) -> Option<u64> {
        Some(self.cursor.get_ref().len() as u64)
    }
}

/// Resolve a `(protocol, path, options)` triple to an open stream.
///
/// `options` is reserved for protocol-specific parameters; the built-in
/// protocols ignore it.
pub fn open_stream(protocol: &str, path: &str, _options: &str) -> Result<Box<dyn ByteStream>> {
    match protocol {
        "file" => Ok(Box::new(FileStream::open(path)?)),
        other => Err(SonanceError::UnknownProtocol(other.to_string())),
    }
}

/// File-extension hint for decoders, derived from a path.
pub(crate) fn extension_hint(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// A byte stream wrapped in a handle, so user code can hand the same stream
/// to a buffer or streaming-generator factory. The stream is consumed by
/// whichever factory uses it first.
pub struct StreamHandleObject {
    header: ObjectHeader,
    stream: Mutex<Option<Box<dyn ByteStream>>>,
    /// Extension hint captured at creation, forwarded to the decoder.
    hint: Option<String>,
}

impl StreamHandleObject {
    pub fn new(stream: Box<dyn ByteStream>, hint: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            header: ObjectHeader::new(),
            stream: Mutex::new(Some(stream)),
            hint,
        })
    }

    /// Take the stream out; fails if it was already consumed.
    pub fn take(&self) -> Result<(Box<dyn ByteStream>, Option<String>)> {
        self.stream
            .lock()
            .unwrap()
            .take()
            .map(|s| (s, self.hint.clone()))
            .ok_or_else(|| {
                SonanceError::Decoder("stream handle was already consumed".to_string())
            })
    }
}

impl BaseObject for StreamHandleObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::StreamHandle
    }

    fn set_property(&self, property: Property, _value: PropertyValue) -> Result<()> {
        Err(crate::object::unknown_property(self.object_type(), property))
    }

    fn get_property(&self, property: Property) -> Result<PropertyValue> {
        Err(crate::object::unknown_property(self.object_type(), property))
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
