//! The SWF outer container.
//!
//! An SWF file is a small header (signature, version, uncompressed length,
//! a bit-packed stage rectangle, frame rate and count) followed by a
//! sequence of framed tags. The compiler only materializes the handful of
//! tags a code-only movie needs (`FileAttributes`, `DoABC`, `SymbolClass`,
//! `ShowFrame`, `End`); anything else round-trips as an opaque blob so
//! library files with graphics still load.
//!
//! `CWS` payloads are zlib-compressed from byte 8; the declared length is
//! always the uncompressed payload plus the 8 header bytes.

use std::io::{Read, Write as _};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::abc::AbcFile;
use crate::error::{Error, Result};
use crate::stream::{BitReader, BitWriter};

pub const TAG_END: u16 = 0;
pub const TAG_SHOW_FRAME: u16 = 1;
pub const TAG_FILE_ATTRIBUTES: u16 = 69;
pub const TAG_SYMBOL_CLASS: u16 = 76;
pub const TAG_DO_ABC: u16 = 82;

/// Stage rectangle in twips. Bit-packed on the wire: a 5-bit field width,
/// then four fields of that many bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x_min: u32,
    pub x_max: u32,
    pub y_min: u32,
    pub y_max: u32,
}

impl Rect {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x_min: 0,
            x_max: width,
            y_min: 0,
            y_max: height,
        }
    }

    pub fn read(r: &mut BitReader<'_>) -> Result<Self> {
        let nbits = r.read_bits(5)?;
        Ok(Self {
            x_min: r.read_bits(nbits)?,
            x_max: r.read_bits(nbits)?,
            y_min: r.read_bits(nbits)?,
            y_max: r.read_bits(nbits)?,
        })
    }

    pub fn write(&self, w: &mut BitWriter) {
        let fields = [self.x_min, self.x_max, self.y_min, self.y_max];
        // Fields are signed on the wire; one extra bit keeps the sign clear.
        let nbits = fields
            .iter()
            .map(|v| 32 - v.leading_zeros() + 1)
            .max()
            .unwrap()
            .max(1);
        w.write_bits(nbits, 5);
        for field in fields {
            w.write_bits(field, nbits);
        }
        w.align();
    }
}

/// The FileAttributes tag. A code-only movie sets ActionScript3 and
/// UseNetwork; metadata is always declared absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    pub use_direct_blit: bool,
    pub use_gpu: bool,
    pub action_script3: bool,
    pub use_network: bool,
}

impl Default for FileAttributes {
    fn default() -> Self {
        Self {
            use_direct_blit: false,
            use_gpu: true,
            action_script3: true,
            use_network: true,
        }
    }
}

impl FileAttributes {
    fn read(r: &mut BitReader<'_>) -> Result<Self> {
        r.read_bits(1)?;
        let use_direct_blit = r.read_bits(1)? != 0;
        let use_gpu = r.read_bits(1)? != 0;
        let _has_metadata = r.read_bits(1)? != 0;
        let action_script3 = r.read_bits(1)? != 0;
        r.read_bits(2)?;
        let use_network = r.read_bits(1)? != 0;
        r.read_bits(24)?;
        Ok(Self {
            use_direct_blit,
            use_gpu,
            action_script3,
            use_network,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        let byte = (u8::from(self.use_direct_blit) << 6)
            | (u8::from(self.use_gpu) << 5)
            | (u8::from(self.action_script3) << 3)
            | u8::from(self.use_network);
        out.extend_from_slice(&[byte, 0, 0, 0]);
    }
}

/// A DoABC tag: flags, a name, and the embedded ABC file bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoAbc {
    pub flags: u32,
    pub name: String,
    pub data: Vec<u8>,
}

impl DoAbc {
    /// Wrap a serialized ABC file.
    pub fn from_abc(name: impl Into<String>, abc: &AbcFile) -> Result<Self> {
        Ok(Self {
            flags: 0,
            name: name.into(),
            data: abc.write()?,
        })
    }

    /// Decode the embedded ABC file.
    pub fn parse_abc(&self) -> Result<AbcFile> {
        AbcFile::read(&self.data)
    }

    fn read(r: &mut BitReader<'_>) -> Result<Self> {
        let flags = r.read_u32()?;
        let name = r.read_cstring()?;
        let mut data = Vec::new();
        while !r.is_empty() {
            data.push(r.read_u8()?);
        }
        Ok(Self { flags, name, data })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.data);
    }
}

/// One tag. Unrecognized codes are carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    End,
    ShowFrame,
    FileAttributes(FileAttributes),
    /// Symbol id → class name bindings; symbol 0 is the main timeline.
    SymbolClass(Vec<(u16, String)>),
    DoAbc(DoAbc),
    Unknown {
        code: u16,
        data: Vec<u8>,
    },
}

impl Tag {
    pub fn code(&self) -> u16 {
        match self {
            Tag::End => TAG_END,
            Tag::ShowFrame => TAG_SHOW_FRAME,
            Tag::FileAttributes(_) => TAG_FILE_ATTRIBUTES,
            Tag::SymbolClass(_) => TAG_SYMBOL_CLASS,
            Tag::DoAbc(_) => TAG_DO_ABC,
            Tag::Unknown { code, .. } => *code,
        }
    }

    fn read(r: &mut BitReader<'_>) -> Result<Self> {
        let mark = r.read_u16()?;
        let code = mark >> 6;
        let mut length = u32::from(mark & 0x3f);
        if length == 0x3f {
            length = r.read_u32()?;
        }
        let body = r.read_bytes(length as usize)?;
        let mut body_reader = BitReader::new(body);
        Ok(match code {
            TAG_END => Tag::End,
            TAG_SHOW_FRAME => Tag::ShowFrame,
            TAG_FILE_ATTRIBUTES => Tag::FileAttributes(FileAttributes::read(&mut body_reader)?),
            TAG_SYMBOL_CLASS => {
                let count = body_reader.read_u16()?;
                let mut assoc = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let id = body_reader.read_u16()?;
                    let name = body_reader.read_cstring()?;
                    assoc.push((id, name));
                }
                Tag::SymbolClass(assoc)
            }
            TAG_DO_ABC => Tag::DoAbc(DoAbc::read(&mut body_reader)?),
            _ => Tag::Unknown {
                code,
                data: body.to_vec(),
            },
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        match self {
            Tag::End | Tag::ShowFrame => {}
            Tag::FileAttributes(attrs) => attrs.write(&mut body),
            Tag::SymbolClass(assoc) => {
                body.extend_from_slice(&(assoc.len() as u16).to_le_bytes());
                for (id, name) in assoc {
                    body.extend_from_slice(&id.to_le_bytes());
                    body.extend_from_slice(name.as_bytes());
                    body.push(0);
                }
            }
            Tag::DoAbc(doabc) => doabc.write(&mut body),
            Tag::Unknown { data, .. } => body.extend_from_slice(data),
        }
        let code = self.code();
        if body.len() > 62 {
            out.extend_from_slice(&((code << 6) | 0x3f).to_le_bytes());
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        } else {
            out.extend_from_slice(&((code << 6) | body.len() as u16).to_le_bytes());
        }
        out.extend_from_slice(&body);
    }
}

/// Header fields of a movie. The frame rate is fixed-point 8.8.
#[derive(Debug, Clone)]
pub struct Header {
    pub compressed: bool,
    pub version: u8,
    pub frame_size: Rect,
    pub frame_rate: u16,
    pub frame_count: u16,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            compressed: true,
            version: 10,
            frame_size: Rect::new(10000, 7500),
            frame_rate: 15 << 8,
            frame_count: 1,
        }
    }
}

/// A whole SWF movie: header plus tag sequence.
#[derive(Debug, Clone)]
pub struct Movie {
    pub header: Header,
    pub tags: Vec<Tag>,
}

impl Movie {
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::malformed("swf", "file shorter than its header"));
        }
        let compressed = match &data[0..3] {
            b"FWS" => false,
            b"CWS" => true,
            sig => {
                return Err(Error::malformed(
                    "swf",
                    format!("bad signature {sig:02x?}"),
                ))
            }
        };
        let version = data[3];
        let file_length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let decompressed;
        let body;
        if compressed {
            let mut buf = Vec::new();
            ZlibDecoder::new(&data[8..])
                .read_to_end(&mut buf)
                .map_err(|e| Error::malformed("swf", format!("zlib: {e}")))?;
            if buf.len() + 8 != file_length as usize {
                return Err(Error::malformed(
                    "swf",
                    format!(
                        "declared length {} does not match payload {}",
                        file_length,
                        buf.len() + 8
                    ),
                ));
            }
            decompressed = buf;
            body = decompressed.as_slice();
        } else {
            body = &data[8..];
        }

        let mut r = BitReader::new(body);
        let frame_size = Rect::read(&mut r)?;
        let frame_rate = r.read_u16()?;
        let frame_count = r.read_u16()?;
        let mut tags = Vec::new();
        while !r.is_empty() {
            let tag = Tag::read(&mut r)?;
            let end = tag == Tag::End;
            tags.push(tag);
            if end {
                break;
            }
        }
        Ok(Self {
            header: Header {
                compressed,
                version,
                frame_size,
                frame_rate,
                frame_count,
            },
            tags,
        })
    }

    /// Serialize; the payload is always zlib-compressed.
    pub fn write(&self) -> Result<Vec<u8>> {
        let mut content = BitWriter::new();
        self.header.frame_size.write(&mut content);
        content.write_u16(self.header.frame_rate);
        content.write_u16(self.header.frame_count);
        let mut content = content.into_bytes();
        for tag in &self.tags {
            tag.write(&mut content);
        }
        if self.tags.last() != Some(&Tag::End) {
            Tag::End.write(&mut content);
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"CWS");
        out.push(self.header.version);
        out.extend_from_slice(&(content.len() as u32 + 8).to_le_bytes());
        let mut encoder = ZlibEncoder::new(&mut out, Compression::default());
        encoder.write_all(&content)?;
        encoder.finish()?;
        Ok(out)
    }

    /// Every DoABC tag in the movie, in order.
    pub fn abc_tags(&self) -> impl Iterator<Item = &DoAbc> {
        self.tags.iter().filter_map(|tag| match tag {
            Tag::DoAbc(doabc) => Some(doabc),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BitWriter;

    #[test]
    fn rect_roundtrips() {
        let rect = Rect::new(11000, 8000);
        let mut w = BitWriter::new();
        rect.write(&mut w);
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        assert_eq!(Rect::read(&mut r).unwrap(), rect);
    }

    #[test]
    fn movie_roundtrips_through_compression() {
        let movie = Movie {
            header: Header {
                frame_size: Rect::new(600 * 20, 400 * 20),
                frame_rate: 30 << 8,
                ..Header::default()
            },
            tags: vec![
                Tag::FileAttributes(FileAttributes::default()),
                Tag::DoAbc(DoAbc {
                    flags: 0,
                    name: "frame1".into(),
                    data: vec![1, 2, 3, 4, 5],
                }),
                Tag::SymbolClass(vec![(0, "Main".into())]),
                Tag::ShowFrame,
                Tag::End,
            ],
        };
        let bytes = movie.write().unwrap();
        let back = Movie::read(&bytes).unwrap();
        assert_eq!(back.header.frame_size, movie.header.frame_size);
        assert_eq!(back.header.frame_rate, 30 << 8);
        assert_eq!(back.tags, movie.tags);
    }

    #[test]
    fn declared_length_is_payload_plus_eight() {
        let movie = Movie {
            header: Header::default(),
            tags: vec![Tag::ShowFrame, Tag::End],
        };
        let bytes = movie.write().unwrap();
        let declared = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut payload = Vec::new();
        ZlibDecoder::new(&bytes[8..])
            .read_to_end(&mut payload)
            .unwrap();
        assert_eq!(declared as usize, payload.len() + 8);
    }

    #[test]
    fn long_tags_use_the_extended_header() {
        let tag = Tag::Unknown {
            code: 77,
            data: vec![0xaa; 100],
        };
        let mut out = Vec::new();
        tag.write(&mut out);
        let mark = u16::from_le_bytes([out[0], out[1]]);
        assert_eq!(mark >> 6, 77);
        assert_eq!(mark & 0x3f, 0x3f);
        let len = u32::from_le_bytes([out[2], out[3], out[4], out[5]]);
        assert_eq!(len, 100);
    }

    #[test]
    fn unknown_tags_pass_through() {
        let movie = Movie {
            header: Header::default(),
            tags: vec![
                Tag::Unknown {
                    code: 9,
                    data: vec![0xff, 0xee, 0xdd],
                },
                Tag::End,
            ],
        };
        let bytes = movie.write().unwrap();
        let back = Movie::read(&bytes).unwrap();
        assert_eq!(back.tags, movie.tags);
    }
}
