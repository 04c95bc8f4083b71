//! Actor memory file format.
//!
//! Every actor file is a little-endian `u32` record count followed by the
//! records. A record starts with a `u16` tag:
//!
//! | tag | body |
//! |-----|------|
//! | 1 (plain) | speaker, content, `u16` token count, timestamp |
//! | 2 (eidet) | speaker, content, timestamp, `u16` token count `n`, K bytes, V bytes |
//!
//! Strings are a `u32` byte length followed by UTF-8. Eidet K data is
//! `n * n_layer * k_row_bytes` bytes, layer after layer, each layer
//! token-major. V data is `n * n_layer * v_row_bytes` bytes, layer after
//! layer, each layer in the transposed cache layout.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use kvlore_core::{Error, Result};
use kvlore_tensor::{KvGeometry, KvSnapshot};
use tracing::debug;

use crate::memory::ConversationMemory;

const TAG_PLAIN: u16 = 1;
const TAG_EIDET: u16 = 2;

/// Write memories in file format to `out`.
pub fn encode<'a, W, I>(out: &mut W, geometry: &KvGeometry, memories: I) -> Result<()>
where
    W: Write,
    I: ExactSizeIterator<Item = &'a ConversationMemory>,
{
    let count = u32::try_from(memories.len())
        .map_err(|_| Error::persist("too many records for one file"))?;
    out.write_all(&count.to_le_bytes())?;

    for memory in memories {
        match memory {
            ConversationMemory::Plain(m) => {
                out.write_all(&TAG_PLAIN.to_le_bytes())?;
                write_str(out, &m.speaker)?;
                write_str(out, &m.content)?;
                out.write_all(&token_count(m.n_tokens)?.to_le_bytes())?;
                write_str(out, &m.timestamp)?;
            }
            ConversationMemory::Eidet(m) => {
                if !m.kv.matches(geometry) {
                    return Err(Error::persist(format!(
                        "eidet of {} tokens does not match cache geometry",
                        m.kv.n_tokens
                    )));
                }
                out.write_all(&TAG_EIDET.to_le_bytes())?;
                write_str(out, &m.speaker)?;
                write_str(out, &m.content)?;
                write_str(out, &m.timestamp)?;
                out.write_all(&token_count(m.kv.n_tokens)?.to_le_bytes())?;
                for layer in &m.kv.k {
                    out.write_all(layer)?;
                }
                for layer in &m.kv.v {
                    out.write_all(layer)?;
                }
            }
        }
    }
    Ok(())
}

/// Read memories in file format from `input`.
pub fn decode<R: Read>(input: &mut R, geometry: &KvGeometry) -> Result<Vec<ConversationMemory>> {
    let count = read_u32(input)?;
    let mut memories = Vec::with_capacity(count.min(4096) as usize);

    for index in 0..count {
        let tag = read_u16(input)?;
        let memory = match tag {
            TAG_PLAIN => {
                let speaker = read_str(input)?;
                let content = read_str(input)?;
                let n_tokens = read_u16(input)? as usize;
                let timestamp = read_str(input)?;
                ConversationMemory::plain(speaker, content, n_tokens, timestamp)
            }
            TAG_EIDET => {
                let speaker = read_str(input)?;
                let content = read_str(input)?;
                let timestamp = read_str(input)?;
                let n = read_u16(input)? as usize;
                let k = read_layers(input, geometry.n_layer, n * geometry.k_row_bytes())?;
                let v = read_layers(input, geometry.n_layer, n * geometry.v_row_bytes())?;
                ConversationMemory::eidet(
                    speaker,
                    content,
                    timestamp,
                    KvSnapshot { n_tokens: n, k, v },
                )
            }
            other => {
                return Err(Error::persist(format!(
                    "unknown record tag {other} at record {index}"
                )))
            }
        };
        memories.push(memory);
    }
    Ok(memories)
}

/// Read an actor file.
pub fn read_file(path: &Path, geometry: &KvGeometry) -> Result<Vec<ConversationMemory>> {
    let shown = path.display().to_string();
    let file = File::open(path)
        .map_err(|e| Error::io_with_path("failed to open actor file", shown.clone(), e))?;
    let memories = decode(&mut BufReader::new(file), geometry).map_err(|e| match e {
        Error::Io {
            source: Some(source),
            ..
        } => Error::io_with_path("failed to read actor file", shown.clone(), source),
        other => other.with_path(shown.clone()),
    })?;
    debug!(path = %shown, records = memories.len(), "actor file read");
    Ok(memories)
}

/// Write an actor file, replacing any existing one.
pub fn write_file<'a, I>(path: &Path, geometry: &KvGeometry, memories: I) -> Result<()>
where
    I: ExactSizeIterator<Item = &'a ConversationMemory>,
{
    let shown = path.display().to_string();
    let file = File::create(path)
        .map_err(|e| Error::io_with_path("failed to create actor file", shown.clone(), e))?;
    let mut out = BufWriter::new(file);
    let records = memories.len();
    encode(&mut out, geometry, memories)
        .and_then(|_| out.flush().map_err(Error::from))
        .map_err(|e| match e {
            Error::Io {
                source: Some(source),
                ..
            } => Error::io_with_path("failed to write actor file", shown.clone(), source),
            other => other.with_path(shown.clone()),
        })?;
    debug!(path = %shown, records, "actor file written");
    Ok(())
}

fn token_count(n: usize) -> Result<u16> {
    u16::try_from(n).map_err(|_| Error::persist(format!("token count {n} exceeds u16")))
}

fn write_str<W: Write>(out: &mut W, s: &str) -> Result<()> {
    let len = u32::try_from(s.len()).map_err(|_| Error::persist("string longer than u32"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(s.as_bytes())?;
    Ok(())
}

fn read_u16<R: Read>(input: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_bytes<R: Read>(input: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    input.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(Error::from(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, found {}", buf.len()),
        )));
    }
    Ok(buf)
}

fn read_str<R: Read>(input: &mut R) -> Result<String> {
    let len = read_u32(input)? as usize;
    let bytes = read_bytes(input, len)?;
    String::from_utf8(bytes).map_err(|e| Error::persist(format!("invalid UTF-8 string: {e}")))
}

fn read_layers<R: Read>(input: &mut R, n_layer: usize, per_layer: usize) -> Result<Vec<Arc<[u8]>>> {
    (0..n_layer)
        .map(|_| read_bytes(input, per_layer).map(Arc::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const GEOMETRY: KvGeometry = KvGeometry {
        n_layer: 2,
        n_embd_k: 4,
        n_embd_v: 4,
        elsize: 2,
    };

    fn eidet(n: usize, seed: u8) -> ConversationMemory {
        let layer = |salt: u8| -> Arc<[u8]> {
            (0..n * 8).map(|i| seed ^ salt ^ i as u8).collect::<Vec<_>>().into()
        };
        ConversationMemory::eidet(
            "alice",
            "the kettle is on",
            "2024-05-01 10:00",
            KvSnapshot {
                n_tokens: n,
                k: vec![layer(1), layer(2)],
                v: vec![layer(3), layer(4)],
            },
        )
    }

    #[test]
    fn test_plain_record_layout() {
        let memories = vec![ConversationMemory::plain("bo", "hi", 3, "t")];
        let mut bytes = Vec::new();
        encode(&mut bytes, &GEOMETRY, memories.iter()).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&1u16.to_le_bytes());
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"bo");
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"hi");
        expected.extend_from_slice(&3u16.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(b"t");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_eidet_stride() {
        let memories = vec![eidet(3, 9)];
        let mut bytes = Vec::new();
        encode(&mut bytes, &GEOMETRY, memories.iter()).unwrap();

        let header = 4 + 2 + (4 + 5) + (4 + 16) + (4 + 16) + 2;
        let stride = GEOMETRY.n_layer * GEOMETRY.k_row_bytes();
        assert_eq!(bytes.len(), header + 2 * 3 * stride);

        let back = decode(&mut Cursor::new(bytes), &GEOMETRY).unwrap();
        assert_eq!(back, memories);
    }

    #[test]
    fn test_mixed_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.hst");
        let memories = vec![
            ConversationMemory::plain("alice", "good morning", 4, "09:00"),
            eidet(2, 1),
            ConversationMemory::plain("bob", "", 0, "09:01"),
            eidet(1, 2),
        ];
        write_file(&path, &GEOMETRY, memories.iter()).unwrap();
        let back = read_file(&path, &GEOMETRY).unwrap();
        assert_eq!(back, memories);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&7u16.to_le_bytes());
        let err = decode(&mut Cursor::new(bytes), &GEOMETRY).unwrap_err();
        assert_eq!(err.error_code(), "PERSIST_ERROR");
        assert!(err.to_string().contains("unknown record tag 7"));
    }

    #[test]
    fn test_short_read_is_io_error() {
        let memories = vec![eidet(2, 5)];
        let mut bytes = Vec::new();
        encode(&mut bytes, &GEOMETRY, memories.iter()).unwrap();
        bytes.truncate(bytes.len() - 3);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.rec");
        std::fs::write(&path, &bytes).unwrap();
        let err = read_file(&path, &GEOMETRY).unwrap_err();
        assert_eq!(err.error_code(), "IO_ERROR");
        assert!(err.to_string().contains("cut.rec"));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_file(&dir.path().join("nobody.def"), &GEOMETRY).unwrap_err();
        assert!(err.to_string().contains("nobody.def"));
    }

    #[test]
    fn test_oversized_token_count_rejected() {
        let memories = vec![ConversationMemory::plain("a", "b", 70_000, "t")];
        let err = encode(&mut Vec::new(), &GEOMETRY, memories.iter()).unwrap_err();
        assert_eq!(err.error_code(), "PERSIST_ERROR");
    }
}
