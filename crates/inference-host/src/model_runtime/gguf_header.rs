//! Reads the key/value header of a GGUF file without touching tensor data.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

const GGUF_MAGIC: u32 = 0x4655_4747; // "GGUF" little-endian
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;
const MAX_KV_COUNT: u64 = 1 << 20;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GgufSummary {
    pub version: u32,
    pub tensor_count: u64,
    pub architecture: Option<String>,
    pub name: Option<String>,
    pub context_length: Option<u64>,
    pub embedding_length: Option<u64>,
    pub vocab_size: Option<u64>,
    pub file_type: Option<u64>,
}

/// A scalar we care about, or `Skipped` for everything else.
enum Value {
    Uint(u64),
    Int(i64),
    Str(String),
    ArrayLen(u64),
    Skipped,
}

impl Value {
    fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }
}

pub fn read_summary(path: &Path) -> io::Result<GgufSummary> {
    let mut r = BufReader::new(File::open(path)?);

    if read_u32(&mut r)? != GGUF_MAGIC {
        return Err(invalid("not a GGUF file"));
    }
    let version = read_u32(&mut r)?;
    if version < 2 {
        return Err(invalid("GGUF v1 headers are not supported"));
    }
    let tensor_count = read_u64(&mut r)?;
    let kv_count = read_u64(&mut r)?;
    if kv_count > MAX_KV_COUNT {
        return Err(invalid("implausible metadata count"));
    }

    let mut summary = GgufSummary { version, tensor_count, ..Default::default() };
    // Per-architecture keys may precede general.architecture.
    let mut context_by_arch: Vec<(String, u64)> = Vec::new();
    let mut embedding_by_arch: Vec<(String, u64)> = Vec::new();

    for _ in 0..kv_count {
        let key = read_string(&mut r)?;
        let ty = read_u32(&mut r)?;
        let value = read_value(&mut r, ty)?;

        match key.as_str() {
            "general.architecture" => {
                if let Value::Str(s) = value {
                    summary.architecture = Some(s);
                }
            }
            "general.name" => {
                if let Value::Str(s) = value {
                    summary.name = Some(s);
                }
            }
            "general.file_type" => summary.file_type = value.as_u64(),
            "tokenizer.ggml.tokens" => {
                if let Value::ArrayLen(n) = value {
                    summary.vocab_size = Some(n);
                }
            }
            k => {
                if let Some(arch) = k.strip_suffix(".context_length") {
                    if let Some(v) = value.as_u64() {
                        context_by_arch.push((arch.to_string(), v));
                    }
                } else if let Some(arch) = k.strip_suffix(".embedding_length") {
                    if let Some(v) = value.as_u64() {
                        embedding_by_arch.push((arch.to_string(), v));
                    }
                }
            }
        }
    }

    if let Some(arch) = summary.architecture.as_deref() {
        summary.context_length = context_by_arch.iter().find(|(a, _)| a == arch).map(|(_, v)| *v);
        summary.embedding_length = embedding_by_arch.iter().find(|(a, _)| a == arch).map(|(_, v)| *v);
    }
    Ok(summary)
}

fn read_value<R: Read>(r: &mut R, ty: u32) -> io::Result<Value> {
    Ok(match ty {
        0 => Value::Uint(read_n::<R, 1>(r)?[0] as u64),
        1 => Value::Int(read_n::<R, 1>(r)?[0] as i8 as i64),
        2 => Value::Uint(u16::from_le_bytes(read_n(r)?) as u64),
        3 => Value::Int(i16::from_le_bytes(read_n(r)?) as i64),
        4 => Value::Uint(read_u32(r)? as u64),
        5 => Value::Int(i32::from_le_bytes(read_n(r)?) as i64),
        6 => {
            read_n::<R, 4>(r)?;
            Value::Skipped
        }
        7 => {
            read_n::<R, 1>(r)?;
            Value::Skipped
        }
        8 => Value::Str(read_string(r)?),
        9 => {
            let elem_ty = read_u32(r)?;
            let len = read_u64(r)?;
            for _ in 0..len {
                skip_value(r, elem_ty)?;
            }
            Value::ArrayLen(len)
        }
        10 => Value::Uint(read_u64(r)?),
        11 => Value::Int(i64::from_le_bytes(read_n(r)?)),
        12 => {
            read_n::<R, 8>(r)?;
            Value::Skipped
        }
        other => return Err(invalid(&format!("unknown GGUF value type {}", other))),
    })
}

fn skip_value<R: Read>(r: &mut R, ty: u32) -> io::Result<()> {
    match ty {
        0 | 1 | 7 => skip(r, 1),
        2 | 3 => skip(r, 2),
        4 | 5 | 6 => skip(r, 4),
        10 | 11 | 12 => skip(r, 8),
        8 => {
            let len = read_u64(r)?;
            if len > MAX_STRING_LEN {
                return Err(invalid("string too long"));
            }
            skip(r, len)
        }
        9 => {
            let elem_ty = read_u32(r)?;
            let len = read_u64(r)?;
            for _ in 0..len {
                skip_value(r, elem_ty)?;
            }
            Ok(())
        }
        other => Err(invalid(&format!("unknown GGUF value type {}", other))),
    }
}

fn skip<R: Read>(r: &mut R, n: u64) -> io::Result<()> {
    let copied = io::copy(&mut r.take(n), &mut io::sink())?;
    if copied != n {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    Ok(())
}

fn read_n<R: Read, const N: usize>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_n(r)?))
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_n(r)?))
}

fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = read_u64(r)?;
    if len > MAX_STRING_LEN {
        return Err(invalid("string too long"));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct Builder(Vec<u8>, u64);

    impl Builder {
        fn new() -> Self {
            Builder(Vec::new(), 0)
        }

        fn string(buf: &mut Vec<u8>, s: &str) {
            buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }

        fn kv_str(mut self, key: &str, value: &str) -> Self {
            Self::string(&mut self.0, key);
            self.0.extend_from_slice(&8u32.to_le_bytes());
            Self::string(&mut self.0, value);
            self.1 += 1;
            self
        }

        fn kv_u32(mut self, key: &str, value: u32) -> Self {
            Self::string(&mut self.0, key);
            self.0.extend_from_slice(&4u32.to_le_bytes());
            self.0.extend_from_slice(&value.to_le_bytes());
            self.1 += 1;
            self
        }

        fn kv_f32(mut self, key: &str, value: f32) -> Self {
            Self::string(&mut self.0, key);
            self.0.extend_from_slice(&6u32.to_le_bytes());
            self.0.extend_from_slice(&value.to_le_bytes());
            self.1 += 1;
            self
        }

        fn kv_str_array(mut self, key: &str, items: &[&str]) -> Self {
            Self::string(&mut self.0, key);
            self.0.extend_from_slice(&9u32.to_le_bytes());
            self.0.extend_from_slice(&8u32.to_le_bytes());
            self.0.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                Self::string(&mut self.0, item);
            }
            self.1 += 1;
            self
        }

        fn write(self) -> NamedTempFile {
            let mut f = NamedTempFile::new().unwrap();
            f.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
            f.write_all(&3u32.to_le_bytes()).unwrap();
            f.write_all(&0u64.to_le_bytes()).unwrap();
            f.write_all(&self.1.to_le_bytes()).unwrap();
            f.write_all(&self.0).unwrap();
            f.flush().unwrap();
            f
        }
    }

    #[test]
    fn test_reads_architecture_keys() {
        let f = Builder::new()
            .kv_u32("llama.context_length", 4096)
            .kv_str("general.architecture", "llama")
            .kv_str("general.name", "tiny")
            .kv_f32("llama.rope.freq_base", 10000.0)
            .kv_u32("llama.embedding_length", 2048)
            .kv_str_array("tokenizer.ggml.tokens", &["<s>", "</s>", "a"])
            .kv_u32("general.file_type", 15)
            .write();

        let s = read_summary(f.path()).unwrap();
        assert_eq!(s.version, 3);
        assert_eq!(s.architecture.as_deref(), Some("llama"));
        assert_eq!(s.name.as_deref(), Some("tiny"));
        assert_eq!(s.context_length, Some(4096));
        assert_eq!(s.embedding_length, Some(2048));
        assert_eq!(s.vocab_size, Some(3));
        assert_eq!(s.file_type, Some(15));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"NOPE0000").unwrap();
        let err = read_summary(f.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_header_errors() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        f.write_all(&3u32.to_le_bytes()).unwrap();
        assert!(read_summary(f.path()).is_err());
    }
}
