//! The `.npy` tensor-blob format (versions 1.0, 2.0 and 3.0).
//!
//! Only C-ordered arrays are accepted. Big-endian payloads are swapped to
//! little-endian on decode; encoding always writes little-endian version 1.0
//! headers unless the header outgrows 64 KiB.

use bytes::{BufMut, Bytes, BytesMut};

use modelgate_common::{checked_byte_len, checked_element_count, DType, Tensor};

use crate::error::{GatewayError, Result};

pub const CONTENT_TYPE: &str = "application/x-npy";

const MAGIC: &[u8] = b"\x93NUMPY";

/// Largest `<U0` array accepted. Those carry no payload, so the body limit
/// does not bound them.
const MAX_EMPTY_STRINGS: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Descr {
    Numeric(DType, ByteOrder),
    /// Fixed-width UTF-32 strings of `n` code points.
    Unicode(usize, ByteOrder),
}

fn bad(msg: impl Into<String>) -> GatewayError {
    GatewayError::BadRequest(format!("malformed npy body: {}", msg.into()))
}

/// Decode one `.npy` array into a tensor.
pub fn decode(data: &[u8]) -> Result<Tensor> {
    if data.len() < 10 || &data[..6] != MAGIC {
        return Err(bad("missing magic string"));
    }
    let major = data[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([data[8], data[9]]) as usize, 10),
        2 | 3 => {
            if data.len() < 12 {
                return Err(bad("truncated header length"));
            }
            (
                u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize,
                12,
            )
        }
        v => return Err(bad(format!("unsupported version {}", v))),
    };
    let header_end = header_start + header_len;
    if data.len() < header_end {
        return Err(bad("truncated header"));
    }
    let header = std::str::from_utf8(&data[header_start..header_end])
        .map_err(|_| bad("header is not valid text"))?;
    let (descr, fortran_order, shape) = parse_header(header)?;
    if fortran_order {
        return Err(bad("fortran-ordered arrays are not supported"));
    }

    let payload = &data[header_end..];
    let count = checked_element_count(&shape).map_err(|e| bad(e.to_string()))?;
    match descr {
        Descr::Numeric(dtype, order) => {
            let width = dtype.width().ok_or_else(|| bad("non-numeric descr"))?;
            let expected = checked_byte_len(&shape, width).map_err(|e| bad(e.to_string()))?;
            if payload.len() != expected {
                return Err(GatewayError::SchemaMismatch(format!(
                    "npy payload is {} bytes but shape {:?} of {} requires {}",
                    payload.len(),
                    shape,
                    dtype,
                    expected
                )));
            }
            let payload = if order == ByteOrder::Big && width > 1 {
                swap_bytes(payload, width)
            } else {
                payload.to_vec()
            };
            Ok(Tensor::new(dtype, shape, payload)?)
        }
        Descr::Unicode(chars, order) => {
            let expected = chars
                .checked_mul(4)
                .and_then(|width| checked_byte_len(&shape, width).ok())
                .ok_or_else(|| bad(format!("shape {:?} of <U{} is too large", shape, chars)))?;
            if payload.len() != expected {
                return Err(GatewayError::SchemaMismatch(format!(
                    "npy payload is {} bytes but shape {:?} of <U{} requires {}",
                    payload.len(),
                    shape,
                    chars,
                    expected
                )));
            }
            if chars == 0 {
                if count > MAX_EMPTY_STRINGS {
                    return Err(bad(format!(
                        "<U0 array of {} elements exceeds the limit of {}",
                        count, MAX_EMPTY_STRINGS
                    )));
                }
                return Ok(Tensor::from_strings(shape, vec![String::new(); count])?);
            }
            let mut values = Vec::with_capacity(count);
            for element in payload.chunks(chars * 4).take(count) {
                let mut s = String::with_capacity(chars);
                for unit in element.chunks_exact(4) {
                    let code = match order {
                        ByteOrder::Big => u32::from_be_bytes([unit[0], unit[1], unit[2], unit[3]]),
                        _ => u32::from_le_bytes([unit[0], unit[1], unit[2], unit[3]]),
                    };
                    if code == 0 {
                        break;
                    }
                    s.push(char::from_u32(code).ok_or_else(|| bad("invalid code point"))?);
                }
                values.push(s);
            }
            Ok(Tensor::from_strings(shape, values)?)
        }
    }
}

fn swap_bytes(payload: &[u8], width: usize) -> Vec<u8> {
    payload
        .chunks_exact(width)
        .flat_map(|chunk| chunk.iter().rev().copied())
        .collect()
}

/// Parse the Python dict literal header, e.g.
/// `{'descr': '<f4', 'fortran_order': False, 'shape': (2, 3), }`.
fn parse_header(header: &str) -> Result<(Descr, bool, Vec<usize>)> {
    let descr = dict_entry(header, "descr")?;
    let descr = descr.trim().trim_matches(|c| c == '\'' || c == '"');
    let descr = parse_descr(descr)?;

    let fortran = dict_entry(header, "fortran_order")?;
    let fortran_order = match fortran.trim() {
        "False" => false,
        "True" => true,
        other => return Err(bad(format!("bad fortran_order '{}'", other))),
    };

    let shape = dict_entry(header, "shape")?;
    let inner = shape
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| bad("shape is not a tuple"))?;
    let shape = inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| bad(format!("bad extent '{}'", s))))
        .collect::<Result<Vec<_>>>()?;

    Ok((descr, fortran_order, shape))
}

/// Raw text of one value in the header dict.
fn dict_entry<'a>(header: &'a str, key: &str) -> Result<&'a str> {
    let quoted = [format!("'{}'", key), format!("\"{}\"", key)];
    let start = quoted
        .iter()
        .find_map(|k| header.find(k.as_str()).map(|i| i + k.len()))
        .ok_or_else(|| bad(format!("header has no '{}'", key)))?;
    let rest = header[start..]
        .trim_start()
        .strip_prefix(':')
        .ok_or_else(|| bad(format!("'{}' has no value", key)))?
        .trim_start();

    let end = if rest.starts_with('(') {
        rest.find(')').map(|i| i + 1)
    } else if let Some(quote) = rest.chars().next().filter(|c| *c == '\'' || *c == '"') {
        rest[1..].find(quote).map(|i| i + 2)
    } else {
        rest.find([',', '}'])
    };
    end.map(|end| &rest[..end])
        .ok_or_else(|| bad(format!("unterminated value for '{}'", key)))
}

fn parse_descr(descr: &str) -> Result<Descr> {
    let mut chars = descr.chars();
    let order = match chars.next() {
        Some('<') | Some('=') => ByteOrder::Little,
        Some('>') | Some('!') => ByteOrder::Big,
        Some('|') => ByteOrder::NotApplicable,
        _ => return Err(bad(format!("unsupported descr '{}'", descr))),
    };
    let code = &descr[1..];
    if let Some(n) = code.strip_prefix('U') {
        let n = n.parse().map_err(|_| bad(format!("bad descr '{}'", descr)))?;
        return Ok(Descr::Unicode(n, order));
    }
    let dtype = match code {
        "b1" => DType::Bool,
        "i1" => DType::I8,
        "i2" => DType::I16,
        "i4" => DType::I32,
        "i8" => DType::I64,
        "u1" => DType::U8,
        "u2" => DType::U16,
        "u4" => DType::U32,
        "u8" => DType::U64,
        "f2" => DType::F16,
        "f4" => DType::F32,
        "f8" => DType::F64,
        _ => return Err(bad(format!("unsupported descr '{}'", descr))),
    };
    Ok(Descr::Numeric(dtype, order))
}

fn descr_of(dtype: DType) -> &'static str {
    match dtype {
        DType::Bool => "|b1",
        DType::I8 => "|i1",
        DType::I16 => "<i2",
        DType::I32 => "<i4",
        DType::I64 => "<i8",
        DType::U8 => "|u1",
        DType::U16 => "<u2",
        DType::U32 => "<u4",
        DType::U64 => "<u8",
        DType::F16 => "<f2",
        DType::F32 | DType::Bf16 => "<f4",
        DType::F64 => "<f8",
        DType::String => "<U",
    }
}

/// Encode a tensor as `.npy`. `bf16` has no numpy equivalent and is widened
/// to `f32`.
pub fn encode(tensor: &Tensor) -> Result<Bytes> {
    let tensor = if tensor.dtype() == DType::Bf16 {
        tensor.cast(DType::F32)?
    } else {
        tensor.clone()
    };

    let (descr, payload) = match tensor.strings() {
        Some(strings) => {
            let chars = strings.iter().map(|s| s.chars().count()).max().unwrap_or(0).max(1);
            let mut payload = Vec::with_capacity(strings.len() * chars * 4);
            for s in strings {
                let mut written = 0;
                for c in s.chars() {
                    payload.extend_from_slice(&(c as u32).to_le_bytes());
                    written += 1;
                }
                payload.resize(payload.len() + (chars - written) * 4, 0);
            }
            (format!("<U{}", chars), Bytes::from(payload))
        }
        None => (
            descr_of(tensor.dtype()).to_string(),
            tensor.payload().cloned().unwrap_or_default(),
        ),
    };

    let shape = match tensor.shape() {
        [] => "()".to_string(),
        [n] => format!("({},)", n),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr, shape
    );

    // magic + version + length prefix + header + '\n' is padded to 64 bytes
    let (version, prefix) = if header.len() + 11 < u16::MAX as usize { (1u8, 10) } else { (2u8, 12) };
    let total = prefix + header.len() + 1;
    let padding = (64 - total % 64) % 64;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let mut out = BytesMut::with_capacity(prefix + header.len() + payload.len());
    out.put_slice(MAGIC);
    out.put_u8(version);
    out.put_u8(0);
    if version == 1 {
        out.put_u16_le(header.len() as u16);
    } else {
        out.put_u32_le(header.len() as u32);
    }
    out.put_slice(header.as_bytes());
    out.put_slice(&payload);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn npy_bytes(header: &str, payload: &[u8]) -> Vec<u8> {
        let mut header = header.to_string();
        while (10 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_encoded_header_is_aligned() {
        let tensor = Tensor::from_f32(vec![2, 3], &[0.0; 6]).unwrap();
        let bytes = encode(&tensor).unwrap();
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
        assert_eq!(decode(&bytes).unwrap(), tensor);
    }

    #[test]
    fn test_decode_numpy_written_header() {
        let payload: Vec<u8> = [1i32, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
        let data = npy_bytes("{'descr': '<i4', 'fortran_order': False, 'shape': (3,), }", &payload);
        let tensor = decode(&data).unwrap();
        assert_eq!(tensor.dtype(), DType::I32);
        assert_eq!(tensor.shape(), &[3]);
        assert_eq!(tensor.to_i64_vec().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_big_endian() {
        let payload: Vec<u8> = [1.5f32, -2.0].iter().flat_map(|v| v.to_be_bytes()).collect();
        let data = npy_bytes("{'descr': '>f4', 'fortran_order': False, 'shape': (2,), }", &payload);
        assert_eq!(decode(&data).unwrap().to_f32_vec().unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn test_zero_extent_has_empty_payload() {
        let data = npy_bytes("{'descr': '<f4', 'fortran_order': False, 'shape': (0, 4), }", &[]);
        let tensor = decode(&data).unwrap();
        assert_eq!(tensor.shape(), &[0, 4]);
        assert_eq!(tensor.element_count(), 0);
    }

    #[test]
    fn test_rejects_fortran_order() {
        let data = npy_bytes("{'descr': '<f4', 'fortran_order': True, 'shape': (1,), }", &[0; 4]);
        assert_eq!(decode(&data).unwrap_err().kind(), "BadRequest");
    }

    #[test]
    fn test_payload_length_mismatch() {
        let data = npy_bytes("{'descr': '<f4', 'fortran_order': False, 'shape': (2,), }", &[0; 4]);
        assert_eq!(decode(&data).unwrap_err().kind(), "SchemaMismatch");
    }

    #[test]
    fn test_overflowing_shape_is_rejected() {
        let data = npy_bytes(
            "{'descr': '<f4', 'fortran_order': False, 'shape': (4611686018427387904, 4), }",
            &[],
        );
        assert_eq!(decode(&data).unwrap_err().kind(), "BadRequest");

        // element count fits, byte length does not
        let data = npy_bytes(
            "{'descr': '<f8', 'fortran_order': False, 'shape': (4611686018427387904,), }",
            &[],
        );
        assert_eq!(decode(&data).unwrap_err().kind(), "BadRequest");

        let data = npy_bytes(
            "{'descr': '<U8', 'fortran_order': False, 'shape': (1152921504606846976,), }",
            &[],
        );
        assert_eq!(decode(&data).unwrap_err().kind(), "BadRequest");
    }

    #[test]
    fn test_huge_empty_string_array_is_rejected() {
        let data = npy_bytes(
            "{'descr': '<U0', 'fortran_order': False, 'shape': (4294967296, 4294967295), }",
            &[],
        );
        let err = decode(&data).unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
        assert!(err.to_string().contains("exceeds the limit"));

        let data = npy_bytes("{'descr': '<U0', 'fortran_order': False, 'shape': (3,), }", &[]);
        assert_eq!(decode(&data).unwrap().strings().unwrap(), &["", "", ""]);
    }

    #[test]
    fn test_unicode_strings() {
        let tensor =
            Tensor::from_strings(vec![2], vec!["cat".to_string(), "dog!".to_string()]).unwrap();
        let decoded = decode(&encode(&tensor).unwrap()).unwrap();
        assert_eq!(decoded, tensor);
    }

    #[test]
    fn test_bf16_is_widened() {
        let tensor = Tensor::from_f64_values(DType::Bf16, vec![1], &[0.5]).unwrap();
        let decoded = decode(&encode(&tensor).unwrap()).unwrap();
        assert_eq!(decoded.dtype(), DType::F32);
        assert_eq!(decoded.to_f32_vec().unwrap(), vec![0.5]);
    }

    #[test]
    fn test_scalar_shape() {
        let tensor = Tensor::from_i64(vec![], &[42]).unwrap();
        let decoded = decode(&encode(&tensor).unwrap()).unwrap();
        assert_eq!(decoded.shape(), &[] as &[usize]);
        assert_eq!(decoded.to_i64_vec().unwrap(), vec![42]);
    }
}
