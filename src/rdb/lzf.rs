//! LZF decompression
//!
//! Redis compresses large strings in the snapshot with LZF. A control byte
//! below 32 starts a literal run; anything else is a back-reference into the
//! output produced so far.

use super::reader::{RdbError, Result};

/// Most output one input byte can produce: a 3-byte back-reference of 264.
const MAX_EXPANSION: usize = 88;

/// Initial allocation bound; the declared length is not trusted.
const MAX_PREALLOC: usize = 64 * 1024;

/// Decompress `input`, which must inflate to exactly `expected_len` bytes.
pub fn decompress(input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    if expected_len > input.len().saturating_mul(MAX_EXPANSION) {
        return Err(RdbError::Lzf);
    }
    let mut output = Vec::with_capacity(expected_len.min(MAX_PREALLOC));
    let mut ip = 0;

    while ip < input.len() {
        let ctrl = input[ip] as usize;
        ip += 1;

        if ctrl < 32 {
            let count = ctrl + 1;
            if ip + count > input.len() {
                return Err(RdbError::Lzf);
            }
            output.extend_from_slice(&input[ip..ip + count]);
            ip += count;
        } else {
            let mut len = ctrl >> 5;
            if len == 7 {
                if ip >= input.len() {
                    return Err(RdbError::Lzf);
                }
                len += input[ip] as usize;
                ip += 1;
            }
            len += 2;

            if ip >= input.len() {
                return Err(RdbError::Lzf);
            }
            let offset = ((ctrl & 0x1f) << 8) | input[ip] as usize;
            ip += 1;

            let start = output
                .len()
                .checked_sub(offset + 1)
                .ok_or(RdbError::Lzf)?;

            // byte-by-byte: the reference may overlap the bytes it produces
            for i in 0..len {
                let byte = output[start + i];
                output.push(byte);
            }
        }

        if output.len() > expected_len {
            return Err(RdbError::Lzf);
        }
    }

    if output.len() != expected_len {
        return Err(RdbError::Lzf);
    }
    Ok(output)
}
