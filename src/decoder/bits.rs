//! Big endian bit fields, as found in RTCM and GPS navigation messages

/// Reads `len` (<= 32) bits as unsigned, starting at bit `pos`.
pub fn getbitu(buf: &[u8], pos: usize, len: usize) -> u32 {
    let mut value = 0u32;
    for i in pos..pos + len {
        value = (value << 1) | ((buf[i / 8] >> (7 - i % 8)) & 1) as u32;
    }
    value
}

/// Reads `len` (<= 32) bits as two's complement signed integer.
pub fn getbits(buf: &[u8], pos: usize, len: usize) -> i32 {
    let value = getbitu(buf, pos, len);
    if len == 0 || len >= 32 || value & (1 << (len - 1)) == 0 {
        value as i32
    } else {
        (value | (!0u32 << len)) as i32
    }
}

/// Reads a 38 bit signed integer (RTCM station coordinates).
pub fn getbits_38(buf: &[u8], pos: usize) -> f64 {
    getbits(buf, pos, 32) as f64 * 64.0 + getbitu(buf, pos + 32, 6) as f64
}

/// Writes `len` (<= 32) bits of `value`, starting at bit `pos`.
#[cfg(test)]
pub fn setbitu(buf: &mut [u8], pos: usize, len: usize, value: u32) {
    for i in 0..len {
        let bit = (value >> (len - 1 - i)) & 1;
        let idx = pos + i;
        let mask = 1u8 << (7 - idx % 8);
        if bit == 1 {
            buf[idx / 8] |= mask;
        } else {
            buf[idx / 8] &= !mask;
        }
    }
}

/// Writes `len` bits of a signed `value`, two's complement.
#[cfg(test)]
pub fn setbits(buf: &mut [u8], pos: usize, len: usize, value: i32) {
    let mask = if len >= 32 { !0u32 } else { (1u32 << len) - 1 };
    setbitu(buf, pos, len, (value as u32) & mask);
}
