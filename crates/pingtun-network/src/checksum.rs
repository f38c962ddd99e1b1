//! Internet checksum (RFC 1071)
//!
//! The checksum is the ones' complement of the ones' complement sum of all
//! big-endian 16-bit words in a region. An odd trailing byte is summed as the
//! high byte of a zero-padded word.

/// Compute the Internet checksum of `data`.
///
/// The result is meant to be written into a packet with `to_be_bytes`.
pub fn compute(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);

    for word in &mut words {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }

    if let Some(&last) = words.remainder().first() {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([last, 0])));
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Check a region whose checksum field is filled in as transmitted.
pub fn is_valid(data: &[u8]) -> bool {
    compute(data) == 0
}

/// Zero the 16-bit field at `offset`, recompute over `region` and write it back.
///
/// `offset` is relative to the start of `region`.
pub(crate) fn rewrite(region: &mut [u8], offset: usize) {
    region[offset] = 0;
    region[offset + 1] = 0;
    let sum = compute(region);
    region[offset..offset + 2].copy_from_slice(&sum.to_be_bytes());
}
