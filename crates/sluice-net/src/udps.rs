use sluice_format::SEQUENCE_HEADER;

/// Stamp the udps sequence number into the first 8 bytes of a datagram.
pub fn encode_seqnr(dgram: &mut [u8], seqnr: u64) {
    dgram[..SEQUENCE_HEADER].copy_from_slice(&seqnr.to_le_bytes());
}

/// Sequence number of an incoming udps datagram, `None` for runts.
pub fn decode_seqnr(dgram: &[u8]) -> Option<u64> {
    let head = dgram.get(..SEQUENCE_HEADER)?;
    Some(u64::from_le_bytes(head.try_into().ok()?))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seqnr_is_little_endian_in_front() {
        let mut dgram = [0u8; 16];
        encode_seqnr(&mut dgram, 0x0102_0304_0506_0708);
        assert_eq!(dgram[0], 0x08);
        assert_eq!(decode_seqnr(&dgram), Some(0x0102_0304_0506_0708));
        assert_eq!(decode_seqnr(&dgram[..4]), None);
    }
}
