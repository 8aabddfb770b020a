use crc::{Algorithm, Crc};

/*
  The wire CRC is the reflected IEEE 802.3 polynomial seeded with zero and
  with no final XOR, i.e. the value the Linux kernel's crc32(0, buf, len)
  produces. Both ends of the link must compute this exact variant; the
  catalogued CRC-32/ISO-HDLC differs in init and xorout.
 */
const LINK_CRC32: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c11db7,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0,
    check: 0x2dfd2d88,
    residue: 0,
};

static CRC: Crc<u32> = Crc::<u32>::new(&LINK_CRC32);

pub fn link_crc32(data: &[u8]) -> u32 {
    CRC.checksum(data)
}

/// CRC over the packet header then the payload: seq_num || data_len || data.
pub fn packet_crc32(seq_num: u8, data: &[u8]) -> u32 {
    let mut digest = CRC.digest();
    digest.update(&[seq_num, data.len() as u8]);
    digest.update(data);
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // computed independently with the bit-by-bit reference algorithm
        assert_eq!(link_crc32(b"123456789"), 0x2dfd2d88);
        assert_eq!(link_crc32(&[]), 0);
        assert_eq!(link_crc32(&[0x16]), 0xf4d4b551);
        assert_eq!(link_crc32(&[0x00, 0x02, 0x41, 0x42]), 0x72348a96);
    }

    #[test]
    fn packet_crc_matches_flat_crc() {
        let payload = [0x41, 0x42];
        assert_eq!(packet_crc32(0, &payload), 0x72348a96);
        assert_eq!(packet_crc32(5, &[]), link_crc32(&[0x05, 0x00]));

        let bulk = [0xAA; 31];
        let mut flat = vec![0x00, 31];
        flat.extend_from_slice(&bulk);
        assert_eq!(packet_crc32(0, &bulk), link_crc32(&flat));
        assert_eq!(packet_crc32(0, &bulk), 0xf6cb8f37);
    }
}
