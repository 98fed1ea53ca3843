/// The Internet checksum (RFC 1071): the ones' complement of the ones' complement sum of all
///  16 bit words, padding an odd trailing byte with zero.
///
/// Computing the checksum over a packet whose checksum field is filled in yields zero for an
///  intact packet, see [is_valid].
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn is_valid(packet: &[u8]) -> bool {
    internet_checksum(packet) == 0
}
