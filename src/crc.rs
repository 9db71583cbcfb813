use crc::Crc;

/// The FCS trailing every captured 802.15.4 frame is CRC-16/KERMIT
/// (poly 0x1021, reflected, init 0) and arrives in little-endian byte order.
pub const FCS_CRC16: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_KERMIT);

/// Computes the frame check sequence over a MAC payload, in on-wire order.
pub fn fcs(payload: &[u8]) -> [u8; 2] {
    FCS_CRC16.checksum(payload).to_le_bytes()
}
