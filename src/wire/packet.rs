// src/wire/packet.rs - KOB server packet codec
//
// Two packet shapes, both fixed length and little-endian:
//
//   short (2 bytes):  u16 command. Disconnect, keep-alive-end, ack.
//   long (496 bytes): u16 command, u16 byte count, 128-byte NUL-padded
//                     station id, u32 sequence number, 51 x i16 code slots,
//                     u16 status/marker, zero padding.
//
// The 51st code slot (index 50) is a side-band count of meaningful leading
// elements, not a code element: positions 0..=49 are payload. A count of 0
// marks an ID packet.
use crate::error::{Error, Result};

pub const SHORT_PACKET_LEN: usize = 2;
pub const LONG_PACKET_LEN: usize = 496;

/// Code payload slots in a long packet (the 51st slot is the count).
pub const MAX_CODE_PER_PACKET: usize = 50;

pub const CMD_DISCONNECT: u16 = 2;
pub const CMD_DATA: u16 = 3;
pub const CMD_CONNECT: u16 = 4;
pub const CMD_ACK: u16 = 5;

const STATION_ID_LEN: usize = 128;
const OFF_BYTE_COUNT: usize = 2;
const OFF_STATION_ID: usize = 4;
const OFF_SEQ_NO: usize = 132;
const OFF_CODE: usize = 136;
const OFF_STATUS: usize = 238;

#[derive(Debug, Clone, PartialEq)]
pub struct LongPacket {
    pub cmd: u16,
    pub station_id: String,
    pub seq_no: u32,
    pub code: Vec<i32>,
    pub status: u16,
}

impl LongPacket {
    /// ID packets signal presence and carry no code.
    pub fn is_id(&self) -> bool {
        self.code.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Short(u16),
    Long(LongPacket),
}

pub fn encode_short(cmd: u16) -> [u8; SHORT_PACKET_LEN] {
    cmd.to_le_bytes()
}

/// Build a 496-byte code or ID packet. Code elements are clamped to the
/// i16 wire range; at most [`MAX_CODE_PER_PACKET`] are carried.
pub fn encode_long(
    station_id: &str,
    seq_no: u32,
    code: &[i32],
    status: u16,
) -> [u8; LONG_PACKET_LEN] {
    let mut buf = [0u8; LONG_PACKET_LEN];
    buf[0..2].copy_from_slice(&CMD_DATA.to_le_bytes());
    buf[OFF_BYTE_COUNT..OFF_BYTE_COUNT + 2]
        .copy_from_slice(&(LONG_PACKET_LEN as u16).to_le_bytes());
    let id = station_id.as_bytes();
    let n = id.len().min(STATION_ID_LEN - 1);
    buf[OFF_STATION_ID..OFF_STATION_ID + n].copy_from_slice(&id[..n]);
    buf[OFF_SEQ_NO..OFF_SEQ_NO + 4].copy_from_slice(&seq_no.to_le_bytes());
    let count = code.len().min(MAX_CODE_PER_PACKET);
    for (i, &c) in code.iter().take(count).enumerate() {
        let c = c.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        let off = OFF_CODE + 2 * i;
        buf[off..off + 2].copy_from_slice(&c.to_le_bytes());
    }
    let count_off = OFF_CODE + 2 * MAX_CODE_PER_PACKET;
    buf[count_off..count_off + 2].copy_from_slice(&(count as i16).to_le_bytes());
    buf[OFF_STATUS..OFF_STATUS + 2].copy_from_slice(&status.to_le_bytes());
    buf
}

/// Parse a datagram. Lengths other than 2 and 496 are protocol errors.
pub fn decode(buf: &[u8]) -> Result<Packet> {
    match buf.len() {
        SHORT_PACKET_LEN => Ok(Packet::Short(u16::from_le_bytes([buf[0], buf[1]]))),
        LONG_PACKET_LEN => {
            let cmd = u16::from_le_bytes([buf[0], buf[1]]);
            let id_raw = &buf[OFF_STATION_ID..OFF_STATION_ID + STATION_ID_LEN];
            let id_end = id_raw.iter().position(|&b| b == 0).unwrap_or(STATION_ID_LEN);
            let station_id = String::from_utf8_lossy(&id_raw[..id_end]).into_owned();
            if !station_id.is_ascii() {
                return Err(Error::Protocol(format!(
                    "malformed station id in packet: {station_id:?}"
                )));
            }
            let seq_no = u32::from_le_bytes([
                buf[OFF_SEQ_NO],
                buf[OFF_SEQ_NO + 1],
                buf[OFF_SEQ_NO + 2],
                buf[OFF_SEQ_NO + 3],
            ]);
            let count_off = OFF_CODE + 2 * MAX_CODE_PER_PACKET;
            let count = i16::from_le_bytes([buf[count_off], buf[count_off + 1]]);
            let count = (count.max(0) as usize).min(MAX_CODE_PER_PACKET);
            let mut code = Vec::with_capacity(count);
            for i in 0..count {
                let off = OFF_CODE + 2 * i;
                code.push(i16::from_le_bytes([buf[off], buf[off + 1]]) as i32);
            }
            let status = u16::from_le_bytes([buf[OFF_STATUS], buf[OFF_STATUS + 1]]);
            Ok(Packet::Long(LongPacket {
                cmd,
                station_id,
                seq_no,
                code,
                status,
            }))
        }
        n => Err(Error::Protocol(format!("unknown packet length {n}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morse::DISCONTINUITY;

    #[test]
    fn long_packet_layout() {
        let code = [-230, 60, -60, 180];
        let buf = encode_long("TEST, WI", 42, &code, 108);
        assert_eq!(buf.len(), LONG_PACKET_LEN);
        // cmd + byte count
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), CMD_DATA);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 496);
        // NUL-padded station id
        assert_eq!(&buf[4..12], b"TEST, WI");
        assert_eq!(buf[12], 0);
        // sequence number at 132
        assert_eq!(u32::from_le_bytes([buf[132], buf[133], buf[134], buf[135]]), 42);
        // first element at 136, count at 236, status at 238
        assert_eq!(i16::from_le_bytes([buf[136], buf[137]]), -230);
        assert_eq!(i16::from_le_bytes([buf[236], buf[237]]), 4);
        assert_eq!(u16::from_le_bytes([buf[238], buf[239]]), 108);
        // padding stays zero
        assert!(buf[240..].iter().all(|&b| b == 0));
    }

    #[test]
    fn long_packet_round_trip() {
        let code = vec![DISCONTINUITY, 2, -120, 60];
        let buf = encode_long("PORTLAND #101", 7, &code, 0);
        match decode(&buf).unwrap() {
            Packet::Long(p) => {
                assert_eq!(p.cmd, CMD_DATA);
                assert_eq!(p.station_id, "PORTLAND #101");
                assert_eq!(p.seq_no, 7);
                assert_eq!(p.code, code);
                assert!(!p.is_id());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn id_packet_has_zero_count() {
        let buf = encode_long("IDLE STATION", 3, &[], 109);
        match decode(&buf).unwrap() {
            Packet::Long(p) => {
                assert!(p.is_id());
                assert_eq!(p.status, 109);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_packet_round_trip() {
        let buf = encode_short(CMD_DISCONNECT);
        assert_eq!(decode(&buf).unwrap(), Packet::Short(CMD_DISCONNECT));
    }

    #[test]
    fn bad_length_is_a_protocol_error() {
        assert!(decode(&[0u8; 17]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn oversized_code_is_truncated_to_payload_slots() {
        let code: Vec<i32> = (0..80).map(|i| 10 + i).collect();
        let buf = encode_long("S", 1, &code, 0);
        match decode(&buf).unwrap() {
            Packet::Long(p) => assert_eq!(p.code.len(), MAX_CODE_PER_PACKET),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn elements_are_clamped_to_i16() {
        let buf = encode_long("S", 1, &[-100_000, 100_000], 0);
        match decode(&buf).unwrap() {
            Packet::Long(p) => assert_eq!(p.code, vec![i16::MIN as i32, i16::MAX as i32]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
