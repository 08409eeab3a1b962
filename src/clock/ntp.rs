//! Legacy 48-byte NTP datagram layout and sample arithmetic.

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_EPOCH_DELTA: u64 = 2_208_988_800;

/// Samples with a round trip above this are too noisy to trust.
pub const RTT_REJECT_US: u64 = 20_000;

/// LI = 3 (unsynchronized), version = 4, mode = 3 (client).
const CLIENT_MODE_FLAGS: u8 = 0b1110_0011;

pub const PACKET_LEN: usize = 48;

const OFFSET_ORIGINATE: usize = 24;
const OFFSET_RECEIVE: usize = 32;
const OFFSET_TRANSMIT: usize = 40;

/// One accepted probe exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    /// Reference minus local, microseconds.
    pub offset: i64,
    /// Round trip time, microseconds.
    pub rtt: u64,
    /// Local receive time minus server transmit time, for diagnostics.
    pub aux_diff: u64,
}

impl TimeSample {
    /// Classic four-timestamp NTP arithmetic.
    ///
    /// T1 = client send, T2 = server receive, T3 = server transmit,
    /// T4 = client receive, all in microseconds since the Unix epoch
    /// (on their respective clocks).
    pub fn compute(t1: u64, t2: u64, t3: u64, t4: u64) -> TimeSample {
        let offset = (t2.wrapping_sub(t1) as i64 + t3.wrapping_sub(t4) as i64) / 2;
        let rtt = (t4.wrapping_sub(t1)).wrapping_sub(t3.wrapping_sub(t2));
        TimeSample {
            offset,
            rtt,
            aux_diff: t4.wrapping_sub(t3),
        }
    }

    pub fn is_acceptable(&self) -> bool {
        self.rtt <= RTT_REJECT_US
    }
}

/// Microseconds since Unix epoch -> (ntp seconds, ntp fraction).
fn to_ntp_timestamp(us: u64) -> (u32, u32) {
    let secs = us / 1_000_000 + NTP_EPOCH_DELTA;
    let frac = ((us % 1_000_000) << 32) / 1_000_000;
    (secs as u32, frac as u32)
}

/// (ntp seconds, ntp fraction) -> microseconds since Unix epoch.
fn from_ntp_timestamp(secs: u32, frac: u32) -> u64 {
    let unix_secs = (secs as u64).wrapping_sub(NTP_EPOCH_DELTA);
    let micros = ((frac as u64) * 1_000_000) >> 32;
    unix_secs * 1_000_000 + micros
}

fn read_timestamp(buf: &[u8], at: usize) -> u64 {
    let secs = u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    let frac = u32::from_be_bytes([buf[at + 4], buf[at + 5], buf[at + 6], buf[at + 7]]);
    from_ntp_timestamp(secs, frac)
}

/// Build a client request carrying `t1` (local send time, us) in the
/// transmit-timestamp field.
pub fn build_request(t1: u64) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = CLIENT_MODE_FLAGS;
    let (secs, frac) = to_ntp_timestamp(t1);
    packet[OFFSET_TRANSMIT..OFFSET_TRANSMIT + 4].copy_from_slice(&secs.to_be_bytes());
    packet[OFFSET_TRANSMIT + 4..OFFSET_TRANSMIT + 8].copy_from_slice(&frac.to_be_bytes());
    packet
}

/// Server-side timestamps parsed out of a reply.
#[derive(Debug, Clone, Copy)]
pub struct ServerTimestamps {
    /// Echo of the client's transmit time.
    pub originate_us: u64,
    /// Server receive time (T2).
    pub receive_us: u64,
    /// Server transmit time (T3).
    pub transmit_us: u64,
}

/// Parse a reply; `None` for short datagrams.
pub fn parse_response(buf: &[u8]) -> Option<ServerTimestamps> {
    if buf.len() < PACKET_LEN {
        return None;
    }
    Some(ServerTimestamps {
        originate_us: read_timestamp(buf, OFFSET_ORIGINATE),
        receive_us: read_timestamp(buf, OFFSET_RECEIVE),
        transmit_us: read_timestamp(buf, OFFSET_TRANSMIT),
    })
}

/// Build a server reply for loopback testing: echoes `t1` as originate and
/// stamps `t2`/`t3` as receive/transmit.
#[cfg(test)]
pub(crate) fn build_response(t1: u64, t2: u64, t3: u64) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = 0b1110_0100; // LI = 3, version = 4, mode = 4 (server)
    for (at, us) in [(OFFSET_ORIGINATE, t1), (OFFSET_RECEIVE, t2), (OFFSET_TRANSMIT, t3)] {
        let (secs, frac) = to_ntp_timestamp(us);
        packet[at..at + 4].copy_from_slice(&secs.to_be_bytes());
        packet[at + 4..at + 8].copy_from_slice(&frac.to_be_bytes());
    }
    packet
}
