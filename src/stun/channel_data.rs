//! TURN ChannelData framing (RFC 8656 §12.4).

/// Valid channel numbers are `0x4000..0x5000`.
pub const CHANNEL_MIN: u16 = 0x4000;
pub const CHANNEL_MAX: u16 = 0x4FFF;

const CHANNEL_HEADER_LEN: usize = 4;

/// One relayed payload framed with a bound channel number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub channel: u16,
    pub data: Vec<u8>,
}

impl ChannelData {
    pub fn is_valid_channel(channel: u16) -> bool {
        (CHANNEL_MIN..=CHANNEL_MAX).contains(&channel)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHANNEL_HEADER_LEN + self.data.len() + 3);
        buf.extend_from_slice(&self.channel.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        // Pad to 4 bytes; over UDP this is optional but harmless.
        buf.resize((buf.len() + 3) & !3, 0);
        buf
    }

    /// Probe a datagram for a ChannelData frame. Any malformed input yields `None`
    /// since the same socket also carries STUN and peer-to-peer traffic.
    pub fn try_decode(buf: &[u8]) -> Option<ChannelData> {
        if buf.len() < CHANNEL_HEADER_LEN {
            return None;
        }
        let channel = u16::from_be_bytes([buf[0], buf[1]]);
        if !Self::is_valid_channel(channel) {
            return None;
        }
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let payload = buf.get(CHANNEL_HEADER_LEN..CHANNEL_HEADER_LEN + len)?;
        Some(ChannelData {
            channel,
            data: payload.to_vec(),
        })
    }
}
