use super::codec::{CommandId, ConnectionFlags, Frame};

/// State byte sent with the connect frame.
pub const CONNECT_INITIAL_STATE: u8 = 1;
/// Secondary set-state value. Carried through as-is.
pub const SET_STATE_FIELD_TWO: u32 = 0x7fff_ffff;
/// Two-byte prefix the courier expects in front of the raw nonce signature.
pub const SIGNATURE_FORMAT_PREFIX: [u8; 2] = [0x01, 0x01];

pub struct ConnectCommand<'a> {
    pub token: &'a [u8],
    pub state: u8,
    pub flags: ConnectionFlags,
    pub certificate: &'a [u8],
    pub nonce: &'a [u8],
    pub signature: &'a [u8],
}

impl ConnectCommand<'_> {
    pub fn to_frame(&self) -> Frame {
        let mut signature = SIGNATURE_FORMAT_PREFIX.to_vec();
        signature.extend_from_slice(self.signature);
        Frame::new(CommandId::Connect)
            .with_field(1, self.token)
            .with_field(2, vec![self.state])
            .with_field(5, self.flags.to_bytes().to_vec())
            .with_field(12, self.certificate)
            .with_field(13, self.nonce)
            .with_field(14, signature)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectAck {
    pub status: Option<Vec<u8>>,
    pub token: Option<Vec<u8>>,
    pub max_message_size: u16,
    pub capabilities: Option<Vec<u8>>,
    pub large_message_size: u16,
    pub server_timestamp: Option<u64>,
}

impl ConnectAck {
    pub fn from_frame(frame: &Frame) -> Self {
        ConnectAck {
            status: frame.find_field(1).map(<[u8]>::to_vec),
            token: frame.find_field(3).map(<[u8]>::to_vec),
            max_message_size: frame.find_field(4).and_then(read_u16).unwrap_or(0),
            capabilities: frame.find_field(6).map(<[u8]>::to_vec),
            large_message_size: frame.find_field(8).and_then(read_u16).unwrap_or(0),
            server_timestamp: frame.find_field(10).and_then(read_u64),
        }
    }

    /// A missing or empty status counts as success; otherwise the first byte decides.
    pub fn is_success(&self) -> bool {
        self.status.as_ref().and_then(|s| s.first()).map_or(true, |b| *b == 0)
    }
}

fn read_u16(value: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = value.get(..2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

fn read_u64(value: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = value.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

pub struct FilterTopicsCommand<'a> {
    pub token: &'a [u8],
    /// SHA-1 digests of the topic names.
    pub topic_hashes: &'a [[u8; 20]],
}

impl FilterTopicsCommand<'_> {
    pub fn to_frame(&self) -> Frame {
        let mut frame = Frame::new(CommandId::FilterTopics).with_field(1, self.token);
        for hash in self.topic_hashes {
            frame.push_field(2, hash.to_vec());
        }
        frame
    }
}

pub struct SetStateCommand {
    pub state: u8,
}

impl SetStateCommand {
    pub fn to_frame(&self) -> Frame {
        Frame::new(CommandId::SetState)
            .with_field(1, vec![self.state])
            .with_field(2, SET_STATE_FIELD_TWO.to_be_bytes().to_vec())
    }
}

pub fn keep_alive_frame() -> Frame {
    Frame::new(CommandId::KeepAlive)
}

/// Push delivered by the courier (command 10).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingSendMessage {
    pub token: Option<Vec<u8>>,
    pub topic_hash: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub message_id: Option<Vec<u8>>,
    pub expiration: Option<Vec<u8>>,
    pub timestamp: Option<Vec<u8>>,
}

impl IncomingSendMessage {
    pub fn from_frame(frame: &Frame) -> Self {
        IncomingSendMessage {
            token: frame.find_field(1).map(<[u8]>::to_vec),
            topic_hash: frame.find_field(2).map(<[u8]>::to_vec),
            payload: frame.find_field(3).map(<[u8]>::to_vec).unwrap_or_default(),
            message_id: frame.find_field(4).map(<[u8]>::to_vec),
            expiration: frame.find_field(5).map(<[u8]>::to_vec),
            timestamp: frame.find_field(6).map(<[u8]>::to_vec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_field_order() {
        let frame = ConnectCommand {
            token: &[],
            state: CONNECT_INITIAL_STATE,
            flags: ConnectionFlags::BASE | ConnectionFlags::ROOT,
            certificate: b"cert",
            nonce: &[0; 20],
            signature: &[0xEE; 4],
        }
        .to_frame();
        let ids: Vec<u8> = frame.fields.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2, 5, 12, 13, 14]);
        assert_eq!(frame.find_field(1), Some(&[][..]));
        assert_eq!(frame.find_field(5), Some(&[0, 0, 0, 0x45][..]));
        assert_eq!(frame.find_field(14), Some(&[1, 1, 0xEE, 0xEE, 0xEE, 0xEE][..]));
    }

    #[test]
    fn connect_ack_parses_limits() {
        let frame = Frame::new(CommandId::ConnectAck)
            .with_field(1, vec![0])
            .with_field(3, vec![7; 32])
            .with_field(4, vec![0x10, 0x00])
            .with_field(8, vec![0x3C, 0x00])
            .with_field(10, 1_700_000_000_000u64.to_be_bytes().to_vec());
        let ack = ConnectAck::from_frame(&frame);
        assert!(ack.is_success());
        assert_eq!(ack.token.as_deref(), Some(&[7u8; 32][..]));
        assert_eq!(ack.max_message_size, 0x1000);
        assert_eq!(ack.large_message_size, 0x3C00);
        assert_eq!(ack.server_timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn connect_ack_status_two_is_failure() {
        let frame = Frame::new(CommandId::ConnectAck).with_field(1, vec![2]);
        assert!(!ConnectAck::from_frame(&frame).is_success());
    }

    #[test]
    fn short_size_fields_are_ignored() {
        let frame = Frame::new(CommandId::ConnectAck).with_field(4, vec![0x10]);
        assert_eq!(ConnectAck::from_frame(&frame).max_message_size, 0);
    }

    #[test]
    fn set_state_carries_fixed_secondary_value() {
        let frame = SetStateCommand { state: 1 }.to_frame();
        assert_eq!(frame.find_field(1), Some(&[1][..]));
        assert_eq!(frame.find_field(2), Some(&[0x7f, 0xff, 0xff, 0xff][..]));
    }

    #[test]
    fn filter_frame_token_then_hashes() {
        let hashes = [[1u8; 20], [2u8; 20]];
        let frame = FilterTopicsCommand { token: b"tok", topic_hashes: &hashes }.to_frame();
        assert_eq!(frame.id, 9);
        assert_eq!(frame.fields[0].value, b"tok");
        assert_eq!(frame.fields_with(2).count(), 2);
    }
}
