/// Reserved message id that closes a conversation. A frame carrying this id
/// is surfaced through the connection's `finished` signal instead of
/// `new_message`, and carries no payload.
pub const FINISH_MESSAGE_ID: u8 = 0xFF;

/// One decoded message: an id byte and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u8,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(id: u8, payload: Vec<u8>) -> Message {
        Message { id, payload }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Maps a raw `(id, payload)` frame to a [`Message`]. Returning `None` drops
/// the frame; the connection keeps running.
pub trait MessageFactory {
    fn create(&self, id: u8, payload: &[u8]) -> Option<Message>;
}

/// Pass-through factory: every frame becomes a [`Message`] verbatim.
pub struct RawMessageFactory;

impl MessageFactory for RawMessageFactory {
    fn create(&self, id: u8, payload: &[u8]) -> Option<Message> {
        Some(Message::new(id, payload.to_vec()))
    }
}
