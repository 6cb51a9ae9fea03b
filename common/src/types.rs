//! Core Identifier Types
//!
//! Defines the packed 64-bit task tag and the event records exchanged
//! between the master scheduler and the worker shards. Queues carry these
//! records only; payload data always stays in the ring buffers.

use std::fmt;

const FRAME_SHIFT: u64 = 0;
const SYMBOL_SHIFT: u64 = 32;
const INDEX_SHIFT: u64 = 48;
const TYPE_SHIFT: u64 = 62;

const FRAME_MASK: u64 = 0xFFFF_FFFF;
const SYMBOL_MASK: u64 = 0xFFFF;
const INDEX_MASK: u64 = 0x3FFF;
const TYPE_MASK: u64 = 0x3;

/// Discriminator for the entity-index field of a [`Tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    /// Index is a base-station antenna id.
    Antennas = 0,
    /// Index is a user id.
    Users = 1,
    /// Index is a base subcarrier id.
    Subcarriers = 2,
    /// No entity index; tag addresses a whole (frame, symbol).
    FrmSym = 3,
}

/// Packed 64-bit task identifier.
///
/// Layout: `frame_id` in bits 0..32 (wrapping), `symbol_id` in bits 32..48,
/// entity index in bits 48..62, discriminator in bits 62..64. Equality is on
/// the full word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Tag(pub u64);

impl Tag {
    fn pack(ty: TagType, frame_id: u32, symbol_id: u16, index: u16) -> Self {
        Tag((frame_id as u64) << FRAME_SHIFT
            | (symbol_id as u64) << SYMBOL_SHIFT
            | ((index as u64) & INDEX_MASK) << INDEX_SHIFT
            | (ty as u64) << TYPE_SHIFT)
    }

    /// Tag addressing one antenna of one symbol.
    pub fn frm_sym_ant(frame_id: u32, symbol_id: u16, ant_id: u16) -> Self {
        Self::pack(TagType::Antennas, frame_id, symbol_id, ant_id)
    }

    /// Tag addressing one user of one symbol.
    pub fn frm_sym_ue(frame_id: u32, symbol_id: u16, ue_id: u16) -> Self {
        Self::pack(TagType::Users, frame_id, symbol_id, ue_id)
    }

    /// Tag addressing a subcarrier block of a frame.
    pub fn frm_sc(frame_id: u32, sc_id: u16) -> Self {
        Self::pack(TagType::Subcarriers, frame_id, 0, sc_id)
    }

    /// Tag addressing a subcarrier block of one data symbol.
    pub fn frm_sym_sc(frame_id: u32, symbol_id: u16, sc_id: u16) -> Self {
        Self::pack(TagType::Subcarriers, frame_id, symbol_id, sc_id)
    }

    /// Tag addressing a whole (frame, symbol).
    pub fn frm_sym(frame_id: u32, symbol_id: u16) -> Self {
        Self::pack(TagType::FrmSym, frame_id, symbol_id, 0)
    }

    pub fn frame_id(self) -> u32 {
        (self.0 >> FRAME_SHIFT & FRAME_MASK) as u32
    }

    pub fn symbol_id(self) -> u16 {
        (self.0 >> SYMBOL_SHIFT & SYMBOL_MASK) as u16
    }

    /// Entity index; meaning depends on [`Tag::tag_type`].
    pub fn index(self) -> u16 {
        (self.0 >> INDEX_SHIFT & INDEX_MASK) as u16
    }

    pub fn ant_id(self) -> u16 {
        self.index()
    }

    pub fn ue_id(self) -> u16 {
        self.index()
    }

    pub fn sc_id(self) -> u16 {
        self.index()
    }

    pub fn tag_type(self) -> TagType {
        match self.0 >> TYPE_SHIFT & TYPE_MASK {
            0 => TagType::Antennas,
            1 => TagType::Users,
            2 => TagType::Subcarriers,
            _ => TagType::FrmSym,
        }
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tag[{:?} frame {} symbol {} idx {}]",
            self.tag_type(),
            self.frame_id(),
            self.symbol_id(),
            self.index()
        )
    }
}

/// Kind of pipeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PacketRx,
    PacketTx,
    Fft,
    Csi,
    Zf,
    Demul,
    Decode,
    Encode,
    Modulate,
    Ifft,
}

/// Number of tag slots carried by one event.
pub const MAX_EVENT_TAGS: usize = 4;

/// Task or completion record flowing through the queues.
///
/// Copyable, trivially destructible, fits in one cache line. Carries only
/// identifiers; the ring-buffer window a tag addresses holds the payload.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub kind: EventKind,
    pub num_tags: u8,
    pub tags: [Tag; MAX_EVENT_TAGS],
}

impl Event {
    pub fn new(kind: EventKind, tag: Tag) -> Self {
        Event {
            kind,
            num_tags: 1,
            tags: [tag; MAX_EVENT_TAGS],
        }
    }

    /// Primary tag of the event.
    pub fn tag(&self) -> Tag {
        self.tags[0]
    }
}

/// Role of a pinned thread, used for core placement and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadType {
    Master,
    WorkerRx,
    WorkerTx,
    Worker,
}

impl fmt::Display for ThreadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadType::Master => "master",
            ThreadType::WorkerRx => "rx",
            ThreadType::WorkerTx => "tx",
            ThreadType::Worker => "worker",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        let tag = Tag::frm_sym_ant(123_456_789, 13, 57);
        assert_eq!(tag.frame_id(), 123_456_789);
        assert_eq!(tag.symbol_id(), 13);
        assert_eq!(tag.ant_id(), 57);
        assert_eq!(tag.tag_type(), TagType::Antennas);

        let tag = Tag::frm_sc(u32::MAX, 1200);
        assert_eq!(tag.frame_id(), u32::MAX);
        assert_eq!(tag.symbol_id(), 0);
        assert_eq!(tag.sc_id(), 1200);
        assert_eq!(tag.tag_type(), TagType::Subcarriers);
    }

    #[test]
    fn test_tag_equality_is_full_word() {
        let a = Tag::frm_sym_ant(7, 3, 1);
        let b = Tag::frm_sym_ue(7, 3, 1);
        assert_ne!(a, b);
        assert_eq!(a, Tag::frm_sym_ant(7, 3, 1));
    }

    #[test]
    fn test_tag_index_width() {
        // 14 usable index bits; the discriminator must survive a max index.
        let tag = Tag::frm_sym_ue(1, 2, 0x3FFF);
        assert_eq!(tag.ue_id(), 0x3FFF);
        assert_eq!(tag.tag_type(), TagType::Users);
    }

    #[test]
    fn test_event_fits_cache_line() {
        assert!(std::mem::size_of::<Event>() <= 64);
        let ev = Event::new(EventKind::Fft, Tag::frm_sym(9, 2));
        assert_eq!(ev.num_tags, 1);
        assert_eq!(ev.tag().frame_id(), 9);
    }
}
