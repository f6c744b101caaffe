// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

bitflags! {
    /// Flags for `msgsnd()` and `msgrcv()`.
    pub struct MsgFlags: i32 {
        /// Return error on wait
        const IPC_NOWAIT = 0o4000;
        /// Truncate a message that is larger than the buffer
        const MSG_NOERROR = 0o10000;
        /// Receive any message except those of the given type
        const MSG_EXCEPT = 0o20000;
    }
}

/// A message: a positive type and the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    mtype: i64,
    text: Vec<u8>,
}

impl Message {
    pub fn new(mtype: i64, text: Vec<u8>) -> Self {
        Self { mtype, text }
    }

    pub fn mtype(&self) -> i64 {
        self.mtype
    }

    pub fn text(&self) -> &[u8] {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub(super) fn truncate(&mut self, len: usize) {
        self.text.truncate(len);
    }
}

/// The message that a receiver asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgFilter {
    /// The first message.
    Any,
    /// The first message of the type.
    Exact(i64),
    /// The first message of any other type.
    Except(i64),
    /// The first message of the lowest type not above the bound.
    LessEqual(i64),
}

impl MsgFilter {
    /// Decodes the `msgtyp` argument of `msgrcv()`.
    pub fn new(msgtyp: i64, flags: MsgFlags) -> Self {
        match msgtyp {
            0 => Self::Any,
            // `-i64::MIN` overflows; every type is below it anyway.
            i64::MIN => Self::LessEqual(i64::MAX),
            msgtyp if msgtyp < 0 => Self::LessEqual(-msgtyp),
            msgtyp if flags.contains(MsgFlags::MSG_EXCEPT) => Self::Except(msgtyp),
            msgtyp => Self::Exact(msgtyp),
        }
    }

    pub fn matches(&self, mtype: i64) -> bool {
        match *self {
            Self::Any => true,
            Self::Exact(msgtyp) => mtype == msgtyp,
            Self::Except(msgtyp) => mtype != msgtyp,
            Self::LessEqual(bound) => mtype <= bound,
        }
    }

    /// Returns the index of the message to receive.
    pub(super) fn select<'a>(&self, messages: impl Iterator<Item = &'a Message>) -> Option<usize> {
        let mut candidates = messages
            .enumerate()
            .filter(|(_, message)| self.matches(message.mtype));

        if let Self::LessEqual(_) = self {
            // The earliest message wins among the lowest types.
            candidates
                .min_by_key(|&(index, message)| (message.mtype, index))
                .map(|(index, _)| index)
        } else {
            candidates.next().map(|(index, _)| index)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn select(filter: MsgFilter, types: &[i64]) -> Option<usize> {
        let messages: Vec<_> = types
            .iter()
            .map(|&mtype| Message::new(mtype, Vec::new()))
            .collect();
        filter.select(messages.iter())
    }

    #[test]
    fn filters() {
        let types = [3, 1, 2, 1, 5];

        assert_eq!(select(MsgFilter::new(0, MsgFlags::empty()), &types), Some(0));
        assert_eq!(select(MsgFilter::new(2, MsgFlags::empty()), &types), Some(2));
        assert_eq!(select(MsgFilter::new(4, MsgFlags::empty()), &types), None);
        assert_eq!(select(MsgFilter::new(3, MsgFlags::MSG_EXCEPT), &types), Some(1));
        assert_eq!(select(MsgFilter::new(-2, MsgFlags::empty()), &types), Some(1));
        assert_eq!(select(MsgFilter::new(-10, MsgFlags::empty()), &types), Some(1));
        assert_eq!(select(MsgFilter::new(i64::MIN, MsgFlags::empty()), &types), Some(1));
        assert_eq!(select(MsgFilter::new(-0, MsgFlags::MSG_EXCEPT), &types), Some(0));
        assert_eq!(select(MsgFilter::new(-1, MsgFlags::empty()), &[4, 2]), None);
    }
}
