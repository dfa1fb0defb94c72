use std::sync::atomic::{AtomicU32, Ordering};

use crate::{Error, Result};

pub const HEADER_SIZE: usize = 64;
pub const RECORD_ALIGN: usize = 64;
pub const MAX_ENCODABLE_PAYLOAD: usize = u32::MAX as usize - 1;
/// Routing keys are short selectors, not payloads.
pub const MAX_ROUTING_KEY_LEN: usize = 1024;

pub const COMMIT_LEN_OFFSET: usize = 0;
pub const KEY_LEN_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 6;
pub const TIMESTAMP_OFFSET: usize = 8;
pub const MESSAGE_ID_OFFSET: usize = 16;
pub const CHECKSUM_OFFSET: usize = 24;

#[repr(C, align(64))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    /// Commit word:
    /// 0 = uncommitted
    /// >0 = committed payload length + 1
    pub commit_len: u32,
    pub key_len: u16,
    pub flags: u16,
    pub timestamp: i64,
    pub message_id: u64,
    pub checksum: u32,
    pub _pad: [u8; 36],
}

impl RecordHeader {
    pub fn new_uncommitted(message_id: u64, timestamp: i64, key_len: u16, checksum: u32) -> Self {
        Self {
            commit_len: 0,
            key_len,
            flags: 0,
            timestamp,
            message_id,
            checksum,
            _pad: [0u8; 36],
        }
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut buf = [0u8; 64];
        buf[COMMIT_LEN_OFFSET..COMMIT_LEN_OFFSET + 4]
            .copy_from_slice(&self.commit_len.to_le_bytes());
        buf[KEY_LEN_OFFSET..KEY_LEN_OFFSET + 2].copy_from_slice(&self.key_len.to_le_bytes());
        buf[FLAGS_OFFSET..FLAGS_OFFSET + 2].copy_from_slice(&self.flags.to_le_bytes());
        buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]
            .copy_from_slice(&self.timestamp.to_le_bytes());
        buf[MESSAGE_ID_OFFSET..MESSAGE_ID_OFFSET + 8]
            .copy_from_slice(&self.message_id.to_le_bytes());
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[28..64].copy_from_slice(&self._pad);
        buf
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Result<Self> {
        let commit_len = u32::from_le_bytes(
            bytes[COMMIT_LEN_OFFSET..COMMIT_LEN_OFFSET + 4]
                .try_into()
                .expect("slice length"),
        );
        let key_len = u16::from_le_bytes(
            bytes[KEY_LEN_OFFSET..KEY_LEN_OFFSET + 2]
                .try_into()
                .expect("slice length"),
        );
        let flags = u16::from_le_bytes(
            bytes[FLAGS_OFFSET..FLAGS_OFFSET + 2]
                .try_into()
                .expect("slice length"),
        );
        let timestamp = i64::from_le_bytes(
            bytes[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]
                .try_into()
                .expect("slice length"),
        );
        let message_id = u64::from_le_bytes(
            bytes[MESSAGE_ID_OFFSET..MESSAGE_ID_OFFSET + 8]
                .try_into()
                .expect("slice length"),
        );
        let checksum = u32::from_le_bytes(
            bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]
                .try_into()
                .expect("slice length"),
        );
        let mut _pad = [0u8; 36];
        _pad.copy_from_slice(&bytes[28..64]);
        Ok(Self {
            commit_len,
            key_len,
            flags,
            timestamp,
            message_id,
            checksum,
            _pad,
        })
    }

    pub fn commit_len_for_payload(payload_len: usize) -> Result<u32> {
        if payload_len > MAX_ENCODABLE_PAYLOAD {
            return Err(Error::Corrupt("payload length exceeds commit encoding"));
        }
        Ok((payload_len as u32) + 1)
    }

    pub fn payload_len_from_commit(commit_len: u32) -> Result<usize> {
        if commit_len == 0 {
            return Err(Error::Corrupt("commit length is zero"));
        }
        Ok((commit_len - 1) as usize)
    }

    pub fn load_commit_len(ptr: *const u8) -> u32 {
        // SAFETY: commit_len is at offset 0 and the record is 64-byte aligned.
        let atomic = unsafe { &*(ptr as *const AtomicU32) };
        atomic.load(Ordering::Acquire)
    }

    pub fn store_commit_len(ptr: *mut u8, commit_len: u32) {
        // SAFETY: commit_len is at offset 0 and the record is 64-byte aligned.
        let atomic = unsafe { &*(ptr as *const AtomicU32) };
        atomic.store(commit_len, Ordering::Release);
    }

    pub fn crc32(routing_key: &[u8], payload: &[u8]) -> u32 {
        use crc32fast::Hasher;
        let mut hasher = Hasher::new();
        hasher.update(routing_key);
        hasher.update(payload);
        hasher.finalize()
    }

    pub fn validate_crc(&self, routing_key: &[u8], payload: &[u8]) -> Result<()> {
        let expected = Self::crc32(routing_key, payload);
        if expected == self.checksum {
            Ok(())
        } else {
            Err(Error::Corrupt("crc mismatch"))
        }
    }
}

/// Framed length of a record with the given key and payload sizes.
pub fn record_len(key_len: usize, payload_len: usize) -> usize {
    align_up(HEADER_SIZE + key_len + payload_len, RECORD_ALIGN)
}

pub fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}
