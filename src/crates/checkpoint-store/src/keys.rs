//! Key layout on the ordered key/value backend
//!
//! Every key starts with a one-byte tag followed by length-prefixed string
//! components (`u32` big-endian length, then the UTF-8 bytes) and, where needed,
//! big-endian integers. Length prefixes make component boundaries unambiguous,
//! so a `(tag, thread)` prefix never matches another thread whose name merely
//! starts with the same characters. Big-endian integers sort numerically.
//!
//! ```text
//! c | thread | ns | version            checkpoint record
//! i | thread | ns | id                 id -> version index
//! h | thread | ns                      lineage head (last version, channels)
//! w | thread | ns | version | seq      task write
//! x | expires_ms | thread | ns | version   expiry index
//! s | ns-len | ns components.. | key   cross-thread item
//! ```

use crate::error::{CheckpointError, Result};

const CHECKPOINT: u8 = b'c';
const ID_INDEX: u8 = b'i';
const HEAD: u8 = b'h';
const WRITE: u8 = b'w';
const EXPIRY: u8 = b'x';
const ITEM: u8 = b's';

/// Half-open byte range `[start, end)`; `end == None` is unbounded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn new(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Every key starting with `prefix`
    pub fn prefix(prefix: Vec<u8>) -> Self {
        let end = prefix_successor(&prefix);
        Self { start: prefix, end }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && self.end.as_deref().map_or(true, |end| key < end)
    }
}

/// Smallest key greater than every key with this prefix
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn tagged(tag: u8, thread_id: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 4 + thread_id.len() + 16);
    buf.push(tag);
    push_str(&mut buf, thread_id);
    buf
}

fn lineage(tag: u8, thread_id: &str, namespace: &str) -> Vec<u8> {
    let mut buf = tagged(tag, thread_id);
    push_str(&mut buf, namespace);
    buf
}

pub fn checkpoint_key(thread_id: &str, namespace: &str, version: u64) -> Vec<u8> {
    let mut key = lineage(CHECKPOINT, thread_id, namespace);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Checkpoints of one lineage with version in `[from, to)`
pub fn checkpoint_range(thread_id: &str, namespace: &str, from: u64, to: u64) -> KeyRange {
    KeyRange::new(
        checkpoint_key(thread_id, namespace, from),
        checkpoint_key(thread_id, namespace, to),
    )
}

pub fn id_key(thread_id: &str, namespace: &str, id: &str) -> Vec<u8> {
    let mut key = lineage(ID_INDEX, thread_id, namespace);
    push_str(&mut key, id);
    key
}

pub fn head_key(thread_id: &str, namespace: &str) -> Vec<u8> {
    lineage(HEAD, thread_id, namespace)
}

/// Heads of every namespace of a thread
pub fn thread_heads(thread_id: &str) -> KeyRange {
    KeyRange::prefix(tagged(HEAD, thread_id))
}

pub fn write_key(thread_id: &str, namespace: &str, version: u64, seq: u32) -> Vec<u8> {
    let mut key = lineage(WRITE, thread_id, namespace);
    key.extend_from_slice(&version.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Task writes recorded against one checkpoint
pub fn write_range(thread_id: &str, namespace: &str, version: u64) -> KeyRange {
    let mut prefix = lineage(WRITE, thread_id, namespace);
    prefix.extend_from_slice(&version.to_be_bytes());
    KeyRange::prefix(prefix)
}

/// Every key a thread owns under `tag`, for deletion
pub fn thread_ranges(thread_id: &str) -> Vec<KeyRange> {
    [CHECKPOINT, ID_INDEX, HEAD, WRITE]
        .into_iter()
        .map(|tag| KeyRange::prefix(tagged(tag, thread_id)))
        .collect()
}

/// Expiry timestamps are stored as non-negative milliseconds so they sort
fn expiry_millis(expires_at: chrono::DateTime<chrono::Utc>) -> u64 {
    expires_at.timestamp_millis().max(0) as u64
}

pub fn expiry_key(
    expires_at: chrono::DateTime<chrono::Utc>,
    thread_id: &str,
    namespace: &str,
    version: u64,
) -> Vec<u8> {
    let mut key = vec![EXPIRY];
    key.extend_from_slice(&expiry_millis(expires_at).to_be_bytes());
    push_str(&mut key, thread_id);
    push_str(&mut key, namespace);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Expiry entries with `expires_at <= now`
pub fn expired_range(now: chrono::DateTime<chrono::Utc>) -> KeyRange {
    let mut end = vec![EXPIRY];
    end.extend_from_slice(&(expiry_millis(now) + 1).to_be_bytes());
    KeyRange::new(vec![EXPIRY], end)
}

/// Address decoded from an expiry key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryEntry {
    pub expires_ms: u64,
    pub thread_id: String,
    pub namespace: String,
    pub version: u64,
}

pub fn decode_expiry_key(key: &[u8]) -> Result<ExpiryEntry> {
    let mut reader = Reader::new(key);
    if reader.byte()? != EXPIRY {
        return Err(CheckpointError::storage("not an expiry key"));
    }
    Ok(ExpiryEntry {
        expires_ms: reader.u64()?,
        thread_id: reader.string()?,
        namespace: reader.string()?,
        version: reader.u64()?,
    })
}

/// Namespace decoded from a head key
pub fn decode_head_namespace(key: &[u8]) -> Result<String> {
    let mut reader = Reader::new(key);
    if reader.byte()? != HEAD {
        return Err(CheckpointError::storage("not a head key"));
    }
    let _thread = reader.string()?;
    reader.string()
}

/// Namespace and version decoded from a checkpoint key
pub fn decode_checkpoint_key(key: &[u8]) -> Result<(String, u64)> {
    let mut reader = Reader::new(key);
    if reader.byte()? != CHECKPOINT {
        return Err(CheckpointError::storage("not a checkpoint key"));
    }
    let _thread = reader.string()?;
    let namespace = reader.string()?;
    Ok((namespace, reader.u64()?))
}

fn item_namespace_prefix(namespace: &[String], exact: bool) -> Vec<u8> {
    let mut key = vec![ITEM];
    for part in namespace {
        push_str(&mut key, part);
    }
    if exact {
        // 0xFFFFFFFF never occurs as a component length, so it terminates the path
        key.extend_from_slice(&u32::MAX.to_be_bytes());
    }
    key
}

pub fn item_key(namespace: &[String], key: &str) -> Vec<u8> {
    let mut buf = item_namespace_prefix(namespace, true);
    push_str(&mut buf, key);
    buf
}

/// Items whose namespace starts with `prefix`
pub fn item_range(prefix: &[String]) -> KeyRange {
    KeyRange::prefix(item_namespace_prefix(prefix, false))
}

/// Namespace path and key decoded from an item key
pub fn decode_item_key(key: &[u8]) -> Result<(Vec<String>, String)> {
    let mut reader = Reader::new(key);
    if reader.byte()? != ITEM {
        return Err(CheckpointError::storage("not an item key"));
    }
    let mut namespace = Vec::new();
    loop {
        let len = reader.u32()?;
        if len == u32::MAX {
            break;
        }
        namespace.push(reader.string_of(len as usize)?);
    }
    let item = reader.string()?;
    Ok((namespace, item))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(CheckpointError::storage("truncated key"));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    fn string_of(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CheckpointError::storage("non-utf8 key"))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        self.string_of(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn test_thread_prefix_does_not_leak_into_longer_names() {
        let heads = thread_heads("t1");
        assert!(heads.contains(&head_key("t1", "")));
        assert!(heads.contains(&head_key("t1", "inner")));
        assert!(!heads.contains(&head_key("t10", "")));
    }

    #[test]
    fn test_expiry_key_round_trip() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let key = expiry_key(at, "thread", "ns", 42);
        let entry = decode_expiry_key(&key).unwrap();

        assert_eq!(entry.expires_ms, 1_700_000_000_123);
        assert_eq!(entry.thread_id, "thread");
        assert_eq!(entry.namespace, "ns");
        assert_eq!(entry.version, 42);

        assert!(expired_range(at).contains(&key));
        let just_before = Utc.timestamp_millis_opt(1_700_000_000_122).unwrap();
        assert!(!expired_range(just_before).contains(&key));
    }

    #[test]
    fn test_item_namespaces_are_exact() {
        let ns = vec!["user_memories".to_string(), "user_123".to_string()];
        let key = item_key(&ns, "preference_1");

        assert_eq!(
            decode_item_key(&key).unwrap(),
            (ns.clone(), "preference_1".to_string())
        );
        assert!(item_range(&ns[..1]).contains(&key));
        assert!(item_range(&ns).contains(&key));

        let deeper = vec![ns[0].clone(), ns[1].clone(), "x".to_string()];
        assert!(!item_range(&deeper).contains(&key));
    }

    #[test]
    fn test_decode_checkpoint_key() {
        let key = checkpoint_key("t", "inner", 9);
        assert_eq!(decode_checkpoint_key(&key).unwrap(), ("inner".to_string(), 9));
        assert!(decode_checkpoint_key(&head_key("t", "inner")).is_err());
        assert_eq!(decode_head_namespace(&head_key("t", "ns")).unwrap(), "ns");
    }

    proptest! {
        #[test]
        fn prop_versions_sort_numerically(a in any::<u64>(), b in any::<u64>(), thread in "[a-z0-9_]{0,12}", ns in "[a-z]{0,6}") {
            let ka = checkpoint_key(&thread, &ns, a);
            let kb = checkpoint_key(&thread, &ns, b);
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }

        #[test]
        fn prop_lineage_range_holds_only_its_versions(v in 1u64..1000, lo in 1u64..1000, hi in 1u64..1000) {
            let range = checkpoint_range("t", "", lo, hi);
            prop_assert_eq!(range.contains(&checkpoint_key("t", "", v)), lo <= v && v < hi);
            prop_assert!(!range.contains(&checkpoint_key("t", "x", v)));
        }
    }
}
