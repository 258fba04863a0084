//! Binary envelope for cached payloads
//!
//! Little-endian layout:
//!
//! ```text
//! "XFC2" | version u8 (1) | expires_on i64 | has_refresh_on u8 | [refresh_on i64] | len i32 | payload
//! ```
//!
//! Anything that does not parse (short, bad magic, other version, bad
//! length) decodes to `None` and is handled as a cache miss.

/// Leading magic bytes
pub const MAGIC: &[u8; 4] = b"XFC2";

/// Only version this codec reads or writes
pub const VERSION: u8 = 1;

/// magic + version + expires_on + flag + length
const MIN_LEN: usize = 4 + 1 + 8 + 1 + 4;

/// Payload plus the times that govern its freshness (unix seconds)
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    pub expires_on: i64,
    pub refresh_on: Option<i64>,
    pub payload: Vec<u8>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("expires_on", &self.expires_on)
            .field("refresh_on", &self.refresh_on)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl Envelope {
    pub fn new(payload: Vec<u8>, expires_on: i64, refresh_on: Option<i64>) -> Self {
        Self {
            expires_on,
            refresh_on,
            payload,
        }
    }

    /// `now + skew >= expires_on`
    pub fn is_expired(&self, now: i64, skew_secs: i64) -> bool {
        now + skew_secs >= self.expires_on
    }

    /// Past `refresh_on` when set, else within the skew of expiry
    pub fn is_past_refresh(&self, now: i64, skew_secs: i64) -> bool {
        match self.refresh_on {
            Some(refresh_on) => now >= refresh_on,
            None => now >= self.expires_on - skew_secs,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let refresh_len = if self.refresh_on.is_some() { 8 } else { 0 };
        let mut buf = Vec::with_capacity(MIN_LEN + refresh_len + self.payload.len());

        buf.extend_from_slice(MAGIC);
        buf.push(VERSION);
        buf.extend_from_slice(&self.expires_on.to_le_bytes());
        match self.refresh_on {
            Some(refresh_on) => {
                buf.push(1);
                buf.extend_from_slice(&refresh_on.to_le_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&(self.payload.len() as i32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode an envelope; trailing bytes after the payload are ignored
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < MIN_LEN {
            return None;
        }

        let mut reader = Reader { data, pos: 0 };
        if reader.take(4)? != MAGIC || reader.byte()? != VERSION {
            return None;
        }

        let expires_on = reader.i64()?;
        let refresh_on = match reader.byte()? {
            0 => None,
            _ => Some(reader.i64()?),
        };

        let len = usize::try_from(reader.i32()?).ok()?;
        let payload = reader.take(len)?.to_vec();

        Some(Self {
            expires_on,
            refresh_on,
            payload,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn byte(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn i64(&mut self) -> Option<i64> {
        self.take(8)?.try_into().ok().map(i64::from_le_bytes)
    }

    fn i32(&mut self) -> Option<i32> {
        self.take(4)?.try_into().ok().map(i32::from_le_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_and_without_refresh_on() {
        let with = Envelope::new(b"key material".to_vec(), 1_700_003_600, Some(1_700_001_800));
        assert_eq!(Envelope::decode(&with.encode()), Some(with.clone()));

        let without = Envelope::new(Vec::new(), -5, None);
        assert_eq!(Envelope::decode(&without.encode()), Some(without));
    }

    #[test]
    fn test_layout() {
        let bytes = Envelope::new(vec![0xAB], 1, Some(2)).encode();
        assert_eq!(&bytes[..4], b"XFC2");
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[5..13], &1i64.to_le_bytes());
        assert_eq!(bytes[13], 1);
        assert_eq!(&bytes[14..22], &2i64.to_le_bytes());
        assert_eq!(&bytes[22..26], &1i32.to_le_bytes());
        assert_eq!(bytes[26], 0xAB);
        assert_eq!(bytes.len(), 27);
    }

    #[test]
    fn test_corrupt_input_is_none() {
        let good = Envelope::new(b"payload".to_vec(), 100, None).encode();

        assert!(Envelope::decode(&[]).is_none());
        assert!(Envelope::decode(&good[..good.len() - 1]).is_none());

        let mut bad_magic = good.clone();
        bad_magic[0] = b'Y';
        assert!(Envelope::decode(&bad_magic).is_none());

        let mut bad_version = good.clone();
        bad_version[4] = 2;
        assert!(Envelope::decode(&bad_version).is_none());

        let mut negative_len = good.clone();
        negative_len[14..18].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(Envelope::decode(&negative_len).is_none());

        let mut missing_refresh = good;
        missing_refresh[13] = 1;
        missing_refresh.truncate(MIN_LEN + 2);
        assert!(Envelope::decode(&missing_refresh).is_none());
    }

    #[test]
    fn test_freshness() {
        let now = 1_000_000;
        let envelope = Envelope::new(Vec::new(), now + 3600, Some(now - 1));
        assert!(!envelope.is_expired(now, 300));
        assert!(envelope.is_past_refresh(now, 300));

        let expired = Envelope::new(Vec::new(), now - 1, None);
        assert!(expired.is_expired(now, 300));

        let near_expiry = Envelope::new(Vec::new(), now + 200, None);
        assert!(near_expiry.is_past_refresh(now, 300));
    }
}
