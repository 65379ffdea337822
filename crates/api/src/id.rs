//! Identity types for attribute rings and overlay participants.

use std::sync::Arc;

macro_rules! imp_deref {
    ($i:ty, $t:ty) => {
        impl std::ops::Deref for $i {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

macro_rules! imp_from {
    ($a:ty, $b:ty, $i:ident => $e:expr) => {
        impl From<$b> for $a {
            fn from($i: $b) -> Self {
                $e
            }
        }
    };
}

/// Identifies one attribute ring (a "hub").
///
/// Every message on the wire is tagged with the ring it belongs to,
/// so one node can participate in several rings over one transport.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct AttrId(pub u8);

imp_deref!(AttrId, u8);
imp_from!(AttrId, u8, a => AttrId(a));

impl std::fmt::Display for AttrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The transport-level address of an overlay participant.
///
/// Cheap to clone. Ordering is lexical and is only used to make
/// aggregation deterministic.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct PeerAddr(Arc<str>);

imp_deref!(PeerAddr, str);
imp_from!(PeerAddr, &str, s => PeerAddr(s.into()));
imp_from!(PeerAddr, String, s => PeerAddr(s.into_boxed_str().into()));

impl PeerAddr {
    /// Get the address as a str.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn peer_addr_serializes_as_plain_string() {
        let addr = PeerAddr::from("mem://7");
        let enc = serde_json::to_string(&addr).unwrap();
        assert_eq!("\"mem://7\"", enc);
        let dec: PeerAddr = serde_json::from_str(&enc).unwrap();
        assert_eq!(addr, dec);
        assert_eq!("mem://7", format!("{dec:?}"));
    }

    #[test]
    fn attr_id_is_transparent() {
        assert_eq!("4", serde_json::to_string(&AttrId(4)).unwrap());
        assert_eq!(4, *AttrId::from(4));
    }
}
