//! Namespace names and the fixed-width catalog hash key.
//!
//! A namespace is `database.collection`; the collection portion may itself
//! contain dots (`acme.system.indexes`). The database portion is everything
//! before the first dot. Full names must fit the 128-byte on-disk key buffer
//! including its terminator; database names are capped at 255 bytes.

use eyre::Result;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::ErrorKind;

/// Max length of a full namespace name, including the terminating zero.
pub const MAX_NS_LEN: usize = 128;
/// Max length of a database name, including the terminating zero.
pub const MAX_DB_LEN: usize = 256;

/// Marker byte stored in the first key byte of a killed catalog slot.
pub const KILLED: u8 = 0x7f;

/// Splits a namespace into its database portion, validating length.
pub fn ns_to_database(ns: &str) -> Result<&str> {
    let db = match ns.find('.') {
        Some(i) => &ns[..i],
        None => ns,
    };
    if db.len() >= MAX_DB_LEN {
        return Err(eyre::Report::new(ErrorKind::NameTooLong {
            name: ns.to_string(),
            max: MAX_DB_LEN - 1,
        }));
    }
    Ok(db)
}

/// A parsed `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceString {
    pub db: String,
    pub coll: String,
}

impl NamespaceString {
    pub fn new(ns: &str) -> Self {
        match ns.find('.') {
            Some(i) => Self {
                db: ns[..i].to_string(),
                coll: ns[i + 1..].to_string(),
            },
            None => Self {
                db: ns.to_string(),
                coll: String::new(),
            },
        }
    }

    pub fn ns(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }

    pub fn is_system(&self) -> bool {
        self.coll.starts_with("system.")
    }
}

/// The catalog hash key: a zero-terminated namespace name in a fixed
/// 128-byte buffer, exactly as it lives in the mapped `.ns` file.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NsKey {
    buf: [u8; MAX_NS_LEN],
}

impl NsKey {
    pub fn new(ns: &str) -> Result<Self> {
        if ns.len() >= MAX_NS_LEN {
            return Err(eyre::Report::new(ErrorKind::NameTooLong {
                name: ns.to_string(),
                max: MAX_NS_LEN - 1,
            }));
        }
        let mut buf = [0u8; MAX_NS_LEN];
        buf[..ns.len()].copy_from_slice(ns.as_bytes());
        Ok(Self { buf })
    }

    pub fn as_str(&self) -> &str {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_NS_LEN);
        std::str::from_utf8(&self.buf[..end]).unwrap_or("")
    }

    /// Horner polynomial over the name bytes, masked to 31 bits and forced
    /// nonzero (a zero hash marks an unused slot).
    pub fn hash(&self) -> i32 {
        let mut x: u32 = 0;
        for &b in &self.buf {
            if b == 0 {
                break;
            }
            x = x.wrapping_mul(131).wrapping_add(b as u32);
        }
        ((x & 0x7fff_ffff) | 0x0800_0000) as i32
    }

    /// Marks the slot as deleted.
    pub fn kill(&mut self) {
        self.buf[0] = KILLED;
    }

    pub fn is_killed(&self) -> bool {
        self.buf[0] == KILLED
    }

    /// The synthetic namespace reserving slot `i` of the overflow chain:
    /// `<ns>$extra` for 0, `<ns>$extrb` for 1, and so on.
    pub fn extra_name(&self, i: usize) -> Result<String> {
        let mut suffix = *b"$extra";
        suffix[5] += i as u8;
        let s = format!("{}{}", self.as_str(), std::str::from_utf8(&suffix).unwrap());
        eyre::ensure!(s.len() < MAX_NS_LEN, "$extra: ns name too long: '{}'", s);
        Ok(s)
    }

    /// True for the reserved `$extra`/`$extrb` overflow keys. The trailing
    /// character check matters: an index could legitimately be named
    /// `$extra_1`, which is not an overflow key.
    pub fn is_extra(&self) -> bool {
        is_extra_name(self.as_str())
    }

    pub fn has_dollar_sign(&self) -> bool {
        self.as_str().contains('$')
    }

    /// `("foo.bar").sister_ns("baz") == "foo.baz"`.
    pub fn sister_ns(&self, local: &str) -> String {
        debug_assert!(!local.is_empty() && !local.starts_with('.'));
        let name = self.as_str();
        let db = match name.find('.') {
            Some(i) => &name[..i],
            None => name,
        };
        format!("{}.{}", db, local)
    }
}

/// Shared with plain-string call sites that have no key at hand.
pub fn is_extra_name(name: &str) -> bool {
    match name.rfind("$extr") {
        Some(i) => {
            let tail = &name.as_bytes()[i..];
            tail.len() == 6 && tail[5] != 0
        }
        None => false,
    }
}

impl PartialEq for NsKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl std::fmt::Debug for NsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NsKey({:?})", self.as_str())
    }
}
