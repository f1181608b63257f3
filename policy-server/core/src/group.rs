use std::{fmt, str::FromStr};

/// A small positive integer identifying a group in the packet mark.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u32);

/// The number of bytes of packet mark reserved for tags.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TagWidth(u8);

#[derive(Debug, thiserror::Error)]
#[error("tag width must be between 1 and 3 bytes, got {0}")]
pub struct InvalidTagWidth(u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKind {
    App,
    Router,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub key: String,
    pub tag: Tag,
    pub kind: GroupKind,
}

// === impl Tag ===

impl Tag {
    pub fn new(value: u32) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Formats the tag as lower-case hex, zero-padded to two characters per
    /// byte of `width`.
    pub fn to_hex(self, width: TagWidth) -> String {
        format!("{:0w$x}", self.0, w = width.hex_len())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// === impl TagWidth ===

impl TagWidth {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 3;

    pub fn new(bytes: u8) -> Result<Self, InvalidTagWidth> {
        if (Self::MIN..=Self::MAX).contains(&bytes) {
            Ok(Self(bytes))
        } else {
            Err(InvalidTagWidth(bytes))
        }
    }

    pub fn bytes(self) -> u8 {
        self.0
    }

    /// The largest tag representable in this width.
    pub fn max_tag(self) -> u32 {
        (1u32 << (8 * u32::from(self.0))) - 1
    }

    /// The packet-mark bits occupied by a tag.
    pub fn mask(self) -> u32 {
        self.max_tag()
    }

    pub fn hex_len(self) -> usize {
        2 * usize::from(self.0)
    }
}

impl Default for TagWidth {
    fn default() -> Self {
        Self(2)
    }
}

impl FromStr for TagWidth {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let bytes = s.parse::<u8>()?;
        Ok(Self::new(bytes)?)
    }
}

// === impl GroupKind ===

impl GroupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Router => "router",
            Self::Other => "other",
        }
    }
}

impl Default for GroupKind {
    fn default() -> Self {
        Self::App
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "app" => Ok(Self::App),
            "router" => Ok(Self::Router),
            "other" => Ok(Self::Other),
            _ => Err(crate::Error::bad_request(format!("unknown group type: {s}"))),
        }
    }
}
