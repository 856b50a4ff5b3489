//! Capability bit-sets shared by adapters, the registry and both pipelines.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

macro_rules! bitset {
    ($(#[$meta:meta])* $name:ident { $($(#[$cmeta:meta])* $flag:ident = $bit:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u8);

        impl $name {
            /// No bits set.
            pub const EMPTY: Self = $name(0);
            $($(#[$cmeta])* pub const $flag: Self = $name($bit);)*

            /// Raw bit value.
            pub const fn bits(self) -> u8 {
                self.0
            }

            /// True when every bit of `other` is set in `self`.
            pub const fn contains(self, other: Self) -> bool {
                other.0 != 0 && (self.0 & other.0) == other.0
            }

            /// True when no bit is set.
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            pub const fn union(self, other: Self) -> Self {
                $name(self.0 | other.0)
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.insert(rhs);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut names = Vec::new();
                $(if self.contains(Self::$flag) {
                    names.push(stringify!($flag));
                })*
                if names.is_empty() {
                    write!(f, "{}(EMPTY)", stringify!($name))
                } else {
                    write!(f, "{}({})", stringify!($name), names.join(" | "))
                }
            }
        }
    };
}

bitset! {
    /// Flags a loader reports about a particular file.
    LoadFlags {
        /// Directly addressable: any region can be read in any order.
        PARTIAL = 1 << 0,
        /// Lazy, top-to-bottom only.
        SEQUENTIAL = 1 << 1,
        /// Pixel words are most-significant byte first.
        BIGENDIAN = 1 << 2,
    }
}

impl LoadFlags {
    /// Resolve the PARTIAL/SEQUENTIAL conflict by keeping SEQUENTIAL.
    ///
    /// Returns the cleaned flags and whether a conflict was found.
    pub fn normalized(self) -> (Self, bool) {
        if self.contains(Self::PARTIAL) && self.contains(Self::SEQUENTIAL) {
            let mut cleaned = self;
            cleaned.remove(Self::PARTIAL);
            (cleaned, true)
        } else {
            (self, false)
        }
    }
}

bitset! {
    /// Band structures a saver accepts.
    ///
    /// The empty set is the special value [`Saveable::ANY`]: the saver takes
    /// whatever arrives and no band-structure normalization happens.
    Saveable {
        MONO = 1 << 0,
        RGB = 1 << 1,
        CMYK = 1 << 2,
        ALPHA = 1 << 3,
    }
}

impl Saveable {
    /// Accept any band structure.
    pub const ANY: Self = Saveable(0);

    pub const RGBA: Self = Saveable(Self::RGB.0 | Self::ALPHA.0);

    pub const fn is_any(self) -> bool {
        self.0 == 0
    }

    /// Whether alpha survives: `ANY` savers take whatever arrives.
    pub const fn accepts_alpha(self) -> bool {
        self.is_any() || self.contains(Self::ALPHA)
    }
}

bitset! {
    /// Pixel codings a saver accepts.
    CodingSet {
        /// Plain unpacked numeric pixels.
        NONE = 1 << 0,
        /// Packed quantized Lab.
        LABQ = 1 << 1,
        /// Packed Radiance RGBE.
        RAD = 1 << 2,
    }
}

bitset! {
    /// Which metadata survives a save.
    Keep {
        EXIF = 1 << 0,
        XMP = 1 << 1,
        IPTC = 1 << 2,
        ICC = 1 << 3,
        /// Everything that is not EXIF, XMP, IPTC or ICC.
        OTHER = 1 << 4,
    }
}

impl Keep {
    pub const NONE: Self = Keep(0);
    pub const ALL: Self = Keep(0b1_1111);
}

bitset! {
    /// Source kinds a loader can read from.
    SourceKinds {
        FILE = 1 << 0,
        BUFFER = 1 << 1,
        STREAM = 1 << 2,
    }
}

impl SourceKinds {
    pub const ALL: Self = SourceKinds(0b111);
}

bitset! {
    /// Output kinds a saver can write to.
    SaveKinds {
        FILE = 1 << 0,
        BUFFER = 1 << 1,
        TARGET = 1 << 2,
    }
}

impl SaveKinds {
    pub const ALL: Self = SaveKinds(0b111);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_sequential_conflict_keeps_sequential() {
        let (flags, conflict) = (LoadFlags::PARTIAL | LoadFlags::SEQUENTIAL).normalized();
        assert!(conflict);
        assert_eq!(flags, LoadFlags::SEQUENTIAL);

        let (flags, conflict) = (LoadFlags::PARTIAL | LoadFlags::BIGENDIAN).normalized();
        assert!(!conflict);
        assert!(flags.contains(LoadFlags::PARTIAL));
    }

    #[test]
    fn any_is_not_a_member_test() {
        assert!(Saveable::ANY.is_any());
        assert!(!Saveable::ANY.contains(Saveable::MONO));
        assert!(Saveable::ANY.accepts_alpha());
        assert!(!Saveable::RGB.accepts_alpha());
        assert!(Saveable::RGBA.accepts_alpha());
    }

    #[test]
    fn keep_shorthands() {
        assert!(Keep::ALL.contains(Keep::EXIF | Keep::XMP | Keep::IPTC | Keep::ICC | Keep::OTHER));
        assert!(Keep::NONE.is_empty());
        let mut keep = Keep::ICC;
        keep |= Keep::EXIF;
        assert!(keep.contains(Keep::EXIF));
        keep.remove(Keep::ICC);
        assert!(!keep.contains(Keep::ICC));
    }

    #[test]
    fn debug_lists_flag_names() {
        let text = format!("{:?}", CodingSet::NONE | CodingSet::LABQ);
        assert_eq!(text, "CodingSet(NONE | LABQ)");
        assert_eq!(format!("{:?}", LoadFlags::EMPTY), "LoadFlags(EMPTY)");
    }
}
