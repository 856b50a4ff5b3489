//! Numeric formats, pixel codings and colour interpretations.

/// Numeric format of one band sample.
///
/// The discriminant doubles as the index into a saver's 10-entry
/// format promotion table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum BandFormat {
    #[default]
    UChar = 0,
    Char = 1,
    UShort = 2,
    Short = 3,
    UInt = 4,
    Int = 5,
    Float = 6,
    Complex = 7,
    Double = 8,
    DpComplex = 9,
}

/// Format promotion table: entry `i` is the output format for source format `i`.
pub type FormatTable = [BandFormat; 10];

impl BandFormat {
    pub const ALL: [BandFormat; 10] = [
        BandFormat::UChar,
        BandFormat::Char,
        BandFormat::UShort,
        BandFormat::Short,
        BandFormat::UInt,
        BandFormat::Int,
        BandFormat::Float,
        BandFormat::Complex,
        BandFormat::Double,
        BandFormat::DpComplex,
    ];

    /// Table that maps every format to itself (no cast on save).
    pub const IDENTITY_TABLE: FormatTable = Self::ALL;

    /// Table that maps every format to 8-bit unsigned.
    pub const UCHAR_TABLE: FormatTable = [BandFormat::UChar; 10];

    /// Index into a [`FormatTable`].
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Bytes per sample (complex formats count both components).
    pub const fn size(self) -> usize {
        match self {
            BandFormat::UChar | BandFormat::Char => 1,
            BandFormat::UShort | BandFormat::Short => 2,
            BandFormat::UInt | BandFormat::Int | BandFormat::Float => 4,
            BandFormat::Complex | BandFormat::Double => 8,
            BandFormat::DpComplex => 16,
        }
    }

    pub const fn is_8bit(self) -> bool {
        matches!(self, BandFormat::UChar | BandFormat::Char)
    }

    pub const fn is_complex(self) -> bool {
        matches!(self, BandFormat::Complex | BandFormat::DpComplex)
    }

    /// Bits per integer sample, `None` for float and complex formats.
    pub const fn int_bits(self) -> Option<u32> {
        match self {
            BandFormat::UChar | BandFormat::Char => Some(8),
            BandFormat::UShort | BandFormat::Short => Some(16),
            BandFormat::UInt | BandFormat::Int => Some(32),
            _ => None,
        }
    }

    /// Representable range for integer formats, `None` for float formats.
    pub fn range(self) -> Option<(f64, f64)> {
        match self {
            BandFormat::UChar => Some((0.0, u8::MAX as f64)),
            BandFormat::Char => Some((i8::MIN as f64, i8::MAX as f64)),
            BandFormat::UShort => Some((0.0, u16::MAX as f64)),
            BandFormat::Short => Some((i16::MIN as f64, i16::MAX as f64)),
            BandFormat::UInt => Some((0.0, u32::MAX as f64)),
            BandFormat::Int => Some((i32::MIN as f64, i32::MAX as f64)),
            _ => None,
        }
    }
}

/// Pixel coding: unpacked numeric bands or a packed representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Coding {
    #[default]
    None,
    /// Quantized Lab packed into 4 bytes (10-bit L, 11-bit a and b).
    LabQ,
    /// Radiance RGBE packed into 4 bytes.
    Rad,
}

/// How the bands of an image should be interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Interpretation {
    #[default]
    Multiband,
    BW,
    Grey16,
    Xyz,
    Lab,
    LabQ,
    LabS,
    Lch,
    Cmc,
    Yxy,
    Cmyk,
    Srgb,
    Rgb,
    Rgb16,
    ScRgb,
    Hsv,
}

impl Interpretation {
    /// Interpretation implied by band count and format alone.
    pub fn default_for(bands: u32, format: BandFormat, coding: Coding) -> Self {
        match coding {
            Coding::LabQ => return Interpretation::LabQ,
            Coding::Rad => return Interpretation::ScRgb,
            Coding::None => {}
        }

        if format.is_complex() {
            return Interpretation::Multiband;
        }

        match (bands, format) {
            (0, _) => Interpretation::Multiband,
            (1 | 2, BandFormat::UShort) => Interpretation::Grey16,
            (1 | 2, _) => Interpretation::BW,
            (_, BandFormat::UShort) => Interpretation::Rgb16,
            _ => Interpretation::Srgb,
        }
    }

    /// Is `self` believable for an image with this shape?
    pub fn is_sane(self, bands: u32, format: BandFormat, coding: Coding) -> bool {
        if coding == Coding::LabQ {
            return self == Interpretation::LabQ;
        }
        if format.is_complex() {
            return self == Interpretation::Multiband;
        }

        match self {
            Interpretation::Multiband => false,
            Interpretation::BW => bands <= 2,
            Interpretation::Grey16 => bands <= 2 && !format.is_8bit(),
            Interpretation::Rgb16 => bands >= 3 && !format.is_8bit(),
            Interpretation::LabQ => false,
            Interpretation::Cmyk => {
                bands >= 4
                    && matches!(
                        format,
                        BandFormat::UChar | BandFormat::UShort | BandFormat::Float
                    )
            }
            Interpretation::LabS => bands >= 3 && format == BandFormat::Short,
            Interpretation::Xyz
            | Interpretation::Lab
            | Interpretation::Lch
            | Interpretation::Cmc
            | Interpretation::Yxy
            | Interpretation::Srgb
            | Interpretation::Rgb
            | Interpretation::ScRgb
            | Interpretation::Hsv => bands >= 3,
        }
    }

    /// Sanity-checked interpretation: `self` if plausible, else the default.
    pub fn guess(self, bands: u32, format: BandFormat, coding: Coding) -> Self {
        if self.is_sane(bands, format, coding) {
            self
        } else {
            Self::default_for(bands, format, coding)
        }
    }

    /// Number of colour (non-extra) bands for this space.
    pub const fn colour_bands(self) -> u32 {
        match self {
            Interpretation::BW | Interpretation::Grey16 => 1,
            Interpretation::Cmyk | Interpretation::LabQ => 4,
            Interpretation::Multiband => 0,
            _ => 3,
        }
    }

    /// Value of a fully opaque alpha sample in this space.
    pub const fn max_alpha(self) -> f64 {
        match self {
            Interpretation::Grey16 | Interpretation::Rgb16 => 65535.0,
            Interpretation::ScRgb => 1.0,
            _ => 255.0,
        }
    }
}

/// Requested pixel access pattern for a load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Access {
    /// Any region in any order.
    #[default]
    Random,
    /// Top-to-bottom, each line read once.
    Sequential,
}

/// How readily a loader should turn warnings into errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum FailOn {
    /// Never fail.
    #[default]
    None,
    /// Fail on truncated input.
    Truncated,
    /// Fail on decode errors.
    Error,
    /// Fail on anything suspicious.
    Warning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_index_matches_discriminant() {
        for (i, format) in BandFormat::ALL.iter().enumerate() {
            assert_eq!(format.index(), i);
            assert_eq!(BandFormat::IDENTITY_TABLE[i], *format);
        }
    }

    #[test]
    fn sample_sizes() {
        assert_eq!(BandFormat::UChar.size(), 1);
        assert_eq!(BandFormat::UShort.size(), 2);
        assert_eq!(BandFormat::Complex.size(), 8);
        assert_eq!(BandFormat::DpComplex.size(), 16);
        assert!(BandFormat::Char.is_8bit());
        assert!(!BandFormat::UShort.is_8bit());
    }

    #[test]
    fn guess_rejects_implausible_cmyk() {
        let cmyk = Interpretation::Cmyk;
        assert_eq!(cmyk.guess(4, BandFormat::UChar, Coding::None), Interpretation::Cmyk);
        assert_eq!(cmyk.guess(3, BandFormat::UChar, Coding::None), Interpretation::Srgb);
        assert_eq!(cmyk.guess(1, BandFormat::UChar, Coding::None), Interpretation::BW);
    }

    #[test]
    fn defaults_follow_shape() {
        assert_eq!(
            Interpretation::default_for(1, BandFormat::UShort, Coding::None),
            Interpretation::Grey16
        );
        assert_eq!(
            Interpretation::default_for(4, BandFormat::UChar, Coding::None),
            Interpretation::Srgb
        );
        assert_eq!(
            Interpretation::default_for(4, BandFormat::UChar, Coding::LabQ),
            Interpretation::LabQ
        );
        assert_eq!(
            Interpretation::Multiband.guess(3, BandFormat::UShort, Coding::None),
            Interpretation::Rgb16
        );
        for format in [BandFormat::Short, BandFormat::Int, BandFormat::UInt] {
            assert_eq!(Interpretation::default_for(3, format, Coding::None), Interpretation::Srgb);
            assert_eq!(Interpretation::default_for(4, format, Coding::None), Interpretation::Srgb);
            assert_eq!(Interpretation::default_for(2, format, Coding::None), Interpretation::BW);
        }
        assert_eq!(
            Interpretation::default_for(2, BandFormat::Complex, Coding::None),
            Interpretation::Multiband
        );
    }
}
