// THEORY (single-pixel colour math):
// The `Pixel` module is the smallest unit the segmenter reasons about. It wraps
// one RGB sample and knows how to express it in the colour spaces the
// superpixel clustering needs, without ever looking at a neighbour.
//
// Channel forms kept on the struct:
//   • normalized (0..1 sRGB):  divide by 255.0, still gamma-encoded
//   • linearized (0..1 linear): sRGB → linear light through a 256-entry LUT
//
// Clustering distances are only meaningful in a perceptually uniform space, so
// the segmenter works in CIE L*a*b* (D65 white point, 2° observer):
//   sRGB bytes → linear RGB (LUT) → XYZ → L*a*b*
// L* spans 0..100 and a*/b* roughly −128..127. The compactness factor of the
// segmenter is calibrated against those ranges.
//
// Key principles:
// 1) Single-pixel scope: nothing here reads neighbours or other frames.
// 2) The sRGB → linear conversion is a table lookup; `powf` runs once per
//    byte value for the whole process.

pub mod pixel {
    use std::sync::OnceLock;

    pub type Channel = u8;
    pub type NormalizedChannel = f64;
    pub type LinearizedChannel = f64;
    pub type Luminance = f64;

    /// D65 reference white in XYZ.
    const WHITE_X: f64 = 0.95047;
    const WHITE_Y: f64 = 1.0;
    const WHITE_Z: f64 = 1.08883;

    // Fast path: 256-entry LUT for sRGB (0..255) -> linear normalized (0..1)
    static SRGB_TO_LINEAR_LUT: OnceLock<[LinearizedChannel; 256]> = OnceLock::new();

    /// A CIE L*a*b* colour.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Lab {
        pub l: f64,
        pub a: f64,
        pub b: f64,
    }

    /// A single RGB sample with its precomputed channel transforms.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Pixel {
        /// The red channel value (0-255).
        pub red: Channel,
        /// The green channel value (0-255).
        pub green: Channel,
        /// The blue channel value (0-255).
        pub blue: Channel,
        /// The red channel value (0.0-1.0).
        pub red_normalized: NormalizedChannel,
        /// The green channel value (0.0-1.0).
        pub green_normalized: NormalizedChannel,
        /// The blue channel value (0.0-1.0).
        pub blue_normalized: NormalizedChannel,
        pub red_linearized: LinearizedChannel,
        pub green_linearized: LinearizedChannel,
        pub blue_linearized: LinearizedChannel,
    }

    impl Pixel {
        pub fn new(red: Channel, green: Channel, blue: Channel) -> Self {
            Pixel {
                red,
                green,
                blue,
                red_normalized: red as NormalizedChannel / 255.0,
                green_normalized: green as NormalizedChannel / 255.0,
                blue_normalized: blue as NormalizedChannel / 255.0,
                red_linearized: Self::srgb_to_linear_normalized_from_byte(red),
                green_linearized: Self::srgb_to_linear_normalized_from_byte(green),
                blue_linearized: Self::srgb_to_linear_normalized_from_byte(blue),
            }
        }

        #[inline]
        fn srgb_to_linear_normalized_from_byte(srgb_value: Channel) -> LinearizedChannel {
            let table = SRGB_TO_LINEAR_LUT.get_or_init(|| {
                let mut table = [0.0f64; 256];
                for (i, entry) in table.iter_mut().enumerate() {
                    let srgb_normalized = i as f64 / 255.0;
                    *entry = if srgb_normalized <= 0.04045 {
                        srgb_normalized / 12.92
                    } else {
                        ((srgb_normalized + 0.055) / 1.055).powf(2.4)
                    };
                }
                table
            });
            table[srgb_value as usize]
        }

        /// Luminance estimate (Rec. 601 luma) on the 0..255 scale.
        pub fn luminance(&self) -> Luminance {
            0.299 * self.red as f64 + 0.587 * self.green as f64 + 0.114 * self.blue as f64
        }

        /// CIE XYZ (D65) from linear RGB.
        pub fn xyz(&self) -> (f64, f64, f64) {
            let (r, g, b) = (self.red_linearized, self.green_linearized, self.blue_linearized);
            let x = 0.412453 * r + 0.357580 * g + 0.180423 * b;
            let y = 0.212671 * r + 0.715160 * g + 0.072169 * b;
            let z = 0.019334 * r + 0.119193 * g + 0.950227 * b;
            (x, y, z)
        }

        /// CIE L*a*b* relative to the D65 white point.
        pub fn lab(&self) -> Lab {
            let (x, y, z) = self.xyz();
            let fx = lab_companding(x / WHITE_X);
            let fy = lab_companding(y / WHITE_Y);
            let fz = lab_companding(z / WHITE_Z);
            Lab {
                l: 116.0 * fy - 16.0,
                a: 500.0 * (fx - fy),
                b: 200.0 * (fy - fz),
            }
        }
    }

    fn lab_companding(t: f64) -> f64 {
        const EPSILON: f64 = 216.0 / 24389.0;
        const KAPPA: f64 = 24389.0 / 27.0;
        if t > EPSILON {
            t.cbrt()
        } else {
            (KAPPA * t + 16.0) / 116.0
        }
    }

    impl From<[Channel; 3]> for Pixel {
        fn from(bytes: [Channel; 3]) -> Self {
            Pixel::new(bytes[0], bytes[1], bytes[2])
        }
    }
}
