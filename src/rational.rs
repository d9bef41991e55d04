/// An exact numerator/denominator pair, always kept in lowest terms with a
/// positive denominator.
///
/// `average_frame_rate()` returns this rather than a float so that a value
/// like `30000/1001` round-trips exactly, matching what `ffprobe` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    numerator: i64,
    denominator: i64,
}

impl Rational {
    pub fn new(numerator: i64, denominator: i64) -> Self {
        assert!(denominator != 0, "rational denominator must be nonzero");
        let sign = if denominator < 0 { -1 } else { 1 };
        let (mut n, mut d) = (numerator * sign, denominator * sign);
        let g = gcd(n.unsigned_abs(), d.unsigned_abs()).max(1);
        n /= g as i64;
        d /= g as i64;
        Self {
            numerator: n,
            denominator: d,
        }
    }

    pub fn numerator(&self) -> i64 {
        self.numerator
    }

    pub fn denominator(&self) -> i64 {
        self.denominator
    }

    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

impl From<ffmpeg_next::Rational> for Rational {
    fn from(r: ffmpeg_next::Rational) -> Self {
        Rational::new(r.numerator() as i64, r.denominator() as i64)
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduces_to_lowest_terms() {
        let r = Rational::new(60000, 2002);
        assert_eq!(r.numerator(), 30000);
        assert_eq!(r.denominator(), 1001);
    }

    #[test]
    fn negative_denominator_normalizes_sign() {
        let r = Rational::new(1, -2);
        assert_eq!(r.numerator(), -1);
        assert_eq!(r.denominator(), 2);
    }

    #[test]
    fn exact_ntsc_rate() {
        let r = Rational::new(30000, 1001);
        assert_eq!((r.numerator(), r.denominator()), (30000, 1001));
        assert!((r.as_f64() - 29.97).abs() < 0.01);
    }
}
