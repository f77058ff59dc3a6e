//! The `grpc-timeout` wire format.
//!
//! A timeout on the wire is one to eight decimal digits followed by a unit
//! letter. Timeouts that need more than eight digits are rounded *up* into a
//! coarser unit before serialization, so a deadline is never shortened by
//! encoding.

use std::{error::Error, fmt, time::Duration};

use http::{HeaderMap, HeaderValue};

use crate::metadata::GRPC_TIMEOUT_HEADER;

/// The largest amount representable on the wire: eight decimal digits.
const MAX_WIRE_AMOUNT: u64 = 99_999_999;

const SECONDS_IN_HOUR: u64 = 60 * 60;
const SECONDS_IN_MINUTE: u64 = 60;

/// Unit of a [`Timeout`], ordered from coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutUnit {
    /// `H`
    Hours,
    /// `M`
    Minutes,
    /// `S`
    Seconds,
    /// `m`
    Milliseconds,
    /// `u`
    Microseconds,
    /// `n`
    Nanoseconds,
}

impl TimeoutUnit {
    fn wire_char(self) -> char {
        match self {
            TimeoutUnit::Hours => 'H',
            TimeoutUnit::Minutes => 'M',
            TimeoutUnit::Seconds => 'S',
            TimeoutUnit::Milliseconds => 'm',
            TimeoutUnit::Microseconds => 'u',
            TimeoutUnit::Nanoseconds => 'n',
        }
    }

    /// The next coarser unit and the factor between them, or `None` at `H`.
    fn promote(self) -> Option<(TimeoutUnit, u64)> {
        match self {
            TimeoutUnit::Hours => None,
            TimeoutUnit::Minutes => Some((TimeoutUnit::Hours, 60)),
            TimeoutUnit::Seconds => Some((TimeoutUnit::Minutes, SECONDS_IN_MINUTE)),
            TimeoutUnit::Milliseconds => Some((TimeoutUnit::Seconds, 1000)),
            TimeoutUnit::Microseconds => Some((TimeoutUnit::Milliseconds, 1000)),
            TimeoutUnit::Nanoseconds => Some((TimeoutUnit::Microseconds, 1000)),
        }
    }

}

/// A gRPC RPC deadline as carried by the `grpc-timeout` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeout {
    amount: u64,
    unit: TimeoutUnit,
}

/// Error returned when a `grpc-timeout` value cannot be parsed.
///
/// Carries the offending text so callers can log it; per the gRPC spec an
/// unparseable timeout is ignored rather than failing the RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTimeout {
    value: String,
}

impl fmt::Display for InvalidTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid grpc-timeout value {:?}", self.value)
    }
}

impl Error for InvalidTimeout {}

impl Timeout {
    /// The sentinel for "no deadline". Never serialized onto the wire.
    pub const INFINITE: Timeout = Timeout {
        amount: u64::MAX,
        unit: TimeoutUnit::Nanoseconds,
    };

    /// Create a timeout, rounding the amount up into coarser units until it
    /// fits in eight wire digits.
    ///
    /// Rounding saturates at `99999999H`.
    pub fn new(amount: u64, unit: TimeoutUnit) -> Timeout {
        if amount == u64::MAX && unit == TimeoutUnit::Nanoseconds {
            return Timeout::INFINITE;
        }
        let (amount, unit) = round_up(amount, unit);
        Timeout { amount, unit }
    }

    /// Whether this is the [`Timeout::INFINITE`] sentinel.
    pub fn is_infinite(&self) -> bool {
        self.amount > MAX_WIRE_AMOUNT
    }

    /// The wire amount (at most eight digits), unless infinite.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// The wire unit.
    pub fn unit(&self) -> TimeoutUnit {
        self.unit
    }

    /// Parse the wire form: one to eight digits followed by a unit letter.
    pub fn from_wire(value: &str) -> Result<Timeout, InvalidTimeout> {
        let invalid = || InvalidTimeout {
            value: value.to_string(),
        };

        if value.is_empty() || !value.is_ascii() {
            return Err(invalid());
        }

        let (digits, unit) = value.split_at(value.len() - 1);

        // The spec caps TimeoutValue at 8 digits. Enforcing the cap before
        // parsing also rules out integer overflow.
        if digits.is_empty() || digits.len() > 8 {
            return Err(invalid());
        }

        let amount: u64 = digits.parse().map_err(|_| invalid())?;

        let unit = match unit {
            "H" => TimeoutUnit::Hours,
            "M" => TimeoutUnit::Minutes,
            "S" => TimeoutUnit::Seconds,
            "m" => TimeoutUnit::Milliseconds,
            "u" => TimeoutUnit::Microseconds,
            "n" => TimeoutUnit::Nanoseconds,
            _ => return Err(invalid()),
        };

        Ok(Timeout { amount, unit })
    }

    /// The header value for this timeout, or `None` for the infinite
    /// sentinel, which must not be transmitted.
    pub fn to_header_value(&self) -> Option<HeaderValue> {
        if self.is_infinite() {
            return None;
        }
        let mut wire = self.amount.to_string();
        wire.push(self.unit.wire_char());
        Some(HeaderValue::from_str(&wire).expect("digits and a unit letter are valid header text"))
    }

    /// Read and parse the `grpc-timeout` header, if present.
    pub fn from_header_map(headers: &HeaderMap) -> Result<Option<Timeout>, InvalidTimeout> {
        let Some(val) = headers.get(GRPC_TIMEOUT_HEADER) else {
            return Ok(None);
        };

        let text = val.to_str().map_err(|_| InvalidTimeout {
            value: String::from_utf8_lossy(val.as_bytes()).into_owned(),
        })?;

        Timeout::from_wire(text).map(Some)
    }

    /// This timeout as a [`Duration`]. The infinite sentinel saturates to
    /// [`Duration::MAX`].
    pub fn as_duration(&self) -> Duration {
        if self.is_infinite() {
            return Duration::MAX;
        }
        match self.unit {
            TimeoutUnit::Hours => Duration::from_secs(self.amount * SECONDS_IN_HOUR),
            TimeoutUnit::Minutes => Duration::from_secs(self.amount * SECONDS_IN_MINUTE),
            TimeoutUnit::Seconds => Duration::from_secs(self.amount),
            TimeoutUnit::Milliseconds => Duration::from_millis(self.amount),
            TimeoutUnit::Microseconds => Duration::from_micros(self.amount),
            TimeoutUnit::Nanoseconds => Duration::from_nanos(self.amount),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Timeout {
        let nanos = duration.as_nanos();
        if nanos < u64::MAX as u128 {
            Timeout::new(nanos as u64, TimeoutUnit::Nanoseconds)
        } else {
            // Round the sub-second part up so the encoded deadline is never
            // earlier than the requested one.
            let secs = duration
                .as_secs()
                .saturating_add(u64::from(duration.subsec_nanos() != 0));
            Timeout::new(secs, TimeoutUnit::Seconds)
        }
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "infinite")
        } else {
            write!(f, "{}{}", self.amount, self.unit.wire_char())
        }
    }
}

fn round_up(mut amount: u64, mut unit: TimeoutUnit) -> (u64, TimeoutUnit) {
    while amount > MAX_WIRE_AMOUNT {
        match unit.promote() {
            Some((coarser, factor)) => {
                amount = amount / factor + u64::from(amount % factor != 0);
                unit = coarser;
            }
            None => return (MAX_WIRE_AMOUNT, TimeoutUnit::Hours),
        }
    }
    (amount, unit)
}

/// Error raised when an RPC's deadline has passed.
#[derive(Debug)]
pub(crate) struct TimeoutExpired(pub(crate) Timeout);

impl fmt::Display for TimeoutExpired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call exceeded timeout of {}", self.0)
    }
}

impl Error for TimeoutExpired {}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn setup_map_parse(val: Option<&str>) -> Result<Option<Timeout>, InvalidTimeout> {
        let mut hm = HeaderMap::new();
        if let Some(v) = val {
            let hv = HeaderValue::from_str(v).unwrap();
            hm.insert(GRPC_TIMEOUT_HEADER, hv);
        };

        Timeout::from_header_map(&hm)
    }

    #[test]
    fn test_hours() {
        let parsed = setup_map_parse(Some("3H")).unwrap().unwrap();
        assert_eq!(Duration::from_secs(3 * 60 * 60), parsed.as_duration());
    }

    #[test]
    fn test_minutes() {
        let parsed = setup_map_parse(Some("1M")).unwrap().unwrap();
        assert_eq!(Duration::from_secs(60), parsed.as_duration());
    }

    #[test]
    fn test_seconds() {
        let parsed = setup_map_parse(Some("42S")).unwrap().unwrap();
        assert_eq!(Duration::from_secs(42), parsed.as_duration());
    }

    #[test]
    fn test_milliseconds() {
        let parsed = setup_map_parse(Some("13m")).unwrap().unwrap();
        assert_eq!(Duration::from_millis(13), parsed.as_duration());
    }

    #[test]
    fn test_microseconds() {
        let parsed = setup_map_parse(Some("2u")).unwrap().unwrap();
        assert_eq!(Duration::from_micros(2), parsed.as_duration());
    }

    #[test]
    fn test_nanoseconds() {
        let parsed = setup_map_parse(Some("82n")).unwrap().unwrap();
        assert_eq!(Duration::from_nanos(82), parsed.as_duration());
    }

    #[test]
    fn test_header_not_present() {
        let parsed = setup_map_parse(None).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_invalid_unit() {
        // "f" is not a valid TimeoutUnit
        setup_map_parse(Some("82f")).unwrap_err();
    }

    #[test]
    fn test_too_many_digits() {
        // gRPC spec states TimeoutValue will be at most 8 digits
        setup_map_parse(Some("123456789H")).unwrap_err();
    }

    #[test]
    fn test_invalid_digits() {
        setup_map_parse(Some("oneH")).unwrap_err();
    }

    #[test]
    fn rounding_promotes_until_eight_digits() {
        // 123_456_789 ns doesn't fit; 123_457 us does.
        let t = Timeout::new(123_456_789, TimeoutUnit::Nanoseconds);
        assert_eq!(t.amount(), 123_457);
        assert_eq!(t.unit(), TimeoutUnit::Microseconds);
    }

    #[test]
    fn rounding_never_shrinks() {
        let t = Timeout::new(123_456_789, TimeoutUnit::Nanoseconds);
        assert!(t.as_duration() >= Duration::from_nanos(123_456_789));
    }

    #[test]
    fn rounding_uses_sixty_for_minutes_and_hours() {
        // 100_000_000 s -> 1_666_667 M
        let t = Timeout::new(100_000_000, TimeoutUnit::Seconds);
        assert_eq!(t.amount(), 1_666_667);
        assert_eq!(t.unit(), TimeoutUnit::Minutes);
    }

    #[test]
    fn rounding_lands_in_hours_from_nanoseconds() {
        let t = Timeout::new(u64::MAX - 1, TimeoutUnit::Nanoseconds);
        assert_eq!(t.unit(), TimeoutUnit::Hours);
        assert!(t.amount() <= MAX_WIRE_AMOUNT);
    }

    #[test]
    fn rounding_saturates_at_max_hours() {
        let t = Timeout::new(u64::MAX - 1, TimeoutUnit::Hours);
        assert_eq!(t.amount(), MAX_WIRE_AMOUNT);
        assert_eq!(t.unit(), TimeoutUnit::Hours);
        assert!(!t.is_infinite());
    }

    #[test]
    fn infinite_is_not_transmitted() {
        assert!(Timeout::INFINITE.to_header_value().is_none());
        assert_eq!(Timeout::INFINITE.to_string(), "infinite");
    }

    #[test]
    fn display_matches_wire() {
        let t = Timeout::new(100, TimeoutUnit::Milliseconds);
        assert_eq!(t.to_string(), "100m");
        assert_eq!(t.to_header_value().unwrap(), "100m");
    }

    #[derive(Clone, Debug)]
    struct WireTimeout(Timeout);

    impl Arbitrary for WireTimeout {
        fn arbitrary(g: &mut Gen) -> Self {
            let unit = *g
                .choose(&[
                    TimeoutUnit::Hours,
                    TimeoutUnit::Minutes,
                    TimeoutUnit::Seconds,
                    TimeoutUnit::Milliseconds,
                    TimeoutUnit::Microseconds,
                    TimeoutUnit::Nanoseconds,
                ])
                .unwrap();
            let amount = u64::arbitrary(g) % (MAX_WIRE_AMOUNT + 1);
            Self(Timeout::new(amount, unit))
        }
    }

    #[quickcheck]
    fn wire_round_trips(t: WireTimeout) -> bool {
        let wire = t.0.to_header_value().unwrap();
        Timeout::from_wire(wire.to_str().unwrap()).unwrap() == t.0
    }

    #[quickcheck]
    fn parse_never_panics(header_value: HeaderValueGen) -> bool {
        let _ = setup_map_parse(Some(&header_value.0));
        true
    }

    /// Newtype to implement `Arbitrary` for generating `String`s that are
    /// valid `HeaderValue`s.
    #[derive(Clone, Debug)]
    struct HeaderValueGen(String);

    impl Arbitrary for HeaderValueGen {
        fn arbitrary(g: &mut Gen) -> Self {
            let max = g.choose(&(1..70).collect::<Vec<_>>()).copied().unwrap();
            Self(gen_string(g, 0, max))
        }
    }

    // copied from https://github.com/hyperium/http/blob/master/tests/header_map_fuzz.rs
    fn gen_string(g: &mut Gen, min: usize, max: usize) -> String {
        let bytes: Vec<_> = (min..max)
            .map(|_| {
                // Chars to pick from
                g.choose(b"0123456789HMSmunABCdefgh----")
                    .copied()
                    .unwrap()
            })
            .collect();

        String::from_utf8(bytes).unwrap()
    }
}
