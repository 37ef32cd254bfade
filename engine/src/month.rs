//! Canonical transaction months.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the twelve canonical month names a payment is booked against.
///
/// Ordering is calendar order, which is the order payment lists are shown in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Month {
    January,
    February,
    March,
    April,
    May,
    June,
    July,
    August,
    September,
    October,
    November,
    December,
}

impl Month {
    pub const ALL: [Month; 12] = [
        Month::January,
        Month::February,
        Month::March,
        Month::April,
        Month::May,
        Month::June,
        Month::July,
        Month::August,
        Month::September,
        Month::October,
        Month::November,
        Month::December,
    ];

    /// Canonical name as stored in the remote collection.
    pub fn name(self) -> &'static str {
        match self {
            Month::January => "January",
            Month::February => "February",
            Month::March => "March",
            Month::April => "April",
            Month::May => "May",
            Month::June => "June",
            Month::July => "July",
            Month::August => "August",
            Month::September => "September",
            Month::October => "October",
            Month::November => "November",
            Month::December => "December",
        }
    }

    /// 1-based calendar number.
    pub fn number(self) -> u8 {
        self as u8 + 1
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Month {
    type Err = Error;

    /// Accepts the canonical name in any letter case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Month::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| Error::UnknownMonth(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calendar_ordering() {
        assert!(Month::January < Month::March);
        assert!(Month::November < Month::December);
        assert_eq!(Month::March.number(), 3);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("march".parse::<Month>().unwrap(), Month::March);
        assert_eq!(" DECEMBER ".parse::<Month>().unwrap(), Month::December);
        assert!(matches!(
            "Smarch".parse::<Month>(),
            Err(Error::UnknownMonth(_))
        ));
    }

    #[test]
    fn serialization_uses_canonical_name() {
        let json = serde_json::to_string(&Month::September).unwrap();
        assert_eq!(json, r#""September""#);
        assert!(serde_json::from_str::<Month>(r#""september""#).is_err());
    }
}
