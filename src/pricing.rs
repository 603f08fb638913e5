use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{BookingExtra, Extra, PriceBreakdown, Property, StayRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Season {
    Low,
    High,
}

/// Which calendar months bill at the high-season rate. One bit per month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeasonCalendar {
    high_months: u16,
}

impl SeasonCalendar {
    pub const DEFAULT_HIGH_MONTHS: [u32; 6] = [3, 4, 5, 10, 11, 12];

    /// `None` if any month is outside 1..=12.
    pub fn from_high_months(months: &[u32]) -> Option<Self> {
        let mut high_months = 0u16;
        for &m in months {
            if !(1..=12).contains(&m) {
                return None;
            }
            high_months |= 1 << m;
        }
        Some(Self { high_months })
    }

    pub fn season_of(&self, date: NaiveDate) -> Season {
        if self.high_months & (1 << date.month()) != 0 {
            Season::High
        } else {
            Season::Low
        }
    }

    pub fn high_months(&self) -> Vec<u32> {
        (1..=12).filter(|m| self.high_months & (1 << m) != 0).collect()
    }
}

impl Default for SeasonCalendar {
    fn default() -> Self {
        let mut high_months = 0u16;
        for m in Self::DEFAULT_HIGH_MONTHS {
            high_months |= 1 << m;
        }
        Self { high_months }
    }
}

/// How a stay's nights are priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingStrategy {
    /// Whole stay billed at the rate of the check-in month, even across a season boundary.
    #[default]
    CheckInMonth,
    /// Each night billed at the rate of its own month.
    PerNightBlended,
}

impl FromStr for PricingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "check_in_month" => Ok(PricingStrategy::CheckInMonth),
            "per_night_blended" => Ok(PricingStrategy::PerNightBlended),
            other => Err(format!("unknown pricing strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingError {
    Overflow,
}

impl std::fmt::Display for PricingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PricingError::Overflow => write!(f, "price arithmetic overflow"),
        }
    }
}

impl std::error::Error for PricingError {}

/// An extra already resolved against the catalog snapshot.
#[derive(Debug, Clone)]
pub struct ExtraCharge {
    pub extra: Extra,
    pub quantity: u32,
    pub service_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub stay: StayRange,
    pub price: PriceBreakdown,
    pub lines: Vec<BookingExtra>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PricingPolicy {
    pub strategy: PricingStrategy,
    pub seasons: SeasonCalendar,
}

impl PricingPolicy {
    pub fn new(strategy: PricingStrategy, seasons: SeasonCalendar) -> Self {
        Self { strategy, seasons }
    }

    pub fn rate_for(&self, property: &Property, date: NaiveDate) -> Decimal {
        match self.seasons.season_of(date) {
            Season::High => property.high_season_rate,
            Season::Low => property.low_season_rate,
        }
    }

    /// Returns `(price_per_night, accommodation_subtotal)`.
    fn accommodation(
        &self,
        property: &Property,
        stay: &StayRange,
    ) -> Result<(Decimal, Decimal), PricingError> {
        let nights = Decimal::from(stay.nights());
        match self.strategy {
            PricingStrategy::CheckInMonth => {
                let rate = self.rate_for(property, stay.check_in);
                let subtotal = rate.checked_mul(nights).ok_or(PricingError::Overflow)?;
                Ok((rate, subtotal))
            }
            PricingStrategy::PerNightBlended => {
                let mut subtotal = Decimal::ZERO;
                for night in stay.nights_iter() {
                    subtotal = subtotal
                        .checked_add(self.rate_for(property, night))
                        .ok_or(PricingError::Overflow)?;
                }
                // Informational mean; the subtotal stays exact.
                let mean = subtotal
                    .checked_div(nights)
                    .ok_or(PricingError::Overflow)?
                    .round_dp(2);
                Ok((mean, subtotal))
            }
        }
    }

    /// Price a candidate stay. Extra lines are bound to `booking_id`.
    pub fn price(
        &self,
        property: &Property,
        stay: &StayRange,
        charges: &[ExtraCharge],
        booking_id: Ulid,
    ) -> Result<Quote, PricingError> {
        let (price_per_night, accommodation_subtotal) = self.accommodation(property, stay)?;

        let mut extras_subtotal = Decimal::ZERO;
        let mut lines = Vec::with_capacity(charges.len());
        for charge in charges {
            let subtotal = charge
                .extra
                .price
                .checked_mul(Decimal::from(charge.quantity))
                .ok_or(PricingError::Overflow)?;
            extras_subtotal = extras_subtotal
                .checked_add(subtotal)
                .ok_or(PricingError::Overflow)?;
            lines.push(BookingExtra {
                booking_id,
                extra_id: charge.extra.id,
                name: charge.extra.name.clone(),
                quantity: charge.quantity,
                unit_price: charge.extra.price,
                subtotal,
                service_date: charge.service_date,
            });
        }

        let total_amount = accommodation_subtotal
            .checked_add(property.cleaning_fee)
            .and_then(|t| t.checked_add(extras_subtotal))
            .ok_or(PricingError::Overflow)?;

        Ok(Quote {
            stay: *stay,
            price: PriceBreakdown {
                price_per_night,
                accommodation_subtotal,
                cleaning_fee: property.cleaning_fee,
                extras_subtotal,
                total_amount,
            },
            lines,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertyStatus;
    use rust_decimal_macros::dec;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn villa() -> Property {
        Property {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            name: "Villa".into(),
            capacity: 10,
            min_nights: 3,
            low_season_rate: dec!(3500),
            high_season_rate: dec!(5500),
            cleaning_fee: dec!(500),
            status: PropertyStatus::Active,
        }
    }

    fn extra(price: Decimal) -> Extra {
        Extra {
            id: Ulid::new(),
            name: "Airport transfer".into(),
            price,
            price_unit: "per trip".into(),
            available: true,
        }
    }

    #[test]
    fn default_calendar_high_months() {
        let cal = SeasonCalendar::default();
        assert_eq!(cal.high_months(), vec![3, 4, 5, 10, 11, 12]);
        assert_eq!(cal.season_of(d("2026-03-01")), Season::High);
        assert_eq!(cal.season_of(d("2026-12-31")), Season::High);
        assert_eq!(cal.season_of(d("2026-01-15")), Season::Low);
        assert_eq!(cal.season_of(d("2026-07-04")), Season::Low);
        assert_eq!(cal.season_of(d("2026-09-30")), Season::Low);
    }

    #[test]
    fn calendar_rejects_bad_month() {
        assert!(SeasonCalendar::from_high_months(&[0]).is_none());
        assert!(SeasonCalendar::from_high_months(&[13]).is_none());
        let summer = SeasonCalendar::from_high_months(&[6, 7, 8]).unwrap();
        assert_eq!(summer.season_of(d("2026-07-01")), Season::High);
        assert_eq!(summer.season_of(d("2026-03-01")), Season::Low);
    }

    #[test]
    fn high_season_week_without_extras() {
        let policy = PricingPolicy::default();
        let stay = StayRange::new(d("2026-03-15"), d("2026-03-22"));
        let quote = policy.price(&villa(), &stay, &[], Ulid::new()).unwrap();
        assert_eq!(quote.price.price_per_night, dec!(5500));
        assert_eq!(quote.price.accommodation_subtotal, dec!(38500));
        assert_eq!(quote.price.cleaning_fee, dec!(500));
        assert_eq!(quote.price.extras_subtotal, dec!(0));
        assert_eq!(quote.price.total_amount, dec!(39000));
        assert!(quote.lines.is_empty());
    }

    #[test]
    fn low_season_rate() {
        let policy = PricingPolicy::default();
        let stay = StayRange::new(d("2026-07-01"), d("2026-07-04"));
        let quote = policy.price(&villa(), &stay, &[], Ulid::new()).unwrap();
        assert_eq!(quote.price.price_per_night, dec!(3500));
        assert_eq!(quote.price.accommodation_subtotal, dec!(10500));
        assert_eq!(quote.price.total_amount, dec!(11000));
    }

    #[test]
    fn check_in_month_bills_whole_stay_across_boundary() {
        // Feb (low) into March (high): all four nights at the February rate.
        let policy = PricingPolicy::default();
        let stay = StayRange::new(d("2026-02-26"), d("2026-03-02"));
        let quote = policy.price(&villa(), &stay, &[], Ulid::new()).unwrap();
        assert_eq!(quote.price.price_per_night, dec!(3500));
        assert_eq!(quote.price.accommodation_subtotal, dec!(14000));
    }

    #[test]
    fn per_night_blended_splits_at_boundary() {
        let policy = PricingPolicy::new(PricingStrategy::PerNightBlended, SeasonCalendar::default());
        // Feb 26, 27, 28 low; Mar 1 high
        let stay = StayRange::new(d("2026-02-26"), d("2026-03-02"));
        let quote = policy.price(&villa(), &stay, &[], Ulid::new()).unwrap();
        assert_eq!(quote.price.accommodation_subtotal, dec!(16000));
        assert_eq!(quote.price.price_per_night, dec!(4000));
        assert!(quote.price.is_reconciled());
    }

    #[test]
    fn per_night_mean_is_rounded_but_subtotal_exact() {
        let policy = PricingPolicy::new(PricingStrategy::PerNightBlended, SeasonCalendar::default());
        // Feb 27, 28 low; Mar 1 high -> 12500 / 3
        let stay = StayRange::new(d("2026-02-27"), d("2026-03-02"));
        let quote = policy.price(&villa(), &stay, &[], Ulid::new()).unwrap();
        assert_eq!(quote.price.accommodation_subtotal, dec!(12500));
        assert_eq!(quote.price.price_per_night, dec!(4166.67));
        assert_eq!(quote.price.total_amount, dec!(13000));
    }

    #[test]
    fn extras_priced_per_quantity() {
        let policy = PricingPolicy::default();
        let stay = StayRange::new(d("2026-03-15"), d("2026-03-22"));
        let booking_id = Ulid::new();
        let charge = ExtraCharge {
            extra: extra(dec!(450)),
            quantity: 2,
            service_date: stay.check_in,
        };
        let quote = policy.price(&villa(), &stay, &[charge], booking_id).unwrap();
        assert_eq!(quote.price.extras_subtotal, dec!(900));
        assert_eq!(quote.price.total_amount, dec!(39900));
        assert_eq!(quote.lines.len(), 1);
        assert_eq!(quote.lines[0].booking_id, booking_id);
        assert_eq!(quote.lines[0].unit_price, dec!(450));
        assert_eq!(quote.lines[0].subtotal, dec!(900));
    }

    #[test]
    fn fractional_prices_reconcile_exactly() {
        // 0.1 + 0.2 style amounts that drift under binary floating point
        let mut p = villa();
        p.low_season_rate = dec!(33.10);
        p.cleaning_fee = dec!(19.99);
        let policy = PricingPolicy::default();
        let stay = StayRange::new(d("2026-01-10"), d("2026-01-13"));
        let charges = vec![
            ExtraCharge { extra: extra(dec!(0.10)), quantity: 3, service_date: stay.check_in },
            ExtraCharge { extra: extra(dec!(0.20)), quantity: 7, service_date: stay.check_in },
        ];
        let quote = policy.price(&p, &stay, &charges, Ulid::new()).unwrap();
        assert_eq!(quote.price.accommodation_subtotal, dec!(99.30));
        assert_eq!(quote.price.extras_subtotal, dec!(1.70));
        assert_eq!(quote.price.total_amount, dec!(120.99));
        assert!(quote.price.is_reconciled());
    }

    #[test]
    fn overflow_is_an_error_not_a_panic() {
        let mut p = villa();
        p.low_season_rate = Decimal::MAX;
        let policy = PricingPolicy::default();
        let stay = StayRange::new(d("2026-01-10"), d("2026-01-13"));
        assert_eq!(
            policy.price(&p, &stay, &[], Ulid::new()),
            Err(PricingError::Overflow)
        );
    }

    #[test]
    fn strategy_from_str() {
        assert_eq!("check_in_month".parse::<PricingStrategy>(), Ok(PricingStrategy::CheckInMonth));
        assert_eq!("per_night_blended".parse::<PricingStrategy>(), Ok(PricingStrategy::PerNightBlended));
        assert!("weekly".parse::<PricingStrategy>().is_err());
    }
}
