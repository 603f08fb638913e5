use chrono::NaiveDate;

use crate::limits::MAX_STAY_NIGHTS;
use crate::model::*;
use crate::pricing::ExtraCharge;
use crate::store::Catalog;

use super::{BookingRequest, DateInput, EngineError, ExtraRequest};

/// Steps 1–4 of the validation order. Each rejects with its own reason.
pub(super) async fn preflight(
    catalog: &dyn Catalog,
    req: &BookingRequest,
) -> Result<(Property, StayRange), EngineError> {
    let property = catalog
        .get_active_property(req.property_id)
        .await?
        .ok_or(EngineError::PropertyUnavailable(req.property_id))?;
    let stay = stay_range(req)?;
    check_min_nights(&property, &stay)?;
    check_guests(&property, req.guest_count)?;
    Ok((property, stay))
}

fn calendar_date(input: &DateInput, field: &str) -> Result<NaiveDate, EngineError> {
    input
        .date()
        .ok_or_else(|| EngineError::InvalidDateRange(format!("{field} {input} is not a YYYY-MM-DD date")))
}

fn stay_range(req: &BookingRequest) -> Result<StayRange, EngineError> {
    let check_in = calendar_date(&req.check_in, "check-in")?;
    let check_out = calendar_date(&req.check_out, "check-out")?;
    let stay = StayRange::checked(check_in, check_out).ok_or_else(|| {
        EngineError::InvalidDateRange(format!(
            "check-out {check_out} is not after check-in {check_in}"
        ))
    })?;
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::InvalidDateRange(format!(
            "stays are limited to {MAX_STAY_NIGHTS} nights"
        )));
    }
    Ok(stay)
}

fn check_min_nights(property: &Property, stay: &StayRange) -> Result<(), EngineError> {
    let nights = stay.nights();
    if nights < i64::from(property.min_nights) {
        return Err(EngineError::StayTooShort {
            nights,
            min_nights: property.min_nights,
        });
    }
    Ok(())
}

fn check_guests(property: &Property, guests: u32) -> Result<(), EngineError> {
    if guests < 1 || guests > property.capacity {
        return Err(EngineError::CapacityExceeded {
            guests,
            capacity: property.capacity,
        });
    }
    Ok(())
}

/// Step 6: bind every requested line to an available catalog extra.
/// The service date must be a calendar date within the stay, check-out day included.
pub(super) async fn resolve_extras(
    catalog: &dyn Catalog,
    lines: &[ExtraRequest],
    stay: &StayRange,
) -> Result<Vec<ExtraCharge>, EngineError> {
    if lines.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<_> = lines.iter().map(|l| l.extra_id).collect();
    let available = catalog.get_available_extras(&ids).await?;

    lines
        .iter()
        .map(|line| {
            let extra = available
                .iter()
                .find(|e| e.id == line.extra_id)
                .ok_or(EngineError::ExtraUnavailable(line.extra_id))?;
            let service_date = match &line.service_date {
                Some(input) => calendar_date(input, "service date")?,
                None => stay.check_in,
            };
            if service_date < stay.check_in || service_date > stay.check_out {
                return Err(EngineError::ExtraUnavailable(line.extra_id));
            }
            Ok(ExtraCharge {
                extra: extra.clone(),
                quantity: line.quantity,
                service_date,
            })
        })
        .collect()
}
