//! Period calculator.
//!
//! Pure date arithmetic: given a subscription's current period and cadence
//! rules, produce the ordered sequence of billing periods that elapsed before
//! `now`. Nothing here touches storage, so the same inputs always yield the
//! same sequence.

use crate::models::{BillingCadence, BillingPeriod, Subscription};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use service_core::error::AppError;

/// Cadence rules used to step from one period boundary to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodSchedule {
    pub anchor: DateTime<Utc>,
    pub cadence: BillingCadence,
    pub period_count: i32,
    pub end_date: Option<DateTime<Utc>>,
}

impl PeriodSchedule {
    pub fn for_subscription(subscription: &Subscription) -> Self {
        Self {
            anchor: subscription.billing_anchor,
            cadence: subscription.cadence(),
            period_count: subscription.billing_period_count,
            end_date: subscription.end_date,
        }
    }
}

/// Output of [`calculate_periods`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodCalculation {
    /// Earliest first. The first element is the period the subscription was
    /// already in; the last one is the new current period.
    pub periods: Vec<BillingPeriod>,
    pub reached_end_date: bool,
    /// Informational only.
    pub has_more_periods: bool,
}

impl PeriodCalculation {
    /// Whether at least one period boundary was crossed.
    pub fn should_process(&self) -> bool {
        self.periods.len() > 1
    }

    /// Periods that fully elapsed and must be invoiced (all but the last).
    pub fn elapsed(&self) -> &[BillingPeriod] {
        match self.periods.split_last() {
            Some((_, elapsed)) => elapsed,
            None => &[],
        }
    }

    /// The period the subscription moves into.
    pub fn next_current(&self) -> Option<BillingPeriod> {
        self.periods.last().copied()
    }
}

/// Compute the billing periods elapsed since `current`.
pub fn calculate_periods(
    current: BillingPeriod,
    schedule: &PeriodSchedule,
    now: DateTime<Utc>,
) -> Result<PeriodCalculation, AppError> {
    let mut periods = vec![current];
    let mut current_end = current.end;
    let mut reached_end_date = false;

    while current_end < now {
        let next_end = next_billing_date(
            current_end,
            schedule.anchor,
            schedule.period_count,
            schedule.cadence,
            schedule.end_date,
        )?;

        if next_end == current_end {
            reached_end_date = true;
            break;
        }

        periods.push(BillingPeriod::new(current_end, next_end));
        current_end = next_end;
    }

    let has_more_periods = if reached_end_date {
        false
    } else {
        let probe = next_billing_date(
            current_end,
            schedule.anchor,
            schedule.period_count,
            schedule.cadence,
            schedule.end_date,
        )?;
        probe != current_end
    };

    Ok(PeriodCalculation {
        periods,
        reached_end_date,
        has_more_periods,
    })
}

/// Next period boundary after `current`.
///
/// Returns `current` unchanged once `end_date` has been reached and clamps
/// any boundary that would overshoot it.
pub fn next_billing_date(
    current: DateTime<Utc>,
    anchor: DateTime<Utc>,
    period_count: i32,
    cadence: BillingCadence,
    end_date: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>, AppError> {
    if period_count <= 0 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "billing period count must be positive, got {}",
            period_count
        )));
    }

    if let Some(end) = end_date {
        if current >= end {
            return Ok(current);
        }
    }

    let next = match cadence {
        BillingCadence::Daily => current + Duration::days(i64::from(period_count)),
        BillingCadence::Weekly => next_weekly(current, anchor, period_count),
        BillingCadence::Monthly => add_months(current, anchor, period_count)?,
        BillingCadence::Quarterly => add_months(current, anchor, period_count * 3)?,
        BillingCadence::HalfYearly => add_months(current, anchor, period_count * 6)?,
        BillingCadence::Annual => next_annual(current, anchor, period_count)?,
    };

    Ok(match end_date {
        Some(end) if next > end => end,
        _ => next,
    })
}

fn next_weekly(current: DateTime<Utc>, anchor: DateTime<Utc>, weeks: i32) -> DateTime<Utc> {
    let target = anchor.weekday().num_days_from_monday() as i64;
    let today = current.weekday().num_days_from_monday() as i64;
    let days_until = (target - today).rem_euclid(7);

    let days = if days_until == 0 {
        7 * i64::from(weeks)
    } else {
        days_until + 7 * i64::from(weeks - 1)
    };

    let date = current.date_naive() + Duration::days(days);
    at_anchor_time(date, anchor)
}

fn add_months(
    current: DateTime<Utc>,
    anchor: DateTime<Utc>,
    months: i32,
) -> Result<DateTime<Utc>, AppError> {
    let total = current.year() * 12 + current.month0() as i32 + months;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    let day = anchor.day().min(days_in_month(year, month));

    let date =
        NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| out_of_range(year, month))?;
    Ok(at_anchor_time(date, anchor))
}

fn next_annual(
    current: DateTime<Utc>,
    anchor: DateTime<Utc>,
    years: i32,
) -> Result<DateTime<Utc>, AppError> {
    let year = current.year() + years;
    let month = anchor.month();
    // Feb 29 anchors land on Feb 28 in non-leap years.
    let day = anchor.day().min(days_in_month(year, month));

    let date =
        NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| out_of_range(year, month))?;
    Ok(at_anchor_time(date, anchor))
}

fn at_anchor_time(date: NaiveDate, anchor: DateTime<Utc>) -> DateTime<Utc> {
    date.and_time(anchor.time()).and_utc()
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

fn out_of_range(year: i32, month: u32) -> AppError {
    AppError::BadRequest(anyhow::anyhow!(
        "billing date out of range: {}-{:02}",
        year,
        month
    ))
}
