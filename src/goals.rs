use crate::errors::{AppError, AppResult};
use crate::models::{Achievement, Aggregation, Goal, GoalProgress, MetricDataType, MetricValue, TimePeriod};
use crate::transform::parse_number;
use chrono::{Datelike, Days, Months, NaiveDate};
use std::collections::BTreeMap;

pub fn aggregation_for(data_type: MetricDataType) -> AppResult<Aggregation> {
    match data_type {
        MetricDataType::Numeric | MetricDataType::Currency => Ok(Aggregation::Sum),
        MetricDataType::Percentage => Ok(Aggregation::Average),
        MetricDataType::Text => Err(AppError::Configuration(
            "text metrics cannot carry goals".to_string(),
        )),
    }
}

pub fn is_period_start(period: TimePeriod, date: NaiveDate) -> bool {
    match period {
        TimePeriod::Daily => true,
        TimePeriod::Weekly => date.weekday().num_days_from_monday() == 0,
        TimePeriod::Monthly => date.day() == 1,
        TimePeriod::Quarterly => date.day() == 1 && (date.month() - 1) % 3 == 0,
        TimePeriod::Annual => date.day() == 1 && date.month() == 1,
    }
}

/// The aligned `[start, end)` window of `period` that contains `date`.
/// Weeks start on Monday; quarters on January, April, July and October.
pub fn period_bounds(period: TimePeriod, date: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    match period {
        TimePeriod::Daily => Some((date, date.checked_add_days(Days::new(1))?)),
        TimePeriod::Weekly => {
            let start = date.checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))?;
            Some((start, start.checked_add_days(Days::new(7))?))
        }
        TimePeriod::Monthly => {
            let start = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?;
            Some((start, start.checked_add_months(Months::new(1))?))
        }
        TimePeriod::Quarterly => {
            let first_month = (date.month() - 1) / 3 * 3 + 1;
            let start = NaiveDate::from_ymd_opt(date.year(), first_month, 1)?;
            Some((start, start.checked_add_months(Months::new(3))?))
        }
        TimePeriod::Annual => {
            let start = NaiveDate::from_ymd_opt(date.year(), 1, 1)?;
            Some((start, start.checked_add_months(Months::new(12))?))
        }
    }
}

/// Goal windows run from one period boundary to a later one.
pub fn validate_window(period: TimePeriod, start: NaiveDate, end: NaiveDate) -> AppResult<()> {
    if end <= start {
        return Err(AppError::Configuration(format!(
            "goal end date {} must be after start date {}",
            end, start
        )));
    }
    for (label, date) in [("start", start), ("end", end)] {
        if !is_period_start(period, date) {
            return Err(AppError::Configuration(format!(
                "goal {} date {} is not aligned to a {} boundary",
                label,
                date,
                period.as_str()
            )));
        }
    }
    Ok(())
}

pub fn validate_target(target: f64) -> AppResult<()> {
    if !target.is_finite() || target == 0.0 {
        return Err(AppError::Configuration(format!(
            "goal target must be a finite non-zero number, got {}",
            target
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Aggregate {
    pub actual: Option<f64>,
    pub days_with_data: u32,
    pub data_points: u32,
    pub unreadable_values: u32,
}

/// Folds values per day first, then across days. SUM adds everything;
/// AVERAGE takes each day's mean and weights days equally.
pub fn aggregate(values: &[MetricValue], aggregation: Aggregation) -> Aggregate {
    let mut days: BTreeMap<NaiveDate, (f64, u32)> = BTreeMap::new();
    let mut result = Aggregate::default();

    for value in values {
        let Some(raw) = value.value.as_deref() else {
            continue;
        };
        match parse_number(raw, '.') {
            Some(number) => {
                let day = days.entry(value.date).or_insert((0.0, 0));
                day.0 += number;
                day.1 += 1;
                result.data_points += 1;
            }
            None => result.unreadable_values += 1,
        }
    }

    result.days_with_data = days.len() as u32;
    if days.is_empty() {
        return result;
    }

    result.actual = Some(match aggregation {
        Aggregation::Sum => days.values().map(|(sum, _)| sum).sum(),
        Aggregation::Average => {
            let daily_total: f64 = days.values().map(|(sum, count)| sum / f64::from(*count)).sum();
            daily_total / days.len() as f64
        }
    });
    result
}

pub fn achievement(actual: Option<f64>, target: f64) -> Achievement {
    match actual {
        Some(actual) if target != 0.0 && target.is_finite() => {
            let ratio = actual / target;
            if ratio.is_finite() {
                Achievement::Measured { ratio }
            } else {
                Achievement::InsufficientData
            }
        }
        _ => Achievement::InsufficientData,
    }
}

/// Progress of `goal` given the values already fetched for its window and scope.
pub fn evaluate(goal: &Goal, data_type: MetricDataType, values: &[MetricValue]) -> AppResult<GoalProgress> {
    let aggregation = aggregation_for(data_type)?;
    let in_window: Vec<MetricValue> = values
        .iter()
        .filter(|value| value.date >= goal.start_date && value.date < goal.end_date)
        .cloned()
        .collect();
    let totals = aggregate(&in_window, aggregation);

    Ok(GoalProgress {
        goal_id: goal.id.clone(),
        metric_definition_id: goal.metric_definition_id.clone(),
        aggregation,
        window_start: goal.start_date,
        window_end: goal.end_date,
        target_value: goal.target_value,
        actual: totals.actual,
        achievement: achievement(totals.actual, goal.target_value),
        days_with_data: totals.days_with_data,
        days_in_window: (goal.end_date - goal.start_date).num_days().max(0) as u32,
        data_points: totals.data_points,
        unreadable_values: totals.unreadable_values,
    })
}
