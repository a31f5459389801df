use crate::error::{EngineError, Result};
use crate::schema::PeriodId;
use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.checked_sub_days(Days::new(1))
}

pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32
}

/// Parses `YYYY-MM` into `(year, month)`.
pub fn parse_period_label(label: &str) -> Result<(i32, u32)> {
    let date = month_start(label)?;
    Ok((date.year(), date.month()))
}

fn month_start(label: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(&format!("{}-01", label.trim()), "%Y-%m-%d").map_err(|_| {
        EngineError::InvalidConfiguration(format!(
            "invalid period label '{}', expected YYYY-MM",
            label
        ))
    })
}

/// Maps integer period ids onto calendar months.
///
/// Period ids are consecutive months; `anchor_period` closes on the last day of
/// the anchor month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodCalendar {
    anchor_period: PeriodId,
    anchor_month: NaiveDate,
}

impl PeriodCalendar {
    pub fn new(anchor_period: PeriodId, year: i32, month: u32) -> Result<Self> {
        let anchor_month = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
            EngineError::InvalidConfiguration(format!("month {}-{} out of range", year, month))
        })?;
        Ok(Self {
            anchor_period,
            anchor_month,
        })
    }

    /// Calendar whose `anchor_period` is the month named by a `YYYY-MM` label.
    pub fn from_label(anchor_period: PeriodId, label: &str) -> Result<Self> {
        Ok(Self {
            anchor_period,
            anchor_month: month_start(label)?,
        })
    }

    fn year_month(&self, period_id: PeriodId) -> (i32, u32) {
        let index = self.anchor_month.year() * 12
            + (self.anchor_month.month() as i32 - 1)
            + (period_id - self.anchor_period);
        (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
    }

    pub fn month_end(&self, period_id: PeriodId) -> Result<NaiveDate> {
        let (year, month) = self.year_month(period_id);
        last_day_of_month(year, month).ok_or_else(|| {
            EngineError::InvalidConfiguration(format!(
                "period {} falls outside the supported date range",
                period_id
            ))
        })
    }

    /// `YYYY-MM` label of the period's month.
    pub fn label(&self, period_id: PeriodId) -> String {
        let (year, month) = self.year_month(period_id);
        format!("{:04}-{:02}", year, month)
    }

    pub fn period_for_date(&self, date: NaiveDate) -> PeriodId {
        self.anchor_period + months_between(self.anchor_month, date)
    }

    /// Inclusive run of period ids covering `start`..=`end` labels.
    pub fn periods_between(&self, start: &str, end: &str) -> Result<Vec<PeriodId>> {
        let first = self.period_for_date(month_start(start)?);
        let last = self.period_for_date(month_start(end)?);

        if last < first {
            return Err(EngineError::InvalidConfiguration(format!(
                "period range {}:{} ends before it starts",
                start, end
            )));
        }
        Ok((first..=last).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(
            last_day_of_month(2023, 2),
            NaiveDate::from_ymd_opt(2023, 2, 28)
        );
        assert_eq!(
            last_day_of_month(2024, 2),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
        assert_eq!(
            last_day_of_month(2023, 12),
            NaiveDate::from_ymd_opt(2023, 12, 31)
        );
    }

    #[test]
    fn test_months_between() {
        let start = NaiveDate::from_ymd_opt(2023, 11, 30).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(months_between(start, end), 3);
    }

    #[test]
    fn test_calendar_crosses_year_boundary() {
        let calendar = PeriodCalendar::new(1, 2024, 11).unwrap();

        assert_eq!(calendar.label(1), "2024-11");
        assert_eq!(calendar.label(3), "2025-01");
        assert_eq!(calendar.label(0), "2024-10");
        assert_eq!(
            calendar.month_end(4).unwrap(),
            NaiveDate::from_ymd_opt(2025, 2, 28).unwrap()
        );
        assert_eq!(
            calendar.period_for_date(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()),
            3
        );
    }

    #[test]
    fn test_periods_between_labels() {
        let calendar = PeriodCalendar::from_label(1, "2024-01").unwrap();
        assert_eq!(calendar.periods_between("2024-03", "2024-05").unwrap(), vec![3, 4, 5]);
        assert!(calendar.periods_between("2024-05", "2024-03").is_err());
        assert!(calendar.periods_between("2024-13", "2024-14").is_err());
        assert!(PeriodCalendar::new(1, 2024, 0).is_err());
        assert_eq!(calendar.periods_between("2023-11", "2024-01").unwrap(), vec![-1, 0, 1]);
        assert_eq!(
            calendar.period_for_date(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()),
            0
        );
    }
}
