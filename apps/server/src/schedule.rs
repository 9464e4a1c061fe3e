//! Slot arithmetic for the practitioner's calendar.
//!
//! Times of day are minutes since midnight. Every booking occupies the
//! half-open interval `[start, start + duration)`, so a booking that ends at
//! 11:00 never collides with one that starts at 11:00.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};

const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid time '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("business hours must open before they close")]
    InvalidHours,
    #[error("slot step must be positive")]
    InvalidStep,
}

/// Half-open interval of minutes within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: u32,
    pub end: u32,
}

impl Interval {
    pub fn new(start: u32, duration_min: u32) -> Self {
        Self {
            start,
            end: start + duration_min,
        }
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Opening hours plus the grid on which start times are offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
    open: u32,
    close: u32,
    step: u32,
}

impl BusinessHours {
    pub fn new(open: u32, close: u32, step: u32) -> Result<Self, ScheduleError> {
        if step == 0 {
            return Err(ScheduleError::InvalidStep);
        }
        if open >= close || close > MINUTES_PER_DAY {
            return Err(ScheduleError::InvalidHours);
        }
        Ok(Self { open, close, step })
    }

    pub fn parse(open: &str, close: &str, step: u32) -> Result<Self, ScheduleError> {
        Self::new(parse_time(open)?, parse_time(close)?, step)
    }

    pub fn open(&self) -> u32 {
        self.open
    }

    pub fn close(&self) -> u32 {
        self.close
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn contains(&self, interval: &Interval) -> bool {
        interval.start >= self.open && interval.end <= self.close
    }

    pub fn is_on_grid(&self, start: u32) -> bool {
        start >= self.open && (start - self.open) % self.step == 0
    }
}

/// A candidate start time, derived on demand and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilitySlot {
    pub start: u32,
    pub end: u32,
    pub available: bool,
}

/// Lazy walk over the grid for one service and day. Clone it to restart.
#[derive(Debug, Clone)]
pub struct Slots {
    hours: BusinessHours,
    duration: u32,
    next: u32,
    busy: Vec<Interval>,
    not_before: Option<u32>,
}

impl Iterator for Slots {
    type Item = AvailabilitySlot;

    fn next(&mut self) -> Option<Self::Item> {
        let candidate = Interval::new(self.next, self.duration);
        if candidate.end > self.hours.close {
            return None;
        }
        self.next += self.hours.step;

        let started = self.not_before.is_some_and(|now| candidate.start < now);
        let taken = self.busy.iter().any(|b| b.overlaps(&candidate));

        Some(AvailabilitySlot {
            start: candidate.start,
            end: candidate.end,
            available: !started && !taken,
        })
    }
}

/// Build the slot sequence for a service of `duration_min` given the day's
/// active bookings. `not_before` hides start times that already passed today.
pub fn compute_slots(
    hours: BusinessHours,
    duration_min: u32,
    busy: Vec<Interval>,
    not_before: Option<u32>,
) -> Slots {
    Slots {
        hours,
        duration: duration_min,
        next: hours.open,
        busy,
        not_before,
    }
}

/// Pairs of ids whose intervals overlap. Input order does not matter.
pub fn find_overlaps(bookings: &[(i64, Interval)]) -> Vec<(i64, i64)> {
    let mut sorted = bookings.to_vec();
    sorted.sort_by_key(|(id, iv)| (iv.start, *id));

    let mut overlaps = Vec::new();
    for (i, (first_id, first)) in sorted.iter().enumerate() {
        for (second_id, second) in &sorted[i + 1..] {
            if second.start >= first.end {
                break;
            }
            overlaps.push((*first_id, *second_id));
        }
    }
    overlaps
}

pub fn parse_date(s: &str) -> Result<NaiveDate, ScheduleError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| ScheduleError::InvalidDate(s.to_string()))
}

/// Strict `HH:MM` into minutes since midnight.
pub fn parse_time(s: &str) -> Result<u32, ScheduleError> {
    if s.len() != 5 {
        return Err(ScheduleError::InvalidTime(s.to_string()));
    }
    let time = NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| ScheduleError::InvalidTime(s.to_string()))?;
    Ok(time.hour() * 60 + time.minute())
}

pub fn format_time(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Minutes since midnight of `now`, only when `now` falls on `date`.
pub fn cutoff_for(date: NaiveDate, now: NaiveDateTime) -> Option<u32> {
    (now.date() == date).then(|| now.hour() * 60 + now.minute())
}

/// Past dates, and start times that already passed today, are rejected.
pub fn is_past(date: NaiveDate, start: Option<u32>, now: NaiveDateTime) -> bool {
    match date.cmp(&now.date()) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => {
            start.is_some_and(|s| s < now.hour() * 60 + now.minute())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(s: &str) -> u32 {
        parse_time(s).unwrap()
    }

    fn salon_hours() -> BusinessHours {
        BusinessHours::parse("09:00", "18:00", 30).unwrap()
    }

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn test_adjacent_intervals_do_not_overlap() {
        let a = Interval::new(hm("10:00"), 60);
        let b = Interval::new(hm("11:00"), 60);
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn test_one_minute_overlap_collides() {
        let a = Interval::new(hm("10:00"), 61);
        let b = Interval::new(hm("11:00"), 60);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn test_contained_interval_overlaps() {
        let outer = Interval::new(hm("10:00"), 120);
        let inner = Interval::new(hm("10:30"), 30);
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
    }

    #[test]
    fn test_slots_around_existing_booking() {
        let busy = vec![Interval::new(hm("10:00"), 60)];
        let slots: Vec<_> = compute_slots(salon_hours(), 60, busy, None).collect();

        let at = |t: &str| slots.iter().find(|s| s.start == hm(t)).unwrap().available;
        assert!(at("09:00"));
        assert!(!at("09:30"));
        assert!(!at("10:00"));
        assert!(!at("10:30"));
        assert!(at("11:00"));
        assert!(at("17:00"));
    }

    #[test]
    fn test_slots_stop_when_service_no_longer_fits() {
        let slots: Vec<_> = compute_slots(salon_hours(), 60, vec![], None).collect();
        assert_eq!(slots.first().unwrap().start, hm("09:00"));
        assert_eq!(slots.last().unwrap().start, hm("17:00"));
        assert_eq!(slots.last().unwrap().end, hm("18:00"));
        assert_eq!(slots.len(), 17);
    }

    #[test]
    fn test_service_longer_than_day_has_no_slots() {
        let slots = compute_slots(salon_hours(), 10 * 60, vec![], None);
        assert_eq!(slots.count(), 0);
    }

    #[test]
    fn test_slots_are_restartable() {
        let slots = compute_slots(salon_hours(), 90, vec![Interval::new(hm("12:00"), 30)], None);
        let first: Vec<_> = slots.clone().collect();
        let second: Vec<_> = slots.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_started_slots_are_unavailable_today() {
        let slots: Vec<_> = compute_slots(salon_hours(), 30, vec![], Some(hm("12:10"))).collect();
        let at = |t: &str| slots.iter().find(|s| s.start == hm(t)).unwrap().available;
        assert!(!at("12:00"));
        assert!(at("12:30"));
    }

    #[test]
    fn test_grid_alignment() {
        let hours = salon_hours();
        assert!(hours.is_on_grid(hm("09:00")));
        assert!(hours.is_on_grid(hm("13:30")));
        assert!(!hours.is_on_grid(hm("13:15")));
        assert!(!hours.is_on_grid(hm("08:30")));
    }

    #[test]
    fn test_hours_contain_interval() {
        let hours = salon_hours();
        assert!(hours.contains(&Interval::new(hm("17:00"), 60)));
        assert!(!hours.contains(&Interval::new(hm("17:30"), 60)));
        assert!(!hours.contains(&Interval::new(hm("08:30"), 60)));
    }

    #[test]
    fn test_invalid_hours_rejected() {
        assert_eq!(
            BusinessHours::parse("18:00", "09:00", 30),
            Err(ScheduleError::InvalidHours)
        );
        assert_eq!(
            BusinessHours::parse("09:00", "18:00", 0),
            Err(ScheduleError::InvalidStep)
        );
    }

    #[test]
    fn test_parse_time_strict() {
        assert_eq!(parse_time("09:05"), Ok(545));
        assert!(parse_time("9:05").is_err());
        assert!(parse_time("25:00").is_err());
        assert!(parse_time("10:00:00").is_err());
        assert!(parse_time("garbage").is_err());
    }

    #[test]
    fn test_parse_date() {
        assert!(parse_date("2026-03-01").is_ok());
        assert!(parse_date("2026-02-30").is_err());
        assert!(parse_date("01.03.2026").is_err());
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0), "00:00");
        assert_eq!(format_time(hm("17:30")), "17:30");
    }

    #[test]
    fn test_find_overlaps_reports_pairs() {
        let bookings = vec![
            (3, Interval::new(hm("12:00"), 60)),
            (1, Interval::new(hm("10:00"), 60)),
            (2, Interval::new(hm("10:30"), 60)),
            (4, Interval::new(hm("13:00"), 30)),
        ];
        assert_eq!(find_overlaps(&bookings), vec![(1, 2)]);
    }

    #[test]
    fn test_find_overlaps_clean_day() {
        let bookings = vec![
            (1, Interval::new(hm("10:00"), 60)),
            (2, Interval::new(hm("11:00"), 60)),
        ];
        assert!(find_overlaps(&bookings).is_empty());
    }

    #[test]
    fn test_is_past() {
        let now = dt("2026-03-10 12:00");
        let today = parse_date("2026-03-10").unwrap();
        assert!(is_past(parse_date("2026-03-09").unwrap(), None, now));
        assert!(!is_past(parse_date("2026-03-11").unwrap(), Some(0), now));
        assert!(!is_past(today, None, now));
        assert!(is_past(today, Some(hm("11:30")), now));
        assert!(!is_past(today, Some(hm("12:00")), now));
    }

    #[test]
    fn test_cutoff_only_applies_today() {
        let now = dt("2026-03-10 12:15");
        assert_eq!(cutoff_for(parse_date("2026-03-10").unwrap(), now), Some(hm("12:15")));
        assert_eq!(cutoff_for(parse_date("2026-03-11").unwrap(), now), None);
    }
}
