//! Hashed org outlines.
//! Headings carry an optional keyword, priority, timestamp, five character hash and tags;
//! the tree keeps every byte of the source so an untouched tree writes back unchanged.

pub mod error {
    use thiserror::Error;

    /// Failures while reading outline text or snapshots.
    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    pub enum OrgError {
        #[error("not a heading line: {0:?}")]
        NotAHeading(String),
        #[error("malformed timestamp: {0}")]
        MalformedTimestamp(String),
        #[error("malformed timestamp range: {0}")]
        MalformedRange(String),
        #[error("malformed planning line: {0}")]
        MalformedSchedule(String),
        #[error("{0} is not a real calendar date or time")]
        InvalidCalendar(String),
        #[error("hash {0} is declared by more than one heading")]
        DuplicateHash(String),
        #[error("corrupt snapshot: {0}")]
        CorruptSnapshot(String),
        #[error("line {line}: {source}")]
        Line {
            line: usize,
            #[source]
            source: Box<OrgError>,
        },
    }

    impl OrgError {
        pub(crate) fn at_line(line: usize, source: OrgError) -> Self {
            OrgError::Line {
                line,
                source: Box::new(source),
            }
        }
    }

    /// Rejections from field setters. The value being edited is left untouched.
    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    pub enum FieldError {
        #[error("level must be at least 1, got {0}")]
        Level(usize),
        #[error("keyword must be 3 to 5 uppercase letters: {0:?}")]
        Keyword(String),
        #[error("priority must be a single uppercase letter: {0:?}")]
        Priority(String),
        #[error("hash must be 5 lowercase letters or digits: {0:?}")]
        Hash(String),
        #[error("title must be non-empty and fit on one line")]
        Title,
        #[error("tags are lowercase letters and digits: {0:?}")]
        Tag(String),
        #[error("invalid repeater: {0:?}")]
        Repeater(String),
        #[error("invalid delay: {0:?}")]
        Delay(String),
        #[error("year must be between 0 and 9999, got {0}")]
        Year(i32),
        #[error("interval must fit in four digits, got {0}")]
        Interval(u32),
        #[error("end time needs a start time at or before it")]
        EndTime,
        #[error("range sides must share a kind and carry no repeater or delay")]
        RangeSide,
        #[error("child level {child} must be deeper than parent level {parent}")]
        ChildLevel { child: usize, parent: usize },
        #[error("no node with id {0}")]
        UnknownNode(usize),
    }
}

pub mod timestamp {
    //! Org timestamps such as `<2013-09-20 Fri 15:05 +10m -5w>`.
    //!
    //! Numeric fields are stored as written and only checked against the calendar
    //! when a chrono value is asked for, so every accepted string prints back unchanged.

    use crate::error::{FieldError, OrgError};
    use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while_m_n},
        character::complete::{char, one_of, satisfy},
        combinator::{all_consuming, map, opt, recognize, value},
        error::{VerboseError, VerboseErrorKind},
        multi::many0,
        sequence::{pair, preceded, separated_pair, tuple},
    };
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};
    use tracing::warn;

    /* ---------------------------- Value Objects ---------------------------- */

    const MAX_YEAR: u32 = 9999;
    const MAX_INTERVAL: u32 = 9999;

    /// Calendar date as written. Not range checked.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct OrgDate {
        pub year: u32,
        pub month: u32,
        pub day: u32,
    }

    impl OrgDate {
        pub fn to_naive(self) -> Result<NaiveDate, OrgError> {
            i32::try_from(self.year)
                .ok()
                .and_then(|year| NaiveDate::from_ymd_opt(year, self.month, self.day))
                .ok_or_else(|| OrgError::InvalidCalendar(self.to_string()))
        }
    }

    /// Years outside the four digit field cannot be written back.
    impl TryFrom<NaiveDate> for OrgDate {
        type Error = FieldError;

        fn try_from(date: NaiveDate) -> Result<Self, Self::Error> {
            let year = u32::try_from(date.year())
                .ok()
                .filter(|year| *year <= MAX_YEAR)
                .ok_or(FieldError::Year(date.year()))?;
            Ok(Self {
                year,
                month: date.month(),
                day: date.day(),
            })
        }
    }

    impl fmt::Display for OrgDate {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
        }
    }

    /// Time of day as written (`HH:MM`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct ClockTime {
        pub hour: u32,
        pub minute: u32,
    }

    impl ClockTime {
        pub fn to_naive(self) -> Result<NaiveTime, OrgError> {
            NaiveTime::from_hms_opt(self.hour, self.minute, 0)
                .ok_or_else(|| OrgError::InvalidCalendar(self.to_string()))
        }
    }

    impl From<NaiveTime> for ClockTime {
        fn from(time: NaiveTime) -> Self {
            Self {
                hour: time.hour(),
                minute: time.minute(),
            }
        }
    }

    impl fmt::Display for ClockTime {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:02}:{:02}", self.hour, self.minute)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum TimeUnit {
        Day,
        Week,
        Month,
        Year,
    }

    impl TimeUnit {
        pub fn letter(self) -> char {
            match self {
                TimeUnit::Day => 'd',
                TimeUnit::Week => 'w',
                TimeUnit::Month => 'm',
                TimeUnit::Year => 'y',
            }
        }
    }

    impl fmt::Display for TimeUnit {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.letter())
        }
    }

    /// Magnitude plus unit, e.g. `10m`. `width` keeps leading zeros of the source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Interval {
        value: u32,
        pub unit: TimeUnit,
        #[serde(default = "default_width")]
        width: u8,
    }

    fn default_width() -> u8 {
        1
    }

    impl Interval {
        pub fn new(value: u32, unit: TimeUnit) -> Result<Self, FieldError> {
            if value > MAX_INTERVAL {
                return Err(FieldError::Interval(value));
            }
            Ok(Self {
                value,
                unit,
                width: 1,
            })
        }

        pub fn value(&self) -> u32 {
            self.value
        }
    }

    impl fmt::Display for Interval {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{:0width$}{}",
                self.value,
                self.unit,
                width = usize::from(self.width)
            )
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum RepeaterKind {
        /// `+`: shift by one interval from the last date (may stay overdue).
        FromLast,
        /// `++`: catch up to the next future occurrence.
        FromBase,
        /// `.+`: restart from today.
        FromNow,
    }

    impl RepeaterKind {
        pub fn symbol(self) -> &'static str {
            match self {
                RepeaterKind::FromLast => "+",
                RepeaterKind::FromBase => "++",
                RepeaterKind::FromNow => ".+",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Repeater {
        pub kind: RepeaterKind,
        pub interval: Interval,
    }

    impl Repeater {
        pub fn new(kind: RepeaterKind, value: u32, unit: TimeUnit) -> Result<Self, FieldError> {
            Ok(Self {
                kind,
                interval: Interval::new(value, unit)?,
            })
        }

        pub fn parse(text: &str) -> Result<Self, FieldError> {
            all_consuming(repeater)(text)
                .map(|(_, r)| r)
                .map_err(|_| FieldError::Repeater(text.to_string()))
        }
    }

    impl fmt::Display for Repeater {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}{}", self.kind.symbol(), self.interval)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum DelayKind {
        /// `-`: warn before every occurrence.
        All,
        /// `--`: warn before the first occurrence only.
        First,
    }

    impl DelayKind {
        pub fn symbol(self) -> &'static str {
            match self {
                DelayKind::All => "-",
                DelayKind::First => "--",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Delay {
        pub kind: DelayKind,
        pub interval: Interval,
    }

    impl Delay {
        pub fn new(kind: DelayKind, value: u32, unit: TimeUnit) -> Result<Self, FieldError> {
            Ok(Self {
                kind,
                interval: Interval::new(value, unit)?,
            })
        }

        pub fn parse(text: &str) -> Result<Self, FieldError> {
            all_consuming(delay)(text)
                .map(|(_, d)| d)
                .map_err(|_| FieldError::Delay(text.to_string()))
        }
    }

    impl fmt::Display for Delay {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}{}", self.kind.symbol(), self.interval)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum TimestampKind {
        DateOnly,
        DateTime,
    }

    /* ------------------------------ Timestamp ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Timestamp {
        active: bool,
        date: OrgDate,
        #[serde(default)]
        weekday: Option<String>,
        #[serde(default)]
        time: Option<ClockTime>,
        #[serde(default)]
        end_time: Option<ClockTime>,
        #[serde(default)]
        repeater: Option<Repeater>,
        #[serde(default)]
        delay: Option<Delay>,
        /// Delay was written before the repeater.
        #[serde(default)]
        delay_first: bool,
    }

    impl Timestamp {
        /// Strict parse of a whole bracketed timestamp.
        pub fn parse(text: &str) -> Result<Self, OrgError> {
            all_consuming(timestamp)(text)
                .map(|(_, ts)| ts)
                .map_err(|_| OrgError::MalformedTimestamp(text.to_string()))
        }

        /// Like [`Timestamp::parse`], but an unreadable `..:..` token in the time
        /// position is dropped and the value is read as date-only.
        pub fn parse_lenient(text: &str) -> Result<Self, OrgError> {
            let err = match Self::parse(text) {
                Ok(ts) => return Ok(ts),
                Err(err) => err,
            };
            let Some(repaired) = strip_unreadable_time(text) else {
                return Err(err);
            };
            let ts = Self::parse(&repaired).map_err(|_| err)?;
            warn!(timestamp = text, "unreadable time of day, reading as date only");
            Ok(ts)
        }

        pub fn from_date(date: NaiveDate, active: bool) -> Result<Self, FieldError> {
            Ok(Self {
                active,
                date: OrgDate::try_from(date)?,
                weekday: None,
                time: None,
                end_time: None,
                repeater: None,
                delay: None,
                delay_first: false,
            })
        }

        pub fn from_datetime(datetime: NaiveDateTime, active: bool) -> Result<Self, FieldError> {
            let mut ts = Self::from_date(datetime.date(), active)?;
            ts.time = Some(datetime.time().into());
            Ok(ts)
        }

        /// Adds the abbreviated weekday name of the current date.
        pub fn with_weekday(mut self) -> Self {
            self.weekday = self.date.to_naive().ok().map(weekday_name);
            self
        }

        /* ---- accessors ---- */

        pub fn is_active(&self) -> bool {
            self.active
        }

        pub fn kind(&self) -> TimestampKind {
            if self.time.is_some() {
                TimestampKind::DateTime
            } else {
                TimestampKind::DateOnly
            }
        }

        pub fn is_date_only(&self) -> bool {
            self.kind() == TimestampKind::DateOnly
        }

        pub fn date(&self) -> OrgDate {
            self.date
        }

        pub fn naive_date(&self) -> Result<NaiveDate, OrgError> {
            self.date.to_naive()
        }

        pub fn has_weekday(&self) -> bool {
            self.weekday.is_some()
        }

        pub fn weekday(&self) -> Option<&str> {
            self.weekday.as_deref()
        }

        pub fn time(&self) -> Option<ClockTime> {
            self.time
        }

        pub fn end_time(&self) -> Option<ClockTime> {
            self.end_time
        }

        /// Start of the timestamp; midnight for date-only values.
        pub fn start_datetime(&self) -> Result<NaiveDateTime, OrgError> {
            let date = self.date.to_naive()?;
            let time = match self.time {
                Some(t) => t.to_naive()?,
                None => NaiveTime::MIN,
            };
            Ok(date.and_time(time))
        }

        pub fn end_datetime(&self) -> Result<Option<NaiveDateTime>, OrgError> {
            match self.end_time {
                Some(end) => Ok(Some(self.date.to_naive()?.and_time(end.to_naive()?))),
                None => Ok(None),
            }
        }

        pub fn has_duration(&self) -> bool {
            self.end_time.is_some()
        }

        /// Same-day span `HH:MM-HH:MM`, if any.
        pub fn duration(&self) -> Result<Option<Duration>, OrgError> {
            let Some(end) = self.end_datetime()? else {
                return Ok(None);
            };
            Ok(Some(end - self.start_datetime()?))
        }

        pub fn repeater(&self) -> Option<&Repeater> {
            self.repeater.as_ref()
        }

        pub fn has_repeater(&self) -> bool {
            self.repeater.is_some()
        }

        /// Only the plain `+` repeater leaves a task overdue after it is shifted.
        pub fn has_overdue_repeater(&self) -> bool {
            matches!(
                self.repeater,
                Some(Repeater {
                    kind: RepeaterKind::FromLast,
                    ..
                })
            )
        }

        pub fn repeat_interval(&self) -> Option<(u32, TimeUnit)> {
            self.repeater
                .map(|r| (r.interval.value, r.interval.unit))
        }

        pub fn delay(&self) -> Option<&Delay> {
            self.delay.as_ref()
        }

        pub fn has_delay(&self) -> bool {
            self.delay.is_some()
        }

        pub fn delay_interval(&self) -> Option<(u32, TimeUnit)> {
            self.delay.map(|d| (d.interval.value, d.interval.unit))
        }

        /* ---- mutators ---- */

        pub fn set_active(&mut self, active: bool) {
            self.active = active;
        }

        /// Moves to another day. A weekday already present is recomputed.
        pub fn set_date(&mut self, date: NaiveDate) -> Result<(), FieldError> {
            self.date = OrgDate::try_from(date)?;
            if self.weekday.is_some() {
                self.weekday = Some(weekday_name(date));
            }
            Ok(())
        }

        /// Sets date and start time. An end time earlier than the new start is dropped.
        pub fn set_datetime(&mut self, datetime: NaiveDateTime) -> Result<(), FieldError> {
            self.set_date(datetime.date())?;
            let start = ClockTime::from(datetime.time());
            self.time = Some(start);
            if self.end_time.is_some_and(|end| end < start) {
                self.end_time = None;
            }
            Ok(())
        }

        pub fn set_date_only(&mut self) {
            self.time = None;
            self.end_time = None;
        }

        pub fn set_end_time(&mut self, end: Option<NaiveTime>) -> Result<(), FieldError> {
            let Some(end) = end else {
                self.end_time = None;
                return Ok(());
            };
            let end = ClockTime::from(end);
            match self.time {
                Some(start) if start <= end => {
                    self.end_time = Some(end);
                    Ok(())
                }
                _ => Err(FieldError::EndTime),
            }
        }

        pub fn set_repeater(&mut self, text: &str) -> Result<(), FieldError> {
            self.repeater = Some(Repeater::parse(text)?);
            Ok(())
        }

        pub fn clear_repeater(&mut self) {
            self.repeater = None;
        }

        pub fn set_delay(&mut self, text: &str) -> Result<(), FieldError> {
            self.delay = Some(Delay::parse(text)?);
            Ok(())
        }

        pub fn clear_delay(&mut self) {
            self.delay = None;
        }

        fn brackets(&self) -> (char, char) {
            if self.active { ('<', '>') } else { ('[', ']') }
        }
    }

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let (open, close) = self.brackets();
            write!(f, "{open}{}", self.date)?;
            if let Some(weekday) = &self.weekday {
                write!(f, " {weekday}")?;
            }
            if let Some(time) = self.time {
                write!(f, " {time}")?;
                if let Some(end) = self.end_time {
                    write!(f, "-{end}")?;
                }
            }
            let repeater = self.repeater.map(|r| r.to_string());
            let delay = self.delay.map(|d| d.to_string());
            let cookies = if self.delay_first {
                [delay, repeater]
            } else {
                [repeater, delay]
            };
            for cookie in cookies.into_iter().flatten() {
                write!(f, " {cookie}")?;
            }
            write!(f, "{close}")
        }
    }

    impl FromStr for Timestamp {
        type Err = OrgError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Self::parse(s)
        }
    }

    fn weekday_name(date: NaiveDate) -> String {
        date.format("%a").to_string()
    }

    /// `<2013-09-20 Fri xx:yy +1w>` becomes `<2013-09-20 Fri +1w>`.
    fn strip_unreadable_time(text: &str) -> Option<String> {
        let bytes = text.as_bytes();
        // opener + YYYY-MM-DD
        let mut at = 11;
        if bytes.get(at) == Some(&b' ')
            && bytes
                .get(at + 1..at + 4)
                .is_some_and(|w| w.iter().all(u8::is_ascii_alphabetic))
        {
            at += 4;
        }
        let token = bytes.get(at + 1..at + 6)?;
        if bytes.get(at) != Some(&b' ') || token[2] != b':' {
            return None;
        }
        if token
            .iter()
            .enumerate()
            .all(|(n, b)| n == 2 || b.is_ascii_digit())
        {
            return None;
        }
        let mut repaired = String::with_capacity(text.len());
        repaired.push_str(text.get(..at)?);
        repaired.push_str(text.get(at + 6..)?);
        Some(repaired)
    }

    /* -------------------------------- Range -------------------------------- */

    /// `from--to`, both sides of the same kind and free of repeaters and delays.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TimestampRange {
        from: Timestamp,
        to: Timestamp,
    }

    impl TimestampRange {
        pub fn new(from: Timestamp, to: Timestamp) -> Result<Self, OrgError> {
            if !range_sides_fit(&from, &to) {
                return Err(OrgError::MalformedRange(format!("{from}--{to}")));
            }
            Ok(Self { from, to })
        }

        pub fn parse(text: &str) -> Result<Self, OrgError> {
            let (_, (from, to)) = all_consuming(range)(text)
                .map_err(|_| OrgError::MalformedRange(text.to_string()))?;
            Self::new(from, to)
        }

        pub fn from(&self) -> &Timestamp {
            &self.from
        }

        pub fn to(&self) -> &Timestamp {
            &self.to
        }

        pub fn set_from(&mut self, from: Timestamp) -> Result<(), FieldError> {
            if !range_sides_fit(&from, &self.to) {
                return Err(FieldError::RangeSide);
            }
            self.from = from;
            Ok(())
        }

        pub fn set_to(&mut self, to: Timestamp) -> Result<(), FieldError> {
            if !range_sides_fit(&self.from, &to) {
                return Err(FieldError::RangeSide);
            }
            self.to = to;
            Ok(())
        }

        pub fn is_active(&self) -> bool {
            self.from.is_active() && self.to.is_active()
        }

        pub fn duration(&self) -> Result<Duration, OrgError> {
            Ok(self.to.start_datetime()? - self.from.start_datetime()?)
        }
    }

    impl fmt::Display for TimestampRange {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}--{}", self.from, self.to)
        }
    }

    fn range_sides_fit(from: &Timestamp, to: &Timestamp) -> bool {
        from.kind() == to.kind()
            && !from.has_repeater()
            && !from.has_delay()
            && !to.has_repeater()
            && !to.has_delay()
    }

    /* ------------------------------- Grammar ------------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    enum Cookie {
        Repeater(Repeater),
        Delay(Delay),
    }

    fn reject<'a>(at: &'a str, what: &'static str) -> nom::Err<VerboseError<&'a str>> {
        nom::Err::Error(VerboseError {
            errors: vec![(at, VerboseErrorKind::Context(what))],
        })
    }

    fn timestamp(input: &str) -> PResult<'_, Timestamp> {
        let (i, open) = one_of("<[")(input)?;
        let (i, date) = date(i)?;
        let (i, weekday) = opt(preceded(char(' '), weekday))(i)?;
        let (i, clock) = opt(preceded(char(' '), clock_span))(i)?;
        let (i, cookies) = many0(preceded(char(' '), cookie))(i)?;
        let (i, close) = one_of(">]")(i)?;

        let active = match (open, close) {
            ('<', '>') => true,
            ('[', ']') => false,
            _ => return Err(reject(input, "brackets")),
        };
        let mut ts = Timestamp {
            active,
            date,
            weekday: weekday.map(str::to_string),
            time: clock.map(|(start, _)| start),
            end_time: clock.and_then(|(_, end)| end),
            repeater: None,
            delay: None,
            delay_first: false,
        };
        for cookie in cookies {
            match cookie {
                Cookie::Repeater(r) if ts.repeater.is_none() => ts.repeater = Some(r),
                Cookie::Delay(d) if ts.delay.is_none() => {
                    ts.delay_first = ts.repeater.is_none();
                    ts.delay = Some(d);
                }
                _ => return Err(reject(input, "duplicate cookie")),
            }
        }
        Ok((i, ts))
    }

    fn range(i: &str) -> PResult<'_, (Timestamp, Timestamp)> {
        separated_pair(timestamp, tag("--"), timestamp)(i)
    }

    /// Fixed-width decimal; returns the value and the digit count.
    fn number(i: &str, min: usize, max: usize) -> PResult<'_, (u32, u8)> {
        let (rest, digits) = take_while_m_n(min, max, |c: char| c.is_ascii_digit())(i)?;
        let value = digits.parse::<u32>().map_err(|_| reject(i, "number"))?;
        let width = u8::try_from(digits.len()).map_err(|_| reject(i, "number"))?;
        Ok((rest, (value, width)))
    }

    fn date(i: &str) -> PResult<'_, OrgDate> {
        let (i, (year, _)) = number(i, 4, 4)?;
        let (i, _) = char('-')(i)?;
        let (i, (month, _)) = number(i, 2, 2)?;
        let (i, _) = char('-')(i)?;
        let (i, (day, _)) = number(i, 2, 2)?;
        Ok((i, OrgDate { year, month, day }))
    }

    fn weekday(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            satisfy(|c: char| c.is_ascii_uppercase()),
            satisfy(|c: char| c.is_ascii_lowercase()),
            satisfy(|c: char| c.is_ascii_lowercase()),
        )))(i)
    }

    fn clock_time(i: &str) -> PResult<'_, ClockTime> {
        let (i, (hour, _)) = number(i, 2, 2)?;
        let (i, _) = char(':')(i)?;
        let (i, (minute, _)) = number(i, 2, 2)?;
        Ok((i, ClockTime { hour, minute }))
    }

    fn clock_span(i: &str) -> PResult<'_, (ClockTime, Option<ClockTime>)> {
        pair(clock_time, opt(preceded(char('-'), clock_time)))(i)
    }

    fn time_unit(i: &str) -> PResult<'_, TimeUnit> {
        alt((
            value(TimeUnit::Day, char('d')),
            value(TimeUnit::Week, char('w')),
            value(TimeUnit::Month, char('m')),
            value(TimeUnit::Year, char('y')),
        ))(i)
    }

    fn interval(i: &str) -> PResult<'_, Interval> {
        let (i, (value, width)) = number(i, 1, 4)?;
        let (i, unit) = time_unit(i)?;
        Ok((i, Interval { value, unit, width }))
    }

    fn repeater(i: &str) -> PResult<'_, Repeater> {
        let (i, kind) = alt((
            value(RepeaterKind::FromNow, tag(".+")),
            value(RepeaterKind::FromBase, tag("++")),
            value(RepeaterKind::FromLast, tag("+")),
        ))(i)?;
        let (i, interval) = interval(i)?;
        Ok((i, Repeater { kind, interval }))
    }

    fn delay(i: &str) -> PResult<'_, Delay> {
        let (i, kind) = alt((
            value(DelayKind::First, tag("--")),
            value(DelayKind::All, tag("-")),
        ))(i)?;
        let (i, interval) = interval(i)?;
        Ok((i, Delay { kind, interval }))
    }

    fn cookie(i: &str) -> PResult<'_, Cookie> {
        alt((map(repeater, Cookie::Repeater), map(delay, Cookie::Delay)))(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
        }

        #[test]
        fn accepted_forms_print_back_unchanged() {
            for text in [
                "<2013-09-20 Fri>",
                "[2013-09-20 Fri]",
                "<2013-09-20>",
                "<2013-09-20 Fri 15:05>",
                "[2013-08-11 Sun 12:15-20:45]",
                "<2013-09-20 Fri 15:05 +10m -5w>",
                "<2013-09-20 Fri -1d +1w>",
                "<2013-09-20 Fri ++1w>",
                "<2013-09-20 Fri .+2d>",
                "<2013-09-20 Fri --3d>",
                "<2013-09-20 +01d>",
                "<2013-13-45 Xyz 99:99>",
            ] {
                let ts = Timestamp::parse(text).expect("parse");
                assert_eq!(ts.to_string(), text);
            }
        }

        #[test]
        fn scheduled_example_decomposes() {
            let ts = Timestamp::parse("<2013-09-20 Fri 15:05 +10m -5w>").expect("parse");
            assert!(ts.is_active());
            assert_eq!(ts.kind(), TimestampKind::DateTime);
            assert_eq!(
                ts.start_datetime().expect("calendar"),
                ymd(2013, 9, 20).and_hms_opt(15, 5, 0).expect("time")
            );
            assert_eq!(ts.repeat_interval(), Some((10, TimeUnit::Month)));
            assert_eq!(ts.delay_interval(), Some((5, TimeUnit::Week)));
            assert_eq!(ts.delay().map(|d| d.kind), Some(DelayKind::All));
            assert!(ts.has_overdue_repeater());
            assert_eq!(ts.weekday(), Some("Fri"));
        }

        #[test]
        fn overdue_only_for_plain_plus() {
            let catch_up = Timestamp::parse("<2013-09-20 Fri ++1w>").expect("parse");
            let restart = Timestamp::parse("<2013-09-20 Fri .+1w>").expect("parse");
            assert!(catch_up.has_repeater());
            assert!(!catch_up.has_overdue_repeater());
            assert!(!restart.has_overdue_repeater());
        }

        #[test]
        fn rejects_malformed_text() {
            for text in [
                "<2013-09-20 Fri]",
                "<2013-9-20>",
                "2013-09-20",
                "<2013-09-20 Friday>",
                "<2013-09-20 Fri 15:5>",
                "<2013-09-20 Fri +1d +2d>",
                "<2013-09-20 Fri -1d --2d>",
                "<2013-09-20 Fri +10x>",
                "<2013-09-20 Fri +12345d>",
                "<2013-09-20 Fri> ",
            ] {
                assert!(
                    matches!(Timestamp::parse(text), Err(OrgError::MalformedTimestamp(_))),
                    "{text} should be rejected"
                );
            }
        }

        #[test]
        fn same_day_duration() {
            let ts = Timestamp::parse("<2013-08-11 Sun 12:15-20:45>").expect("parse");
            assert!(ts.has_duration());
            assert_eq!(
                ts.duration().expect("calendar"),
                Some(Duration::hours(8) + Duration::minutes(30))
            );
            let plain = Timestamp::parse("<2013-08-11 Sun 12:15>").expect("parse");
            assert_eq!(plain.duration().expect("calendar"), None);
        }

        #[test]
        fn calendar_is_checked_only_on_conversion() {
            let ts = Timestamp::parse("<2013-02-30 Sat>").expect("parse");
            assert_eq!(ts.to_string(), "<2013-02-30 Sat>");
            assert!(matches!(ts.naive_date(), Err(OrgError::InvalidCalendar(_))));
        }

        #[test]
        fn set_date_recomputes_weekday() {
            let mut ts = Timestamp::parse("<2013-09-20 Fri 15:05>").expect("parse");
            ts.set_date(ymd(2013, 9, 23)).expect("date");
            assert_eq!(ts.to_string(), "<2013-09-23 Mon 15:05>");

            let mut bare = Timestamp::parse("<2013-09-20>").expect("parse");
            bare.set_date(ymd(2013, 9, 23)).expect("date");
            assert_eq!(bare.to_string(), "<2013-09-23>");
        }

        #[test]
        fn mutators_rederive_text() {
            let mut ts = Timestamp::parse("[2013-09-20 Fri]").expect("parse");
            ts.set_active(true);
            ts.set_datetime(ymd(2013, 9, 20).and_hms_opt(9, 30, 0).expect("time"))
                .expect("datetime");
            ts.set_end_time(NaiveTime::from_hms_opt(10, 0, 0)).expect("end");
            ts.set_repeater("++1w").expect("repeater");
            ts.set_delay("-2d").expect("delay");
            assert_eq!(ts.to_string(), "<2013-09-20 Fri 09:30-10:00 ++1w -2d>");

            ts.set_date_only();
            ts.clear_repeater();
            ts.clear_delay();
            assert_eq!(ts.to_string(), "<2013-09-20 Fri>");
        }

        #[test]
        fn failed_setters_leave_value_alone() {
            let mut ts = Timestamp::parse("<2013-09-20 Fri +1w>").expect("parse");
            assert_eq!(
                ts.set_end_time(NaiveTime::from_hms_opt(10, 0, 0)),
                Err(FieldError::EndTime)
            );
            assert!(matches!(ts.set_repeater("+1x"), Err(FieldError::Repeater(_))));
            assert!(matches!(ts.set_delay("+1d"), Err(FieldError::Delay(_))));
            assert_eq!(ts.to_string(), "<2013-09-20 Fri +1w>");
        }

        #[test]
        fn dates_outside_four_digit_years_are_refused() {
            let mut ts = Timestamp::parse("<2013-09-20 Fri>").expect("parse");
            assert_eq!(ts.set_date(ymd(12345, 1, 1)), Err(FieldError::Year(12345)));
            assert_eq!(ts.set_date(ymd(-1, 1, 1)), Err(FieldError::Year(-1)));
            assert_eq!(ts.to_string(), "<2013-09-20 Fri>");
            assert!(Timestamp::from_date(ymd(10000, 1, 1), true).is_err());

            ts.set_date(ymd(9999, 12, 31)).expect("date");
            let reread = Timestamp::parse(&ts.to_string()).expect("reparse");
            assert_eq!(reread, ts);
        }

        #[test]
        fn intervals_fit_four_digits() {
            assert_eq!(
                Delay::new(DelayKind::All, 10_000, TimeUnit::Day),
                Err(FieldError::Interval(10_000))
            );
            let repeater = Repeater::new(RepeaterKind::FromLast, 9999, TimeUnit::Day).expect("max");
            assert_eq!(Repeater::parse(&repeater.to_string()), Ok(repeater));
        }

        #[test]
        fn constructors_render_like_org() {
            let ts = Timestamp::from_datetime(
                ymd(2013, 9, 20).and_hms_opt(15, 5, 0).expect("time"),
                true,
            )
            .expect("datetime")
            .with_weekday();
            assert_eq!(ts.to_string(), "<2013-09-20 Fri 15:05>");
            assert_eq!(
                Timestamp::from_date(ymd(2013, 9, 20), false)
                    .expect("date")
                    .to_string(),
                "[2013-09-20]"
            );
            assert_eq!(
                Repeater::new(RepeaterKind::FromBase, 2, TimeUnit::Week)
                    .expect("repeater")
                    .to_string(),
                "++2w"
            );
        }

        #[test]
        fn range_parses_and_measures() {
            let range =
                TimestampRange::parse("<2013-08-11 Sun>--<2013-08-13 Tue>").expect("range");
            assert!(range.is_active());
            assert_eq!(range.duration().expect("calendar"), Duration::days(2));
            assert_eq!(range.to_string(), "<2013-08-11 Sun>--<2013-08-13 Tue>");

            let timed = TimestampRange::parse("[2013-08-11 Sun 10:00]--[2013-08-12 Mon 12:00]")
                .expect("range");
            assert!(!timed.is_active());
            assert_eq!(
                timed.duration().expect("calendar"),
                Duration::days(1) + Duration::hours(2)
            );
        }

        #[test]
        fn range_rejects_mixed_or_cookied_sides() {
            for text in [
                "<2013-08-11 Sun>--<2013-08-13 Tue 10:00>",
                "<2013-08-11 Sun +1w>--<2013-08-13 Tue>",
                "<2013-08-11 Sun>--<2013-08-13 Tue -1d>",
                "<2013-08-11 Sun>-<2013-08-13 Tue>",
            ] {
                assert!(
                    matches!(TimestampRange::parse(text), Err(OrgError::MalformedRange(_))),
                    "{text} should be rejected"
                );
            }

            let mut range =
                TimestampRange::parse("<2013-08-11 Sun>--<2013-08-13 Tue>").expect("range");
            let timed = Timestamp::parse("<2013-08-14 Wed 10:00>").expect("parse");
            assert_eq!(range.set_to(timed), Err(FieldError::RangeSide));
            assert_eq!(range.to().to_string(), "<2013-08-13 Tue>");
        }

        #[test]
        fn lenient_parse_drops_unreadable_time() {
            let text = "<2013-09-20 Fri xx:yy +1w>";
            assert!(Timestamp::parse(text).is_err());
            let ts = Timestamp::parse_lenient(text).expect("lenient");
            assert!(ts.is_date_only());
            assert_eq!(ts.repeat_interval(), Some((1, TimeUnit::Week)));
            assert_eq!(
                ts.start_datetime().expect("calendar"),
                ymd(2013, 9, 20).and_hms_opt(0, 0, 0).expect("time")
            );

            assert!(Timestamp::parse_lenient("<2013-09-20 Fri 1:30>").is_err());
        }
    }
}

pub mod header {
    //! Heading lines: `<stars> [KEYWORD ][[#P] ][<timestamp> ][hash: ]title[ :tag:tag:]`.
    //!
    //! A parsed header keeps the line it came from and prints it back verbatim until
    //! a setter touches it; from then on it is rendered from its fields.

    use crate::error::{FieldError, OrgError};
    use crate::timestamp::Timestamp;
    use nom::{
        IResult,
        bytes::complete::{tag, take_while_m_n},
        character::complete::{char, satisfy},
        error::VerboseError,
        sequence::{delimited, terminated},
    };
    use serde::{Deserialize, Serialize};
    use std::{borrow::Cow, fmt, str::FromStr};

    pub const MARKER: char = '*';

    /// Which of priority and timestamp comes first on the line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum FieldOrder {
        #[default]
        PriorityFirst,
        TimestampFirst,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Header {
        level: usize,
        #[serde(default)]
        keyword: Option<String>,
        #[serde(default)]
        priority: Option<char>,
        #[serde(default)]
        timestamp: Option<Timestamp>,
        #[serde(default)]
        hash: Option<String>,
        title: String,
        #[serde(default)]
        tags: Vec<String>,
        /// Whitespace between the title and the tag block.
        #[serde(default = "default_tag_gap")]
        tag_gap: String,
        #[serde(default)]
        order: FieldOrder,
        /// Cached serialized form; cleared by every setter.
        #[serde(default)]
        source: Option<String>,
    }

    fn default_tag_gap() -> String {
        " ".to_string()
    }

    /* ---- Construction ---- */

    impl Header {
        fn blank(level: usize) -> Self {
            Self {
                level,
                keyword: None,
                priority: None,
                timestamp: None,
                hash: None,
                title: String::new(),
                tags: Vec::new(),
                tag_gap: default_tag_gap(),
                order: FieldOrder::default(),
                source: None,
            }
        }

        pub fn new(level: usize, title: &str) -> Result<Self, FieldError> {
            let mut header = Self::blank(1);
            header.set_level(level)?;
            header.set_title(title)?;
            Ok(header)
        }

        /// Parses one heading line. A trailing line terminator is ignored.
        ///
        /// A bracketed token shaped like a date in the priority/timestamp slot must
        /// be a valid timestamp; anything else there falls through to the title.
        pub fn parse(line: &str) -> Result<Self, OrgError> {
            let source = line.trim_end_matches(['\n', '\r']);
            let text = source.trim();
            let level = text.chars().take_while(|c| *c == MARKER).count();
            if level == 0 {
                return Err(OrgError::NotAHeading(source.to_string()));
            }

            let mut header = Self::blank(level);
            header.source = Some(source.to_string());

            let after_stars = &text[level..];
            let Some(mut rest) = after_stars.strip_prefix(' ') else {
                header.title = after_stars.trim().to_string();
                return Ok(header);
            };

            if let Ok((r, kw)) = keyword(rest) {
                header.keyword = Some(kw.to_string());
                rest = r;
            }
            if let Ok((r, p)) = priority(rest) {
                header.priority = Some(p);
                rest = r;
            }
            if let Some((ts, r)) = embedded_timestamp(rest)? {
                header.timestamp = Some(ts);
                rest = r;
                if header.priority.is_none() {
                    if let Ok((r, p)) = priority(rest) {
                        header.priority = Some(p);
                        header.order = FieldOrder::TimestampFirst;
                        rest = r;
                    }
                }
            }
            if let Ok((r, h)) = hash(rest) {
                header.hash = Some(h.to_string());
                rest = r;
            }

            let (title, tags) = split_tags(rest);
            header.title = title.trim().to_string();
            if let Some((gap, tags)) = tags {
                header.tag_gap = gap.to_string();
                header.tags = tags;
            }
            Ok(header)
        }

        /* ---- Accessors ---- */

        pub fn level(&self) -> usize {
            self.level
        }

        pub fn keyword(&self) -> Option<&str> {
            self.keyword.as_deref()
        }

        pub fn has_keyword(&self) -> bool {
            self.keyword.is_some()
        }

        pub fn priority(&self) -> Option<char> {
            self.priority
        }

        pub fn has_priority(&self) -> bool {
            self.priority.is_some()
        }

        pub fn timestamp(&self) -> Option<&Timestamp> {
            self.timestamp.as_ref()
        }

        pub fn has_timestamp(&self) -> bool {
            self.timestamp.is_some()
        }

        pub fn hash(&self) -> Option<&str> {
            self.hash.as_deref()
        }

        pub fn has_hash(&self) -> bool {
            self.hash.is_some()
        }

        pub fn title(&self) -> &str {
            &self.title
        }

        pub fn tags(&self) -> &[String] {
            &self.tags
        }

        pub fn has_tags(&self) -> bool {
            !self.tags.is_empty()
        }

        pub fn has_tag(&self, tag: &str) -> bool {
            self.tags.iter().any(|t| t == tag)
        }

        /// `:a:b:`, or an empty string without tags.
        pub fn tag_string(&self) -> String {
            if self.tags.is_empty() {
                String::new()
            } else {
                format!(":{}:", self.tags.join(":"))
            }
        }

        pub fn field_order(&self) -> FieldOrder {
            self.order
        }

        /// True while the cached source line is still valid.
        pub fn is_clean(&self) -> bool {
            self.source.is_some()
        }

        /* ---- Setters ---- */

        fn mark_dirty(&mut self) {
            self.source = None;
        }

        pub fn set_level(&mut self, level: usize) -> Result<(), FieldError> {
            if level == 0 {
                return Err(FieldError::Level(level));
            }
            self.level = level;
            self.mark_dirty();
            Ok(())
        }

        pub fn set_keyword(&mut self, keyword: Option<&str>) -> Result<(), FieldError> {
            if let Some(kw) = keyword {
                if !is_keyword(kw) {
                    return Err(FieldError::Keyword(kw.to_string()));
                }
            }
            self.keyword = keyword.map(str::to_string);
            self.mark_dirty();
            Ok(())
        }

        pub fn set_priority(&mut self, priority: Option<&str>) -> Result<(), FieldError> {
            let parsed = match priority {
                None => None,
                Some(p) => {
                    let mut chars = p.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) if c.is_ascii_uppercase() => Some(c),
                        _ => return Err(FieldError::Priority(p.to_string())),
                    }
                }
            };
            self.priority = parsed;
            self.mark_dirty();
            Ok(())
        }

        pub fn set_timestamp(&mut self, timestamp: Option<Timestamp>) {
            self.timestamp = timestamp;
            self.mark_dirty();
        }

        /// Mutable access to the timestamp. Invalidates the cached line when there is one.
        pub fn timestamp_mut(&mut self) -> Option<&mut Timestamp> {
            let ts = self.timestamp.as_mut()?;
            self.source = None;
            Some(ts)
        }

        pub fn set_hash(&mut self, hash: Option<&str>) -> Result<(), FieldError> {
            if let Some(h) = hash {
                if !is_hash(h) {
                    return Err(FieldError::Hash(h.to_string()));
                }
            }
            self.hash = hash.map(str::to_string);
            self.mark_dirty();
            Ok(())
        }

        pub fn set_title(&mut self, title: &str) -> Result<(), FieldError> {
            let title = title.trim();
            if title.is_empty() || title.contains(['\n', '\r']) {
                return Err(FieldError::Title);
            }
            self.title = title.to_string();
            self.mark_dirty();
            Ok(())
        }

        /// Returns `Ok(false)` when the tag is already present.
        pub fn add_tag(&mut self, tag: &str) -> Result<bool, FieldError> {
            if tag.is_empty()
                || !tag
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            {
                return Err(FieldError::Tag(tag.to_string()));
            }
            if self.has_tag(tag) {
                return Ok(false);
            }
            self.tags.push(tag.to_string());
            self.mark_dirty();
            Ok(true)
        }

        pub fn remove_tag(&mut self, tag: &str) -> bool {
            let before = self.tags.len();
            self.tags.retain(|t| t != tag);
            let removed = self.tags.len() != before;
            if removed {
                self.mark_dirty();
            }
            removed
        }

        pub fn clear_tags(&mut self) {
            if !self.tags.is_empty() {
                self.tags.clear();
                self.mark_dirty();
            }
        }

        /* ---- Output ---- */

        /// The cached source line when unmodified, else the canonical rendering.
        pub fn format(&self) -> Cow<'_, str> {
            match &self.source {
                Some(line) => Cow::Borrowed(line.as_str()),
                None => Cow::Owned(self.render()),
            }
        }

        /// Rebuilds the line from fields, single spaces between present fields.
        pub fn render(&self) -> String {
            let mut buf = MARKER.to_string().repeat(self.level);
            if let Some(kw) = &self.keyword {
                buf.push(' ');
                buf.push_str(kw);
            }
            let priority = self.priority.map(|p| format!("[#{p}]"));
            let timestamp = self.timestamp.as_ref().map(ToString::to_string);
            let middle = match self.order {
                FieldOrder::PriorityFirst => [priority, timestamp],
                FieldOrder::TimestampFirst => [timestamp, priority],
            };
            for field in middle.into_iter().flatten() {
                buf.push(' ');
                buf.push_str(&field);
            }
            if let Some(hash) = &self.hash {
                buf.push(' ');
                buf.push_str(hash);
                buf.push(':');
            }
            buf.push(' ');
            buf.push_str(&self.title);
            if !self.tags.is_empty() {
                buf.push_str(&self.tag_gap);
                buf.push_str(&self.tag_string());
            }
            buf
        }
    }

    impl fmt::Display for Header {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.format())
        }
    }

    impl FromStr for Header {
        type Err = OrgError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Self::parse(s)
        }
    }

    /* ------------------------------- Grammar ------------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn is_keyword(s: &str) -> bool {
        (3..=5).contains(&s.len()) && s.chars().all(|c| c.is_ascii_uppercase())
    }

    fn is_hash(s: &str) -> bool {
        s.len() == 5
            && s
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    }

    fn keyword(i: &str) -> PResult<'_, &str> {
        terminated(
            take_while_m_n(3, 5, |c: char| c.is_ascii_uppercase()),
            char(' '),
        )(i)
    }

    fn priority(i: &str) -> PResult<'_, char> {
        terminated(
            delimited(tag("[#"), satisfy(|c: char| c.is_ascii_uppercase()), char(']')),
            char(' '),
        )(i)
    }

    fn hash(i: &str) -> PResult<'_, &str> {
        terminated(
            take_while_m_n(5, 5, |c: char| {
                c.is_ascii_lowercase() || c.is_ascii_digit()
            }),
            tag(": "),
        )(i)
    }

    /// Opener followed by `DDDD-`.
    fn looks_like_timestamp(i: &str) -> bool {
        let b = i.as_bytes();
        b.len() > 5
            && matches!(b[0], b'<' | b'[')
            && b[1..5].iter().all(u8::is_ascii_digit)
            && b[5] == b'-'
    }

    fn embedded_timestamp(i: &str) -> Result<Option<(Timestamp, &str)>, OrgError> {
        if !looks_like_timestamp(i) {
            return Ok(None);
        }
        let close = if i.starts_with('<') { '>' } else { ']' };
        let Some(end) = i.find(close) else {
            return Err(OrgError::MalformedTimestamp(i.to_string()));
        };
        let (token, rest) = i.split_at(end + 1);
        let ts = Timestamp::parse(token)?;
        Ok(rest.strip_prefix(' ').map(|rest| (ts, rest)))
    }

    fn is_tag_block(block: &str) -> bool {
        block.len() >= 3
            && block.starts_with(':')
            && block.ends_with(':')
            && block[1..block.len() - 1]
                .split(':')
                .all(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_alphanumeric()))
    }

    /// Splits `title  :a:b:` into the title part and `(gap, tags)`.
    fn split_tags(text: &str) -> (&str, Option<(&str, Vec<String>)>) {
        let Some(pos) = text.rfind([' ', '\t']) else {
            return (text, None);
        };
        let block = &text[pos + 1..];
        if !is_tag_block(block) {
            return (text, None);
        }
        let head = text[..pos].trim_end_matches([' ', '\t']);
        let gap = &text[head.len()..=pos];
        let tags = block[1..block.len() - 1]
            .split(':')
            .map(str::to_string)
            .collect();
        (head, Some((gap, tags)))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::timestamp::TimeUnit;

        #[test]
        fn keyword_hash_and_title() {
            let h = Header::parse("*** TODO 12345: test header").expect("parse");
            assert_eq!(h.level(), 3);
            assert_eq!(h.keyword(), Some("TODO"));
            assert_eq!(h.hash(), Some("12345"));
            assert_eq!(h.title(), "test header");
            assert!(!h.has_priority());
            assert!(!h.has_timestamp());
            assert!(!h.has_tags());
        }

        #[test]
        fn priority_before_hash() {
            let h = Header::parse("* LOG [#A] z2389: TEST header").expect("parse");
            assert_eq!(h.level(), 1);
            assert_eq!(h.keyword(), Some("LOG"));
            assert_eq!(h.priority(), Some('A'));
            assert_eq!(h.hash(), Some("z2389"));
            assert_eq!(h.title(), "TEST header");
        }

        #[test]
        fn every_field_in_either_order() {
            let h = Header::parse("** NEXT [#B] <2013-09-20 Fri 15:05 +1w> ab1cd: Call :work:phone:")
                .expect("parse");
            assert_eq!(h.field_order(), FieldOrder::PriorityFirst);
            assert_eq!(
                h.timestamp().and_then(|t| t.repeat_interval()),
                Some((1, TimeUnit::Week))
            );
            assert_eq!(h.tags(), ["work", "phone"]);
            assert_eq!(h.tag_string(), ":work:phone:");

            let h = Header::parse("* DONE [2013-08-11 Sun] [#C] Review").expect("parse");
            assert_eq!(h.field_order(), FieldOrder::TimestampFirst);
            assert_eq!(h.priority(), Some('C'));
            assert!(h.timestamp().is_some_and(|t| !t.is_active()));
            assert_eq!(h.title(), "Review");
        }

        #[test]
        fn render_matches_clean_lines() {
            for line in [
                "*** TODO 12345: test header",
                "* LOG [#A] z2389: TEST header",
                "** NEXT [#B] <2013-09-20 Fri 15:05 +1w> ab1cd: Call :work:phone:",
                "* DONE [2013-08-11 Sun] [#C] Review",
                "* Plain title",
                "* Tabbed\t:a:",
                "**** Spaced out      :x:y:",
            ] {
                let h = Header::parse(line).expect("parse");
                assert_eq!(h.render(), line);
                assert_eq!(h.format(), line);
            }
        }

        #[test]
        fn format_keeps_untrimmed_source() {
            let h = Header::parse("* Title with trailing space   \r\n").expect("parse");
            assert_eq!(h.format(), "* Title with trailing space   ");
            assert_eq!(h.render(), "* Title with trailing space");
        }

        #[test]
        fn near_misses_stay_in_title() {
            let h = Header::parse("* TODOXX thing").expect("parse");
            assert_eq!(h.keyword(), None);
            assert_eq!(h.title(), "TODOXX thing");

            let h = Header::parse("* abcdef: six chars").expect("parse");
            assert_eq!(h.hash(), None);

            let h = Header::parse("* Title :not a tag:").expect("parse");
            assert!(h.tags().is_empty());
            assert_eq!(h.title(), "Title :not a tag:");

            let h = Header::parse("* [2013-08-11 Sun]").expect("parse");
            assert!(!h.has_timestamp());
            assert_eq!(h.title(), "[2013-08-11 Sun]");
        }

        #[test]
        fn hard_failures() {
            assert!(matches!(
                Header::parse("No stars here"),
                Err(OrgError::NotAHeading(_))
            ));
            assert!(matches!(
                Header::parse("* TODO <2013-08-11 Sun 12:1> meeting"),
                Err(OrgError::MalformedTimestamp(_))
            ));
            assert!(matches!(
                Header::parse("* TODO <2013-08-11 Sun meeting"),
                Err(OrgError::MalformedTimestamp(_))
            ));
        }

        #[test]
        fn rejected_setters_keep_state() {
            let mut h = Header::parse("*** TODO 12345: test header").expect("parse");
            assert!(matches!(h.set_priority(Some("AB")), Err(FieldError::Priority(_))));
            assert!(matches!(h.set_priority(Some("a")), Err(FieldError::Priority(_))));
            assert!(matches!(h.set_keyword(Some("TO")), Err(FieldError::Keyword(_))));
            assert!(matches!(h.set_hash(Some("ABCDE")), Err(FieldError::Hash(_))));
            assert_eq!(h.set_title("   "), Err(FieldError::Title));
            assert_eq!(h.set_title("x\n* injected"), Err(FieldError::Title));
            assert_eq!(h.set_title("x\ry"), Err(FieldError::Title));
            assert_eq!(h.set_level(0), Err(FieldError::Level(0)));
            assert!(matches!(h.add_tag("Work"), Err(FieldError::Tag(_))));
            assert!(h.is_clean());
            assert_eq!(h.format(), "*** TODO 12345: test header");
        }

        #[test]
        fn setters_invalidate_only_the_cache() {
            let mut h = Header::parse("*** TODO 12345: test header").expect("parse");
            h.set_keyword(Some("DONE")).expect("keyword");
            assert!(!h.is_clean());
            assert_eq!(h.hash(), Some("12345"));
            assert_eq!(h.format(), "*** DONE 12345: test header");

            h.set_priority(Some("A")).expect("priority");
            assert_eq!(h.add_tag("work"), Ok(true));
            assert_eq!(h.add_tag("work"), Ok(false));
            h.set_level(1).expect("level");
            assert_eq!(h.format(), "* DONE [#A] 12345: test header :work:");

            assert!(h.remove_tag("work"));
            assert!(!h.remove_tag("work"));
            h.set_hash(None).expect("hash");
            h.set_keyword(None).expect("keyword");
            assert_eq!(h.format(), "* [#A] test header");
        }

        #[test]
        fn timestamp_mut_rerenders() {
            let mut h = Header::parse("* DONE [2013-08-11 Sun] [#C] Review").expect("parse");
            if let Some(ts) = h.timestamp_mut() {
                ts.set_active(true);
                ts.set_repeater("+1w").expect("repeater");
            }
            assert_eq!(h.format(), "* DONE <2013-08-11 Sun +1w> [#C] Review");
        }

        #[test]
        fn timestamp_mut_without_timestamp_keeps_line() {
            let mut h = Header::parse("** TODO 12345: spaced   ").expect("parse");
            assert!(h.timestamp_mut().is_none());
            assert!(h.is_clean());
            assert_eq!(h.format(), "** TODO 12345: spaced   ");
        }

        #[test]
        fn new_header_renders_canonically() {
            let mut h = Header::new(2, "Fresh").expect("header");
            h.set_hash(Some("a1b2c")).expect("hash");
            h.set_timestamp(Timestamp::parse("<2013-09-20 Fri>").ok());
            assert_eq!(h.to_string(), "** <2013-09-20 Fri> a1b2c: Fresh");
            assert_eq!(Header::new(0, "x"), Err(FieldError::Level(0)));
        }
    }
}

pub mod body {
    //! Structured data derived from a node's raw body: the property block,
    //! planning lines and named drawers.

    use crate::error::OrgError;
    use crate::timestamp::Timestamp;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ------------------------------ Planning ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum PlanningKind {
        Scheduled,
        Deadline,
        Closed,
    }

    impl PlanningKind {
        pub const ALL: [PlanningKind; 3] = [
            PlanningKind::Scheduled,
            PlanningKind::Deadline,
            PlanningKind::Closed,
        ];

        pub fn keyword(self) -> &'static str {
            match self {
                PlanningKind::Scheduled => "SCHEDULED",
                PlanningKind::Deadline => "DEADLINE",
                PlanningKind::Closed => "CLOSED",
            }
        }

        fn marker(self) -> String {
            format!("{}:", self.keyword())
        }
    }

    impl fmt::Display for PlanningKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.keyword())
        }
    }

    /// One `KEYWORD: <timestamp>` entry of a planning line.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Schedule {
        kind: PlanningKind,
        timestamp: Timestamp,
    }

    impl Schedule {
        pub fn new(kind: PlanningKind, timestamp: Timestamp) -> Self {
            Self { kind, timestamp }
        }

        /// Reads the timestamp following `kind`'s keyword anywhere on `line`.
        /// Falls back to date-only when the time of day is unreadable.
        pub fn parse(kind: PlanningKind, line: &str) -> Result<Self, OrgError> {
            let malformed = || OrgError::MalformedSchedule(line.trim().to_string());
            let payload = bracket_after(line, kind).ok_or_else(malformed)?;
            let close = match payload.chars().next() {
                Some('<') => '>',
                Some('[') => ']',
                _ => return Err(malformed()),
            };
            let end = payload.find(close).ok_or_else(malformed)?;
            let timestamp = Timestamp::parse_lenient(&payload[..=end]).map_err(|_| malformed())?;
            Ok(Self { kind, timestamp })
        }

        pub fn scheduled(line: &str) -> Result<Self, OrgError> {
            Self::parse(PlanningKind::Scheduled, line)
        }

        pub fn deadline(line: &str) -> Result<Self, OrgError> {
            Self::parse(PlanningKind::Deadline, line)
        }

        pub fn kind(&self) -> PlanningKind {
            self.kind
        }

        pub fn timestamp(&self) -> &Timestamp {
            &self.timestamp
        }

        pub fn timestamp_mut(&mut self) -> &mut Timestamp {
            &mut self.timestamp
        }

        pub fn into_timestamp(self) -> Timestamp {
            self.timestamp
        }
    }

    impl fmt::Display for Schedule {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}: {}", self.kind, self.timestamp)
        }
    }

    /// Text from the first bracket that directly follows `kind`'s keyword.
    fn bracket_after(line: &str, kind: PlanningKind) -> Option<&str> {
        let marker = kind.marker();
        line.match_indices(&marker)
            .map(|(at, _)| line[at + marker.len()..].trim_start())
            .find(|rest| rest.starts_with(['<', '[']))
    }

    /// Keywords on `line` that are followed by a bracket.
    fn planning_kinds(line: &str) -> Vec<PlanningKind> {
        PlanningKind::ALL
            .into_iter()
            .filter(|kind| bracket_after(line, *kind).is_some())
            .collect()
    }

    /* ------------------------------- Drawers ------------------------------- */

    /// A `:NAME:` ... `:END:` block; `content` holds the interior lines verbatim.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Drawer {
        pub name: String,
        pub content: String,
    }

    impl Drawer {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                content: String::new(),
            }
        }

        pub fn lines(&self) -> impl Iterator<Item = &str> {
            self.content.lines()
        }
    }

    impl fmt::Display for Drawer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, ":{}:\n{}", self.name, self.content)?;
            if !self.content.is_empty() && !self.content.ends_with('\n') {
                writeln!(f)?;
            }
            f.write_str(":END:")
        }
    }

    fn drawer_name(trimmed: &str) -> Option<&str> {
        let name = trimmed.strip_prefix(':')?.strip_suffix(':')?;
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
            && !name.eq_ignore_ascii_case("END")
            && !name.eq_ignore_ascii_case("PROPERTIES");
        valid.then_some(name)
    }

    fn is_end(trimmed: &str) -> bool {
        trimmed.eq_ignore_ascii_case(":END:")
    }

    fn is_properties_start(trimmed: &str) -> bool {
        trimmed.eq_ignore_ascii_case(":PROPERTIES:")
    }

    /// `:KEY: value` with the value trimmed.
    fn property_line(trimmed: &str) -> Option<(&str, &str)> {
        let (key, value) = trimmed.strip_prefix(':')?.split_once(':')?;
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '+'));
        valid.then(|| (key, value.trim()))
    }

    /* ------------------------------ Body data ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct BodyData {
        /// Later keys win; first-seen order is kept.
        pub properties: IndexMap<String, String>,
        pub scheduled: Option<Schedule>,
        pub deadline: Option<Schedule>,
        pub closed: Option<Schedule>,
        pub drawers: Vec<Drawer>,
    }

    enum Scan {
        Idle,
        Properties,
        Drawer(Drawer),
    }

    impl BodyData {
        /// Single pass over the raw body.
        pub fn parse(raw: &str) -> Result<Self, OrgError> {
            let mut data = BodyData::default();
            let mut state = Scan::Idle;
            for line in raw.split_inclusive('\n') {
                state = data.step(state, line)?;
            }
            if let Scan::Drawer(open) = state {
                data.drawers.push(open);
            }
            Ok(data)
        }

        fn step(&mut self, state: Scan, line: &str) -> Result<Scan, OrgError> {
            let trimmed = line.trim();
            if let Scan::Drawer(mut drawer) = state {
                if is_end(trimmed) {
                    self.drawers.push(drawer);
                    return Ok(Scan::Idle);
                }
                drawer.content.push_str(line);
                return Ok(Scan::Drawer(drawer));
            }

            if is_properties_start(trimmed) {
                return Ok(Scan::Properties);
            }
            if is_end(trimmed) {
                return Ok(Scan::Idle);
            }
            let kinds = planning_kinds(trimmed);
            if !kinds.is_empty() {
                for kind in kinds {
                    let schedule = Schedule::parse(kind, trimmed)?;
                    match kind {
                        PlanningKind::Scheduled => self.scheduled = Some(schedule),
                        PlanningKind::Deadline => self.deadline = Some(schedule),
                        PlanningKind::Closed => self.closed = Some(schedule),
                    }
                }
                return Ok(Scan::Idle);
            }
            if let Some(name) = drawer_name(trimmed) {
                return Ok(Scan::Drawer(Drawer::new(name)));
            }
            if let Scan::Properties = state {
                if let Some((key, value)) = property_line(trimmed) {
                    self.properties.insert(key.to_string(), value.to_string());
                }
            }
            Ok(state)
        }

        pub fn has_properties(&self) -> bool {
            !self.properties.is_empty()
        }

        pub fn property(&self, key: &str) -> Option<&str> {
            self.properties.get(key).map(String::as_str)
        }

        pub fn has_schedule(&self) -> bool {
            self.scheduled.is_some()
        }

        pub fn has_deadline(&self) -> bool {
            self.deadline.is_some()
        }

        pub fn drawer(&self, name: &str) -> Option<&Drawer> {
            self.drawers.iter().find(|d| d.name == name)
        }

        /// Scheduled, deadline and closed entries that are present, in that order.
        pub fn planning(&self) -> impl Iterator<Item = &Schedule> {
            [&self.scheduled, &self.deadline, &self.closed]
                .into_iter()
                .flatten()
        }
    }

}

pub mod tree {
    //! Outline tree assembled from lines.
    //!
    //! Nodes live in an arena owned by [`OrgTree`]; parent, child and index links
    //! are [`NodeId`]s. Index 0 is a synthetic root holding the text before the
    //! first heading.

    use crate::body::{BodyData, Schedule};
    use crate::error::{FieldError, OrgError};
    use crate::header::{Header, MARKER};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{collections::BTreeMap, fmt};
    use tracing::{debug, trace, warn};

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeId(usize);

    impl NodeId {
        pub const ROOT: NodeId = NodeId(0);

        pub fn index(self) -> usize {
            self.0
        }
    }

    /* ------------------------------ Options ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum DuplicateHashPolicy {
        /// The later heading takes over the hash.
        #[default]
        LastWins,
        /// A second heading with the same hash fails the build.
        Reject,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ParseOptions {
        #[serde(default)]
        pub duplicate_hashes: DuplicateHashPolicy,
    }

    /* ------------------------------- Nodes ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Node {
        header: Option<Header>,
        /// Lines after the heading, terminators included.
        #[serde(default)]
        body: String,
        /// Terminator of the heading line; empty when it ended the input.
        #[serde(default)]
        eol: String,
        parent: Option<NodeId>,
        #[serde(default)]
        children: Vec<NodeId>,
    }

    impl Node {
        fn root() -> Self {
            Self {
                header: None,
                body: String::new(),
                eol: String::new(),
                parent: None,
                children: Vec::new(),
            }
        }

        /// Heading level; 0 for the root.
        fn level(&self) -> usize {
            self.header.as_ref().map_or(0, Header::level)
        }
    }

    /* ------------------------------- Tree ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(try_from = "TreeSnapshot")]
    pub struct OrgTree {
        nodes: Vec<Node>,
        #[serde(skip)]
        hash_index: BTreeMap<String, NodeId>,
        #[serde(skip)]
        tag_index: IndexMap<String, Vec<NodeId>>,
    }

    impl Default for OrgTree {
        fn default() -> Self {
            Self::new()
        }
    }

    impl OrgTree {
        /// A tree holding only the empty root.
        pub fn new() -> Self {
            Self {
                nodes: vec![Node::root()],
                hash_index: BTreeMap::new(),
                tag_index: IndexMap::new(),
            }
        }

        /// Builds with default options from a whole document.
        pub fn parse_str(text: &str) -> Result<Self, OrgError> {
            TreeBuilder::default().build(text.split_inclusive('\n'))
        }

        pub fn root(&self) -> NodeRef<'_> {
            NodeRef {
                tree: self,
                id: NodeId::ROOT,
            }
        }

        pub fn get(&self, id: NodeId) -> Option<NodeRef<'_>> {
            (id.0 < self.nodes.len()).then_some(NodeRef { tree: self, id })
        }

        /// Number of headings, the root excluded.
        pub fn len(&self) -> usize {
            self.nodes.len() - 1
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        pub fn get_by_hash(&self, hash: &str) -> Option<NodeRef<'_>> {
            self.hash_index.get(hash).and_then(|id| self.get(*id))
        }

        /// Headings carrying `tag`, in document order.
        pub fn get_by_tag(&self, tag: &str) -> Vec<NodeRef<'_>> {
            self.tag_index
                .get(tag)
                .map(|ids| ids.iter().filter_map(|id| self.get(*id)).collect())
                .unwrap_or_default()
        }

        pub fn hashes(&self) -> impl Iterator<Item = &str> {
            self.hash_index.keys().map(String::as_str)
        }

        pub fn tags(&self) -> impl Iterator<Item = &str> {
            self.tag_index.keys().map(String::as_str)
        }

        pub fn children(&self, id: NodeId) -> &[NodeId] {
            self.nodes
                .get(id.0)
                .map(|n| n.children.as_slice())
                .unwrap_or_default()
        }

        pub fn parent(&self, id: NodeId) -> Option<NodeId> {
            self.nodes.get(id.0).and_then(|n| n.parent)
        }

        /// Whole tree in pre-order, root first.
        pub fn iter(&self) -> PreOrder<'_> {
            self.descendants(NodeId::ROOT)
        }

        /// `id` and everything below it in pre-order.
        pub fn descendants(&self, id: NodeId) -> PreOrder<'_> {
            let stack = if id.0 < self.nodes.len() {
                vec![id]
            } else {
                Vec::new()
            };
            PreOrder { tree: self, stack }
        }

        /// Runs `edit` on the heading of `id`. A level that no longer sits between
        /// the parent's and the children's is rolled back and reported; hash or tag
        /// changes are indexed before returning.
        pub fn edit_header<R>(
            &mut self,
            id: NodeId,
            edit: impl FnOnce(&mut Header) -> R,
        ) -> Result<R, FieldError> {
            let node = self.nodes.get(id.0).ok_or(FieldError::UnknownNode(id.0))?;
            let before = node.header.clone().ok_or(FieldError::UnknownNode(id.0))?;
            let parent_level = node.parent.map_or(0, |p| self.nodes[p.0].level());
            let child_level = node
                .children
                .iter()
                .map(|c| self.nodes[c.0].level())
                .min();

            let Some(header) = self.nodes[id.0].header.as_mut() else {
                return Err(FieldError::UnknownNode(id.0));
            };
            let out = edit(header);
            let level = header.level();
            let misplaced = if level <= parent_level {
                Some(FieldError::ChildLevel {
                    child: level,
                    parent: parent_level,
                })
            } else {
                child_level
                    .filter(|child| *child <= level)
                    .map(|child| FieldError::ChildLevel {
                        child,
                        parent: level,
                    })
            };
            if let Some(err) = misplaced {
                *header = before;
                return Err(err);
            }
            if header.hash() != before.hash() || header.tags() != before.tags() {
                self.reindex();
            }
            Ok(out)
        }

        pub fn body_mut(&mut self, id: NodeId) -> Option<&mut String> {
            self.nodes.get_mut(id.0).map(|n| &mut n.body)
        }

        /// Adds a heading as the last child of `parent` and refreshes the indices.
        pub fn append_child(
            &mut self,
            parent: NodeId,
            header: Header,
            body: impl Into<String>,
        ) -> Result<NodeId, FieldError> {
            let parent_level = self
                .nodes
                .get(parent.0)
                .map(Node::level)
                .ok_or(FieldError::UnknownNode(parent.0))?;
            if header.level() <= parent_level {
                return Err(FieldError::ChildLevel {
                    child: header.level(),
                    parent: parent_level,
                });
            }
            let id = self.push_node(parent, header, "\n".to_string());
            self.nodes[id.0].body = body.into();
            self.reindex();
            Ok(id)
        }

        /// Rebuilds both indices from the headers, last hash wins.
        pub fn reindex(&mut self) {
            self.hash_index.clear();
            self.tag_index.clear();
            let order: Vec<NodeId> = self.iter().map(|n| n.id).collect();
            for id in order {
                self.index_node_last_wins(id);
            }
        }

        fn push_node(&mut self, parent: NodeId, header: Header, eol: String) -> NodeId {
            let id = NodeId(self.nodes.len());
            self.nodes.push(Node {
                header: Some(header),
                body: String::new(),
                eol,
                parent: Some(parent),
                children: Vec::new(),
            });
            self.nodes[parent.0].children.push(id);
            id
        }

        fn index_node(&mut self, id: NodeId, policy: DuplicateHashPolicy) -> Result<(), OrgError> {
            if policy == DuplicateHashPolicy::Reject {
                let hash = self
                    .nodes
                    .get(id.0)
                    .and_then(|n| n.header.as_ref())
                    .and_then(Header::hash);
                if let Some(hash) = hash.filter(|h| self.hash_index.contains_key(*h)) {
                    return Err(OrgError::DuplicateHash(hash.to_string()));
                }
            }
            self.index_node_last_wins(id);
            Ok(())
        }

        fn index_node_last_wins(&mut self, id: NodeId) {
            let Some(header) = self.nodes.get(id.0).and_then(|n| n.header.as_ref()) else {
                return;
            };
            if let Some(hash) = header.hash() {
                if self.hash_index.insert(hash.to_string(), id).is_some() {
                    warn!(hash, "duplicate hash, later heading wins");
                }
            }
            let mut seen: Vec<&str> = Vec::new();
            for tag in header.tags() {
                if seen.contains(&tag.as_str()) {
                    continue;
                }
                seen.push(tag);
                self.tag_index.entry(tag.clone()).or_default().push(id);
            }
        }
    }

    /* ------------------------------ Builder ------------------------------ */

    /// `*` run followed by a space.
    pub fn is_heading_line(s: &str) -> bool {
        let stars = count_stars(s);
        stars >= 1 && s[stars..].starts_with(' ')
    }

    fn count_stars(s: &str) -> usize {
        s.chars().take_while(|c| *c == MARKER).count()
    }

    fn split_line_ending(line: &str) -> (&str, &str) {
        let content = line.trim_end_matches(['\n', '\r']);
        (content, &line[content.len()..])
    }

    #[derive(Debug, Clone, Default)]
    pub struct TreeBuilder {
        options: ParseOptions,
    }

    impl TreeBuilder {
        pub fn new(options: ParseOptions) -> Self {
            Self { options }
        }

        pub fn options(&self) -> &ParseOptions {
            &self.options
        }

        /// Assembles a tree from lines that keep their terminators.
        ///
        /// Open headings sit on a stack; a new heading closes every open one at
        /// its level or deeper and becomes a child of what remains on top.
        pub fn build<I, S>(&self, lines: I) -> Result<OrgTree, OrgError>
        where
            I: IntoIterator<Item = S>,
            S: AsRef<str>,
        {
            let mut tree = OrgTree::new();
            let mut open = vec![NodeId::ROOT];

            for (index, line) in lines.into_iter().enumerate() {
                let line = line.as_ref();
                if !is_heading_line(line) {
                    let current = open.last().copied().unwrap_or(NodeId::ROOT);
                    tree.nodes[current.0].body.push_str(line);
                    continue;
                }

                let (content, eol) = split_line_ending(line);
                let header =
                    Header::parse(content).map_err(|e| OrgError::at_line(index + 1, e))?;
                let level = header.level();
                while let Some(top) = open.last() {
                    if tree.nodes[top.0].level() < level {
                        break;
                    }
                    open.pop();
                }
                let parent = open.last().copied().unwrap_or(NodeId::ROOT);
                let id = tree.push_node(parent, header, eol.to_string());
                tree.index_node(id, self.options.duplicate_hashes)
                    .map_err(|e| OrgError::at_line(index + 1, e))?;
                trace!(line = index + 1, level, parent = parent.0, "heading");
                open.push(id);
            }

            debug!(
                headings = tree.len(),
                hashes = tree.hash_index.len(),
                tags = tree.tag_index.len(),
                "assembled tree"
            );
            Ok(tree)
        }
    }

    /* ----------------------------- Navigation ----------------------------- */

    /// Borrowed handle to one node of a tree.
    #[derive(Clone, Copy)]
    pub struct NodeRef<'a> {
        tree: &'a OrgTree,
        id: NodeId,
    }

    impl<'a> NodeRef<'a> {
        fn node(self) -> &'a Node {
            &self.tree.nodes[self.id.0]
        }

        pub fn id(self) -> NodeId {
            self.id
        }

        pub fn level(self) -> usize {
            self.node().level()
        }

        pub fn is_root(self) -> bool {
            self.id == NodeId::ROOT
        }

        pub fn header(self) -> Option<&'a Header> {
            self.node().header.as_ref()
        }

        pub fn title(self) -> Option<&'a str> {
            self.header().map(Header::title)
        }

        pub fn hash(self) -> Option<&'a str> {
            self.header().and_then(Header::hash)
        }

        pub fn body(self) -> &'a str {
            &self.node().body
        }

        /// Terminator read after this node's heading line.
        pub fn line_ending(self) -> &'a str {
            &self.node().eol
        }

        pub fn body_data(self) -> Result<BodyData, OrgError> {
            BodyData::parse(self.body())
        }

        pub fn properties(self) -> Result<IndexMap<String, String>, OrgError> {
            Ok(self.body_data()?.properties)
        }

        pub fn schedule(self) -> Result<Option<Schedule>, OrgError> {
            Ok(self.body_data()?.scheduled)
        }

        pub fn deadline(self) -> Result<Option<Schedule>, OrgError> {
            Ok(self.body_data()?.deadline)
        }

        pub fn parent(self) -> Option<NodeRef<'a>> {
            let tree = self.tree;
            self.node().parent.map(|id| NodeRef { tree, id })
        }

        /// Parent, grandparent, ... up to and including the root.
        pub fn ancestors(self) -> impl Iterator<Item = NodeRef<'a>> {
            std::iter::successors(self.parent(), |n| n.parent())
        }

        pub fn children(self) -> impl Iterator<Item = NodeRef<'a>> {
            let tree = self.tree;
            self.node()
                .children
                .iter()
                .map(move |id| NodeRef { tree, id: *id })
        }

        pub fn has_children(self) -> bool {
            !self.node().children.is_empty()
        }

        /// This node, then its descendants in pre-order.
        pub fn iter(self) -> PreOrder<'a> {
            self.tree.descendants(self.id)
        }
    }

    impl PartialEq for NodeRef<'_> {
        fn eq(&self, other: &Self) -> bool {
            std::ptr::eq(self.tree, other.tree) && self.id == other.id
        }
    }

    impl fmt::Debug for NodeRef<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("NodeRef")
                .field("id", &self.id.0)
                .field("level", &self.level())
                .field("title", &self.title())
                .finish()
        }
    }

    /// Explicit-stack pre-order walk.
    pub struct PreOrder<'a> {
        tree: &'a OrgTree,
        stack: Vec<NodeId>,
    }

    impl<'a> Iterator for PreOrder<'a> {
        type Item = NodeRef<'a>;

        fn next(&mut self) -> Option<Self::Item> {
            let id = self.stack.pop()?;
            let node = &self.tree.nodes[id.0];
            self.stack.extend(node.children.iter().rev().copied());
            Some(NodeRef {
                tree: self.tree,
                id,
            })
        }
    }

    /* ------------------------------ Snapshot ------------------------------ */

    /// Serialized shape of [`OrgTree`]; checked before it becomes a tree.
    #[derive(Deserialize)]
    struct TreeSnapshot {
        nodes: Vec<Node>,
    }

    impl TryFrom<TreeSnapshot> for OrgTree {
        type Error = OrgError;

        fn try_from(snapshot: TreeSnapshot) -> Result<Self, Self::Error> {
            let nodes = snapshot.nodes;
            let corrupt = |msg: String| Err(OrgError::CorruptSnapshot(msg));
            match nodes.first() {
                Some(root) if root.header.is_none() && root.parent.is_none() => {}
                _ => return corrupt("node 0 must be a bare root".to_string()),
            }
            for (index, node) in nodes.iter().enumerate().skip(1) {
                if node.header.is_none() {
                    return corrupt(format!("node {index} has no header"));
                }
                let Some(parent) = node.parent.and_then(|p| nodes.get(p.0)) else {
                    return corrupt(format!("node {index} has no parent"));
                };
                if parent.level() >= node.level() {
                    return corrupt(format!("node {index} is not deeper than its parent"));
                }
            }
            // every non-root node listed exactly once, by its own parent
            let mut listed = vec![false; nodes.len()];
            for (index, node) in nodes.iter().enumerate() {
                for child in &node.children {
                    match nodes.get(child.0) {
                        Some(c) if c.parent == Some(NodeId(index)) => {}
                        _ => return corrupt(format!("node {index} lists a foreign child")),
                    }
                    if std::mem::replace(&mut listed[child.0], true) {
                        return corrupt(format!("node {} is listed twice", child.0));
                    }
                }
            }
            if let Some(orphan) = listed.iter().skip(1).position(|seen| !seen) {
                return corrupt(format!("node {} is not attached to its parent", orphan + 1));
            }

            let mut tree = OrgTree {
                nodes,
                hash_index: BTreeMap::new(),
                tag_index: IndexMap::new(),
            };
            tree.reindex();
            Ok(tree)
        }
    }

}

pub mod format {
    use crate::tree::{NodeId, NodeRef, OrgTree};
    use serde::{Deserialize, Serialize};
    use std::io;

    /// Terminator written after heading lines. Body text is always copied as is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum LineEnding {
        /// Whatever the heading line ended with when it was read; `\n` for new nodes.
        #[default]
        Preserve,
        Lf,
        CrLf,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct WriteOptions {
        #[serde(default)]
        pub line_ending: LineEnding,
    }

    /// Root body, then every heading in pre-order.
    pub fn write_tree(tree: &OrgTree, options: &WriteOptions) -> String {
        write_subtree(tree, NodeId::ROOT, options)
    }

    /// `id`'s heading line and body followed by all of its descendants.
    pub fn write_subtree(tree: &OrgTree, id: NodeId, options: &WriteOptions) -> String {
        let mut out = String::new();
        let mut nodes = tree.descendants(id).peekable();
        while let Some(node) = nodes.next() {
            let is_last = nodes.peek().is_none();
            append_node(&mut out, node, options, is_last);
        }
        out
    }

    pub fn write_to<W: io::Write>(
        tree: &OrgTree,
        mut writer: W,
        options: &WriteOptions,
    ) -> io::Result<()> {
        writer.write_all(write_tree(tree, options).as_bytes())?;
        writer.flush()
    }

    fn append_node(out: &mut String, node: NodeRef<'_>, options: &WriteOptions, is_last: bool) {
        if let Some(header) = node.header() {
            out.push_str(&header.format());
            out.push_str(terminator(node, options, is_last));
        }
        let body = node.body();
        out.push_str(body);
        // the next heading has to start on a line of its own
        if !is_last && !body.is_empty() && !body.ends_with('\n') {
            out.push_str(match options.line_ending {
                LineEnding::CrLf => "\r\n",
                LineEnding::Lf | LineEnding::Preserve => "\n",
            });
        }
    }

    fn terminator<'a>(node: NodeRef<'a>, options: &WriteOptions, is_last: bool) -> &'a str {
        match options.line_ending {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
            LineEnding::Preserve => {
                let eol = node.line_ending();
                // a heading that ended the input gained followers
                if eol.is_empty() && (!is_last || !node.body().is_empty()) {
                    "\n"
                } else {
                    eol
                }
            }
        }
    }

}

pub mod storage {
    //! Persistence seams. Snapshots are the serde_json form of the node arena;
    //! indices are rebuilt on load.

    use crate::tree::{OrgTree, TreeBuilder};
    use anyhow::{Context, Result};
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    /// Parser seam, so callers can swap in other sources of trees.
    pub trait OrgParser {
        fn parse_file(&self, abs_path: &Path) -> Result<OrgTree>;
    }

    impl OrgParser for TreeBuilder {
        fn parse_file(&self, abs_path: &Path) -> Result<OrgTree> {
            let text =
                fs::read_to_string(abs_path).with_context(|| format!("reading {:?}", abs_path))?;
            self.build(text.split_inclusive('\n'))
                .with_context(|| format!("parsing {:?}", abs_path))
        }
    }

    pub trait TreeStore {
        fn save(&self, tree: &OrgTree) -> Result<()>;
        fn load(&self) -> Result<OrgTree>;

        /// Replaces `tree` only once a complete snapshot has been decoded.
        fn load_into(&self, tree: &mut OrgTree) -> Result<()> {
            let loaded = self.load()?;
            *tree = loaded;
            Ok(())
        }
    }

    /// Snapshot kept in a single JSON file.
    #[derive(Debug, Clone)]
    pub struct JsonTreeStore {
        path: PathBuf,
    }

    impl JsonTreeStore {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl TreeStore for JsonTreeStore {
        fn save(&self, tree: &OrgTree) -> Result<()> {
            let bytes = to_bytes(tree)?;
            fs::write(&self.path, bytes).with_context(|| format!("writing {:?}", self.path))?;
            debug!(path = ?self.path, headings = tree.len(), "saved snapshot");
            Ok(())
        }

        fn load(&self) -> Result<OrgTree> {
            let bytes = fs::read(&self.path).with_context(|| format!("reading {:?}", self.path))?;
            let tree = from_bytes(&bytes).with_context(|| format!("loading {:?}", self.path))?;
            debug!(path = ?self.path, headings = tree.len(), "loaded snapshot");
            Ok(tree)
        }
    }

    pub fn to_bytes(tree: &OrgTree) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(tree).context("encoding tree snapshot")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<OrgTree> {
        serde_json::from_slice(bytes).context("decoding tree snapshot")
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::format::{WriteOptions, write_tree};
        use tempfile::tempdir;

        const TEXT: &str = "pre\n* TODO 12345: a :x:\nSCHEDULED: <2013-09-20 Fri +1w>\n** 23456: b :x:y:\n";

        #[test]
        fn bytes_round_trip_with_indices() {
            let tree = OrgTree::parse_str(TEXT).expect("parse");
            let restored = from_bytes(&to_bytes(&tree).expect("encode")).expect("decode");
            assert_eq!(restored, tree);
            assert_eq!(
                restored.get_by_hash("23456").and_then(|n| n.parent()).and_then(|p| p.hash()),
                Some("12345")
            );
            assert_eq!(restored.get_by_tag("x").len(), 2);
            assert_eq!(write_tree(&restored, &WriteOptions::default()), TEXT);
        }

        #[test]
        fn json_store_save_and_load() {
            let dir = tempdir().expect("tempdir");
            let store = JsonTreeStore::new(dir.path().join("tree.json"));
            let tree = OrgTree::parse_str(TEXT).expect("parse");
            store.save(&tree).expect("save");
            assert_eq!(store.load().expect("load"), tree);
        }

        #[test]
        fn failed_load_leaves_target_alone() {
            let dir = tempdir().expect("tempdir");
            let path = dir.path().join("broken.json");
            fs::write(&path, b"{\"nodes\": [").expect("write");
            let store = JsonTreeStore::new(&path);
            let mut tree = OrgTree::parse_str(TEXT).expect("parse");
            let before = tree.clone();
            assert!(store.load_into(&mut tree).is_err());
            assert_eq!(tree, before);

            let missing = JsonTreeStore::new(dir.path().join("missing.json"));
            assert!(missing.load_into(&mut tree).is_err());
            assert_eq!(tree, before);
        }

        #[test]
        fn inconsistent_snapshot_is_rejected() {
            let json = br#"{"nodes":[{"header":null,"body":"","eol":"","parent":null,"children":[4]}]}"#;
            assert!(from_bytes(json).is_err());
            let headless = br#"{"nodes":[
                {"header":null,"body":"","eol":"","parent":null,"children":[1]},
                {"header":null,"body":"","eol":"\n","parent":0,"children":[]}
            ]}"#;
            assert!(from_bytes(headless).is_err());

            let tree = OrgTree::parse_str("* a\n").expect("parse");
            let mut value = serde_json::to_value(&tree).expect("encode");
            value["nodes"][0]["children"] = serde_json::json!([1, 1]);
            let err = from_bytes(&serde_json::to_vec(&value).expect("bytes")).expect_err("twice");
            assert!(format!("{err:#}").contains("listed twice"));

            value["nodes"][0]["children"] = serde_json::json!([]);
            let err = from_bytes(&serde_json::to_vec(&value).expect("bytes")).expect_err("orphan");
            assert!(format!("{err:#}").contains("not attached"));
        }

        #[test]
        fn level_edit_survives_snapshot() {
            let mut tree = OrgTree::parse_str("* a\n** 12345: b\n").expect("parse");
            let id = tree.get_by_hash("12345").expect("12345").id();
            tree.edit_header(id, |h| h.set_level(3))
                .expect("in place")
                .expect("level");
            let restored = from_bytes(&to_bytes(&tree).expect("encode")).expect("decode");
            assert_eq!(restored, tree);
            assert_eq!(restored.get_by_hash("12345").map(|n| n.level()), Some(3));
            assert_eq!(
                write_tree(&restored, &WriteOptions::default()),
                "* a\n*** 12345: b\n"
            );
        }

        #[test]
        fn parser_seam_reads_files() {
            let dir = tempdir().expect("tempdir");
            let path = dir.path().join("notes.org");
            fs::write(&path, TEXT).expect("write");
            let tree = TreeBuilder::default().parse_file(&path).expect("parse");
            assert_eq!(tree.len(), 2);
            let err = TreeBuilder::default()
                .parse_file(&dir.path().join("nope.org"))
                .expect_err("missing");
            assert!(format!("{err:#}").contains("reading"));
        }
    }
}

pub use body::{BodyData, Drawer, PlanningKind, Schedule};
pub use error::{FieldError, OrgError};
pub use format::{LineEnding, WriteOptions, write_subtree, write_to, write_tree};
pub use header::{FieldOrder, Header};
pub use storage::{JsonTreeStore, OrgParser, TreeStore};
pub use timestamp::{
    Delay, DelayKind, Repeater, RepeaterKind, TimeUnit, Timestamp, TimestampKind, TimestampRange,
};
pub use tree::{DuplicateHashPolicy, NodeId, NodeRef, OrgTree, ParseOptions, TreeBuilder};
