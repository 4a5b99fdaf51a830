//! Loading and cleaning the NAFLD cohort.
//!
//! The input table has a fixed schema (`id, status, futime, age, male,
//! weight, height, bmi`). A missing header is fatal. Rows with any missing or
//! unparseable field are dropped and counted; nothing is imputed. A short
//! row counts as missing its trailing fields, an overlong one as malformed.
//! After
//! cleaning the cohort is annotated with age and BMI classes and never
//! changes again.

use std::fmt;
use std::path::Path;

use csv::{ReaderBuilder, Trim};
use log::{debug, info, warn};
use ndarray::Array2;
use serde::Deserialize;

use crate::binning::{AgeClass, BmiClass};
use crate::data::SurvivalData;
use crate::error::{Result, SurvivalError};

/// columns every input file must carry
pub const REQUIRED_COLUMNS: [&str; 8] =
    ["id", "status", "futime", "age", "male", "weight", "height", "bmi"];

/// one patient
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: u64,
    pub status: u8,  // 1 = event observed, 0 = censored
    pub futime: f64, // days
    pub age: f64,
    pub male: u8,
    pub weight: f64,
    pub height: f64,
    pub bmi: f64,
}

impl Subject {
    pub fn is_event(&self) -> bool {
        self.status == 1
    }

    pub fn value(&self, covariate: Covariate) -> f64 {
        match covariate {
            Covariate::Age => self.age,
            Covariate::Male => self.male as f64,
            Covariate::Bmi => self.bmi,
            Covariate::Weight => self.weight,
            Covariate::Height => self.height,
        }
    }
}

/// explicit column reference for model covariates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Covariate {
    Age,
    Male,
    Bmi,
    Weight,
    Height,
}

impl Covariate {
    pub fn name(&self) -> &'static str {
        match self {
            Covariate::Age => "age",
            Covariate::Male => "male",
            Covariate::Bmi => "bmi",
            Covariate::Weight => "weight",
            Covariate::Height => "height",
        }
    }

    /// binary covariates always enter models linearly
    pub fn is_binary(&self) -> bool {
        matches!(self, Covariate::Male)
    }
}

impl fmt::Display for Covariate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// a row as read, before any parsing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRecord {
    pub id: Option<String>,
    pub status: Option<String>,
    pub futime: Option<String>,
    pub age: Option<String>,
    pub male: Option<String>,
    pub weight: Option<String>,
    pub height: Option<String>,
    pub bmi: Option<String>,
}

/// why a row was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowDefect {
    Missing,
    Malformed,
}

fn is_missing(field: &Option<String>) -> bool {
    match field {
        None => true,
        Some(s) => {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case("na") || s.eq_ignore_ascii_case("nan") || s == "."
        }
    }
}

fn parse_number(field: &Option<String>) -> std::result::Result<f64, RowDefect> {
    if is_missing(field) {
        return Err(RowDefect::Missing);
    }
    let text = field.as_deref().unwrap_or_default().trim();
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(RowDefect::Malformed),
    }
}

fn parse_flag(field: &Option<String>) -> std::result::Result<u8, RowDefect> {
    let v = parse_number(field)?;
    if v == 0.0 {
        Ok(0)
    } else if v == 1.0 {
        Ok(1)
    } else {
        Err(RowDefect::Malformed)
    }
}

impl RawRecord {
    fn parse(&self) -> std::result::Result<Subject, RowDefect> {
        let fields = [
            &self.id, &self.status, &self.futime, &self.age,
            &self.male, &self.weight, &self.height, &self.bmi,
        ];
        // missing wins over malformed so the counts line up with na.omit
        if fields.iter().any(|f| is_missing(f)) {
            return Err(RowDefect::Missing);
        }

        let id = parse_number(&self.id)?;
        if id < 0.0 || id.fract() != 0.0 {
            return Err(RowDefect::Malformed);
        }
        let futime = parse_number(&self.futime)?;
        if futime < 0.0 {
            return Err(RowDefect::Malformed);
        }

        Ok(Subject {
            id: id as u64,
            status: parse_flag(&self.status)?,
            futime,
            age: parse_number(&self.age)?,
            male: parse_flag(&self.male)?,
            weight: parse_number(&self.weight)?,
            height: parse_number(&self.height)?,
            bmi: parse_number(&self.bmi)?,
        })
    }
}

/// how many rows survived cleaning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleaningReport {
    pub rows_read: usize,
    pub rows_kept: usize,
    pub rows_missing: usize,   // at least one missing field
    pub rows_malformed: usize, // unparseable or out-of-range field
}

impl CleaningReport {
    pub fn rows_removed(&self) -> usize {
        self.rows_missing + self.rows_malformed
    }
}

/// file-reading knobs
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub delimiter: u8,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl LoadOptions {
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

/// the cleaned, annotated cohort
#[derive(Debug, Clone)]
pub struct Cohort {
    subjects: Vec<Subject>,
    age_classes: Vec<Option<AgeClass>>,
    bmi_classes: Vec<Option<BmiClass>>,
}

impl Cohort {
    /// clean raw rows: drop anything incomplete or malformed, then annotate
    pub fn from_rows(rows: Vec<RawRecord>) -> (Self, CleaningReport) {
        Self::clean(rows, 0)
    }

    // `undecodable` rows never made it into a RawRecord; they count as malformed
    fn clean(rows: Vec<RawRecord>, undecodable: usize) -> (Self, CleaningReport) {
        let mut report = CleaningReport {
            rows_read: rows.len() + undecodable,
            rows_malformed: undecodable,
            ..Default::default()
        };
        let mut subjects = Vec::with_capacity(rows.len());

        for (line, row) in rows.iter().enumerate() {
            match row.parse() {
                Ok(subject) => subjects.push(subject),
                Err(RowDefect::Missing) => report.rows_missing += 1,
                Err(RowDefect::Malformed) => {
                    debug!("row {} has a malformed field, dropping it", line + 1);
                    report.rows_malformed += 1;
                }
            }
        }
        report.rows_kept = subjects.len();

        info!(
            "cleaning: {} rows read, {} kept, {} with missing fields, {} malformed",
            report.rows_read, report.rows_kept, report.rows_missing, report.rows_malformed
        );
        if report.rows_malformed > 0 {
            warn!("{} rows dropped as malformed", report.rows_malformed);
        }

        (Self::annotate(subjects), report)
    }

    /// wrap already-clean subjects
    pub fn from_subjects(subjects: Vec<Subject>) -> Result<Self> {
        if let Some(s) = subjects.iter().find(|s| s.futime < 0.0 || !s.futime.is_finite()) {
            return Err(SurvivalError::invalid_survival_data(format!(
                "subject {} has futime {}",
                s.id, s.futime
            )));
        }
        if let Some(s) = subjects.iter().find(|s| s.status > 1 || s.male > 1) {
            return Err(SurvivalError::invalid_survival_data(format!(
                "subject {} has a non-binary status/male flag",
                s.id
            )));
        }
        Ok(Self::annotate(subjects))
    }

    fn annotate(subjects: Vec<Subject>) -> Self {
        let age_classes = subjects.iter().map(|s| AgeClass::from_value(s.age)).collect();
        let bmi_classes = subjects.iter().map(|s| BmiClass::from_value(s.bmi)).collect();
        Self { subjects, age_classes, bmi_classes }
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn times(&self) -> Vec<f64> {
        self.subjects.iter().map(|s| s.futime).collect()
    }

    pub fn events(&self) -> Vec<bool> {
        self.subjects.iter().map(Subject::is_event).collect()
    }

    pub fn column(&self, covariate: Covariate) -> Vec<f64> {
        self.subjects.iter().map(|s| s.value(covariate)).collect()
    }

    pub fn age_classes(&self) -> &[Option<AgeClass>] {
        &self.age_classes
    }

    pub fn bmi_classes(&self) -> &[Option<BmiClass>] {
        &self.bmi_classes
    }

    /// every column coerced to numbers, in schema order
    pub fn numeric_columns(&self) -> Vec<(&'static str, Vec<f64>)> {
        let s = &self.subjects;
        vec![
            ("id", s.iter().map(|r| r.id as f64).collect()),
            ("status", s.iter().map(|r| r.status as f64).collect()),
            ("futime", s.iter().map(|r| r.futime).collect()),
            ("age", s.iter().map(|r| r.age).collect()),
            ("male", s.iter().map(|r| r.male as f64).collect()),
            ("weight", s.iter().map(|r| r.weight).collect()),
            ("height", s.iter().map(|r| r.height).collect()),
            ("bmi", s.iter().map(|r| r.bmi).collect()),
        ]
    }

    /// design for a model on an explicit covariate list
    pub fn survival_data(&self, covariates: &[Covariate]) -> Result<SurvivalData> {
        let n = self.len();
        let p = covariates.len();
        let matrix = Array2::from_shape_fn((n, p), |(i, j)| self.subjects[i].value(covariates[j]));
        let names = covariates.iter().map(|c| c.name().to_string()).collect();
        SurvivalData::new(self.times(), self.events(), matrix)?.with_names(names)
    }
}

/// read and clean a delimited file with the fixed schema
pub fn load_cohort<P: AsRef<Path>>(path: P, options: &LoadOptions) -> Result<(Cohort, CleaningReport)> {
    let path = path.as_ref();
    // ragged rows are a cleaning matter, not a read error
    let mut rdr = ReaderBuilder::new()
        .delimiter(options.delimiter)
        .trim(Trim::All)
        .flexible(true)
        .from_path(path)?;

    let headers = rdr.headers()?.clone();
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|col| !headers.iter().any(|h| h == *col))
        .collect();
    if !missing.is_empty() {
        return Err(SurvivalError::schema(format!(
            "{} is missing column(s): {}",
            path.display(),
            missing.join(", ")
        )));
    }

    let mut rows = Vec::new();
    let mut undecodable = 0;
    for record in rdr.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                debug!("unreadable row: {}", e);
                undecodable += 1;
                continue;
            }
        };
        // short rows come through with the trailing fields missing
        if record.len() > headers.len() {
            debug!("row with {} fields under {} headers", record.len(), headers.len());
            undecodable += 1;
            continue;
        }
        match record.deserialize::<RawRecord>(Some(&headers)) {
            Ok(row) => rows.push(row),
            Err(e) => {
                debug!("undecodable row: {}", e);
                undecodable += 1;
            }
        }
    }
    info!("read {} rows from {}", rows.len() + undecodable, path.display());

    Ok(Cohort::clean(rows, undecodable))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(fields: [&str; 8]) -> RawRecord {
        let f = |s: &str| if s.is_empty() { None } else { Some(s.to_string()) };
        RawRecord {
            id: f(fields[0]),
            status: f(fields[1]),
            futime: f(fields[2]),
            age: f(fields[3]),
            male: f(fields[4]),
            weight: f(fields[5]),
            height: f(fields[6]),
            bmi: f(fields[7]),
        }
    }

    #[test]
    fn test_incomplete_rows_are_dropped_and_counted() {
        let rows = vec![
            raw(["1", "0", "100", "50", "1", "80", "175", "26.1"]),
            raw(["2", "1", "200", "", "0", "70", "160", "27.3"]),
            raw(["3", "1", "300", "60", "0", "NA", "165", "29.0"]),
            raw(["4", "2", "300", "60", "0", "72", "165", "29.0"]),
            raw(["5", "0", "abc", "61", "1", "90", "180", "27.8"]),
        ];
        let (cohort, report) = Cohort::from_rows(rows);

        assert_eq!(cohort.len(), 1);
        assert_eq!(report.rows_read, 5);
        assert_eq!(report.rows_kept, 1);
        assert_eq!(report.rows_missing, 2);
        assert_eq!(report.rows_malformed, 2);
        assert_eq!(report.rows_removed(), 4);
    }

    #[test]
    fn test_annotation_follows_values() {
        let rows = vec![
            raw(["1", "0", "10", "45", "1", "80", "175", "40"]),
            raw(["2", "1", "20", "29.5", "0", "50", "170", "17.3"]),
        ];
        let (cohort, _) = Cohort::from_rows(rows);
        assert_eq!(cohort.age_classes(), &[Some(AgeClass::From45To60), Some(AgeClass::Under30)]);
        assert_eq!(cohort.bmi_classes(), &[Some(BmiClass::Class3), Some(BmiClass::Underweight)]);
    }

    #[test]
    fn test_survival_data_uses_named_covariates() {
        let rows = vec![
            raw(["1", "0", "10", "45", "1", "80", "175", "26"]),
            raw(["2", "1", "20", "50", "0", "50", "170", "17"]),
        ];
        let (cohort, _) = Cohort::from_rows(rows);
        let data = cohort.survival_data(&[Covariate::Male, Covariate::Bmi]).unwrap();
        assert_eq!(data.n_features(), 2);
        assert_eq!(data.names(), &["male".to_string(), "bmi".to_string()]);
        assert_eq!(data.covariates()[[1, 1]], 17.0);
    }

    #[test]
    fn test_from_subjects_rejects_negative_time() {
        let subject = Subject {
            id: 1, status: 1, futime: -3.0, age: 40.0,
            male: 0, weight: 60.0, height: 160.0, bmi: 23.4,
        };
        assert!(Cohort::from_subjects(vec![subject]).is_err());
    }
}
