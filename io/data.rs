//! Raw longitudinal observations, grouped by subject.
//!
//! This is the minimal container the pipeline consumes: an ordered list of
//! subjects, each with strictly increasing visit ages and one observation row
//! per visit. Missing observations are stored as `NaN` and become masked
//! entries once the data is padded into a [`Dataset`](super::dataset::Dataset).

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct IndividualData {
    pub id: String,
    /// Strictly increasing ages of the visits.
    pub timepoints: Vec<f64>,
    /// One row per visit, one entry per feature; `NaN` means not observed.
    pub observations: Vec<Vec<f64>>,
}

impl IndividualData {
    pub fn n_visits(&self) -> usize {
        self.timepoints.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Data {
    headers: Vec<String>,
    individuals: Vec<IndividualData>,
    positions: HashMap<String, usize>,
}

impl Data {
    pub fn new(headers: Vec<String>) -> Result<Self> {
        if headers.is_empty() {
            return Err(Error::Input("data must have at least one feature".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = headers.iter().find(|h| !seen.insert(h.as_str())) {
            return Err(Error::Input(format!("feature '{dup}' appears twice in the headers")));
        }
        Ok(Self {
            headers,
            individuals: Vec::new(),
            positions: HashMap::new(),
        })
    }

    /// Appends a subject. Visits may be given in any order; they are sorted by age.
    pub fn add_individual(&mut self, id: &str, mut visits: Vec<(f64, Vec<f64>)>) -> Result<()> {
        if self.positions.contains_key(id) {
            return Err(Error::Input(format!("subject '{id}' is already present in the data")));
        }
        if visits.is_empty() {
            return Err(Error::Input(format!("subject '{id}' has no visits")));
        }
        for (age, row) in &visits {
            if !age.is_finite() {
                return Err(Error::Input(format!(
                    "subject '{id}' has a non-finite visit age ({age})"
                )));
            }
            if row.len() != self.headers.len() {
                return Err(Error::Input(format!(
                    "subject '{id}' has a visit with {} values, expected {}",
                    row.len(),
                    self.headers.len()
                )));
            }
        }
        visits.sort_by(|a, b| a.0.total_cmp(&b.0));
        if visits.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(Error::Input(format!(
                "subject '{id}' has two visits at the same age"
            )));
        }

        let (timepoints, observations) = visits.into_iter().unzip();
        self.positions.insert(id.to_string(), self.individuals.len());
        self.individuals.push(IndividualData {
            id: id.to_string(),
            timepoints,
            observations,
        });
        Ok(())
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn dimension(&self) -> usize {
        self.headers.len()
    }

    pub fn n_individuals(&self) -> usize {
        self.individuals.len()
    }

    pub fn n_visits(&self) -> usize {
        self.individuals.iter().map(IndividualData::n_visits).sum()
    }

    pub fn individuals(&self) -> &[IndividualData] {
        &self.individuals
    }

    pub fn get(&self, id: &str) -> Option<&IndividualData> {
        self.positions.get(id).map(|&pos| &self.individuals[pos])
    }

    /// Reads a long-format CSV with columns `ID,TIME,<feature>...`.
    ///
    /// Rows of one subject need not be contiguous. Empty cells and `nan` are
    /// missing observations.
    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let header_row = reader.headers()?.clone();
        if header_row.len() < 3 || &header_row[0] != "ID" || &header_row[1] != "TIME" {
            return Err(Error::Input(
                "CSV data must start with columns 'ID' and 'TIME' followed by at least one feature"
                    .to_string(),
            ));
        }
        let headers: Vec<String> = header_row.iter().skip(2).map(str::to_string).collect();

        let mut order: Vec<String> = Vec::new();
        let mut visits: HashMap<String, Vec<(f64, Vec<f64>)>> = HashMap::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let id = record[0].to_string();
            let age = parse_cell(&record[1]).ok_or_else(|| {
                Error::Input(format!("row {}: TIME '{}' is not a number", line + 1, &record[1]))
            })?;
            let mut row = Vec::with_capacity(headers.len());
            for (column, cell) in headers.iter().zip(record.iter().skip(2)) {
                let value = if cell.trim().is_empty() {
                    f64::NAN
                } else {
                    parse_cell(cell).ok_or_else(|| {
                        Error::Input(format!(
                            "row {}: value '{cell}' of feature '{column}' is not a number",
                            line + 1
                        ))
                    })?
                };
                row.push(value);
            }
            if !visits.contains_key(&id) {
                order.push(id.clone());
            }
            visits.entry(id).or_default().push((age, row));
        }

        let mut data = Data::new(headers)?;
        for id in order {
            let subject_visits = visits.remove(&id).unwrap_or_default();
            data.add_individual(&id, subject_visits)?;
        }
        log::info!(
            "Loaded {} visits from {} subjects with features {:?}",
            data.n_visits(),
            data.n_individuals(),
            data.headers()
        );
        Ok(data)
    }

    /// Writes the long format read by [`Data::from_csv_path`]; missing values are empty cells.
    pub fn to_csv_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["ID".to_string(), "TIME".to_string()];
        header.extend(self.headers.iter().cloned());
        writer.write_record(&header)?;
        for individual in &self.individuals {
            for (age, row) in individual.timepoints.iter().zip(&individual.observations) {
                let mut record = vec![individual.id.clone(), age.to_string()];
                record.extend(row.iter().map(|v| {
                    if v.is_nan() { String::new() } else { v.to_string() }
                }));
                writer.write_record(&record)?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

fn parse_cell(cell: &str) -> Option<f64> {
    let trimmed = cell.trim();
    if trimmed.eq_ignore_ascii_case("nan") {
        return Some(f64::NAN);
    }
    trimmed.parse::<f64>().ok()
}
