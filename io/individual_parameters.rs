//! Per-subject latent parameters produced by personalization.

use crate::error::{Error, Result};
use ndarray::{Array1, ArrayView1};
use std::collections::HashMap;
use std::path::Path;

/// Ordered mapping from subject identifier to its latent-parameter vector.
///
/// All subjects share the same ordered parameter names. A subject's entry is
/// written once and never replaced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndividualParameters {
    names: Vec<String>,
    indices: Vec<String>,
    values: HashMap<String, Array1<f64>>,
}

/// Read-only view on the parameters of one subject.
#[derive(Debug, Clone, Copy)]
pub struct SubjectParameters<'a> {
    names: &'a [String],
    values: ArrayView1<'a, f64>,
}

impl<'a> SubjectParameters<'a> {
    pub fn new(names: &'a [String], values: ArrayView1<'a, f64>) -> Self {
        Self { names, values }
    }

    pub fn names(&self) -> &'a [String] {
        self.names
    }

    pub fn values(&self) -> ArrayView1<'a, f64> {
        self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|pos| self.values[pos])
    }

    pub fn require(&self, name: &str) -> Result<f64> {
        self.get(name).ok_or_else(|| {
            Error::Input(format!(
                "individual parameter '{name}' is missing, available: {:?}",
                self.names
            ))
        })
    }
}

impl IndividualParameters {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            indices: Vec::new(),
            values: HashMap::new(),
        }
    }

    pub fn add_individual(&mut self, id: &str, values: Array1<f64>) -> Result<()> {
        if self.values.contains_key(id) {
            return Err(Error::Input(format!(
                "individual parameters of subject '{id}' are already set"
            )));
        }
        if values.len() != self.names.len() {
            return Err(Error::Input(format!(
                "subject '{id}' has {} parameters, expected {} ({:?})",
                values.len(),
                self.names.len(),
                self.names
            )));
        }
        self.indices.push(id.to_string());
        self.values.insert(id.to_string(), values);
        Ok(())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Subject identifiers in insertion order.
    pub fn indices(&self) -> &[String] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn subject(&self, id: &str) -> Result<SubjectParameters<'_>> {
        self.values
            .get(id)
            .map(|values| SubjectParameters::new(&self.names, values.view()))
            .ok_or_else(|| Error::Input(format!("no individual parameters for subject '{id}'")))
    }

    /// Writes `ID,<name>...` rows in insertion order.
    pub fn save_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["ID".to_string()];
        header.extend(self.names.iter().cloned());
        writer.write_record(&header)?;
        for id in &self.indices {
            let mut record = vec![id.clone()];
            record.extend(self.values[id].iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let header = reader.headers()?.clone();
        if header.is_empty() || &header[0] != "ID" {
            return Err(Error::Input(
                "individual parameters CSV must start with an 'ID' column".to_string(),
            ));
        }
        let names = header.iter().skip(1).map(str::to_string).collect();
        let mut ips = IndividualParameters::new(names);
        for record in reader.records() {
            let record = record?;
            let values = record
                .iter()
                .skip(1)
                .map(|cell| {
                    cell.trim().parse::<f64>().map_err(|_| {
                        Error::Input(format!(
                            "subject '{}': '{cell}' is not a number",
                            &record[0]
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            ips.add_individual(&record[0], Array1::from_vec(values))?;
        }
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn entries_are_written_once() {
        let mut ips = IndividualParameters::new(vec!["tau".into(), "xi".into()]);
        ips.add_individual("a", array![70.0, -0.1]).unwrap();
        let err = ips.add_individual("a", array![71.0, 0.0]).unwrap_err();
        assert!(err.is_input_error());
        assert!(ips.add_individual("b", array![1.0]).is_err());

        let a = ips.subject("a").unwrap();
        assert_eq!(a.get("tau"), Some(70.0));
        assert_eq!(a.require("xi").unwrap(), -0.1);
        assert!(a.require("sources").unwrap_err().is_input_error());
        assert!(ips.subject("zz").unwrap_err().is_input_error());
    }

    #[test]
    fn csv_round_trip_keeps_order() {
        let mut ips = IndividualParameters::new(vec!["random_intercept".into()]);
        ips.add_individual("s2", array![0.5]).unwrap();
        ips.add_individual("s1", array![-0.25]).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        ips.save_csv(file.path()).unwrap();
        let loaded = IndividualParameters::load_csv(file.path()).unwrap();
        assert_eq!(loaded.indices(), ["s2".to_string(), "s1".to_string()]);
        assert_eq!(loaded, ips);
    }
}
