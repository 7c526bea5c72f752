//! Padded, masked tensor view of [`Data`] used by every algorithm.

use crate::algo::device::{Device, DeviceMovable};
use crate::error::{Error, Result};
use crate::io::data::Data;
use crate::models::Model;
use ndarray::{Array2, Array3};

/// Subjects × visits × features layout of longitudinal observations.
///
/// Row `i` holds subject `indices[i]`; its first `n_visits_per_individual[i]`
/// visits are real, the remainder is zero padding with `mask == 0`. Missing
/// observations at real visits are masked too.
#[derive(Debug, Clone)]
pub struct Dataset {
    headers: Vec<String>,
    indices: Vec<String>,
    timepoints: Array2<f64>,
    values: Array3<f64>,
    mask: Array3<f64>,
    n_visits_per_individual: Vec<usize>,
    device: Device,
}

impl Dataset {
    /// Pads `data`. When `model` already has features, they must match the data headers.
    pub fn new(data: &Data, model: Option<&dyn Model>) -> Result<Self> {
        if let Some(model) = model {
            let features = model.features();
            if !features.is_empty() && features != data.headers() {
                return Err(Error::Input(format!(
                    "data features {:?} do not match model features {:?}",
                    data.headers(),
                    features
                )));
            }
        }
        if data.n_individuals() == 0 {
            return Err(Error::Input("data contains no subjects".to_string()));
        }

        let n_individuals = data.n_individuals();
        let dimension = data.dimension();
        // Visits without any observed feature are dropped.
        let observed_visits: Vec<Vec<(f64, &[f64])>> = data
            .individuals()
            .iter()
            .map(|ind| {
                ind.timepoints
                    .iter()
                    .zip(&ind.observations)
                    .filter(|(_, row)| row.iter().any(|v| v.is_finite()))
                    .map(|(&age, row)| (age, row.as_slice()))
                    .collect()
            })
            .collect();
        let max_visits = observed_visits.iter().map(Vec::len).max().unwrap_or(0);

        let mut timepoints = Array2::<f64>::zeros((n_individuals, max_visits));
        let mut values = Array3::<f64>::zeros((n_individuals, max_visits, dimension));
        let mut mask = Array3::<f64>::zeros((n_individuals, max_visits, dimension));
        let mut indices = Vec::with_capacity(n_individuals);
        let mut n_visits_per_individual = Vec::with_capacity(n_individuals);

        let rows = data.individuals().iter().zip(&observed_visits);
        for (i, (individual, visits)) in rows.enumerate() {
            indices.push(individual.id.clone());
            n_visits_per_individual.push(visits.len());
            for (j, &(age, row)) in visits.iter().enumerate() {
                timepoints[[i, j]] = age;
                for (k, &value) in row.iter().enumerate() {
                    if value.is_finite() {
                        values[[i, j, k]] = value;
                        mask[[i, j, k]] = 1.0;
                    }
                }
            }
        }

        log::debug!(
            "Built dataset: {} subjects, up to {} visits, {} features",
            n_individuals,
            max_visits,
            dimension
        );

        Ok(Self {
            headers: data.headers().to_vec(),
            indices,
            timepoints,
            values,
            mask,
            n_visits_per_individual,
            device: Device::default(),
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn dimension(&self) -> usize {
        self.headers.len()
    }

    pub fn n_individuals(&self) -> usize {
        self.indices.len()
    }

    pub fn max_visits(&self) -> usize {
        self.timepoints.ncols()
    }

    pub fn indices(&self) -> &[String] {
        &self.indices
    }

    pub fn timepoints(&self) -> &Array2<f64> {
        &self.timepoints
    }

    pub fn values(&self) -> &Array3<f64> {
        &self.values
    }

    pub fn mask(&self) -> &Array3<f64> {
        &self.mask
    }

    pub fn n_visits_per_individual(&self) -> &[usize] {
        &self.n_visits_per_individual
    }
}

impl DeviceMovable for Dataset {
    fn device(&self) -> &Device {
        &self.device
    }

    fn move_to_device(&mut self, device: &Device) -> Result<()> {
        self.device = device.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Axis;

    fn sample_data() -> Data {
        let mut data = Data::new(vec!["score".into()]).unwrap();
        data.add_individual("a", vec![(60.0, vec![1.0]), (61.0, vec![1.5]), (62.0, vec![2.0])])
            .unwrap();
        data.add_individual("b", vec![(70.0, vec![0.5])]).unwrap();
        data
    }

    #[test]
    fn padding_is_masked_and_counts_match() {
        let dataset = Dataset::new(&sample_data(), None).unwrap();
        assert_eq!(dataset.max_visits(), 3);
        assert_eq!(dataset.indices(), ["a".to_string(), "b".to_string()]);
        assert_eq!(dataset.n_visits_per_individual(), [3, 1]);

        let per_subject = dataset.mask().sum_axis(Axis(1));
        for (i, &n) in dataset.n_visits_per_individual().iter().enumerate() {
            assert_eq!(per_subject[[i, 0]] as usize, n);
        }
        assert_eq!(dataset.values()[[1, 1, 0]], 0.0);
        assert_eq!(dataset.mask()[[1, 1, 0]], 0.0);
        assert_eq!(dataset.timepoints()[[0, 2]], 62.0);
        assert_eq!(dataset.mask().iter().filter(|&&m| m > 0.0).count(), 4);
    }

    #[test]
    fn missing_observations_are_masked_but_visits_count() {
        let mut data = Data::new(vec!["x".into(), "y".into()]).unwrap();
        data.add_individual("a", vec![(1.0, vec![0.1, f64::NAN]), (2.0, vec![0.2, 0.3])])
            .unwrap();
        let dataset = Dataset::new(&data, None).unwrap();
        assert_eq!(dataset.mask()[[0, 0, 1]], 0.0);
        assert_eq!(dataset.values()[[0, 0, 1]], 0.0);
        assert_eq!(dataset.n_visits_per_individual(), [2]);
        assert_eq!(dataset.mask()[[0, 1, 1]], 1.0);
    }

    #[test]
    fn unobserved_visits_are_dropped() {
        let mut data = Data::new(vec!["score".into()]).unwrap();
        data.add_individual("a", vec![(1.0, vec![0.1]), (2.0, vec![f64::NAN]), (3.0, vec![0.3])])
            .unwrap();
        let dataset = Dataset::new(&data, None).unwrap();
        assert_eq!(dataset.n_visits_per_individual(), [2]);
        assert_eq!(dataset.max_visits(), 2);
        assert_eq!(dataset.timepoints()[[0, 1]], 3.0);
        assert_eq!(dataset.mask().sum_axis(Axis(1))[[0, 0]] as usize, 2);
    }

    #[test]
    fn moving_devices_keeps_values() {
        let mut dataset = Dataset::new(&sample_data(), None).unwrap();
        let before = dataset.values().clone();
        dataset.move_to_device(&Device::cuda(Some(0))).unwrap();
        assert_eq!(dataset.device(), &Device::cuda(Some(0)));
        assert_eq!(dataset.values(), &before);
    }
}
