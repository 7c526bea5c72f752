//! Best linear unbiased prediction of the LME random effects.

use super::device::{ComputeContext, Device};
use super::{
    Algorithm, AlgorithmFamily, PersonalizeOutput, check_parameter_keys, create_progress_bar,
};
use crate::error::{Error, Result};
use crate::io::dataset::Dataset;
use crate::io::individual_parameters::IndividualParameters;
use crate::io::settings::AlgorithmSettings;
use crate::models::Model;
use crate::models::lme::{LmeModel, random_effect_names};
use crate::models::parameters::{bool_hyperparameter, matrix, scalar, vector};
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::Solve;

#[derive(Debug, Clone)]
pub struct LmePersonalizeAlgorithm {
    device: Device,
}

impl LmePersonalizeAlgorithm {
    pub const NAME: &'static str = "lme_personalize";

    pub fn new(settings: &AlgorithmSettings) -> Result<Self> {
        check_parameter_keys(Self::NAME, &settings.parameters, &[])?;
        Ok(Self {
            device: settings.device()?,
        })
    }
}

impl Algorithm for LmePersonalizeAlgorithm {
    type Output = PersonalizeOutput;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn family(&self) -> AlgorithmFamily {
        AlgorithmFamily::Personalize
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn run_impl(
        &mut self,
        model: &mut dyn Model,
        dataset: &mut Dataset,
        ctx: &ComputeContext,
    ) -> Result<PersonalizeOutput> {
        if model.name() != LmeModel::NAME {
            return Err(Error::Input(format!(
                "'{}' personalizes '{}' models only, got '{}'",
                Self::NAME,
                LmeModel::NAME,
                model.name()
            )));
        }
        if dataset.dimension() != 1 {
            return Err(Error::DataInput(format!(
                "LME personalization needs univariate data, got features {:?}",
                dataset.headers()
            )));
        }

        let with_random_slope_age =
            bool_hyperparameter(&model.hyperparameters(), "with_random_slope_age")?.unwrap_or(true);
        let parameters = model.parameters();
        let ages_mean = scalar(&parameters, "ages_mean")?;
        let ages_std = scalar(&parameters, "ages_std")?;
        let fe_params = vector(&parameters, "fe_params")?;
        let cov_re_unscaled_inv = matrix(&parameters, "cov_re_unscaled_inv")?;
        let names = random_effect_names(with_random_slope_age);
        if cov_re_unscaled_inv.dim() != (names.len(), names.len()) || fe_params.len() != 2 {
            return Err(Error::Type(format!(
                "LME parameters do not match the random effects {names:?}"
            )));
        }

        let mut individual_parameters = IndividualParameters::new(names.clone());
        let mut squared_residuals = 0.0;
        let mut n_residuals = 0usize;

        let values = dataset.values().index_axis(Axis(2), 0);
        let mask = dataset.mask().index_axis(Axis(2), 0);
        let pb = create_progress_bar(dataset.n_individuals() as u64, "Personalizing subjects");
        for (i, id) in dataset.indices().iter().enumerate() {
            let observed: Vec<usize> = (0..dataset.max_visits())
                .filter(|&j| mask[[i, j]] > 0.0)
                .collect();
            let n = observed.len();
            let mut exog = Array2::<f64>::ones((n, 2));
            let mut endog = Array1::<f64>::zeros(n);
            for (row, &j) in observed.iter().enumerate() {
                exog[[row, 1]] = (dataset.timepoints()[[i, j]] - ages_mean) / ages_std;
                endog[row] = values[[i, j]];
            }
            let exog_re = if with_random_slope_age {
                exog.clone()
            } else {
                Array2::<f64>::ones((n, 1))
            };

            let residual = &endog - &exog.dot(&fe_params);
            let lhs = exog_re.t().dot(&exog_re) + &cov_re_unscaled_inv;
            let rhs = exog_re.t().dot(&residual);
            let random_effects = lhs.solve(&rhs)?;

            let remaining = &residual - &exog_re.dot(&random_effects);
            squared_residuals += remaining.dot(&remaining);
            n_residuals += n;

            individual_parameters
                .add_individual(id, random_effects.mapv(|v| ctx.precision.cast(v)))?;
            pb.inc(1);
        }
        pb.finish_and_clear();

        let noise_std = if n_residuals > 0 {
            ctx.precision.cast((squared_residuals / n_residuals as f64).sqrt())
        } else {
            f64::NAN
        };
        log::info!(
            "Personalized {} subjects, residual RMSE {:.4}",
            individual_parameters.len(),
            noise_std
        );
        Ok(PersonalizeOutput {
            individual_parameters,
            noise_std,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_empty_parameters_are_accepted() {
        let settings = AlgorithmSettings::new("lme_personalize").unwrap();
        assert!(LmePersonalizeAlgorithm::new(&settings).is_ok());
        let extra = settings.with_parameter("n_iter", 10);
        assert!(matches!(
            LmePersonalizeAlgorithm::new(&extra),
            Err(Error::UnrecognizedSettings { .. })
        ));
    }
}
