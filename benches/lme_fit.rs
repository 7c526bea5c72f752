use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use sundial::algo::mixed_lm::{FitMethod, MixedLm, MixedLmFitOptions};

struct Problem {
    endog: Array1<f64>,
    exog: Array2<f64>,
    labels: Vec<String>,
}

fn random_slope_problem(n_groups: usize, n_visits: usize) -> Problem {
    let mut rng = StdRng::seed_from_u64(0x5EED_0 + n_groups as u64);
    let n_obs = n_groups * n_visits;
    let mut endog = Array1::<f64>::zeros(n_obs);
    let mut exog = Array2::<f64>::ones((n_obs, 2));
    let mut labels = Vec::with_capacity(n_obs);
    for g in 0..n_groups {
        let intercept = 0.5 * rng.sample::<f64, _>(StandardNormal);
        let slope = 0.2 * rng.sample::<f64, _>(StandardNormal);
        let start = -1.5 + 3.0 * rng.r#gen::<f64>();
        for v in 0..n_visits {
            let row = g * n_visits + v;
            let t = start + 0.25 * v as f64;
            exog[[row, 1]] = t;
            let noise = 0.1 * rng.sample::<f64, _>(StandardNormal);
            endog[row] = 1.0 + intercept + (0.4 + slope) * t + noise;
            labels.push(format!("g{g}"));
        }
    }
    Problem { endog, exog, labels }
}

fn benchmark_lme_fit(c: &mut Criterion) {
    let sizes = [25_usize, 100, 400];
    let problems: Vec<_> = sizes
        .iter()
        .map(|&size| (size, random_slope_problem(size, 6)))
        .collect();

    let mut group = c.benchmark_group("lme_fit");
    group.sample_size(10);
    for (size, problem) in problems.iter() {
        group.throughput(Throughput::Elements(problem.endog.len() as u64));
        for method in [FitMethod::Bfgs, FitMethod::Nm] {
            let options = MixedLmFitOptions {
                method: vec![method],
                ..MixedLmFitOptions::default()
            };
            group.bench_with_input(BenchmarkId::new(method.to_string(), size), problem, |b, input| {
                b.iter(|| {
                    let lme = MixedLm::new(&input.endog, &input.exog, &input.labels, &input.exog)
                        .unwrap();
                    let fitted = lme.fit(black_box(&options), false).unwrap();
                    black_box(fitted.fe_params);
                });
            });
        }
    }
    group.finish();
}

criterion_group!(lme_fit, benchmark_lme_fit);
criterion_main!(lme_fit);
